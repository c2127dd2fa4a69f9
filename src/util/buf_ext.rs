use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};

macro_rules! try_read_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reads for wire decoding. Everything is big endian except the 24-bit counters,
///  which RakNet puts on the wire little endian.
pub trait BufExt: Buf {
    try_read_impl!(try_read_u8, u8, get_u8);
    try_read_impl!(try_read_u16, u16, get_u16);
    try_read_impl!(try_read_u32, u32, get_u32);
    try_read_impl!(try_read_u64, u64, get_u64);
    try_read_impl!(try_read_u128, u128, get_u128);

    fn try_read_u24_le(&mut self) -> anyhow::Result<u32> {
        if self.remaining() < 3 {
            return Err(anyhow!("buffer underflow"));
        }
        let b0 = self.get_u8() as u32;
        let b1 = self.get_u8() as u32;
        let b2 = self.get_u8() as u32;
        Ok(b0 | (b1 << 8) | (b2 << 16))
    }

    fn try_read_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow: expected {} bytes, {} remaining", len, self.remaining()));
        }
        Ok(self.copy_to_bytes(len))
    }

    fn try_read_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            return Err(anyhow!("buffer underflow"));
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Ok(result)
    }
}

pub trait BufMutExt: BufMut {
    fn put_u24_le(&mut self, v: u32) {
        debug_assert!(v <= 0xff_ffff);
        self.put_u8(v as u8);
        self.put_u8((v >> 8) as u8);
        self.put_u8((v >> 16) as u8);
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}

//! Paul Hsieh's SuperFastHash, bit-for-bit compatible with RakNet's implementation (including
//!  its treatment of trailing bytes as *signed* chars).
//!
//! Large inputs are hashed in blocks of [INCREMENTAL_READ_BLOCK_SIZE] bytes, each block seeded
//!  with the hash of the previous one and the first block seeded with the total input length.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use anyhow::Context;
use tracing::trace;

pub const INCREMENTAL_READ_BLOCK_SIZE: usize = 65536;

#[inline]
fn get16bits(data: &[u8], index: usize) -> u32 {
    ((data[index + 1] as u32) << 8) | data[index] as u32
}

#[inline]
fn signed(b: u8) -> u32 {
    b as i8 as i32 as u32
}

/// One hashing step, seeded with the result of the previous step. An empty input hashes to 0
///  regardless of the seed.
pub fn super_fast_hash_incremental(data: &[u8], last_hash: u32) -> u32 {
    if data.is_empty() {
        return 0;
    }

    let mut hash = last_hash;
    let rem = data.len() & 3;

    let mut index = 0;
    for _ in 0..data.len() >> 2 {
        hash = hash.wrapping_add(get16bits(data, index));
        let tmp = (get16bits(data, index + 2) << 11) ^ hash;
        hash = (hash << 16) ^ tmp;
        index += 4;
        hash = hash.wrapping_add(hash >> 11);
    }

    match rem {
        3 => {
            hash = hash.wrapping_add(get16bits(data, index));
            hash ^= hash << 16;
            hash ^= signed(data[index + 2]) << 18;
            hash = hash.wrapping_add(hash >> 11);
        }
        2 => {
            hash = hash.wrapping_add(get16bits(data, index));
            hash ^= hash << 11;
            hash = hash.wrapping_add(hash >> 17);
        }
        1 => {
            hash = hash.wrapping_add(signed(data[index]));
            hash ^= hash << 10;
            hash = hash.wrapping_add(hash >> 1);
        }
        _ => {}
    }

    // avalanche
    hash ^= hash << 3;
    hash = hash.wrapping_add(hash >> 5);
    hash ^= hash << 4;
    hash = hash.wrapping_add(hash >> 17);
    hash ^= hash << 25;
    hash = hash.wrapping_add(hash >> 6);

    hash
}

pub fn super_fast_hash(data: &[u8]) -> u32 {
    if data.is_empty() {
        return 0;
    }

    let mut last_hash = data.len() as u32;
    let mut chunks = data.chunks_exact(INCREMENTAL_READ_BLOCK_SIZE);
    for block in &mut chunks {
        last_hash = super_fast_hash_incremental(block, last_hash);
    }
    if !chunks.remainder().is_empty() {
        last_hash = super_fast_hash_incremental(chunks.remainder(), last_hash);
    }
    last_hash
}

/// Streaming variant of [super_fast_hash]: data can be fed in pieces of arbitrary size, and the
///  result is the same as hashing the concatenation in one call.
///
/// The algorithm seeds with the *total* length, so that length must be known up front.
pub struct SuperFastHasher {
    last_hash: u32,
    pending: Vec<u8>,
    expected_len: u64,
    fed_len: u64,
}

impl SuperFastHasher {
    pub fn new(total_len: u64) -> SuperFastHasher {
        SuperFastHasher {
            last_hash: total_len as u32,
            pending: Vec::with_capacity(INCREMENTAL_READ_BLOCK_SIZE),
            expected_len: total_len,
            fed_len: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.fed_len += data.len() as u64;

        if !self.pending.is_empty() {
            let missing = INCREMENTAL_READ_BLOCK_SIZE - self.pending.len();
            let take = missing.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.pending.len() < INCREMENTAL_READ_BLOCK_SIZE {
                return;
            }
            self.last_hash = super_fast_hash_incremental(&self.pending, self.last_hash);
            self.pending.clear();
        }

        let mut chunks = data.chunks_exact(INCREMENTAL_READ_BLOCK_SIZE);
        for block in &mut chunks {
            self.last_hash = super_fast_hash_incremental(block, self.last_hash);
        }
        self.pending.extend_from_slice(chunks.remainder());
    }

    pub fn finish(self) -> anyhow::Result<u32> {
        if self.fed_len != self.expected_len {
            anyhow::bail!("hasher was created for {} bytes but fed {}", self.expected_len, self.fed_len);
        }
        if self.fed_len == 0 {
            return Ok(0);
        }
        if self.pending.is_empty() {
            return Ok(self.last_hash);
        }
        Ok(super_fast_hash_incremental(&self.pending, self.last_hash))
    }
}

fn read_block(file: &mut File, block: &mut [u8]) -> anyhow::Result<()> {
    file.read_exact(block)
        .with_context(|| format!("could not read {} bytes", block.len()))
}

/// Hashes a file the way RakNet does, including its quirk of tracking the file length in a signed
///  32-bit counter: files of 2 GiB or more do not hash their content correctly. Use
///  [hash_file_wide] where compatibility with RakNet's file hashes is not needed.
pub fn hash_file(path: impl AsRef<Path>) -> anyhow::Result<u32> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .with_context(|| format!("could not open {:?}", path))?;

    let length = file.metadata()?.len() as i32;
    trace!("hashing {:?} with legacy length {}", path, length);

    let mut bytes_remaining = length;
    let mut last_hash = length as u32;
    let mut block = vec![0u8; INCREMENTAL_READ_BLOCK_SIZE];

    while bytes_remaining >= INCREMENTAL_READ_BLOCK_SIZE as i32 {
        read_block(&mut file, &mut block)?;
        last_hash = super_fast_hash_incremental(&block, last_hash);
        bytes_remaining -= INCREMENTAL_READ_BLOCK_SIZE as i32;
    }

    if bytes_remaining > 0 {
        let remaining = bytes_remaining as usize;
        read_block(&mut file, &mut block[..remaining])?;
        last_hash = super_fast_hash_incremental(&block[..remaining], last_hash);
    }

    Ok(last_hash)
}

/// Like [hash_file], but with a 64-bit length counter. Results are identical for files below
///  2 GiB.
pub fn hash_file_wide(path: impl AsRef<Path>) -> anyhow::Result<u32> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .with_context(|| format!("could not open {:?}", path))?;

    let length = file.metadata()?.len();

    let mut hasher = SuperFastHasher::new(length);
    let mut block = vec![0u8; INCREMENTAL_READ_BLOCK_SIZE];
    let mut bytes_remaining = length;
    while bytes_remaining > 0 {
        let len = bytes_remaining.min(INCREMENTAL_READ_BLOCK_SIZE as u64) as usize;
        read_block(&mut file, &mut block[..len])?;
        hasher.update(&block[..len]);
        bytes_remaining -= len as u64;
    }
    hasher.finish()
}

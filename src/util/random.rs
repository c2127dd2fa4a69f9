use rand::RngCore;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn next_u64() -> u64;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u64() -> u64 {
        rand::thread_rng().next_u64()
    }
}

pub mod buf_ext;
pub mod exponential_backoff;
pub mod random;
pub mod rolling_data;
pub mod safe_converter;
pub mod super_fast_hash;

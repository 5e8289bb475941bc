pub mod ext;
pub mod time;

mod backoff;

pub use backoff::ExponentialBackoff;

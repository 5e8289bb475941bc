mod datetime;
mod duration;

pub use datetime::DateTime;
pub use duration::Duration;

mod result;

pub use result::ResultExt;

use std::future::Future;

use crate::error::UpdateError;

/// One upstream data source, supplied by a device adapter.
///
/// `fetch` is the single opaque operation the engine awaits. Whether the
/// adapter talks natively async or hands blocking I/O to a worker pool is
/// invisible here; the coordinator bounds the whole operation with one
/// timeout either way.
pub trait DataSource: Send + Sync + 'static {
    type Data: Clone + Send + Sync + 'static;

    fn fetch(&self) -> impl Future<Output = Result<Self::Data, UpdateError>> + Send;

    /// Try to renew rejected credentials without user interaction, e.g. by
    /// refreshing a token. `Ok(true)` means renewal worked and a retry is
    /// worth attempting. Sources without renewable credentials keep the
    /// default.
    fn reauthorize(&self) -> impl Future<Output = Result<bool, UpdateError>> + Send {
        async { Ok(false) }
    }
}

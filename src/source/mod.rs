pub mod external;

use anyhow::Result;

pub use external::ExternalSource;

/// A unit of data production feeding the capture stream.
pub trait Source: Send {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Begin producing frames.
    fn start(
        &mut self,
        ctx: tokio_util::sync::CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Stop producing frames.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}

//! The `Backend` trait -- the contract every compute provider implements.

use async_trait::async_trait;

use super::types::{BackendError, GenerateRequest, TextStream};

/// An interchangeable text-generation provider.
///
/// Implementations are shared across concurrent workers and must support
/// independent concurrent calls without shared mutable state.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Produce a complete response.
    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError>;

    /// Produce a response as a stream of chunks. The stream may fail
    /// mid-flight, in which case the caller falls back to [`Backend::generate`].
    ///
    /// The default wraps [`Backend::generate`] in a single-chunk stream.
    async fn stream_generate(&self, request: &GenerateRequest) -> Result<TextStream, BackendError> {
        let text = self.generate(request).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
    }
}

// Compile-time assertion: Backend must be usable as `dyn Backend`.
const _: () = {
    fn _assert_object_safe(_: &dyn Backend) {}
};

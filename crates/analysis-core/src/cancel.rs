/// Cloneable cancellation signal shared by everything working on a request.
pub use tokio_util::sync::CancellationToken;

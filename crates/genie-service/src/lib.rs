//! Async runtime pieces for Genie: the pooled stream client, the OAuth code
//! sweeper and tracing setup shared by the binaries.

pub mod logging;
pub mod stream;
pub mod sweeper;

pub use stream::{StreamError, StreamMessage, StreamPool};
pub use sweeper::CodeSweeper;

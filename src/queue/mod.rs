//! Queue runtime on top of the stream primitives.
//!
//! # Modules
//!
//! - `message`: message representation and the stream wire format
//! - `registry`: queue-pair lifecycle and the backend-side queue set
//! - `queue`: the per-stream handle (publish/claim/ack/DLQ/requeue/purge)
//! - `transaction`: atomic multi-publish batches
//! - `sweeper`: TTL-driven expiration sweep

mod message;
mod queue;
mod registry;
mod sweeper;
mod transaction;

pub use message::Message;
pub use queue::{Queue, QueueInfo};
pub use registry::QueueRegistry;
pub use sweeper::ExpirationSweeper;
pub use transaction::Transaction;

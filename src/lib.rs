pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod web;

// Re-export commonly used types
pub use application::{Ack, AlwaysAck, BackfillWalker, BackorderCounter, Dispatcher, SyncError};
pub use domain::{Event, Topic};
pub use infrastructure::{AppConfig, DownstreamStore, MemoryStore, RetryPolicy};

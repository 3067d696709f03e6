pub mod backfill;
pub mod backorder;
pub mod dispatcher;
pub mod error;
pub mod handlers;

pub use backfill::BackfillWalker;
pub use backorder::{BackorderCounter, BackorderOutcome};
pub use dispatcher::{Ack, AlwaysAck, Dispatcher, RouteOutcome};
pub use error::SyncError;
pub use handlers::TopicHandler;

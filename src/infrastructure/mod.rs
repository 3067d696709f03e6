pub mod audit;
pub mod config;
pub mod init;
pub mod lock;
pub mod logging;
pub mod postgres_store;
pub mod redis_store;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod upstream;

pub use audit::{AuditRecord, AuditSink, StoreAuditLog};
pub use config::{AppConfig, StoreBackend};
pub use lock::{BackorderLock, LockGuard, LockSweeper, DEFAULT_LOCK_TTL};
pub use postgres_store::PostgresStore;
pub use redis_store::RedisStore;
pub use retry::RetryPolicy;
pub use store::{DownstreamStore, MemoryStore, StoreError};
pub use upstream::{Page, ShopifyGraphqlPager, UpstreamError, UpstreamPager};

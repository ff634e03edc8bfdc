pub mod address;
pub mod cache;
pub mod cache_control;
pub mod common;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod session;
pub mod tunnel;

pub use cache::{CacheKey, CacheStore};
pub use config::Config;
pub use connector::OriginConnector;
pub use dispatcher::ConnectionDispatcher;
pub use error::ProxyError;
pub use fetcher::CacheAwareFetcher;
pub use session::{ClientIdentity, SessionContext};

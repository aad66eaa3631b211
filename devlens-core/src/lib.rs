//! devlens core: the event plane.
//!
//! Monitors (file watcher, git poller) publish into the [`bus`], which
//! dispatches to in-process subscribers and routes through the [`queue`]
//! layer into the [`store`]. [`analyzer`]s consume the firehose on their own
//! workers and keep derived state; the [`stream`] fan-out multiplexes
//! filtered, rate-limited views to external subscribers; the [`facade`] is
//! the stable read surface over all of it.

pub mod activity;
pub mod analyzer;
pub mod api_types;
pub mod bus;
pub mod duration;
pub mod error;
pub mod facade;
pub mod monitor;
pub mod queue;
pub mod runtime;
pub mod sink;
pub mod store;
pub mod stream;

pub use error::{Result, TelemetryError};

/// Schema migrations, applied at store open and reused by `#[sqlx::test]`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use bus::{EventBus, PublishOptions, PublishReceipt};
pub use facade::ToolFacade;
pub use queue::QueueManager;
pub use runtime::{Runtime, RuntimeConfig};
pub use store::{EventFilter, EventStore, StoreConfig};
pub use stream::StreamFanout;

use thiserror::Error;

/// Error taxonomy for the event plane.
///
/// Variants map to the failure kinds callers must distinguish: schema
/// violations and resource exhaustion surface to the publisher, transient
/// monitor/store faults recover locally, and `Cancelled` is cooperative
/// shutdown rather than a failure.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("event store full: {0}")]
    StoreFull(String),

    #[error("event store degraded: {0}")]
    StoreDegraded(String),

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("subscriber failure: {0}")]
    Subscriber(String),

    #[error("monitor transient failure: {0}")]
    MonitorTransient(String),

    #[error("monitor fatal: {0}")]
    MonitorFatal(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("model error: {0}")]
    Model(#[from] devlens_model::ModelError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TelemetryError {
    /// Stable machine-readable kind used in facade error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryError::InvalidEvent(_) | TelemetryError::Model(_) => {
                "InvalidEvent"
            }
            TelemetryError::StoreFull(_) => "StoreFull",
            TelemetryError::StoreDegraded(_) => "StoreDegraded",
            TelemetryError::QueueFull(_) => "QueueFull",
            TelemetryError::Queue(_) => "QueueError",
            TelemetryError::Subscriber(_) => "SubscriberError",
            TelemetryError::MonitorTransient(_) => "MonitorTransient",
            TelemetryError::MonitorFatal(_) => "MonitorFatal",
            TelemetryError::Cancelled(_) => "Cancelled",
            TelemetryError::Database(_) | TelemetryError::Migrate(_) => {
                "DatabaseError"
            }
            TelemetryError::Io(_) => "IoError",
            TelemetryError::Serialization(_) => "SerializationError",
            TelemetryError::Git(_) => "GitError",
            TelemetryError::Watch(_) => "WatchError",
            TelemetryError::Config(_) => "ConfigError",
            TelemetryError::Internal(_) => "InternalError",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TelemetryError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, TelemetryError>;

use thiserror::Error;

/// Errors surfaced at the controller boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RewardError {
    /// Another holder owns a lock this operation needs.
    #[error("resource locked: {0}")]
    ResourceLocked(String),
    /// The requested motion would run the carriage past an end of travel.
    #[error("end of track: {0}")]
    EndTrack(String),
    /// The pump gate was closed mid-motion (cooperative cancellation).
    #[error("pump not enabled: {0}")]
    PumpNotEnabled(String),
    #[error("incomplete delivery: requested {requested_ml:.4} mL, delivered {delivered_ml:.4} mL")]
    IncompleteDelivery { requested_ml: f64, delivered_ml: f64 },
    #[error("missing resource: {0}")]
    MissingResource(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl RewardError {
    /// Stable name used in status snapshots and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RewardError::ResourceLocked(_) => "ResourceLocked",
            RewardError::EndTrack(_) => "EndTrackError",
            RewardError::PumpNotEnabled(_) => "PumpNotEnabled",
            RewardError::IncompleteDelivery { .. } => "IncompleteDelivery",
            RewardError::MissingResource(_) => "MissingResource",
            RewardError::InvalidArgument(_) => "ValueError",
            RewardError::Hardware(_) => "HardwareError",
            RewardError::Io(_) => "IOError",
            RewardError::Config(_) => "ConfigError",
        }
    }
}

impl From<std::io::Error> for RewardError {
    fn from(e: std::io::Error) -> Self {
        RewardError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RewardError>;
pub use eyre::Report;

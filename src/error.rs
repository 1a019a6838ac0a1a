use thiserror::Error;

use crate::types::Channel;

/// A single per-channel hardware write that failed during dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFailure {
    pub channel: Channel,
    pub operation: &'static str,
    pub status: i32,
}

impl std::fmt::Display for ChannelFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed on {} (status {})",
            self.operation, self.channel, self.status
        )
    }
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Configuration infeasible: {0}")]
    ConfigurationInfeasible(String),
    #[error("Failed to load waveform for {channel} into slot {slot} (status {status})")]
    Load {
        channel: Channel,
        slot: u8,
        status: i32,
    },
    #[error("Failed to queue waveform on {channel} (status {status})")]
    Queue { channel: Channel, status: i32 },
    #[error("Channel start withheld after {} failed channel operation(s)", .0.len())]
    StartWithheld(Vec<ChannelFailure>),
    #[error("Hardware error during {context} (status {status})")]
    Hardware { status: i32, context: String },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Acquisition failed: {0}")]
    Acquisition(String),
    #[error("Scan aborted before dispatch")]
    Aborted,
    #[error("Sample stream ended after {filled} of {expected} pixels")]
    IncompleteStream { filled: usize, expected: usize },
    #[error("IO error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for ScanError {
    fn from(source: std::io::Error) -> Self {
        ScanError::Io {
            source,
            context: "I/O operation".to_string(),
        }
    }
}

impl ScanError {
    /// Per-channel write failures are reported but do not abort dispatch
    pub fn as_channel_failure(&self) -> Option<ChannelFailure> {
        match self {
            ScanError::Load { channel, status, .. } => Some(ChannelFailure {
                channel: *channel,
                operation: "load",
                status: *status,
            }),
            ScanError::Queue { channel, status } => Some(ChannelFailure {
                channel: *channel,
                operation: "queue",
                status: *status,
            }),
            _ => None,
        }
    }
}

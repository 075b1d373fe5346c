//! Error types and handling for shmlink

/// Result type alias for shmlink operations
pub type Result<T> = std::result::Result<T, ShmError>;

/// Error types for the shared-memory channel transport
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// Malformed or inconsistent channel geometry, detected at
    /// register/open time
    #[error("Invalid configuration: {parameter} - {message}")]
    InvalidConfig { parameter: String, message: String },

    /// Exclusivity-group violation; retryable once the conflicting
    /// device has closed
    #[error("Resource conflict: device '{name}' holds exclusivity group {group}")]
    ResourceConflict { name: String, group: u32 },

    /// The write index would overtake the read index
    #[error("Channel full: {pending} of {capacity} slots pending")]
    ChannelFull { pending: u32, capacity: u32 },

    /// Committed length exceeds the slot budget
    #[error("Payload too large: {len} bytes exceeds budget of {budget}")]
    PayloadTooLarge { len: u32, budget: u32 },

    /// Release called with no unreleased slot at the read index
    #[error("Nothing to release on channel")]
    NothingToRelease,

    /// Close called on a device already in the Closed state
    #[error("Device '{name}' is already closed")]
    AlreadyClosed { name: String },

    /// Operation requires the device to be Closed first
    #[error("Device '{name}' is busy in state {state}")]
    DeviceBusy { name: String, state: String },

    /// A device with this name is already registered
    #[error("Duplicate device name: {name}")]
    DuplicateName { name: String },

    /// The underlying link or protocol layer has not signalled readiness
    #[error("Transport not ready: {message}")]
    NotReady { message: String },

    /// Handle does not refer to a registered device
    #[error("No registered device for handle {handle}")]
    NotRegistered { handle: u32 },

    /// I/O related errors (memfd, mmap, eventfd)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl ShmError {
    /// Create an invalid configuration error
    pub fn invalid_config(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a resource conflict error
    pub fn resource_conflict(name: impl Into<String>, group: u32) -> Self {
        Self::ResourceConflict {
            name: name.into(),
            group,
        }
    }

    /// Create a channel full error
    pub fn channel_full(pending: u32, capacity: u32) -> Self {
        Self::ChannelFull { pending, capacity }
    }

    /// Create a payload too large error
    pub fn payload_too_large(len: u32, budget: u32) -> Self {
        Self::PayloadTooLarge { len, budget }
    }

    /// Create an already closed error
    pub fn already_closed(name: impl Into<String>) -> Self {
        Self::AlreadyClosed { name: name.into() }
    }

    /// Create a device busy error
    pub fn device_busy(name: impl Into<String>, state: impl Into<String>) -> Self {
        Self::DeviceBusy {
            name: name.into(),
            state: state.into(),
        }
    }

    /// Create a duplicate name error
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    /// Create a not ready error
    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::NotReady {
            message: message.into(),
        }
    }

    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }
}

impl From<std::io::Error> for ShmError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ShmError::invalid_config("alignment", "must be a power of two");
        assert!(matches!(err, ShmError::InvalidConfig { .. }));

        let err = ShmError::channel_full(4, 4);
        assert!(matches!(err, ShmError::ChannelFull { .. }));

        let err = ShmError::duplicate_name("modem0");
        assert!(matches!(err, ShmError::DuplicateName { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = ShmError::payload_too_large(129, 128);
        let display = format!("{}", err);
        assert!(display.contains("Payload too large"));
        assert!(display.contains("129"));

        let err = ShmError::resource_conflict("modem0", 2);
        assert!(format!("{}", err).contains("exclusivity group 2"));
    }
}

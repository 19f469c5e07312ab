use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by a device connection.
///
/// The type is cheap to clone: a single cause is handed to every listener and
/// to every pending command that is drained when a session ends, so I/O errors
/// are kept behind an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Opening the socket failed.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: Arc<io::Error>,
    },
    /// Opening the socket did not finish within the configured timeout.
    #[error("connecting to {0} timed out")]
    ConnectTimeout(String),
    /// An operation that needs a live session was attempted without one.
    #[error("device {0:#x} is not connected")]
    NotConnected(u64),
    /// The session ended before a reply for a pending command arrived.
    #[error("connection to device {0:#x} was closed")]
    Closed(u64),
    /// Reading from or writing to an established session failed.
    #[error("socket error: {0}")]
    Io(Arc<io::Error>),
    /// The device closed its end of the stream.
    #[error("device closed the stream")]
    ClosedByPeer,
    /// A command with the same correlation id is still awaiting its reply.
    #[error("command id {0} is already awaiting a reply")]
    DuplicateCommandId(u32),
    /// The connection was released by its pool and can not be used anymore.
    #[error("connection to device {0:#x} was released")]
    Released(u64),
    /// The pool was released and does not hand out connections anymore.
    #[error("connection pool was released")]
    PoolReleased,
}

impl ConnectionError {
    /// Whether this error comes from opening the socket, as opposed to a
    /// failure of an already established session.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            ConnectionError::Connect { .. } | ConnectionError::ConnectTimeout(_)
        )
    }

    pub(crate) fn io(err: io::Error) -> Self {
        ConnectionError::Io(Arc::new(err))
    }
}

/// A single frame could not be decoded.
///
/// Protocol errors are scoped to the frame that caused them; the session that
/// received the frame keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame exceeds the maximum length of {0} bytes")]
    FrameTooLong(usize),
    #[error("unexpected frame: {0}")]
    Unexpected(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// A scan could not be carried out.
///
/// Discovery failures are returned as data, see
/// [`DeviceMap::error`](crate::device::device_map::DeviceMap::error).
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    #[error("discovery socket error: {0}")]
    Io(Arc<io::Error>),
    #[error("a scan is already in progress")]
    ScanInProgress,
    #[error("already listening for announcements")]
    AlreadyListening,
    #[error("the scanner was stopped")]
    Stopped,
}

impl From<io::Error> for DiscoveryError {
    fn from(err: io::Error) -> Self {
        DiscoveryError::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_errors_are_classified() {
        let refused = ConnectionError::Connect {
            address: "10.0.0.2:55443".to_string(),
            source: Arc::new(io::Error::from(io::ErrorKind::ConnectionRefused)),
        };
        assert!(refused.is_connect_error());
        assert!(ConnectionError::ConnectTimeout("10.0.0.2:55443".into()).is_connect_error());
        assert!(!ConnectionError::ClosedByPeer.is_connect_error());
        assert!(!ConnectionError::NotConnected(1).is_connect_error());
    }

    #[test]
    fn test_device_ids_are_printed_in_hex() {
        let err = ConnectionError::NotConnected(0x1b);
        assert_eq!(err.to_string(), "device 0x1b is not connected");
    }
}

//! Error taxonomy for the bus runtime.
//!
//! Local failures (I/O, bad names, bad signatures, decode errors) are
//! variants of [`Error`]; failures reported by a remote peer travel as a
//! [`BusError`] carrying the symbolic error name and the human-readable
//! message from the error reply. Timeouts are a remote error with the
//! well-known [`ERR_NO_REPLY`] name so callers can treat them like any
//! other error reply or single them out with [`Error::is_timeout`].

use std::fmt;
use std::io;

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// `org.freedesktop.DBus.Error.Failed`
pub const ERR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
/// `org.freedesktop.DBus.Error.NoReply`, also synthesized for call timeouts.
pub const ERR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
/// `org.freedesktop.DBus.Error.UnknownMethod`
pub const ERR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
/// `org.freedesktop.DBus.Error.UnknownObject`
pub const ERR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
/// `org.freedesktop.DBus.Error.UnknownInterface`
pub const ERR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
/// `org.freedesktop.DBus.Error.UnknownProperty`
pub const ERR_UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
/// `org.freedesktop.DBus.Error.PropertyReadOnly`
pub const ERR_PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
/// `org.freedesktop.DBus.Error.AccessDenied`
pub const ERR_ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
/// `org.freedesktop.DBus.Error.InvalidArgs`
pub const ERR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
/// `org.freedesktop.DBus.Error.NotSupported`
pub const ERR_NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";
/// `org.freedesktop.DBus.Error.Disconnected`
pub const ERR_DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";

/// An error reply from a peer: a symbolic name plus a message.
///
/// Server-side method and property handlers return `BusError` to reject a
/// call; the dispatch engine turns it into an error reply. On the client
/// side every error reply is surfaced as [`Error::Remote`] wrapping one of
/// these, never silently swallowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusError {
    name: String,
    message: String,
}

impl BusError {
    /// Create an error with a symbolic name and message.
    ///
    /// The name must follow the error-name grammar (same rules as interface
    /// names); a malformed name is replaced by [`ERR_FAILED`] so a bad
    /// handler can never put an invalid name on the wire.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let name = if crate::names::is_valid_error_name(&name) {
            name
        } else {
            ERR_FAILED.to_string()
        };
        BusError {
            name,
            message: message.into(),
        }
    }

    pub(crate) fn new_unchecked(name: impl Into<String>, message: impl Into<String>) -> Self {
        BusError {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        BusError::new_unchecked(ERR_FAILED, message)
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        BusError::new_unchecked(ERR_INVALID_ARGS, message)
    }

    pub(crate) fn unknown_method(interface: &str, member: &str) -> Self {
        BusError::new_unchecked(
            ERR_UNKNOWN_METHOD,
            format!("no method '{}' on interface '{}'", member, interface),
        )
    }

    pub(crate) fn unknown_interface(interface: &str) -> Self {
        BusError::new_unchecked(
            ERR_UNKNOWN_INTERFACE,
            format!("interface '{}' is not registered here", interface),
        )
    }

    pub(crate) fn unknown_object(path: &str) -> Self {
        BusError::new_unchecked(ERR_UNKNOWN_OBJECT, format!("no object at path '{}'", path))
    }

    pub(crate) fn unknown_property(interface: &str, property: &str) -> Self {
        BusError::new_unchecked(
            ERR_UNKNOWN_PROPERTY,
            format!("no property '{}' on interface '{}'", property, interface),
        )
    }

    pub(crate) fn timeout() -> Self {
        BusError::new_unchecked(ERR_NO_REPLY, "method call timed out")
    }

    /// The symbolic error name, e.g. `org.freedesktop.DBus.Error.Failed`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The human-readable message, possibly empty.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True if this is the timeout error name.
    pub fn is_timeout(&self) -> bool {
        self.name == ERR_NO_REPLY
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for BusError {}

/// Lets method handlers use `?` on runtime errors; the caller sees a
/// `Failed` reply with the original error text.
impl From<Error> for BusError {
    fn from(e: Error) -> Self {
        match e {
            Error::Remote(e) => e,
            other => BusError::failed(other.to_string()),
        }
    }
}

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("invalid bus address '{0}'")]
    InvalidAddress(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid type signature '{0}'")]
    InvalidSignature(String),

    #[error("message decoding failed: {0}")]
    Decode(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection is not a message bus")]
    NotABus,

    /// A local wait (listener accept, loop join) ran out of time. Method
    /// call timeouts are *not* this; they surface as [`Error::Remote`]
    /// carrying [`ERR_NO_REPLY`].
    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Remote(BusError),
}

impl Error {
    /// True for a method call that exceeded its deadline, whether the
    /// timeout reply was synthesized locally or sent by the peer.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Remote(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// The symbolic error name, if this error carries one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Error::Remote(e) => Some(e.name()),
            _ => None,
        }
    }
}

impl From<BusError> for Error {
    fn from(e: BusError) -> Self {
        Error::Remote(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_display() {
        let e = BusError::new("org.example.Error.Sad", "it did not work");
        assert_eq!(e.to_string(), "org.example.Error.Sad: it did not work");
        assert_eq!(e.name(), "org.example.Error.Sad");
    }

    #[test]
    fn malformed_error_name_degrades_to_failed() {
        let e = BusError::new("not a name", "boom");
        assert_eq!(e.name(), ERR_FAILED);
        assert_eq!(e.message(), "boom");
    }

    #[test]
    fn timeout_detection() {
        let e: Error = BusError::timeout().into();
        assert!(e.is_timeout());
        assert_eq!(e.name(), Some(ERR_NO_REPLY));
        assert!(!Error::ConnectionClosed.is_timeout());
    }
}

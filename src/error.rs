use thiserror::Error;

/// Errors reported by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// No matching device was found during enumeration or re-opening.
    #[error("device not found")]
    DeviceNotFound,

    /// The interface could not be claimed; another session is still
    /// holding it.
    #[error("device is busy, interface could not be claimed")]
    Busy,

    /// A USB transfer failed at the transport layer.
    #[error("usb error: {0}")]
    Usb(rusb::Error),

    /// A bulk transfer returned after its timeout budget. Retried where
    /// the protocol allows it, surfaced once the retry budget runs out.
    #[error("usb transfer timed out")]
    Timeout,

    /// The device answered with a malformed frame, or an image structure
    /// failed validation (bad magic, bad CRC, bad SHA-256, excess padding).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device reported a non-OK result. `message` carries the
    /// device-supplied error string if the result was `ERROR_MSG`.
    #[error("device error {code:#06x}: {}", .message.as_deref().unwrap_or("no detail"))]
    Device { code: u16, message: Option<String> },

    /// A caller-supplied range or flag combination was rejected before any
    /// USB I/O took place.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The operation is not available with the negotiated protocol version.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Local file I/O failed (image, cache or output files).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusb::Error> for Error {
    fn from(error: rusb::Error) -> Self {
        match error {
            rusb::Error::Timeout => Error::Timeout,
            other => Error::Usb(other),
        }
    }
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use crate::native::{EventLogApi, Status};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EvtError>;

pub const ERROR_SUCCESS: u32 = 0;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_OUTOFMEMORY: u32 = 14;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
pub const ERROR_NO_MORE_ITEMS: u32 = 259;
pub const ERROR_NOT_FOUND: u32 = 1168;
pub const ERROR_TIMEOUT: u32 = 1460;
pub const ERROR_EVT_INVALID_CHANNEL_PATH: u32 = 15000;
pub const ERROR_EVT_INVALID_QUERY: u32 = 15001;
pub const ERROR_EVT_CHANNEL_NOT_FOUND: u32 = 15007;
pub const ERROR_EVT_MESSAGE_NOT_FOUND: u32 = 15027;
pub const ERROR_EVT_PUBLISHER_METADATA_NOT_FOUND: u32 = 15032;

#[derive(Debug, Error)]
pub enum EvtError {
    #[error("{call} failed with error code {code}: {message}")]
    NativeCallFailed {
        call: &'static str,
        code: u32,
        message: String,
    },

    #[error("Bookmark markup could not be parsed (error code {code}): {message}")]
    InvalidFormat { code: u32, message: String },

    #[error("Failed to update bookmark (error code {code}): {message}")]
    UpdateFailed { code: u32, message: String },

    #[error("Out of memory while allocating a {size} byte render buffer")]
    OutOfMemory { size: usize },

    #[error("No current record, `advance` must succeed before rendering")]
    NoCurrentRecord,

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },
}

impl EvtError {
    /// Wraps a failed native call, looking up the system message for its status code.
    pub(crate) fn native(api: &dyn EventLogApi, call: &'static str, status: Status) -> Self {
        let code = status.code();
        EvtError::NativeCallFailed {
            call,
            code,
            message: api.format_message(code),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        EvtError::InvalidArgument {
            message: message.into(),
        }
    }

    /// The native status code carried by this error, if any.
    pub fn code(&self) -> Option<u32> {
        match self {
            EvtError::NativeCallFailed { code, .. }
            | EvtError::InvalidFormat { code, .. }
            | EvtError::UpdateFailed { code, .. } => Some(*code),
            EvtError::OutOfMemory { .. } => Some(ERROR_OUTOFMEMORY),
            EvtError::NoCurrentRecord | EvtError::InvalidArgument { .. } => None,
        }
    }
}

/// Fallback text used when the system has no message for a status code.
pub(crate) fn describe_status(code: u32) -> String {
    let known = match code {
        ERROR_SUCCESS => "The operation completed successfully.",
        ERROR_INVALID_HANDLE => "The handle is invalid.",
        ERROR_OUTOFMEMORY => "Not enough memory resources are available to complete this operation.",
        ERROR_INVALID_PARAMETER => "The parameter is incorrect.",
        ERROR_INSUFFICIENT_BUFFER => "The data area passed to a system call is too small.",
        ERROR_NO_MORE_ITEMS => "No more data is available.",
        ERROR_NOT_FOUND => "Element not found.",
        ERROR_TIMEOUT => "This operation returned because the timeout period expired.",
        ERROR_EVT_INVALID_CHANNEL_PATH => "The specified channel path is invalid.",
        ERROR_EVT_INVALID_QUERY => "The specified query is invalid.",
        ERROR_EVT_CHANNEL_NOT_FOUND => "The specified channel could not be found.",
        ERROR_EVT_MESSAGE_NOT_FOUND => "The message resource is present but the message was not found in the message table.",
        ERROR_EVT_PUBLISHER_METADATA_NOT_FOUND => "The publisher metadata cannot be found in the resource.",
        _ => return format!("Unknown error ({})", code),
    };
    known.to_string()
}

//! Typed failures raised by tool dispatch and the calendar gateway.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Calendar '{calendar}' is read-only; events can only be written to read_write calendars")]
    PermissionDenied { calendar: String },

    #[error("Calendar '{0}' is not tracked")]
    NotTracked(String),

    #[error("No writable calendar configured. Mark a tracked calendar as read_write first")]
    NoWritableCalendar,

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Calendar service error: {0}")]
    Upstream(#[source] anyhow::Error),

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl ToolError {
    /// Stable machine-readable tag placed in failed tool results.
    pub fn error_type(&self) -> &'static str {
        match self {
            ToolError::PermissionDenied { .. } => "permission_denied",
            ToolError::NotTracked(_) => "not_tracked",
            ToolError::NoWritableCalendar => "no_writable_calendar",
            ToolError::NotFound(_) => "not_found",
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::Upstream(_) => "upstream_error",
            ToolError::Storage(_) => "storage_error",
        }
    }
}

impl From<rusqlite::Error> for ToolError {
    fn from(e: rusqlite::Error) -> Self {
        ToolError::Storage(e.into())
    }
}

/// Failures reported by a calendar backend.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Calendar provider needs setup: {0}")]
    NotConfigured(String),

    #[error("Calendar API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ProviderError> for ToolError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotFound(what) => ToolError::NotFound(format!("{} not found", what)),
            other => ToolError::Upstream(other.into()),
        }
    }
}

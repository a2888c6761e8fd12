//! Session error types.

use thiserror::Error;

/// Errors from session lookup and validation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// No session under that id.
    #[error("session not found")]
    NotFound,

    /// The session existed but passed its idle or absolute deadline; it
    /// has been deleted.
    #[error("session expired")]
    Expired,

    /// The request carried no session cookie.
    #[error("missing session cookie")]
    MissingCookie,
}

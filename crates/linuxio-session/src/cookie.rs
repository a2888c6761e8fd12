//! Session cookie attributes.
//!
//! The cookie value is the opaque session id, never the bridge secret.

use std::time::Duration;

/// Default cookie name.
pub const DEFAULT_COOKIE_NAME: &str = "session_id";

/// Attributes for the session cookie.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    /// Cookie name.
    pub name: String,
    /// Emit the `Secure` attribute (production).
    pub secure: bool,
    /// Cookie path.
    pub path: String,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_COOKIE_NAME.to_string(),
            secure: true,
            path: "/".to_string(),
        }
    }
}

impl CookieConfig {
    /// Render a `Set-Cookie` value for a new session. `max_age` is the
    /// session's absolute timeout.
    #[must_use]
    pub fn build(&self, session_id: &str, max_age: Duration) -> String {
        let mut cookie = format!(
            "{}={}; Path={}; HttpOnly; SameSite=Strict; Max-Age={}",
            self.name,
            session_id,
            self.path,
            max_age.as_secs()
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// Render a `Set-Cookie` value that clears the cookie on logout.
    #[must_use]
    pub fn clear(&self) -> String {
        let mut cookie = format!(
            "{}=; Path={}; HttpOnly; SameSite=Strict; Max-Age=0",
            self.name, self.path
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Extract a cookie value from a `Cookie` request header.
#[must_use]
pub fn parse_cookie_header<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

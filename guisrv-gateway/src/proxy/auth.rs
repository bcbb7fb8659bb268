//! Login observation for a proxied session
//!
//! The gateway does not authenticate anybody itself. It watches the login
//! exchange between console and backend, and remembers the credentials once
//! the backend accepts them.

use guisrv_common::protocol::Credentials;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct LoginTracker {
    pending: Option<(Value, Credentials)>,
    user: Option<Credentials>,
}

impl LoginTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A login request was relayed to the backend
    pub fn begin(&mut self, request_id: Value, credentials: Credentials) {
        self.pending = Some((request_id, credentials));
    }

    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Inspect a backend frame while a login is pending
    ///
    /// Returns `Some(true)` on success, `Some(false)` on failure and `None`
    /// when the frame is not the login response.
    pub fn observe_response(&mut self, text: &str) -> Option<bool> {
        let expected = &self.pending.as_ref()?.0;
        let Ok(Value::Object(data)) = serde_json::from_str::<Value>(text) else {
            return None;
        };
        if data.get("RequestId") != Some(expected) {
            return None;
        }

        let (_, credentials) = self.pending.take()?;
        if data.contains_key("Error") {
            self.user = None;
            Some(false)
        } else {
            self.user = Some(credentials);
            Some(true)
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.user.as_ref()
    }
}

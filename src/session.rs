use std::{fmt, sync::Arc};

use crate::{
    storage::{Storage, TOKEN_KEY},
    StorageError,
};

/// Notification for the session/auth layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// A request came back 401; the stored token was cleared and the user
    /// should be sent to `login_url`.
    LoginRequired { login_url: String },
}

/// Credential token persisted next to the request queue.
#[derive(Clone)]
pub struct Session {
    storage: Arc<dyn Storage>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Session {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn token(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .storage
            .get(TOKEN_KEY)?
            .filter(|token| !token.trim().is_empty()))
    }

    pub fn set_token(&self, token: impl AsRef<str>) -> Result<(), StorageError> {
        self.storage.set(TOKEN_KEY, token.as_ref().trim())
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.storage.remove(TOKEN_KEY)
    }

    /// `Authorization` header value for the stored token, if any.
    pub fn authorization(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .token()?
            .map(|token| normalize_bearer_authorization(&token)))
    }
}

fn normalize_bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}

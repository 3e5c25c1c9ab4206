//! Access credentials for the blob store.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

use crate::cancel::CancelToken;
use crate::error::TransferError;

pub const ENV_ACCESS_KEY_ID: &str = "TREEPIPE_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "TREEPIPE_SECRET_ACCESS_KEY";
pub const ENV_SESSION_TOKEN: &str = "TREEPIPE_SESSION_TOKEN";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

// Secrets never end up in logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Source of credentials. `resolve` may block (a token exchange, say) and
/// must give up once `cancel` fires.
pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, cancel: &CancelToken) -> Result<Credentials>;
}

pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        StaticCredentials(Credentials {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        })
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.0.session_token = Some(token.into());
        self
    }
}

impl From<Credentials> for StaticCredentials {
    fn from(credentials: Credentials) -> Self {
        StaticCredentials(credentials)
    }
}

impl CredentialProvider for StaticCredentials {
    fn resolve(&self, cancel: &CancelToken) -> Result<Credentials> {
        cancel.check()?;
        Ok(self.0.clone())
    }
}

/// Reads the `TREEPIPE_*` variables on every call, so rotated values are
/// picked up without rebuilding the session.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn resolve(&self, cancel: &CancelToken) -> Result<Credentials> {
        cancel.check()?;
        let required = |field: &'static str| {
            env::var(field)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or(TransferError::MissingConfig { field })
        };
        Ok(Credentials {
            access_key_id: required(ENV_ACCESS_KEY_ID)?,
            secret_access_key: required(ENV_SECRET_ACCESS_KEY)?,
            session_token: env::var(ENV_SESSION_TOKEN).ok().filter(|v| !v.is_empty()),
        })
    }
}

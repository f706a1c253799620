//! Access-token persistence.
//!
//! The token file is JSON `{access_token, refresh_token, expire_time}` with
//! `expire_time` in unix seconds.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PanError, Result};

/// Refresh when fewer than this many seconds remain.
pub const REFRESH_THRESHOLD_SECS: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    pub expire_time: i64,
}

impl Token {
    /// Build a token from an OAuth response's `expires_in`.
    pub fn from_grant(access_token: String, refresh_token: String, expires_in: i64) -> Self {
        Self {
            access_token,
            refresh_token,
            expire_time: Utc::now().timestamp() + expires_in,
        }
    }

    pub fn needs_refresh(&self) -> bool {
        self.expire_time - Utc::now().timestamp() < REFRESH_THRESHOLD_SECS
    }
}

pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored token. A missing, empty, or incomplete file yields `None`.
    pub fn load(&self) -> Result<Option<Token>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let token: Token = serde_json::from_str(&raw)?;
        if token.access_token.is_empty() || token.refresh_token.is_empty() {
            debug!("token file {} is incomplete", self.path.display());
            return Ok(None);
        }
        Ok(Some(token))
    }

    pub fn store(&self, token: &Token) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, serde_json::to_string(token)?)?;
        info!("stored access token in {}", self.path.display());
        Ok(())
    }

    /// Load the token, refreshing and persisting it when it is close to expiry.
    pub fn load_fresh(&self, refresh: impl FnOnce(&Token) -> Result<Token>) -> Result<Token> {
        let token = self.load()?.ok_or_else(|| {
            PanError::Auth(format!(
                "no access token in {}; run `panfs login` first",
                self.path.display()
            ))
        })?;
        if !token.needs_refresh() {
            return Ok(token);
        }
        info!("access token expires soon, refreshing");
        let fresh = refresh(&token)?;
        self.store(&fresh)?;
        Ok(fresh)
    }
}

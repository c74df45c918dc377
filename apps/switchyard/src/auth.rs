//! HTTP Basic authentication for the attachment endpoint.
//!
//! Credentials are `account id` as the username and the account's token as
//! the password. The account store itself lives outside this service; the
//! [`AccountDirectory`] trait is the seam, and [`StaticDirectory`] adapts a
//! flat `id:token` list for deployments without one.

use std::collections::HashMap;

use anyhow::{bail, Context};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Serialize;
use thiserror::Error;

pub const CODE_INTERNAL_ERROR: u32 = 0;
pub const CODE_INVALID_CREDENTIALS: u32 = 4;

/// Error envelope returned by the HTTP surface before upgrade.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(rename = "errorCode")]
    pub error_code: u32,
    pub message: String,
}

impl ApiError {
    pub fn invalid_credentials() -> Self {
        Self {
            error_code: CODE_INVALID_CREDENTIALS,
            message: "Invalid credentials.".to_string(),
        }
    }

    pub fn internal() -> Self {
        Self {
            error_code: CODE_INTERNAL_ERROR,
            message: "Internal error.".to_string(),
        }
    }
}

/// Failure of the account store itself, as opposed to a credential
/// mismatch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("account store unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a credential pair to a yes/no for the claimed account id. A
/// store that cannot be consulted at all reports a [`DirectoryError`]
/// rather than a mismatch.
pub trait AccountDirectory: Send + Sync {
    fn authenticate(&self, account_id: u64, token: &str) -> Result<bool, DirectoryError>;
}

/// Directory parsed from comma-separated `id:token` pairs. An empty
/// directory rejects everything.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    tokens: HashMap<u64, String>,
}

impl StaticDirectory {
    pub fn parse(pairs: &str) -> anyhow::Result<Self> {
        let mut tokens = HashMap::new();
        for entry in pairs.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (id, token) = entry
                .split_once(':')
                .with_context(|| format!("account entry {entry:?} is not id:token"))?;
            if token.is_empty() {
                bail!("account entry {entry:?} has an empty token");
            }
            let id: u64 = id
                .parse()
                .with_context(|| format!("account id {id:?} is not an integer"))?;
            tokens.insert(id, token.to_string());
        }
        Ok(Self { tokens })
    }
}

impl AccountDirectory for StaticDirectory {
    fn authenticate(&self, account_id: u64, token: &str) -> Result<bool, DirectoryError> {
        Ok(self.tokens.get(&account_id).is_some_and(|t| t == token))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or malformed authorization header")]
    Malformed,
    #[error("invalid credentials")]
    Rejected,
    #[error("account directory failure: {0}")]
    Directory(#[from] DirectoryError),
}

/// Extracts HTTP Basic credentials from the request headers and checks them
/// against the directory, yielding the authenticated account id. A
/// directory failure surfaces as [`AuthError::Directory`] so callers can
/// answer with an internal error instead of a credential rejection.
pub fn authenticate(
    headers: &HeaderMap,
    directory: &dyn AccountDirectory,
) -> Result<u64, AuthError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(AuthError::Malformed)?;
    let encoded = header.strip_prefix("Basic ").ok_or(AuthError::Malformed)?;
    let decoded = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
    let (user, token) = decoded.split_once(':').ok_or(AuthError::Malformed)?;
    let account_id: u64 = user.parse().map_err(|_| AuthError::Malformed)?;

    if directory.authenticate(account_id, token)? {
        Ok(account_id)
    } else {
        Err(AuthError::Rejected)
    }
}

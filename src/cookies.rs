//! Cookie export
//!
//! Reshapes a small allow-list of the remote session's cookies into a flat
//! import format so an authenticated session can be handed to another
//! consumer. One file per session id under the export directory.

use crate::browser::page::PageCookie;
use crate::error::{FlowError, Result};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Only these cookie names are exported; everything else the remote sets is
/// noise for the downstream consumer.
pub const EXPORT_ALLOWLIST: &[&str] = &["session", "auth_token", "sid", "remember_token"];

/// How long the fixed expiry metadata marks an exported cookie as valid.
const EXPORT_VALIDITY_DAYS: i64 = 30;

/// One cookie in the export format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Fixed expiry metadata (unix seconds), not the remote's own expiry.
    pub expires: i64,
    pub http_only: bool,
    pub secure: bool,
}

/// Filter to the allow-list and attach the fixed expiry metadata.
pub fn reshape(cookies: &[PageCookie]) -> Vec<ExportedCookie> {
    let expires = (Utc::now() + ChronoDuration::days(EXPORT_VALIDITY_DAYS)).timestamp();
    cookies
        .iter()
        .filter(|c| EXPORT_ALLOWLIST.contains(&c.name.as_str()))
        .map(|c| ExportedCookie {
            name: c.name.clone(),
            value: c.value.clone(),
            domain: c.domain.clone(),
            path: c.path.clone(),
            expires,
            http_only: c.http_only,
            secure: c.secure,
        })
        .collect()
}

/// Write the session's reshaped cookies as pretty JSON. Returns the file
/// path and how many cookies made it through the allow-list.
pub async fn write_export(
    dir: &Path,
    session_id: &str,
    cookies: &[PageCookie],
) -> Result<(PathBuf, usize)> {
    let exported = reshape(cookies);

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| FlowError::Internal(format!("failed to create export dir: {}", e)))?;

    let path = dir.join(format!("cookies_{}.json", sanitize(session_id)));
    let json = serde_json::to_string_pretty(&exported)
        .map_err(|e| FlowError::Internal(format!("failed to serialize cookies: {}", e)))?;
    tokio::fs::write(&path, json)
        .await
        .map_err(|e| FlowError::Internal(format!("failed to write cookie export: {}", e)))?;

    log::info!(
        "exported {} of {} cookies for session {}",
        exported.len(),
        cookies.len(),
        session_id
    );
    Ok((path, exported.len()))
}

fn sanitize(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

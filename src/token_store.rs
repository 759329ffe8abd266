//! On-disk persistence of OAuth tokens
//!
//! A single JSON record at a fixed per-user path. Writes go through a
//! temporary file in the same directory followed by a rename, so a reader
//! never observes a partially written record.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{JmapError, JmapResult};

/// Directory under the home directory holding the token file
const TOKEN_DIR: &str = ".jmap-mail-mcp";
const TOKEN_FILE: &str = "tokens.json";

/// Persisted OAuth token set
///
/// `expires_at` is in epoch seconds; absent means the provider did not report
/// an expiry and the token is assumed valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

/// Default token file location: `~/.jmap-mail-mcp/tokens.json`
///
/// # Errors
///
/// Returns `configError` if the home directory cannot be determined.
pub fn default_token_path() -> JmapResult<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        JmapError::config("cannot determine home directory; set JMAP_TOKEN_FILE")
    })?;
    Ok(home.join(TOKEN_DIR).join(TOKEN_FILE))
}

/// Token file handle
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted tokens
    ///
    /// Returns `None` when no file exists. A file that cannot be parsed is
    /// logged and treated as absent, which leads callers to re-authenticate.
    ///
    /// # Errors
    ///
    /// Returns `tokenStoreError` if the file exists but cannot be read.
    pub fn load(&self) -> JmapResult<Option<StoredTokens>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(JmapError::token_store(
                    "read",
                    format!("{}: {err}", self.path.display()),
                ));
            }
        };

        match serde_json::from_str::<StoredTokens>(&contents) {
            Ok(tokens) => Ok(Some(tokens)),
            Err(err) => {
                warn!(path = %self.path.display(), "ignoring unreadable token file: {err}");
                Ok(None)
            }
        }
    }

    /// Persist tokens, replacing any previous record atomically
    ///
    /// Creates the parent directory on demand. On Unix the file is readable
    /// by the owner only.
    pub fn save(&self, tokens: &StoredTokens) -> JmapResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                JmapError::token_store("write", format!("{}: {e}", parent.display()))
            })?;
        }

        let serialized = serde_json::to_string_pretty(tokens)
            .map_err(|e| JmapError::token_store("write", e))?;

        let tmp_path = self.path.with_extension("json.tmp");
        write_private(&tmp_path, serialized.as_bytes())
            .map_err(|e| JmapError::token_store("write", format!("{}: {e}", tmp_path.display())))?;

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            JmapError::token_store("write", format!("{}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), "tokens saved");
        Ok(())
    }

    /// Delete the token file
    ///
    /// Returns whether a file was removed.
    pub fn clear(&self) -> JmapResult<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(false),
            Err(err) => Err(JmapError::token_store(
                "delete",
                format!("{}: {err}", self.path.display()),
            )),
        }
    }
}

/// Write `contents` to `path`, owner-only on Unix from the moment of creation
///
/// A leftover file from an interrupted save keeps its old mode on open, so
/// the mode is also reset explicitly.
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.sync_all()
}

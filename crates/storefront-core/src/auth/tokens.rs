//! Durable storage for the access/refresh token pair.
//!
//! Every backend keeps an in-memory copy so that reads on the request path
//! never touch the disk or the OS keychain. Writes go through to the
//! backing store before the in-memory copy is updated.

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Token file name in the data directory
const TOKEN_FILE: &str = "tokens.json";

/// Keychain service name
const SERVICE_NAME: &str = "storefront";

/// Well-known key for the access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Well-known key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

// Tokens must never end up in logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Holder of the credential pair.
///
/// Created on login/register, access token overwritten on refresh,
/// destroyed on logout or when a refresh fails.
pub trait TokenStore: Send + Sync {
    fn get(&self) -> Option<Credentials>;

    fn set(&self, credentials: &Credentials) -> Result<()>;

    /// Swap in a refreshed access token, and a rotated refresh token when
    /// the server sent one, but only while the stored access token is still
    /// `stale`. The check and the write happen under one lock, so a refresh
    /// that finishes after a logout or a new login changes nothing.
    ///
    /// Returns whether the store was updated.
    fn replace_access(
        &self,
        stale: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<bool>;

    fn clear(&self) -> Result<()>;

    fn access_token(&self) -> Option<String> {
        self.get().map(|c| c.access_token)
    }

    fn refresh_token(&self) -> Option<String> {
        self.get().map(|c| c.refresh_token)
    }

    fn has_credentials(&self) -> bool {
        self.get().is_some()
    }
}

fn read_slot(slot: &RwLock<Option<Credentials>>) -> RwLockReadGuard<'_, Option<Credentials>> {
    slot.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_slot(slot: &RwLock<Option<Credentials>>) -> RwLockWriteGuard<'_, Option<Credentials>> {
    slot.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Credentials after a refresh, if `current` still holds `stale`
fn refreshed(
    current: &Option<Credentials>,
    stale: &str,
    access_token: &str,
    refresh_token: Option<&str>,
) -> Option<Credentials> {
    match current {
        Some(current) if current.access_token == stale => Some(Credentials::new(
            access_token,
            refresh_token.unwrap_or(&current.refresh_token),
        )),
        Some(_) => {
            debug!("Ignoring refreshed token, access token was replaced meanwhile");
            None
        }
        None => {
            debug!("Ignoring refreshed token, no credentials stored");
            None
        }
    }
}

/// Non-persistent store, for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryTokenStore {
    slot: RwLock<Option<Credentials>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            slot: RwLock::new(Some(credentials)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Option<Credentials> {
        read_slot(&self.slot).clone()
    }

    fn set(&self, credentials: &Credentials) -> Result<()> {
        *write_slot(&self.slot) = Some(credentials.clone());
        Ok(())
    }

    fn replace_access(
        &self,
        stale: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<bool> {
        let mut slot = write_slot(&self.slot);
        match refreshed(&slot, stale, access_token, refresh_token) {
            Some(next) => {
                *slot = Some(next);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn clear(&self) -> Result<()> {
        *write_slot(&self.slot) = None;
        Ok(())
    }
}

/// Tokens persisted as `tokens.json` under the data directory.
///
/// Writes land in a temp file that is renamed over the real one; clearing
/// removes the file, so both keys disappear together.
pub struct FileTokenStore {
    path: PathBuf,
    slot: RwLock<Option<Credentials>>,
}

impl FileTokenStore {
    /// Open the store in `data_dir`, loading any saved tokens.
    ///
    /// An unreadable token file is treated as a logged-out state.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(TOKEN_FILE);
        let loaded = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read token file {}", path.display()))?;
            match serde_json::from_str::<Credentials>(&contents) {
                Ok(credentials) => Some(credentials),
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "Discarding unparseable token file");
                    None
                }
            }
        } else {
            None
        };
        debug!(path = %path.display(), loaded = loaded.is_some(), "Token store opened");

        Ok(Self {
            path,
            slot: RwLock::new(loaded),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, credentials: &Credentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(credentials)?;
        std::fs::write(&tmp, contents).context("Failed to write token file")?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace token file")?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("Failed to restrict token file permissions")
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

impl TokenStore for FileTokenStore {
    fn get(&self) -> Option<Credentials> {
        read_slot(&self.slot).clone()
    }

    fn set(&self, credentials: &Credentials) -> Result<()> {
        let mut slot = write_slot(&self.slot);
        self.write_file(credentials)?;
        *slot = Some(credentials.clone());
        Ok(())
    }

    fn replace_access(
        &self,
        stale: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<bool> {
        let mut slot = write_slot(&self.slot);
        match refreshed(&slot, stale, access_token, refresh_token) {
            Some(next) => {
                self.write_file(&next)?;
                *slot = Some(next);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn clear(&self) -> Result<()> {
        let mut slot = write_slot(&self.slot);
        *slot = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove token file")?;
        }
        Ok(())
    }
}

/// Tokens kept in the OS keychain, one entry per well-known key
pub struct KeyringTokenStore {
    slot: RwLock<Option<Credentials>>,
}

impl KeyringTokenStore {
    pub fn open() -> Result<Self> {
        let access = Self::read_entry(ACCESS_TOKEN_KEY)?;
        let refresh = Self::read_entry(REFRESH_TOKEN_KEY)?;
        let loaded = match (access, refresh) {
            (Some(access), Some(refresh)) => Some(Credentials::new(access, refresh)),
            _ => None,
        };
        debug!(loaded = loaded.is_some(), "Keychain token store opened");
        Ok(Self {
            slot: RwLock::new(loaded),
        })
    }

    fn entry(key: &str) -> Result<Entry> {
        Entry::new(SERVICE_NAME, key).context("Failed to create keyring entry")
    }

    fn read_entry(key: &str) -> Result<Option<String>> {
        match Self::entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {} from keychain", key)),
        }
    }

    fn write_entries(credentials: &Credentials) -> Result<()> {
        Self::entry(ACCESS_TOKEN_KEY)?
            .set_password(&credentials.access_token)
            .context("Failed to store access token in keychain")?;
        Self::entry(REFRESH_TOKEN_KEY)?
            .set_password(&credentials.refresh_token)
            .context("Failed to store refresh token in keychain")?;
        Ok(())
    }

    fn delete_entry(key: &str) -> Result<()> {
        match Self::entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {} from keychain", key)),
        }
    }
}

impl TokenStore for KeyringTokenStore {
    fn get(&self) -> Option<Credentials> {
        read_slot(&self.slot).clone()
    }

    fn set(&self, credentials: &Credentials) -> Result<()> {
        let mut slot = write_slot(&self.slot);
        Self::write_entries(credentials)?;
        *slot = Some(credentials.clone());
        Ok(())
    }

    fn replace_access(
        &self,
        stale: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<bool> {
        let mut slot = write_slot(&self.slot);
        match refreshed(&slot, stale, access_token, refresh_token) {
            Some(next) => {
                Self::write_entries(&next)?;
                *slot = Some(next);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn clear(&self) -> Result<()> {
        let mut slot = write_slot(&self.slot);
        *slot = None;
        let access = Self::delete_entry(ACCESS_TOKEN_KEY);
        let refresh = Self::delete_entry(REFRESH_TOKEN_KEY);
        access.and(refresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_lifecycle() {
        let store = MemoryTokenStore::new();
        assert!(store.get().is_none());

        store.set(&Credentials::new("A1", "R1")).unwrap();
        assert_eq!(store.access_token().as_deref(), Some("A1"));
        assert_eq!(store.refresh_token().as_deref(), Some("R1"));

        assert!(store.replace_access("A1", "A2", None).unwrap());
        assert_eq!(store.get(), Some(Credentials::new("A2", "R1")));

        assert!(store.replace_access("A2", "A3", Some("R3")).unwrap());
        assert_eq!(store.get(), Some(Credentials::new("A3", "R3")));

        store.clear().unwrap();
        assert!(!store.has_credentials());
    }

    #[test]
    fn test_replace_access_after_logout_is_noop() {
        let store = MemoryTokenStore::with_credentials(Credentials::new("A1", "R1"));
        store.clear().unwrap();
        assert!(!store.replace_access("A1", "A2", Some("R2")).unwrap());
        assert!(store.get().is_none());
    }

    #[test]
    fn test_replace_access_after_new_login_is_noop() {
        let store = MemoryTokenStore::with_credentials(Credentials::new("A1", "R1"));
        store.set(&Credentials::new("N1", "NR1")).unwrap();
        assert!(!store.replace_access("A1", "A2", None).unwrap());
        assert_eq!(store.get(), Some(Credentials::new("N1", "NR1")));
    }

    #[test]
    fn test_replace_access_racing_clear_never_resurrects() {
        use std::sync::Arc;

        for _ in 0..200 {
            let store = Arc::new(MemoryTokenStore::with_credentials(Credentials::new("A1", "R1")));
            let refresher = {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.replace_access("A1", "A2", Some("R2")).unwrap())
            };
            store.clear().unwrap();
            let replaced = refresher.join().unwrap();

            // Whichever ran first, the logout is the last word
            assert!(store.get().is_none(), "replaced={}", replaced);
        }
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileTokenStore::open(dir.path()).unwrap();
            store.set(&Credentials::new("A1", "R1")).unwrap();
            assert!(store.replace_access("A1", "A2", None).unwrap());
        }

        let reopened = FileTokenStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(), Some(Credentials::new("A2", "R1")));

        let raw = std::fs::read_to_string(reopened.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value[ACCESS_TOKEN_KEY], "A2");
        assert_eq!(value[REFRESH_TOKEN_KEY], "R1");
    }

    #[test]
    fn test_file_store_clear_removes_both_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::open(dir.path()).unwrap();
        store.set(&Credentials::new("A1", "R1")).unwrap();
        assert!(store.path().exists());

        store.clear().unwrap();
        assert!(!store.path().exists());
        assert!(store.get().is_none());
        assert!(FileTokenStore::open(dir.path()).unwrap().get().is_none());

        // Clearing twice is fine
        store.clear().unwrap();

        // A refresh landing after the logout writes nothing back to disk
        assert!(!store.replace_access("A1", "A2", Some("R2")).unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_file_store_ignores_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TOKEN_FILE), "{not json").unwrap();
        let store = FileTokenStore::open(dir.path()).unwrap();
        assert!(store.get().is_none());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let rendered = format!("{:?}", Credentials::new("secret-access", "secret-refresh"));
        assert!(!rendered.contains("secret"));
    }
}

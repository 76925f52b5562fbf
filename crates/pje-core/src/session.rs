//! On-disk session persistence: a cookie map plus a freshness marker.
//! Pure durability; whether a saved session is still usable is decided by
//! the auth service with a live probe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const COOKIES_FILE: &str = "cookies.json";
const INFO_FILE: &str = "session_info.json";

#[derive(Debug, Serialize, Deserialize)]
struct SessionInfo {
    saved_at: String,
    timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist the cookie map and refresh the freshness marker.
    pub fn save(&self, cookies: &HashMap<String, String>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating session dir {}", self.dir.display()))?;
        let now = Local::now();
        let info = SessionInfo {
            saved_at: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            timestamp: now.timestamp(),
        };
        std::fs::write(
            self.dir.join(COOKIES_FILE),
            serde_json::to_string_pretty(cookies).context("serializing cookies")?,
        )
        .context("writing cookies")?;
        std::fs::write(
            self.dir.join(INFO_FILE),
            serde_json::to_string_pretty(&info).context("serializing session info")?,
        )
        .context("writing session info")?;
        debug!(dir = %self.dir.display(), cookies = cookies.len(), "session saved");
        Ok(())
    }

    /// Load the saved cookie map, or `None` when nothing usable is on disk.
    pub fn load(&self) -> Option<HashMap<String, String>> {
        let raw = std::fs::read_to_string(self.dir.join(COOKIES_FILE)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(map) => Some(map),
            Err(err) => {
                warn!(%err, "saved cookies are unreadable, ignoring");
                None
            }
        }
    }

    /// True when the freshness marker exists and is younger than `max_age`.
    pub fn is_fresh(&self, max_age_hours: i64) -> bool {
        let Ok(raw) = std::fs::read_to_string(self.dir.join(INFO_FILE)) else {
            return false;
        };
        let Ok(info) = serde_json::from_str::<SessionInfo>(&raw) else {
            return false;
        };
        let Some(saved) = DateTime::from_timestamp(info.timestamp, 0) else {
            return false;
        };
        Local::now().signed_duration_since(saved) < Duration::hours(max_age_hours)
    }

    /// Remove both files. Missing files are fine.
    pub fn clear(&self) {
        for name in [COOKIES_FILE, INFO_FILE] {
            let path = self.dir.join(name);
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(%err, path = %path.display(), "failed to remove session file");
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cookies() -> HashMap<String, String> {
        HashMap::from([
            ("JSESSIONID".to_string(), "abc123".to_string()),
            ("KEYCLOAK_SESSION".to_string(), "xyz".to_string()),
        ])
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session"));
        store.save(&sample_cookies()).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.get("JSESSIONID").map(String::as_str), Some("abc123"));
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn fresh_right_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save(&sample_cookies()).unwrap();
        assert!(store.is_fresh(8));
        assert!(!store.is_fresh(0));
    }

    #[test]
    fn missing_session_is_stale_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nope"));
        assert!(store.load().is_none());
        assert!(!store.is_fresh(8));
        store.clear();
    }

    #[test]
    fn clear_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save(&sample_cookies()).unwrap();
        store.clear();
        assert!(store.load().is_none());
        assert!(!store.is_fresh(8));
    }

    #[test]
    fn corrupt_cookies_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        std::fs::write(dir.path().join(COOKIES_FILE), "{not json").unwrap();
        assert!(store.load().is_none());
    }
}

use std::collections::HashMap;
use std::path::PathBuf;

/// Full engine configuration. Every tunable the services consume lives here,
/// so tests can shrink delays to zero and the CLI stays a thin layer.
/// Credentials come from env/.env only and are resolved separately.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub sso_url: String,

    pub download_dir: PathBuf,
    pub session_dir: PathBuf,
    pub log_dir: PathBuf,

    pub http_timeout_secs: u64,
    // Streamed document fetches get their own, much larger deadline; the
    // page/API timeout would kill a healthy slow transfer mid-stream.
    pub download_timeout_secs: u64,
    pub session_max_age_hours: i64,

    // Pacing between portal requests, jittered inside the range.
    pub request_delay_min_ms: u64,
    pub request_delay_max_ms: u64,

    // Pipeline tuning
    pub batch_size: usize,
    pub batch_wait_secs: u64,
    pub final_wait_secs: u64,
    pub poll_interval_secs: u64,
    pub search_timeout_secs: u64,
    pub retry_delay_secs: u64,
    pub retry_settle_secs: u64,
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "https://pje.tjba.jus.br".to_string(),
            sso_url: "https://sso.cloud.pje.jus.br".to_string(),
            download_dir: PathBuf::from("downloads"),
            session_dir: PathBuf::from(".pje_session"),
            log_dir: PathBuf::from("logs"),
            http_timeout_secs: 30,
            download_timeout_secs: 600,
            session_max_age_hours: 8,
            request_delay_min_ms: 500,
            request_delay_max_ms: 3000,
            batch_size: 10,
            batch_wait_secs: 60,
            final_wait_secs: 300,
            poll_interval_secs: 10,
            search_timeout_secs: 30,
            retry_delay_secs: 5,
            retry_settle_secs: 15,
            max_retries: 2,
        }
    }
}

impl EngineConfig {
    /// Build from env vars, falling back to a local `.env`, then defaults.
    pub fn from_env() -> Self {
        let dotenv = parse_dotenv();
        let d = Self::default();
        Self {
            base_url: get_str("PJE_BASE_URL", &dotenv, &d.base_url),
            sso_url: get_str("PJE_SSO_URL", &dotenv, &d.sso_url),
            download_dir: PathBuf::from(get_str(
                "PJE_DOWNLOAD_DIR",
                &dotenv,
                &d.download_dir.to_string_lossy(),
            )),
            session_dir: PathBuf::from(get_str(
                "PJE_SESSION_DIR",
                &dotenv,
                &d.session_dir.to_string_lossy(),
            )),
            log_dir: PathBuf::from(get_str("PJE_LOG_DIR", &dotenv, &d.log_dir.to_string_lossy())),
            http_timeout_secs: get_u64("PJE_HTTP_TIMEOUT_SECS", &dotenv, d.http_timeout_secs),
            download_timeout_secs: get_u64(
                "PJE_DOWNLOAD_TIMEOUT_SECS",
                &dotenv,
                d.download_timeout_secs,
            ),
            session_max_age_hours: get_i64(
                "PJE_SESSION_MAX_AGE_HOURS",
                &dotenv,
                d.session_max_age_hours,
            ),
            request_delay_min_ms: get_u64("PJE_DELAY_MIN_MS", &dotenv, d.request_delay_min_ms),
            request_delay_max_ms: get_u64("PJE_DELAY_MAX_MS", &dotenv, d.request_delay_max_ms),
            batch_size: get_u64("PJE_BATCH_SIZE", &dotenv, d.batch_size as u64) as usize,
            batch_wait_secs: get_u64("PJE_BATCH_WAIT_SECS", &dotenv, d.batch_wait_secs),
            final_wait_secs: get_u64("PJE_FINAL_WAIT_SECS", &dotenv, d.final_wait_secs),
            poll_interval_secs: get_u64("PJE_POLL_INTERVAL_SECS", &dotenv, d.poll_interval_secs),
            search_timeout_secs: get_u64("PJE_SEARCH_TIMEOUT_SECS", &dotenv, d.search_timeout_secs),
            retry_delay_secs: get_u64("PJE_RETRY_DELAY_SECS", &dotenv, d.retry_delay_secs),
            retry_settle_secs: get_u64("PJE_RETRY_SETTLE_SECS", &dotenv, d.retry_settle_secs),
            max_retries: get_u32("PJE_MAX_RETRIES", &dotenv, d.max_retries),
        }
    }

    /// REST API root derived from the portal base URL.
    pub fn api_base(&self) -> String {
        format!("{}/pje/seam/resource/rest/pje-legacy", self.base_url)
    }
}

/// Credential resolution: explicit values win, then `PJE_USER`/`PJE_PASSWORD`,
/// then the bare `USER`/`PASSWORD` pair, env before `.env` at each step.
pub fn resolve_credentials(
    user: Option<String>,
    password: Option<String>,
) -> Option<(String, String)> {
    let dotenv = parse_dotenv();
    let user = user
        .or_else(|| get("PJE_USER", &dotenv))
        .or_else(|| get("USER", &dotenv))?;
    let password = password
        .or_else(|| get("PJE_PASSWORD", &dotenv))
        .or_else(|| get("PASSWORD", &dotenv))?;
    Some((user, password))
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = EngineConfig::default();
        assert_eq!(c.http_timeout_secs, 30);
        assert!(c.download_timeout_secs > c.http_timeout_secs);
        assert_eq!(c.session_max_age_hours, 8);
        assert_eq!(c.batch_size, 10);
        assert_eq!(c.max_retries, 2);
        assert!(c.request_delay_min_ms <= c.request_delay_max_ms);
    }

    #[test]
    fn api_base_derived_from_base_url() {
        let c = EngineConfig::default();
        assert_eq!(
            c.api_base(),
            "https://pje.tjba.jus.br/pje/seam/resource/rest/pje-legacy"
        );
    }

    #[test]
    fn explicit_credentials_win() {
        let creds = resolve_credentials(Some("alice".into()), Some("s3cret".into()));
        assert_eq!(creds, Some(("alice".into(), "s3cret".into())));
    }

    #[test]
    fn missing_credentials_yield_none() {
        // No env or .env in the test environment for these keys.
        assert!(resolve_credentials(Some("alice".into()), None).is_none());
    }
}

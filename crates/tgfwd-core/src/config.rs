use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{errors::Error, filter::FilterMode, Result};

/// Typed configuration, loaded from environment variables with an
/// optional `.env` file.
#[derive(Clone, Debug)]
pub struct Config {
    // Credentials
    pub bot_token: String,
    pub api_id: i32,
    pub api_hash: String,

    // Storage
    pub database_url: String,

    // Session encryption
    pub session_encryption_key: String,

    // Observability
    pub log_level: String,
    pub log_format: LogFormat,

    // Rate limiting
    pub max_messages_per_second: u32,
    pub flood_wait_multiplier: f64,

    // Retry
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub retry_scan_interval: Duration,

    // Ingestion
    pub media_group_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_page_size: u32,

    // DM fallback
    pub dm_max_media_size_mb: u64,

    // Keyword filtering
    pub filter_keywords: Vec<String>,
    pub filter_mode: FilterMode,
    pub filter_case_sensitive: bool,

    // Auth
    pub max_auth_attempts: u32,
    pub auth_code_timeout: Duration,

    // Session health
    pub session_check_interval: Duration,

    // Limits
    pub max_sources_per_user: i64,

    // MTProto bridge process
    pub mtproto_bridge_cmd: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Console,
    Json,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let bot_token = env_str("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(Error::Config(
                "BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let api_id = env_str("API_ID")
            .and_then(|s| s.trim().parse::<i32>().ok())
            .ok_or_else(|| Error::Config("API_ID environment variable is required".to_string()))?;
        let api_hash = env_str("API_HASH").and_then(non_empty).ok_or_else(|| {
            Error::Config("API_HASH environment variable is required".to_string())
        })?;

        let session_encryption_key = env_str("SESSION_ENCRYPTION_KEY")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("SESSION_ENCRYPTION_KEY environment variable is required".to_string())
            })?;

        let database_url =
            env_str("DATABASE_URL").unwrap_or_else(|| "sqlite://data/relay.db".to_string());

        let log_level = env_str("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_format = match env_str("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Console,
        };

        let max_messages_per_second = env_u32("MAX_MESSAGES_PER_SECOND").unwrap_or(30).max(1);
        let flood_wait_multiplier = env_f64("FLOOD_WAIT_MULTIPLIER").unwrap_or(1.5).max(1.0);

        let max_retries = env_u32("MAX_RETRIES").unwrap_or(5);
        let base_retry_delay = duration_secs_f64(env_f64("BASE_RETRY_DELAY").unwrap_or(1.0));
        let max_retry_delay = duration_secs_f64(env_f64("MAX_RETRY_DELAY").unwrap_or(300.0));
        let retry_scan_interval = Duration::from_secs(env_u64("RETRY_SCAN_INTERVAL").unwrap_or(60));

        let media_group_timeout = duration_secs_f64(env_f64("MEDIA_GROUP_TIMEOUT").unwrap_or(2.0));
        let poll_interval = Duration::from_secs(env_u64("POLL_INTERVAL").unwrap_or(30));
        let poll_page_size = env_u32("POLL_PAGE_SIZE").unwrap_or(20).max(1);

        let dm_max_media_size_mb = env_u64("DM_MAX_MEDIA_SIZE_MB").unwrap_or(20);

        let filter_keywords = parse_csv(env_str("FILTER_KEYWORDS"));
        let filter_mode = match env_str("FILTER_MODE").as_deref() {
            Some("whitelist") => FilterMode::Whitelist,
            _ => FilterMode::Blacklist,
        };
        let filter_case_sensitive = env_bool("FILTER_CASE_SENSITIVE").unwrap_or(false);

        let max_auth_attempts = env_u32("MAX_AUTH_ATTEMPTS").unwrap_or(3).max(1);
        let auth_code_timeout = Duration::from_secs(env_u64("AUTH_CODE_TIMEOUT").unwrap_or(300));

        let session_check_interval =
            Duration::from_secs(env_u64("SESSION_CHECK_INTERVAL").unwrap_or(300));

        let max_sources_per_user = env_u64("MAX_SOURCES_PER_USER").unwrap_or(50) as i64;

        let mtproto_bridge_cmd = PathBuf::from(
            env_str("MTPROTO_BRIDGE_CMD").unwrap_or_else(|| "mtproto-bridge".to_string()),
        );

        Ok(Self {
            bot_token,
            api_id,
            api_hash,
            database_url,
            session_encryption_key,
            log_level,
            log_format,
            max_messages_per_second,
            flood_wait_multiplier,
            max_retries,
            base_retry_delay,
            max_retry_delay,
            retry_scan_interval,
            media_group_timeout,
            poll_interval,
            poll_page_size,
            dm_max_media_size_mb,
            filter_keywords,
            filter_mode,
            filter_case_sensitive,
            max_auth_attempts,
            auth_code_timeout,
            session_check_interval,
            max_sources_per_user,
            mtproto_bridge_cmd,
        })
    }

    pub fn dm_max_media_bytes(&self) -> u64 {
        self.dm_max_media_size_mb * 1024 * 1024
    }
}

fn duration_secs_f64(secs: f64) -> Duration {
    Duration::from_secs_f64(secs.max(0.0))
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    env_str(key).and_then(|s| s.trim().parse::<f64>().ok())
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        bot_token: "test-token".to_string(),
        api_id: 1,
        api_hash: "hash".to_string(),
        database_url: "sqlite::memory:".to_string(),
        session_encryption_key: "test-master-key".to_string(),
        log_level: "info".to_string(),
        log_format: LogFormat::Console,
        max_messages_per_second: 1000,
        flood_wait_multiplier: 1.0,
        max_retries: 5,
        base_retry_delay: Duration::from_secs(1),
        max_retry_delay: Duration::from_secs(300),
        retry_scan_interval: Duration::from_secs(60),
        media_group_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_secs(30),
        poll_page_size: 20,
        dm_max_media_size_mb: 20,
        filter_keywords: vec![],
        filter_mode: FilterMode::Blacklist,
        filter_case_sensitive: false,
        max_auth_attempts: 3,
        auth_code_timeout: Duration::from_secs(300),
        session_check_interval: Duration::from_secs(300),
        max_sources_per_user: 50,
        mtproto_bridge_cmd: PathBuf::from("mtproto-bridge"),
    }
}

use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};

/// Initialize tracing for the relay.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},sqlx=warn,hyper=warn", cfg.log_level.to_lowercase()))
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match cfg.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Console => builder.init(),
    }
}

//! Environment-driven runtime configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    /// Collection window per round; quorum closes a round earlier.
    pub round_timeout: Duration,
    pub default_model: String,
    pub default_rounds: u32,
    pub default_epochs: u32,
    pub roster_file: Option<PathBuf>,
    /// Unset means no durable store: sessions live in memory only.
    pub db_path: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8600).into(),
            round_timeout: Duration::from_secs(20),
            default_model: "dnn".into(),
            default_rounds: 50,
            default_epochs: 10,
            roster_file: None,
            db_path: None,
        }
    }
}

impl CoordinatorConfig {
    /// Reads `FEDFLEET_*` variables, falling back to defaults field by field.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            listen_addr: env_parse("FEDFLEET_LISTEN_ADDR", d.listen_addr),
            round_timeout: Duration::from_secs(env_parse(
                "FEDFLEET_ROUND_TIMEOUT_SECS",
                d.round_timeout.as_secs(),
            )),
            default_model: std::env::var("FEDFLEET_DEFAULT_MODEL").unwrap_or(d.default_model),
            default_rounds: env_parse("FEDFLEET_DEFAULT_ROUNDS", d.default_rounds),
            default_epochs: env_parse("FEDFLEET_DEFAULT_EPOCHS", d.default_epochs),
            roster_file: std::env::var("FEDFLEET_ROSTER_FILE").ok().map(PathBuf::from),
            db_path: std::env::var("FEDFLEET_DB_PATH").ok().map(PathBuf::from),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_WORKFLOW_GOAL: &str = "go to {url} which is an ecommerce website, \
Follow the instruction on screen,& complete the purchase, Make sure that all respective \
choices of the product specification are chosen in product details page. view a product \
details click on the product ID.";

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the observer listens on
    pub port: u16,
    /// Directory holding per-session event logs, the ledger and the marker file
    pub log_dir: PathBuf,
    /// Base URL of the system hosting session instruction pages
    pub internal_url: String,
    /// Publicly reachable base URL for session display links
    pub display_url: String,
    /// Remote workflow API credential; `None` runs in dry-run mode.
    pub nfig_api_key: Option<String>,
    /// Remote workflow API base URL
    pub nfig_api_base_url: String,
    /// Goal template sent when creating a workflow; `{url}` is the display URL.
    pub workflow_goal: String,
    /// How often the monitor polls a session's event log
    pub poll_interval: Duration,
    /// How long a session may run before it is timed out
    pub session_timeout: Duration,
    /// Per-request timeout for remote HTTP calls
    pub remote_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            port: env_parse("OBSERVER_PORT", 5000)?,
            log_dir: PathBuf::from(env_str("OBSERVER_LOG_DIR", "user_session_logs/mturk")),
            internal_url: env_str("INTERNAL_URL", "http://localhost:3000"),
            display_url: env_str("EXTERNAL_ACCESS_URL", "http://localhost:3000"),
            nfig_api_key: std::env::var("NFIG_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            nfig_api_base_url: env_str("NFIG_API_BASE_URL", "https://api-staging.nfig.ai"),
            workflow_goal: env_str("OBSERVER_WORKFLOW_GOAL", DEFAULT_WORKFLOW_GOAL),
            poll_interval: Duration::from_millis(env_parse("OBSERVER_POLL_INTERVAL_MS", 1000)?),
            session_timeout: Duration::from_secs(env_parse(
                "OBSERVER_SESSION_TIMEOUT_SECS",
                120,
            )?),
            remote_timeout: Duration::from_secs(env_parse("OBSERVER_REMOTE_TIMEOUT_SECS", 30)?),
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Join a base URL and a session id without doubling the separator.
pub fn session_url(base: &str, session_id: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_url_trims_trailing_slash() {
        assert_eq!(
            session_url("http://localhost:3000/", "fixed_1"),
            "http://localhost:3000/fixed_1"
        );
        assert_eq!(
            session_url("https://webshop.example", "abc"),
            "https://webshop.example/abc"
        );
    }

    #[test]
    fn test_env_parse_reports_bad_values() {
        std::env::set_var("OBSERVER_TEST_BAD_PORT", "not-a-port");
        let err = env_parse::<u16>("OBSERVER_TEST_BAD_PORT", 1).unwrap_err();
        assert!(err.to_string().contains("OBSERVER_TEST_BAD_PORT"));
        std::env::remove_var("OBSERVER_TEST_BAD_PORT");

        assert_eq!(env_parse::<u16>("OBSERVER_TEST_UNSET_PORT", 7).unwrap(), 7);
    }
}

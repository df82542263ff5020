use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Misspelled variable read by earlier tooling; still honoured as a fallback.
const LEGACY_API_KEY_ENV: &str = "DASHCOPE_API_KEY";

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Maximum number of classifier calls in flight at once (also the worker count)
    #[arg(long, env = "MAX_CONCURRENT_REQUESTS", default_value = "5")]
    pub max_concurrent_requests: usize,

    /// Maximum number of classifier calls started in any one-second window
    #[arg(long, env = "MAX_CALLS_PER_SECOND", default_value = "5")]
    pub max_calls_per_second: usize,

    /// Number of samples to evaluate: an integer, or "all" (-1 also means all)
    #[arg(long = "sample", env = "SAMPLE_LIMIT", default_value = "10", value_parser = parse_sample_limit, allow_hyphen_values = true)]
    pub sample_limit: SampleLimit,

    /// Upper bound in milliseconds of the random jitter added when the rate window is full
    #[arg(long, env = "RATE_LIMIT_JITTER_MS", default_value = "300")]
    pub max_jitter_ms: u64,

    /// Dataset root containing Phenotypes/ and TongueImage/Raw/
    #[arg(long, env = "DATA_DIR", default_value = "data/TonguExpertDatabase")]
    pub data_dir: PathBuf,

    /// Directory the predictions, metrics and report are written to
    #[arg(long, env = "OUTPUT_DIR", default_value = "out_put/baseline_results")]
    pub output_dir: PathBuf,

    /// API key for the OpenAI-compatible vision endpoint (DASHCOPE_API_KEY is also read)
    #[arg(long, env = "DASHSCOPE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible vision endpoint
    #[arg(
        long,
        env = "BASE_URL",
        default_value = "https://dashscope.aliyuncs.com/compatible-mode/v1"
    )]
    pub base_url: String,

    /// Vision model name
    #[arg(long, env = "MODEL", default_value = "qwen-vl-max")]
    pub model: String,

    /// HTTP timeout for a single classifier call, in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "120")]
    pub request_timeout_secs: u64,

    /// Serve Prometheus counters on this address while the run is active
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Emit JSON log lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

/// How many ground-truth rows to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLimit {
    All,
    Count(usize),
}

fn parse_sample_limit(value: &str) -> Result<SampleLimit, String> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("all") || value == "-1" {
        return Ok(SampleLimit::All);
    }
    value
        .parse::<usize>()
        .map(SampleLimit::Count)
        .map_err(|_| format!("expected a non-negative integer or \"all\", got {value:?}"))
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_concurrent: usize,
    pub max_per_second: usize,
    pub min_jitter: Duration,
    pub max_jitter: Duration,
}

impl From<&Config> for RateLimitConfig {
    fn from(config: &Config) -> Self {
        let max_jitter = Duration::from_millis(config.max_jitter_ms);
        Self {
            max_concurrent: config.max_concurrent_requests,
            max_per_second: config.max_calls_per_second,
            min_jitter: Duration::from_millis(50).min(max_jitter),
            max_jitter,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub workers: usize,
}

impl From<&Config> for DispatchConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.max_concurrent_requests,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_requests == 0 {
            anyhow::bail!("--max-concurrent-requests must be at least 1");
        }
        if self.max_calls_per_second == 0 {
            anyhow::bail!("--max-calls-per-second must be at least 1");
        }
        Ok(())
    }

    /// `--api-key`/`DASHSCOPE_API_KEY`, falling back to `DASHCOPE_API_KEY`.
    pub fn resolved_api_key(&self) -> Option<String> {
        api_key_or_legacy(
            self.api_key.clone(),
            std::env::var(LEGACY_API_KEY_ENV).ok(),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn api_key_or_legacy(primary: Option<String>, legacy: Option<String>) -> Option<String> {
    primary
        .into_iter()
        .chain(legacy)
        .find(|key| !key.trim().is_empty())
}

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use harvest_adapters::{ScheduleBucket, StrategyConfig, DEFAULT_CONFIDENCE_THRESHOLD, MAX_PAGE_TEXT_CHARS};
use harvest_storage::{BackoffPolicy, HttpClientConfig};

use crate::batch::{BatchLimits, DEFAULT_PAYLOAD_MARGIN};

pub const MAX_SOURCE_CONCURRENCY: usize = 3;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sources_file: PathBuf,
    pub store_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub cron_daily: String,
    pub cron_weekly: String,
    pub cron_monthly: String,
    pub cron_frequent: String,
    pub user_agent: String,
    pub page_timeout_secs: u64,
    pub retries: usize,
    pub retry_delay_ms: u64,
    pub politeness_delay_ms: u64,
    pub source_concurrency: usize,
    pub ai_endpoint: Option<String>,
    pub ai_token: Option<String>,
    pub ai_first: bool,
    pub ai_timeout_secs: u64,
    pub confidence_threshold: f64,
    pub workflow_endpoint: Option<String>,
    pub workflow_token: Option<String>,
    pub payload_margin: usize,
    pub batch_name: String,
    pub cross_run_dedup: bool,
    pub run_deadline_secs: Option<u64>,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sources_file: PathBuf::from("sources.yaml"),
            store_dir: PathBuf::from("./event-store"),
            scheduler_enabled: false,
            cron_daily: "0 0 6 * * *".to_string(),
            cron_weekly: "0 0 5 * * Mon".to_string(),
            cron_monthly: "0 0 4 1 * *".to_string(),
            cron_frequent: "0 0 */4 * * *".to_string(),
            user_agent: "event-harvester/0.1".to_string(),
            page_timeout_secs: 30,
            retries: 2,
            retry_delay_ms: 1_000,
            politeness_delay_ms: 2_000,
            source_concurrency: 1,
            ai_endpoint: None,
            ai_token: None,
            ai_first: true,
            ai_timeout_secs: 60,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            workflow_endpoint: None,
            workflow_token: None,
            payload_margin: DEFAULT_PAYLOAD_MARGIN,
            batch_name: "events".to_string(),
            cross_run_dedup: true,
            run_deadline_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            sources_file: std::env::var("HARVEST_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(d.sources_file),
            store_dir: std::env::var("HARVEST_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.store_dir),
            scheduler_enabled: env_flag("HARVEST_SCHEDULER_ENABLED", d.scheduler_enabled),
            cron_daily: env_string("HARVEST_CRON_DAILY", &d.cron_daily),
            cron_weekly: env_string("HARVEST_CRON_WEEKLY", &d.cron_weekly),
            cron_monthly: env_string("HARVEST_CRON_MONTHLY", &d.cron_monthly),
            cron_frequent: env_string("HARVEST_CRON_FREQUENT", &d.cron_frequent),
            user_agent: env_string("HARVEST_USER_AGENT", &d.user_agent),
            page_timeout_secs: env_parse("HARVEST_PAGE_TIMEOUT_SECS", d.page_timeout_secs),
            retries: env_parse("HARVEST_RETRIES", d.retries),
            retry_delay_ms: env_parse("HARVEST_RETRY_DELAY_MS", d.retry_delay_ms),
            politeness_delay_ms: env_parse("HARVEST_POLITENESS_DELAY_MS", d.politeness_delay_ms),
            source_concurrency: env_parse("HARVEST_SOURCE_CONCURRENCY", d.source_concurrency)
                .clamp(1, MAX_SOURCE_CONCURRENCY),
            ai_endpoint: env_opt("HARVEST_AI_ENDPOINT"),
            ai_token: env_opt("HARVEST_AI_TOKEN"),
            ai_first: env_flag("HARVEST_AI_FIRST", d.ai_first),
            ai_timeout_secs: env_parse("HARVEST_AI_TIMEOUT_SECS", d.ai_timeout_secs),
            confidence_threshold: env_parse("HARVEST_CONFIDENCE_THRESHOLD", d.confidence_threshold)
                .clamp(0.0, 1.0),
            workflow_endpoint: env_opt("HARVEST_WORKFLOW_ENDPOINT"),
            workflow_token: env_opt("HARVEST_WORKFLOW_TOKEN"),
            payload_margin: env_parse("HARVEST_PAYLOAD_MARGIN", d.payload_margin),
            batch_name: env_string("HARVEST_BATCH_NAME", &d.batch_name),
            cross_run_dedup: env_flag("HARVEST_CROSS_RUN_DEDUP", d.cross_run_dedup),
            run_deadline_secs: env_opt("HARVEST_RUN_DEADLINE_SECS").and_then(|v| v.parse().ok()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.page_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.source_concurrency.clamp(1, MAX_SOURCE_CONCURRENCY),
            per_source_concurrency: 1,
            backoff: BackoffPolicy::fixed(self.retries, Duration::from_millis(self.retry_delay_ms)),
        }
    }

    pub fn strategy_config(&self) -> StrategyConfig {
        StrategyConfig {
            ai_first: self.ai_first,
            confidence_threshold: self.confidence_threshold,
            page_timeout: Duration::from_secs(self.page_timeout_secs),
            ai_timeout: Duration::from_secs(self.ai_timeout_secs),
            max_page_text: MAX_PAGE_TEXT_CHARS,
        }
    }

    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits::with_margin(self.payload_margin)
    }

    pub fn cron_for(&self, bucket: ScheduleBucket) -> &str {
        match bucket {
            ScheduleBucket::Daily => &self.cron_daily,
            ScheduleBucket::Weekly => &self.cron_weekly,
            ScheduleBucket::Monthly => &self.cron_monthly,
            ScheduleBucket::Frequent => &self.cron_frequent,
        }
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.cron_for(ScheduleBucket::Weekly), "0 0 5 * * Mon");
        assert_eq!(config.batch_limits().margin, 260_000);
        assert_eq!(config.strategy_config().confidence_threshold, 0.7);
        let http = config.http_client_config();
        assert_eq!(http.timeout, Duration::from_secs(30));
        assert_eq!(http.backoff.max_retries, 2);
        assert_eq!(http.backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.run_deadline(), None);
    }
}

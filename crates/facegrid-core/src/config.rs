//! facegrid.toml configuration.
//!
//! One file configures every role; each role validates only the settings
//! it needs. Identifiers can be overridden from the environment
//! (`FACEGRID_REQUEST_QUEUE`, `FACEGRID_INPUT_BUCKET`, ...).
//!
//! ```toml
//! [aws]
//! region = "us-east-1"
//!
//! [queues]
//! request = "facegrid-req"
//! response = "facegrid-resp"
//!
//! [buckets]
//! input = "facegrid-in"
//! output = "facegrid-out"
//!
//! [gateway]
//! result_wait = "60s"
//! poll_interval = "500ms"
//!
//! [autoscaler]
//! max_instances = 15
//! grace_period = "5s"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Which process is being configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Gateway,
    Worker,
    Autoscaler,
    /// All roles in one process over in-memory backends.
    Standalone,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FacegridConfig {
    pub aws: AwsConfig,
    pub queues: QueueNames,
    pub buckets: BucketNames,
    pub gateway: GatewayConfig,
    pub worker: WorkerConfig,
    pub autoscaler: AutoscalerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
    /// Custom endpoint, e.g. a LocalStack URL.
    pub endpoint_url: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
        }
    }
}

/// Queue names or URLs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueNames {
    pub request: Option<String>,
    pub response: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketNames {
    pub input: Option<String>,
    /// Where results are written. Defaults to the input bucket.
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    /// Multipart field carrying the image.
    pub upload_field: String,
    pub max_upload_bytes: usize,
    /// How long a request waits for its result before answering 504.
    #[serde(with = "duration_str")]
    pub result_wait: Duration,
    /// How often a waiting request checks the correlation table.
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    /// Unclaimed results older than this are evicted.
    #[serde(with = "duration_str")]
    pub result_ttl: Duration,
    /// Response messages fetched per drain pass (1..=10).
    pub drain_batch: u32,
    /// Long-poll wait for each drain pass.
    #[serde(with = "duration_str")]
    pub drain_wait: Duration,
    /// Pause between drain passes.
    #[serde(with = "duration_str")]
    pub drain_pause: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            upload_field: "inputFile".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
            result_wait: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            result_ttl: Duration::from_secs(300),
            drain_batch: 10,
            drain_wait: Duration::from_secs(5),
            drain_pause: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Long-poll wait for each receive.
    #[serde(with = "duration_str")]
    pub receive_wait: Duration,
    /// Pause between iterations.
    #[serde(with = "duration_str")]
    pub idle_pause: Duration,
    /// Pause after a failed receive.
    #[serde(with = "duration_str")]
    pub error_pause: Duration,
    /// Enrolled gallery (JSON) used by the recognizer.
    pub gallery: Option<PathBuf>,
    /// Side length of the thumbnail used to embed images.
    pub thumbnail_side: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            receive_wait: Duration::from_secs(5),
            idle_pause: Duration::from_millis(500),
            error_pause: Duration::from_secs(1),
            gallery: None,
            thumbnail_side: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    /// Hard ceiling on active instances.
    pub max_instances: u32,
    /// Sustained over-provisioning required before stopping instances.
    #[serde(with = "duration_str")]
    pub grace_period: Duration,
    #[serde(with = "duration_str")]
    pub tick: Duration,
    /// Name-tag pattern identifying pool members.
    pub instance_name_pattern: String,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            max_instances: 15,
            grace_period: Duration::from_secs(5),
            tick: Duration::from_secs(2),
            instance_name_pattern: "app-tier-instance-*".to_string(),
        }
    }
}

impl FacegridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from an optional file, then apply process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override settings from `FACEGRID_*` variables supplied by `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("FACEGRID_REGION") {
            self.aws.region = v;
        }
        if let Some(v) = non_empty("FACEGRID_ENDPOINT_URL") {
            self.aws.endpoint_url = Some(v);
        }
        if let Some(v) = non_empty("FACEGRID_REQUEST_QUEUE") {
            self.queues.request = Some(v);
        }
        if let Some(v) = non_empty("FACEGRID_RESPONSE_QUEUE") {
            self.queues.response = Some(v);
        }
        if let Some(v) = non_empty("FACEGRID_INPUT_BUCKET") {
            self.buckets.input = Some(v);
        }
        if let Some(v) = non_empty("FACEGRID_OUTPUT_BUCKET") {
            self.buckets.output = Some(v);
        }
        if let Some(v) = non_empty("FACEGRID_GALLERY") {
            self.worker.gallery = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty("FACEGRID_MAX_INSTANCES") {
            self.autoscaler.max_instances =
                v.trim().parse().map_err(|e| ConfigError::Invalid {
                    field: "autoscaler.max_instances",
                    reason: format!("{v:?}: {e}"),
                })?;
        }
        if let Some(v) = non_empty("FACEGRID_GRACE_PERIOD") {
            self.autoscaler.grace_period = parse_duration(&v)?;
        }
        Ok(())
    }

    /// Check that everything `role` needs is present and sane.
    pub fn validate(&self, role: Role) -> Result<(), ConfigError> {
        match role {
            Role::Gateway => {
                self.request_queue()?;
                self.response_queue()?;
                self.input_bucket()?;
                self.validate_gateway()?;
            }
            Role::Worker => {
                self.request_queue()?;
                self.response_queue()?;
                self.input_bucket()?;
                self.gallery_path()?;
                self.validate_worker()?;
            }
            Role::Autoscaler => {
                self.request_queue()?;
                self.validate_autoscaler()?;
            }
            Role::Standalone => {
                self.gallery_path()?;
                self.validate_gateway()?;
                self.validate_worker()?;
                self.validate_autoscaler()?;
            }
        }
        Ok(())
    }

    pub fn request_queue(&self) -> Result<&str, ConfigError> {
        required(&self.queues.request, "queues.request")
    }

    pub fn response_queue(&self) -> Result<&str, ConfigError> {
        required(&self.queues.response, "queues.response")
    }

    pub fn input_bucket(&self) -> Result<&str, ConfigError> {
        required(&self.buckets.input, "buckets.input")
    }

    /// The output bucket, falling back to the input bucket.
    pub fn output_bucket(&self) -> Result<&str, ConfigError> {
        match self.buckets.output.as_deref() {
            Some(bucket) if !bucket.trim().is_empty() => Ok(bucket),
            _ => self.input_bucket(),
        }
    }

    pub fn gallery_path(&self) -> Result<&Path, ConfigError> {
        self.worker
            .gallery
            .as_deref()
            .ok_or(ConfigError::Missing("worker.gallery"))
    }

    fn validate_gateway(&self) -> Result<(), ConfigError> {
        let gw = &self.gateway;
        non_zero(gw.poll_interval, "gateway.poll_interval")?;
        non_zero(gw.result_wait, "gateway.result_wait")?;
        non_zero(gw.drain_pause, "gateway.drain_pause")?;
        if gw.result_ttl <= gw.result_wait {
            return Err(ConfigError::Invalid {
                field: "gateway.result_ttl",
                reason: format!(
                    "{} must be longer than gateway.result_wait ({})",
                    format_duration(gw.result_ttl),
                    format_duration(gw.result_wait)
                ),
            });
        }
        if !(1..=10).contains(&gw.drain_batch) {
            return Err(ConfigError::Invalid {
                field: "gateway.drain_batch",
                reason: format!("{} is outside 1..=10", gw.drain_batch),
            });
        }
        if gw.upload_field.is_empty() {
            return Err(ConfigError::Missing("gateway.upload_field"));
        }
        Ok(())
    }

    fn validate_worker(&self) -> Result<(), ConfigError> {
        non_zero(self.worker.idle_pause, "worker.idle_pause")?;
        non_zero(self.worker.error_pause, "worker.error_pause")?;
        if self.worker.thumbnail_side == 0 {
            return Err(ConfigError::Invalid {
                field: "worker.thumbnail_side",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    fn validate_autoscaler(&self) -> Result<(), ConfigError> {
        non_zero(self.autoscaler.tick, "autoscaler.tick")?;
        if self.autoscaler.instance_name_pattern.is_empty() {
            return Err(ConfigError::Missing("autoscaler.instance_name_pattern"));
        }
        Ok(())
    }
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, ConfigError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(field)),
    }
}

fn non_zero(value: Duration, field: &'static str) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Parse a duration string like "500ms", "30s", "5m", "1h".
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::Duration(s.to_string());

    let (number, unit_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };

    let value: u64 = number.trim().parse().map_err(|_| invalid())?;
    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// Render a duration in the shortest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 3_600_000 == 0 && ms > 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 && ms > 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{ms}ms")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn full_config() -> FacegridConfig {
        FacegridConfig::from_toml(
            r#"
[queues]
request = "req"
response = "resp"

[buckets]
input = "in"

[worker]
gallery = "gallery.json"
"#,
        )
        .unwrap()
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 7 ").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn format_duration_picks_exact_unit() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = FacegridConfig::default();
        assert_eq!(config.gateway.result_wait, Duration::from_secs(60));
        assert_eq!(config.gateway.poll_interval, Duration::from_millis(500));
        assert_eq!(config.gateway.upload_field, "inputFile");
        assert_eq!(config.autoscaler.max_instances, 15);
        assert_eq!(config.autoscaler.grace_period, Duration::from_secs(5));
        assert_eq!(config.autoscaler.tick, Duration::from_secs(2));
    }

    #[test]
    fn parse_sections_and_durations() {
        let config = FacegridConfig::from_toml(
            r#"
[gateway]
result_wait = "2m"
poll_interval = "250ms"

[autoscaler]
max_instances = 4
grace_period = "10s"
"#,
        )
        .unwrap();
        assert_eq!(config.gateway.result_wait, Duration::from_secs(120));
        assert_eq!(config.gateway.poll_interval, Duration::from_millis(250));
        assert_eq!(config.autoscaler.max_instances, 4);
        assert_eq!(config.autoscaler.grace_period, Duration::from_secs(10));
        // Untouched sections keep their defaults.
        assert_eq!(config.worker.receive_wait, Duration::from_secs(5));
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let err = FacegridConfig::from_toml("[gateway]\nresult_wait = \"forever\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = full_config();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed = FacegridConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.gateway.poll_interval, config.gateway.poll_interval);
        assert_eq!(parsed.queues.request, config.queues.request);
    }

    #[test]
    fn gateway_requires_queues_and_bucket() {
        let config = FacegridConfig::default();
        assert!(matches!(
            config.validate(Role::Gateway),
            Err(ConfigError::Missing("queues.request"))
        ));

        let mut config = full_config();
        config.buckets.input = Some("  ".to_string());
        assert!(matches!(
            config.validate(Role::Gateway),
            Err(ConfigError::Missing("buckets.input"))
        ));
    }

    #[test]
    fn worker_requires_gallery() {
        let mut config = full_config();
        assert!(config.validate(Role::Worker).is_ok());
        config.worker.gallery = None;
        assert!(matches!(
            config.validate(Role::Worker),
            Err(ConfigError::Missing("worker.gallery"))
        ));
    }

    #[test]
    fn autoscaler_needs_only_request_queue() {
        let mut config = FacegridConfig::default();
        config.queues.request = Some("req".to_string());
        assert!(config.validate(Role::Autoscaler).is_ok());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut config = full_config();
        config.gateway.poll_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(Role::Gateway),
            Err(ConfigError::Invalid { field: "gateway.poll_interval", .. })
        ));

        let mut config = full_config();
        config.autoscaler.tick = Duration::ZERO;
        assert!(config.validate(Role::Autoscaler).is_err());

        let mut config = full_config();
        config.gateway.drain_pause = Duration::ZERO;
        assert!(matches!(
            config.validate(Role::Gateway),
            Err(ConfigError::Invalid { field: "gateway.drain_pause", .. })
        ));

        let config = FacegridConfig::from_toml(
            r#"
[queues]
request = "req"
response = "resp"

[buckets]
input = "in"

[worker]
gallery = "gallery.json"
idle_pause = "0s"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(Role::Worker),
            Err(ConfigError::Invalid { field: "worker.idle_pause", .. })
        ));
        assert!(config.validate(Role::Standalone).is_err());

        let mut config = full_config();
        config.worker.error_pause = Duration::ZERO;
        assert!(matches!(
            config.validate(Role::Worker),
            Err(ConfigError::Invalid { field: "worker.error_pause", .. })
        ));
    }

    #[test]
    fn result_ttl_must_outlast_result_wait() {
        let mut config = full_config();
        config.gateway.result_ttl = Duration::ZERO;
        assert!(matches!(
            config.validate(Role::Gateway),
            Err(ConfigError::Invalid { field: "gateway.result_ttl", .. })
        ));

        config.gateway.result_ttl = config.gateway.result_wait;
        assert!(config.validate(Role::Gateway).is_err());

        config.gateway.result_ttl = config.gateway.result_wait + Duration::from_secs(1);
        assert!(config.validate(Role::Gateway).is_ok());
    }

    #[test]
    fn drain_batch_is_bounded() {
        let mut config = full_config();
        config.gateway.drain_batch = 11;
        assert!(config.validate(Role::Gateway).is_err());
        config.gateway.drain_batch = 0;
        assert!(config.validate(Role::Gateway).is_err());
    }

    #[test]
    fn output_bucket_falls_back_to_input() {
        let mut config = full_config();
        assert_eq!(config.output_bucket().unwrap(), "in");
        config.buckets.output = Some("out".to_string());
        assert_eq!(config.output_bucket().unwrap(), "out");
    }

    #[test]
    fn env_overrides_identifiers() {
        let env: HashMap<&str, &str> = [
            ("FACEGRID_REQUEST_QUEUE", "env-req"),
            ("FACEGRID_INPUT_BUCKET", "env-in"),
            ("FACEGRID_MAX_INSTANCES", "3"),
            ("FACEGRID_GRACE_PERIOD", "250ms"),
            ("FACEGRID_RESPONSE_QUEUE", ""),
        ]
        .into_iter()
        .collect();

        let mut config = full_config();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.queues.request.as_deref(), Some("env-req"));
        assert_eq!(config.buckets.input.as_deref(), Some("env-in"));
        assert_eq!(config.autoscaler.max_instances, 3);
        assert_eq!(config.autoscaler.grace_period, Duration::from_millis(250));
        // Empty values do not clobber the file.
        assert_eq!(config.queues.response.as_deref(), Some("resp"));
    }

    #[test]
    fn env_rejects_bad_max_instances() {
        let mut config = full_config();
        let err = config
            .apply_env(|key| (key == "FACEGRID_MAX_INSTANCES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "autoscaler.max_instances", .. }));
    }

    #[test]
    fn from_file_reads_and_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facegrid.toml");
        std::fs::write(&path, "[queues]\nrequest = \"req\"\n").unwrap();

        let config = FacegridConfig::from_file(&path).unwrap();
        assert_eq!(config.request_queue().unwrap(), "req");

        let err = FacegridConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

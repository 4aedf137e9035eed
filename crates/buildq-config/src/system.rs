//! System configuration parsing.
//!
//! ```kdl
//! database url="postgres://buildq@localhost/buildq"
//!
//! queue {
//!     max-depth 300
//!     temporary-lock-ttl-ms 1000
//!     max-duration-ms 5000
//!     running-jobs-max-bucket 5
//!     poll-interval-ms 1000
//!     error-backoff-ms 5000
//! }
//!
//! flags {
//!     ci_queueing_disaster_recovery_disable_fair_scheduling #false
//!     ci_register_job_temporary_lock #true runner=12
//! }
//! ```

use crate::kdl_ext::{get_bool_prop, get_first_bool_arg, get_int_prop, get_non_negative_arg, get_string_prop};
use crate::{ConfigError, ConfigResult};
use buildq_core::{Flag, RunnerId, StaticFlags};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Database connection string. `DATABASE_URL` takes precedence.
    pub database_url: Option<String>,
    /// Registration tunables.
    pub queue: QueueSettings,
    /// Static flag values, used when no flag service is configured.
    pub flags: Vec<FlagSetting>,
}

impl SystemConfig {
    /// Build an in-memory flag source from the `flags` block.
    pub fn static_flags(&self) -> StaticFlags {
        let mut flags = StaticFlags::new();
        for setting in &self.flags {
            match setting.runner_id {
                Some(runner_id) => flags.set_for_runner(setting.flag, runner_id, setting.enabled),
                None => flags.set(setting.flag, setting.enabled),
            }
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSetting {
    pub flag: Flag,
    pub runner_id: Option<RunnerId>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Candidates examined per registration before the response is marked
    /// invalid.
    pub max_queue_depth: usize,
    pub temporary_lock_ttl: Duration,
    /// Registrations slower than this are logged with their timings.
    pub max_duration: Duration,
    /// Running-job counts above this are reported as `"<bucket>+"`.
    pub running_jobs_max_bucket: u64,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_depth: 300,
            temporary_lock_ttl: Duration::from_secs(1),
            max_duration: Duration::from_secs(5),
            running_jobs_max_bucket: 5,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => {
                config.database_url = Some(
                    get_string_prop(node, "url")
                        .ok_or_else(|| ConfigError::MissingField("database url".to_string()))?,
                );
            }
            "queue" => {
                config.queue = parse_queue(node)?;
            }
            "flags" => {
                config.flags = parse_flags(node)?;
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

/// Read and parse a configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

fn parse_queue(node: &KdlNode) -> ConfigResult<QueueSettings> {
    let mut settings = QueueSettings::default();
    let Some(children) = node.children() else {
        return Ok(settings);
    };

    for child in children.nodes() {
        match child.name().value() {
            "max-depth" => {
                let depth = get_non_negative_arg(child)?;
                if depth == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "max-depth".to_string(),
                        message: "must be at least 1".to_string(),
                    });
                }
                settings.max_queue_depth = depth as usize;
            }
            "temporary-lock-ttl-ms" => {
                settings.temporary_lock_ttl = Duration::from_millis(get_non_negative_arg(child)?);
            }
            "max-duration-ms" => {
                settings.max_duration = Duration::from_millis(get_non_negative_arg(child)?);
            }
            "running-jobs-max-bucket" => {
                settings.running_jobs_max_bucket = get_non_negative_arg(child)?;
            }
            "poll-interval-ms" => {
                settings.poll_interval = Duration::from_millis(get_non_negative_arg(child)?);
            }
            "error-backoff-ms" => {
                settings.error_backoff = Duration::from_millis(get_non_negative_arg(child)?);
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "queue".to_string(),
                    message: format!("unknown setting '{}'", other),
                });
            }
        }
    }

    Ok(settings)
}

fn parse_flags(node: &KdlNode) -> ConfigResult<Vec<FlagSetting>> {
    let mut settings: Vec<FlagSetting> = Vec::new();
    let Some(children) = node.children() else {
        return Ok(settings);
    };

    for child in children.nodes() {
        let name = child.name().value();
        let flag: Flag = name.parse().map_err(|_| ConfigError::InvalidValue {
            field: "flags".to_string(),
            message: format!("unknown flag '{}'", name),
        })?;
        let enabled = get_first_bool_arg(child)
            .or_else(|| get_bool_prop(child, "enabled"))
            .ok_or_else(|| ConfigError::MissingField(format!("value for flag '{}'", name)))?;
        let runner_id = get_int_prop(child, "runner")?.map(RunnerId::new);

        if settings
            .iter()
            .any(|s| s.flag == flag && s.runner_id == runner_id)
        {
            return Err(ConfigError::Duplicate(match runner_id {
                Some(id) => format!("flag '{}' for runner {}", name, id),
                None => format!("flag '{}'", name),
            }));
        }

        settings.push(FlagSetting {
            flag,
            runner_id,
            enabled,
        });
    }

    Ok(settings)
}

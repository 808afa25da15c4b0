//! Configuration loading: TOML file with environment variable overrides.
//!
//! Looks for `devicepilot.toml` in the working directory, or the file named
//! by `DEVICEPILOT_CONFIG`. Every field has a sensible default so the file
//! is optional. Environment variables take precedence over file values.

use std::path::PathBuf;
use std::time::Duration;

use devicepilot_app::services::network_conditioner::{ConditionerConfig, WarmupConfig};
use devicepilot_app::services::positioning_stabilizer::StabilizerConfig;
use devicepilot_app::services::teardown::TeardownConfig;
use devicepilot_domain::automation::{
    AutomationStep, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, Precondition, Sequence, SequenceStep,
};
use devicepilot_domain::conditioning::{ConditioningTarget, SchedulePolicy, TimeoutPolicy};
use devicepilot_domain::error::ValidationError;
use devicepilot_domain::location::DEFAULT_LOCK_THRESHOLD_M;
use devicepilot_domain::tunnel::{Profile, ResolverCandidate};
use serde::Deserialize;

const DEFAULT_PATH: &str = "devicepilot.toml";

/// Top-level configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    /// Tunnel profiles, selectable by name in `start <profile>`.
    pub profiles: Vec<Profile>,
    pub positioning: PositioningConfig,
    pub conditioner: ConditionerSection,
    pub teardown: TeardownSection,
    pub sequences: Vec<SequenceConfig>,
    pub ui: UiConfig,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Profile started right after boot, if any.
    pub default_profile: Option<String>,
    /// Stop escalates to the full teardown and terminates the process.
    pub terminate_on_stop: bool,
    /// Backlog of the async event listener.
    pub event_capacity: usize,
    pub command_capacity: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PositioningConfig {
    pub settle_delay_ms: u64,
    pub lock_threshold_m: f64,
    pub resume_on_enable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ConditionerSection {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_attempts: u32,
    pub attempt_pause_ms: u64,
    pub probe_every: u64,
    pub full_fetch_every: u64,
    pub healthy_delays_secs: Vec<u64>,
    pub failure_delay_secs: u64,
    pub backoff_ceiling_secs: u64,
    pub failure_threshold: u32,
    pub probe_address: String,
    pub targets: Vec<ConditioningTarget>,
    pub warmup: WarmupSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WarmupSection {
    pub endpoints: Vec<String>,
    pub stagger_ms: u64,
    pub attempts: u32,
    pub pause_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TeardownSection {
    pub grace_delay_ms: u64,
    pub final_delay_ms: u64,
    pub stop_timeout_ms: u64,
    pub remove_from_tasks: bool,
}

/// A named list of UI automation steps, runnable with `run <id>`.
#[derive(Debug, Deserialize)]
pub struct SequenceConfig {
    pub id: String,
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Deserialize)]
pub struct StepConfig {
    pub name: String,
    pub labels: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub precondition: Option<Precondition>,
    /// Labels of a follow-up activation run after the step succeeded.
    #[serde(default)]
    pub confirm_labels: Vec<String>,
}

/// Source of the scripted UI screens.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// JSON file holding an array of screens; the built-in demo otherwise.
    pub screens: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `devicepilot.toml` (or `DEVICEPILOT_CONFIG`)
    /// then apply environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or if the
    /// result fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("DEVICEPILOT_CONFIG").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DEVICEPILOT_PROFILE") {
            self.engine.default_profile = Some(val).filter(|v| !v.trim().is_empty());
        }
        if let Ok(val) = std::env::var("DEVICEPILOT_LOG") {
            self.logging.filter = val;
        }
        if let Ok(val) = std::env::var("RUST_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.profiles.is_empty() {
            return Err(ConfigError::Validation(
                "at least one profile is required".to_string(),
            ));
        }
        for profile in &self.profiles {
            profile.validate()?;
        }
        if let Some(name) = &self.engine.default_profile {
            if !self.profiles.iter().any(|p| &p.name == name) {
                return Err(ConfigError::Validation(format!(
                    "default profile {name:?} is not defined"
                )));
            }
        }
        if self.engine.event_capacity == 0 || self.engine.command_capacity == 0 {
            return Err(ConfigError::Validation(
                "queue capacities must be non-zero".to_string(),
            ));
        }
        if self.positioning.lock_threshold_m <= 0.0 {
            return Err(ConfigError::Validation(
                "lock threshold must be positive".to_string(),
            ));
        }
        self.conditioner_config()?;
        self.sequences()?;
        Ok(())
    }

    #[must_use]
    pub fn stabilizer_config(&self) -> StabilizerConfig {
        StabilizerConfig {
            settle_delay: Duration::from_millis(self.positioning.settle_delay_ms),
            lock_threshold_m: self.positioning.lock_threshold_m,
            resume_on_enable: self.positioning.resume_on_enable,
        }
    }

    /// Build the conditioner settings.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for an empty target list or a healthy
    /// delay table of the wrong size.
    pub fn conditioner_config(&self) -> Result<ConditionerConfig, ValidationError> {
        let section = &self.conditioner;
        let delays: Vec<Duration> = section
            .healthy_delays_secs
            .iter()
            .copied()
            .map(Duration::from_secs)
            .collect();
        let schedule = SchedulePolicy {
            failure_delay: Duration::from_secs(section.failure_delay_secs),
            backoff_ceiling: Duration::from_secs(section.backoff_ceiling_secs),
            failure_threshold: section.failure_threshold,
            probe_every: section.probe_every,
            full_fetch_every: section.full_fetch_every,
            ..SchedulePolicy::default()
        }
        .with_healthy_delays(&delays)?;

        let config = ConditionerConfig {
            targets: section.targets.clone(),
            schedule,
            timeouts: TimeoutPolicy {
                connect: Duration::from_millis(section.connect_timeout_ms),
                read: Duration::from_millis(section.read_timeout_ms),
            },
            max_attempts: section.max_attempts,
            attempt_pause: Duration::from_millis(section.attempt_pause_ms),
            probe_address: section.probe_address.clone(),
            warmup: WarmupConfig {
                endpoints: section.warmup.endpoints.clone(),
                stagger: Duration::from_millis(section.warmup.stagger_ms),
                attempts: section.warmup.attempts,
                pause: Duration::from_millis(section.warmup.pause_ms),
            },
            ..ConditionerConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn teardown_config(&self) -> TeardownConfig {
        TeardownConfig {
            grace_delay: Duration::from_millis(self.teardown.grace_delay_ms),
            final_delay: Duration::from_millis(self.teardown.final_delay_ms),
            stop_timeout: Duration::from_millis(self.teardown.stop_timeout_ms),
            remove_from_tasks: self.teardown.remove_from_tasks,
        }
    }

    /// Build the configured automation sequences.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] among the sequences.
    pub fn sequences(&self) -> Result<Vec<Sequence>, ValidationError> {
        self.sequences.iter().map(SequenceConfig::build).collect()
    }
}

impl SequenceConfig {
    fn build(&self) -> Result<Sequence, ValidationError> {
        self.steps
            .iter()
            .fold(Sequence::builder().id(&self.id), |builder, step| {
                builder.step(step.build())
            })
            .build()
    }
}

impl StepConfig {
    fn build(&self) -> SequenceStep {
        let retry_delay = Duration::from_millis(self.retry_delay_ms);
        let mut entry = SequenceStep::new(
            AutomationStep::new(&self.name, &self.labels)
                .with_max_retries(self.max_retries)
                .with_retry_delay(retry_delay),
        )
        .delay_before(Duration::from_millis(self.delay_ms));
        if let Some(precondition) = self.precondition {
            entry = entry.precondition(precondition);
        }
        if !self.confirm_labels.is_empty() {
            entry = entry.confirm_with(
                AutomationStep::new(format!("{}/confirm", self.name), &self.confirm_labels)
                    .with_max_retries(self.max_retries)
                    .with_retry_delay(retry_delay),
            );
        }
        entry
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    u64::try_from(DEFAULT_RETRY_DELAY.as_millis()).unwrap_or(u64::MAX)
}

fn resolver(label: &str, addresses: [&str; 2]) -> ResolverCandidate {
    ResolverCandidate {
        label: label.to_string(),
        addresses: addresses
            .iter()
            .filter_map(|address| address.parse().ok())
            .collect(),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            engine: EngineConfig::default(),
            profiles: vec![Profile {
                name: "default".to_string(),
                resolvers: vec![
                    resolver("cloudflare", ["1.1.1.1", "1.0.0.1"]),
                    resolver("quad9", ["9.9.9.9", "149.112.112.112"]),
                    resolver("google", ["8.8.8.8", "8.8.4.4"]),
                ],
            }],
            positioning: PositioningConfig::default(),
            conditioner: ConditionerSection::default(),
            teardown: TeardownSection::default(),
            sequences: vec![SequenceConfig {
                id: "location-consent".to_string(),
                steps: vec![
                    StepConfig {
                        name: "allow-location".to_string(),
                        labels: vec![
                            "While using the app".to_string(),
                            "Only this time".to_string(),
                            "Allow".to_string(),
                        ],
                        max_retries: DEFAULT_MAX_RETRIES,
                        retry_delay_ms: default_retry_delay_ms(),
                        delay_ms: 0,
                        precondition: None,
                        confirm_labels: vec!["Turn on".to_string(), "OK".to_string()],
                    },
                    StepConfig {
                        name: "open-map".to_string(),
                        labels: vec!["map view".to_string()],
                        max_retries: DEFAULT_MAX_RETRIES,
                        retry_delay_ms: default_retry_delay_ms(),
                        delay_ms: 500,
                        precondition: Some(Precondition::LocationLocked {
                            timeout: Duration::from_secs(30),
                        }),
                        confirm_labels: Vec::new(),
                    },
                ],
            }],
            ui: UiConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "devicepilotd=info,devicepilot=info".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_profile: None,
            terminate_on_stop: false,
            event_capacity: 256,
            command_capacity: 32,
        }
    }
}

impl Default for PositioningConfig {
    fn default() -> Self {
        let defaults = StabilizerConfig::default();
        Self {
            settle_delay_ms: u64::try_from(defaults.settle_delay.as_millis()).unwrap_or(u64::MAX),
            lock_threshold_m: DEFAULT_LOCK_THRESHOLD_M,
            resume_on_enable: defaults.resume_on_enable,
        }
    }
}

impl Default for ConditionerSection {
    fn default() -> Self {
        let defaults = ConditionerConfig::default();
        let secs = |d: Duration| d.as_secs();
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self {
            connect_timeout_ms: millis(defaults.timeouts.connect),
            read_timeout_ms: millis(defaults.timeouts.read),
            max_attempts: defaults.max_attempts,
            attempt_pause_ms: millis(defaults.attempt_pause),
            probe_every: defaults.schedule.probe_every,
            full_fetch_every: defaults.schedule.full_fetch_every,
            healthy_delays_secs: defaults.schedule.healthy_delays.map(secs).to_vec(),
            failure_delay_secs: secs(defaults.schedule.failure_delay),
            backoff_ceiling_secs: secs(defaults.schedule.backoff_ceiling),
            failure_threshold: defaults.schedule.failure_threshold,
            probe_address: defaults.probe_address,
            targets: defaults.targets,
            warmup: WarmupSection::default(),
        }
    }
}

impl Default for WarmupSection {
    fn default() -> Self {
        let defaults = WarmupConfig::default();
        Self {
            endpoints: defaults.endpoints,
            stagger_ms: u64::try_from(defaults.stagger.as_millis()).unwrap_or(u64::MAX),
            attempts: defaults.attempts,
            pause_ms: u64::try_from(defaults.pause.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl Default for TeardownSection {
    fn default() -> Self {
        let defaults = TeardownConfig::default();
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self {
            grace_delay_ms: millis(defaults.grace_delay),
            final_delay_ms: millis(defaults.final_delay),
            stop_timeout_ms: millis(defaults.stop_timeout),
            remove_from_tasks: defaults.remove_from_tasks,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// A profile, sequence or conditioner setting breaks a domain rule.
    #[error("invalid configuration")]
    Domain(#[from] ValidationError),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

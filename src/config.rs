//! Run configuration: YAML file plus CLI overrides.

use crate::dispatch::{FailurePolicy, KeyCodec};
use crate::event::Topic;
use crate::orchestrator::{OrchestratorConfig, Waits};
use crate::side_input::SideInputSource;
use crate::transport::config::parse_engine;
use crate::transport::{ConnectOptions, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

const SECURITY_PROTOCOLS: [&str; 4] = ["plaintext", "ssl", "sasl_plaintext", "sasl_ssl"];
const SASL_MECHANISMS: [&str; 5] = ["PLAIN", "SCRAM-SHA-256", "SCRAM-SHA-512", "GSSAPI", "OAUTHBEARER"];
const COMPRESSIONS: [&str; 5] = ["none", "gzip", "snappy", "lz4", "zstd"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Unset means the engine's default address.
    pub bootstrap_servers: Option<String>,
    pub security_protocol: String,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub compression: String,
    pub client_id: String,
    pub key_codec: KeyCodec,
    pub value_codec: String,
    /// Passed through to the transport untouched.
    pub extra: BTreeMap<String, String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: None,
            security_protocol: "plaintext".into(),
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            compression: "none".into(),
            client_id: "nexmark-replay".into(),
            key_codec: KeyCodec::Long,
            value_codec: "string".into(),
            extra: BTreeMap::new(),
        }
    }
}

impl BrokerConfig {
    /// Fold `--connect key=value` pairs in; recognised keys land in their
    /// typed field, everything else in `extra`.
    pub fn apply_overrides(&mut self, opts: &ConnectOptions) -> Result<(), ConfigError> {
        for (k, v) in &opts.params {
            match k.as_str() {
                "bootstrap.servers" => self.bootstrap_servers = Some(v.clone()),
                "security.protocol" => self.security_protocol = v.clone(),
                "sasl.mechanism" => self.sasl_mechanism = Some(v.clone()),
                "sasl.username" => self.sasl_username = Some(v.clone()),
                "sasl.password" => self.sasl_password = Some(v.clone()),
                "compression.type" => self.compression = v.clone(),
                "client.id" => self.client_id = v.clone(),
                "key.codec" => {
                    self.key_codec = KeyCodec::parse(v)
                        .ok_or_else(|| invalid("key.codec", format!("unknown codec {v}")))?
                }
                "value.codec" => self.value_codec = v.clone(),
                _ => {
                    self.extra.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(invalid("bootstrap.servers", "must not be empty"));
        }
        let protocol = self.security_protocol.to_lowercase();
        if !SECURITY_PROTOCOLS.contains(&protocol.as_str()) {
            return Err(invalid(
                "security.protocol",
                format!("{} (expected one of {SECURITY_PROTOCOLS:?})", self.security_protocol),
            ));
        }
        if protocol.starts_with("sasl") && self.sasl_mechanism.is_none() {
            return Err(invalid("sasl.mechanism", format!("required with {protocol}")));
        }
        if let Some(ref mechanism) = self.sasl_mechanism {
            if !SASL_MECHANISMS.contains(&mechanism.to_uppercase().as_str()) {
                return Err(invalid("sasl.mechanism", mechanism.clone()));
            }
        }
        if !COMPRESSIONS.contains(&self.compression.to_lowercase().as_str()) {
            return Err(invalid("compression.type", self.compression.clone()));
        }
        if self.value_codec != "string" {
            return Err(invalid(
                "value.codec",
                format!("{} (only \"string\" is supported)", self.value_codec),
            ));
        }
        Ok(())
    }

    /// Flat key-value options for the transport, falling back to
    /// `default_bootstrap` when no broker address is configured.
    pub fn to_connect_options(&self, default_bootstrap: &str) -> ConnectOptions {
        let mut opts = ConnectOptions::default();
        let bootstrap = self.bootstrap_servers.as_deref().unwrap_or(default_bootstrap);
        opts.set("bootstrap.servers", bootstrap)
            .set("security.protocol", self.security_protocol.to_lowercase())
            .set("compression.type", self.compression.to_lowercase())
            .set("client.id", self.client_id.as_str())
            .set("key.codec", self.key_codec.as_str())
            .set("value.codec", self.value_codec.as_str());
        if let Some(ref m) = self.sasl_mechanism {
            opts.set("sasl.mechanism", m.to_uppercase());
        }
        if let Some(ref u) = self.sasl_username {
            opts.set("sasl.username", u.as_str());
        }
        if let Some(ref p) = self.sasl_password {
            opts.set("sasl.password", p.as_str());
        }
        // Pass-through can override any of the above.
        for (k, v) in &self.extra {
            opts.set(k.as_str(), v.as_str());
        }
        opts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TopicsConfig {
    pub events: String,
    pub side_inputs: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            events: "events".into(),
            side_inputs: "side-inputs".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GeneratorSettings {
    pub events: u64,
    pub events_per_second: u32,
    pub first_event_id: u64,
    /// Round pacing waits up to this many milliseconds.
    pub pacing_granularity_ms: u64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            events: 1000,
            events_per_second: 100,
            first_event_id: 0,
            pacing_granularity_ms: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SideInputSettings {
    pub path: String,
    pub limit: usize,
}

impl Default for SideInputSettings {
    fn default() -> Self {
        Self {
            path: "side_input.txt".into(),
            limit: crate::side_input::DEFAULT_SIDE_INPUT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WaitSettings {
    pub publish_warmup_secs: u64,
    pub consumer_warmup_secs: u64,
    pub events_settle_secs: u64,
    pub side_inputs_settle_secs: u64,
    pub settle_poll_ms: u64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            publish_warmup_secs: 5,
            consumer_warmup_secs: 60,
            events_settle_secs: 100,
            side_inputs_settle_secs: 60,
            settle_poll_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    pub engine: String,
    pub broker: BrokerConfig,
    pub topics: TopicsConfig,
    pub workers: usize,
    pub failure_policy: FailurePolicy,
    pub generator: GeneratorSettings,
    pub side_input: SideInputSettings,
    pub waits: WaitSettings,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            engine: "kafka".into(),
            broker: BrokerConfig::default(),
            topics: TopicsConfig::default(),
            workers: 3,
            failure_policy: FailurePolicy::FailFast,
            generator: GeneratorSettings::default(),
            side_input: SideInputSettings::default(),
            waits: WaitSettings::default(),
        }
    }
}

impl ReplayConfig {
    pub fn from_yaml_str(s: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(s).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: origin.clone(),
                source,
            })?;
        Self::from_yaml_str(&text, &origin)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.topics.events.trim().is_empty() {
            return Err(invalid("topics.events", "must not be empty"));
        }
        if self.topics.side_inputs.trim().is_empty() {
            return Err(invalid("topics.side_inputs", "must not be empty"));
        }
        if self.generator.events_per_second == 0 {
            return Err(invalid("generator.events_per_second", "must be positive"));
        }
        self.engine()?;
        self.broker.validate()
    }

    pub fn engine(&self) -> Result<Engine, ConfigError> {
        parse_engine(&self.engine).ok_or_else(|| invalid("engine", self.engine.clone()))
    }

    /// Engine plus its connect options, with the engine's default broker
    /// address when none is set.
    pub fn connect_options(&self) -> Result<(Engine, ConnectOptions), ConfigError> {
        let engine = self.engine()?;
        Ok((engine, self.broker.to_connect_options(engine.default_bootstrap())))
    }

    pub fn publish_warmup(&self) -> Duration {
        Duration::from_secs(self.waits.publish_warmup_secs)
    }

    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig, ConfigError> {
        let events_topic = Topic::new(self.topics.events.as_str())
            .map_err(|e| invalid("topics.events", e.to_string()))?;
        let side_inputs_topic = Topic::new(self.topics.side_inputs.as_str())
            .map_err(|e| invalid("topics.side_inputs", e.to_string()))?;
        Ok(OrchestratorConfig {
            events_topic,
            side_inputs_topic,
            workers: self.workers,
            key_codec: self.broker.key_codec,
            side_input: SideInputSource::new(self.side_input.path.as_str(), self.side_input.limit),
            waits: Waits {
                consumer_warmup: Duration::from_secs(self.waits.consumer_warmup_secs),
                events_settle: Duration::from_secs(self.waits.events_settle_secs),
                side_inputs_settle: Duration::from_secs(self.waits.side_inputs_settle_secs),
                settle_poll: Duration::from_millis(self.waits.settle_poll_ms),
            },
        })
    }
}

//! Relay Configuration
//!
//! Tunables for flood control, cache bounds and transport identifiers.
//! Loaded from JSON with per-field defaults so partial documents work.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{MeshError, Result};

/// Hop budget for locally originated and cross-rebroadcast messages
pub const DEFAULT_TTL: u8 = 3;

/// Service identifier the star transport listens and connects on
pub const STAR_SERVICE_ID: Uuid = Uuid::from_u128(0x3a233f2b_7e65_4e8d_8eaf_2f2e0cd08a1d);

const MAX_NICKNAME_LEN: usize = 50;

/// Uniform random delay applied before every rebroadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterWindow {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl JitterWindow {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    /// No delay at all
    pub const fn none() -> Self {
        Self { min_ms: 0, max_ms: 0 }
    }

    /// Draw one delay from the window
    pub fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }
}

impl Default for JitterWindow {
    fn default() -> Self {
        Self::new(20, 250)
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub nickname: String,
    pub default_ttl: u8,
    pub jitter: JitterWindow,
    pub advertise_window_ms: u64,
    /// Overrides the capacity reported by the radio when set
    pub payload_capacity: Option<usize>,
    pub relay_seen_capacity: usize,
    pub delivery_seen_capacity: usize,
    pub reassembly_capacity: usize,
    pub reassembly_timeout_secs: u64,
    pub service_id: Uuid,
}

impl MeshConfig {
    pub fn new() -> Self {
        Self {
            nickname: Self::generate_default_nickname(),
            default_ttl: DEFAULT_TTL,
            jitter: JitterWindow::default(),
            advertise_window_ms: 120,
            payload_capacity: None,
            relay_seen_capacity: 500,
            delivery_seen_capacity: 2000,
            reassembly_capacity: 256,
            reassembly_timeout_secs: 60,
            service_id: STAR_SERVICE_ID,
        }
    }

    /// Zero jitter and no advertising window, for reproducible runs
    pub fn deterministic() -> Self {
        Self {
            jitter: JitterWindow::none(),
            advertise_window_ms: 0,
            ..Self::new()
        }
    }

    fn generate_default_nickname() -> String {
        format!("User-{:04}", rand::thread_rng().gen_range(0..10_000u32))
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = nickname.into();
        self
    }

    pub fn advertise_window(&self) -> Duration {
        Duration::from_millis(self.advertise_window_ms)
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.reassembly_timeout_secs)
    }

    /// Parse a full or partial JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: MeshConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the fields present in `json`, leaving the rest untouched
    pub fn update_from_json(&mut self, json: Value) -> Result<()> {
        if let Some(nickname) = json.get("nickname").and_then(|v| v.as_str()) {
            self.set_nickname(nickname)?;
        }

        if let Some(ttl) = json.get("default_ttl").and_then(|v| v.as_u64()) {
            self.default_ttl = u8::try_from(ttl)
                .map_err(|_| MeshError::InvalidConfig(format!("default_ttl {} exceeds 255", ttl)))?;
        }

        if let Some(jitter) = json.get("jitter") {
            self.jitter = serde_json::from_value(jitter.clone())?;
        }

        if let Some(window) = json.get("advertise_window_ms").and_then(|v| v.as_u64()) {
            self.advertise_window_ms = window;
        }

        if let Some(capacity) = json.get("payload_capacity") {
            self.payload_capacity = capacity.as_u64().map(|c| c as usize);
        }

        if let Some(bound) = json.get("relay_seen_capacity").and_then(|v| v.as_u64()) {
            self.relay_seen_capacity = bound as usize;
        }

        if let Some(bound) = json.get("delivery_seen_capacity").and_then(|v| v.as_u64()) {
            self.delivery_seen_capacity = bound as usize;
        }

        if let Some(bound) = json.get("reassembly_capacity").and_then(|v| v.as_u64()) {
            self.reassembly_capacity = bound as usize;
        }

        if let Some(timeout) = json.get("reassembly_timeout_secs").and_then(|v| v.as_u64()) {
            self.reassembly_timeout_secs = timeout;
        }

        if let Some(service_id) = json.get("service_id").and_then(|v| v.as_str()) {
            self.service_id = Uuid::parse_str(service_id)
                .map_err(|e| MeshError::InvalidConfig(format!("service_id: {}", e)))?;
        }

        self.validate()
    }

    pub fn set_nickname(&mut self, nickname: &str) -> Result<()> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            return Err(MeshError::InvalidConfig("nickname cannot be empty".into()));
        }
        if nickname.len() > MAX_NICKNAME_LEN {
            return Err(MeshError::InvalidConfig(format!(
                "nickname too long (max {} characters)",
                MAX_NICKNAME_LEN
            )));
        }
        self.nickname = nickname.to_string();
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.nickname.trim().is_empty() {
            return Err(MeshError::InvalidConfig("nickname cannot be empty".into()));
        }

        if self.jitter.min_ms > self.jitter.max_ms {
            return Err(MeshError::InvalidConfig(format!(
                "jitter window {}..{} ms is inverted",
                self.jitter.min_ms, self.jitter.max_ms
            )));
        }

        if self.relay_seen_capacity == 0 || self.delivery_seen_capacity == 0 {
            return Err(MeshError::InvalidConfig("dedup capacities must be greater than 0".into()));
        }

        if self.reassembly_capacity == 0 {
            return Err(MeshError::InvalidConfig("reassembly capacity must be greater than 0".into()));
        }

        Ok(())
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::new()
    }
}

use serde::Deserialize;

/// Top-level agent configuration, loaded from environment variables and/or
/// an optional `rda.toml` file via the `config` crate.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Signalling/session defaults.
    #[serde(default)]
    pub session: SessionConfig,
    /// Adaptive bitrate controller defaults.
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    /// Capture/encode pipeline timing constants.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Log level (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Display index to capture when none is specified by the caller.
    #[serde(default)]
    pub default_display_index: u32,
    /// STUN/TURN servers used when the caller provides none.
    #[serde(default = "default_ice_servers")]
    pub default_ice_servers: Vec<String>,
    /// Hard ceiling accepted from `set_bitrate` control messages (bps).
    #[serde(default = "default_hard_bitrate_cap")]
    pub hard_bitrate_cap_bps: u32,
    /// ICE gathering timeout in seconds.
    #[serde(default = "default_ice_timeout_secs")]
    pub ice_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_display_index: 0,
            default_ice_servers: default_ice_servers(),
            hard_bitrate_cap_bps: default_hard_bitrate_cap(),
            ice_timeout_secs: default_ice_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
    #[serde(default = "default_stable_count_threshold")]
    pub stable_count_threshold: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            ewma_alpha: default_ewma_alpha(),
            stable_count_threshold: default_stable_count_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold: u32,
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    #[serde(default = "default_secure_fps_floor")]
    pub secure_fps_floor: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_threshold: default_idle_threshold(),
            idle_sleep_ms: default_idle_sleep_ms(),
            secure_fps_floor: default_secure_fps_floor(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_hard_bitrate_cap() -> u32 {
    20_000_000
}

fn default_ice_timeout_secs() -> u64 {
    20
}

fn default_cooldown_secs() -> u64 {
    2
}

fn default_ewma_alpha() -> f64 {
    0.3
}

fn default_stable_count_threshold() -> u32 {
    3
}

fn default_idle_threshold() -> u32 {
    180
}

fn default_idle_sleep_ms() -> u64 {
    16
}

fn default_secure_fps_floor() -> u32 {
    8
}

impl AgentConfig {
    /// Load configuration from `RDA_*` environment variables, falling back
    /// to an optional `rda.toml` in the working directory, then defaults.
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("rda").required(false))
            .add_source(config::Environment::with_prefix("RDA").separator("__"));

        let cfg = builder.build()?;
        match cfg.try_deserialize() {
            Ok(parsed) => Ok(parsed),
            Err(_) => Ok(Self::default()),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            adaptive: AdaptiveConfig::default(),
            pipeline: PipelineConfig::default(),
            log_level: default_log_level(),
        }
    }
}

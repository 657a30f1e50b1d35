//! Configuration for the avbridge agent.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use avbridge_core::{
    Capabilities, DropPolicy, Endpoint, LaneConfig, ReconnectPolicy, Registration, SessionConfig,
};
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Transport settings.
    pub network: NetworkConfig,
    /// Queue sizes and drop policies.
    pub lanes: LanesConfig,
    /// Reconnect behaviour after a transport failure.
    pub reconnect: ReconnectConfig,
    /// Synthetic media sources.
    pub media: MediaConfig,
    /// Descriptor announced to the host.
    pub registration: RegistrationConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Accept one peer on `address:port`.
    Listen,
    /// Dial `address:port`.
    Connect,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mode: Mode,
    pub address: String,
    pub port: u16,
    /// Socket read buffer in bytes.
    pub read_buffer_size: usize,
    /// Largest accepted payload in bytes.
    pub max_payload: usize,
    pub open_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub teardown_timeout_ms: u64,
}

/// Per-lane queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanesConfig {
    pub audio_capacity: usize,
    pub audio_policy: DropPolicy,
    pub video_capacity: usize,
    pub video_policy: DropPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Uptime after which a silent link counts as healthy again.
    pub stable_after_ms: u64,
}

/// Synthetic capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Audio sample rate in Hz (16-bit mono PCM).
    pub sample_rate: u32,
    /// Length of one audio packet in milliseconds.
    pub audio_packet_ms: u32,
    /// Tone frequency in Hz.
    pub tone_hz: f32,
    /// Test-pattern frames per second.
    pub video_fps: u32,
    pub video_width: u32,
    pub video_height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub identifier: String,
    /// Host-facing capability names, e.g. "audio_redirect".
    pub capabilities: Capabilities,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Connect,
            address: "127.0.0.1".into(),
            port: avbridge_core::DEFAULT_PORT,
            read_buffer_size: 4096,
            max_payload: avbridge_core::DEFAULT_MAX_PAYLOAD,
            open_timeout_ms: 10_000,
            write_timeout_ms: 2_000,
            teardown_timeout_ms: 500,
        }
    }
}

impl Default for LanesConfig {
    fn default() -> Self {
        let audio = LaneConfig::for_kind(avbridge_core::MediaKind::Audio);
        let video = LaneConfig::for_kind(avbridge_core::MediaKind::Video);
        Self {
            audio_capacity: audio.capacity,
            audio_policy: audio.policy,
            video_capacity: video.capacity,
            video_policy: video.policy,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            stable_after_ms: 10_000,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            audio_packet_ms: 20,
            tone_hz: 440.0,
            video_fps: 15,
            video_width: 320,
            video_height: 180,
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        let reg = Registration::default();
        Self {
            identifier: reg.identifier,
            capabilities: reg.capabilities,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

/// Where a loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// No file at the path; defaults were used.
    Missing,
    /// The file did not parse; defaults were used.
    Invalid(String),
}

impl ConfigSource {
    /// Report the outcome of [`AgentConfig::load`]. Call once logging is
    /// set up.
    pub fn log(&self, path: &Path) {
        match self {
            Self::File => tracing::info!("loaded config from {}", path.display()),
            Self::Missing => tracing::info!("no config at {}; using defaults", path.display()),
            Self::Invalid(e) => {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display())
            }
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    ///
    /// Runs before logging exists, so the outcome is returned rather
    /// than logged.
    pub fn load(path: &Path) -> (Self, ConfigSource) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, ConfigSource::File),
                Err(e) => (Self::default(), ConfigSource::Invalid(e.to_string())),
            },
            Err(_) => (Self::default(), ConfigSource::Missing),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip: IpAddr = self.network.address.parse()?;
        Ok(SocketAddr::new(ip, self.network.port))
    }

    pub fn endpoint(&self) -> Result<Endpoint, std::net::AddrParseError> {
        let addr = self.socket_addr()?;
        Ok(match self.network.mode {
            Mode::Listen => Endpoint::Listen(addr),
            Mode::Connect => Endpoint::Connect(addr),
        })
    }

    /// Point the agent at `addr`, in the given mode.
    pub fn set_endpoint(&mut self, mode: Mode, addr: SocketAddr) {
        self.network.mode = mode;
        self.network.address = addr.ip().to_string();
        self.network.port = addr.port();
    }

    /// Build the core session configuration, clamping values that
    /// would make the session unusable.
    pub fn to_session_config(&self) -> Result<SessionConfig, std::net::AddrParseError> {
        let mut session = SessionConfig::new(self.endpoint()?);

        let net = &self.network;
        session.channel.read_buffer_size = net.read_buffer_size.clamp(512, 1 << 20);
        session.channel.max_payload = net.max_payload.max(1024);
        session.channel.open_timeout = Duration::from_millis(net.open_timeout_ms.max(1));
        session.channel.write_timeout = Duration::from_millis(net.write_timeout_ms.max(1));
        session.channel.teardown_timeout = Duration::from_millis(net.teardown_timeout_ms);

        session.audio = LaneConfig {
            capacity: self.lanes.audio_capacity.max(1),
            policy: self.lanes.audio_policy,
        };
        session.video = LaneConfig {
            capacity: self.lanes.video_capacity.max(1),
            policy: self.lanes.video_policy,
        };

        let initial = Duration::from_millis(self.reconnect.initial_backoff_ms);
        session.reconnect = ReconnectPolicy {
            max_retries: self.reconnect.max_retries,
            initial_backoff: initial,
            max_backoff: Duration::from_millis(self.reconnect.max_backoff_ms).max(initial),
            stable_after: Duration::from_millis(self.reconnect.stable_after_ms),
        };

        session.registration = Registration::new(
            self.registration.identifier.clone(),
            self.registration.capabilities,
        );
        Ok(session)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = AgentConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("port = 9001"));
        assert!(text.contains("audio_policy = \"drop_oldest\""));
        assert!(text.contains("\"audio_redirect\""));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = AgentConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: AgentConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.port, 9001);
        assert_eq!(parsed.network.read_buffer_size, 4096);
        assert_eq!(parsed.reconnect.max_retries, 3);
        assert_eq!(parsed.lanes.video_policy, DropPolicy::DropNewest);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: AgentConfig = toml::from_str(
            r#"
            [network]
            mode = "listen"
            address = "0.0.0.0"

            [registration]
            capabilities = ["audio_redirect"]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.network.mode, Mode::Listen);
        assert_eq!(parsed.network.port, 9001);
        assert_eq!(parsed.registration.capabilities, Capabilities::AUDIO_REDIRECT);
        assert_eq!(
            parsed.endpoint().unwrap(),
            Endpoint::Listen("0.0.0.0:9001".parse().unwrap())
        );
    }

    #[test]
    fn to_session_config_clamps() {
        let mut cfg = AgentConfig::default();
        cfg.lanes.audio_capacity = 0;
        cfg.network.read_buffer_size = 1;
        cfg.reconnect.max_backoff_ms = 1;
        let session = cfg.to_session_config().unwrap();
        assert_eq!(session.audio.capacity, 1);
        assert_eq!(session.channel.read_buffer_size, 512);
        assert_eq!(session.reconnect.max_backoff, session.reconnect.initial_backoff);
    }

    #[test]
    fn video_lane_defaults_deeper_than_audio() {
        let cfg = AgentConfig::default();
        assert!(cfg.lanes.video_capacity > cfg.lanes.audio_capacity);
        let session = cfg.to_session_config().unwrap();
        assert!(session.video.capacity > session.audio.capacity);
        assert_eq!(session.reconnect.stable_after, Duration::from_secs(10));
    }

    #[test]
    fn load_reports_its_source() {
        let dir = std::env::temp_dir().join(format!("avbridge-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let missing = dir.join("missing.toml");
        let (cfg, source) = AgentConfig::load(&missing);
        assert_eq!(source, ConfigSource::Missing);
        assert_eq!(cfg.network.port, 9001);

        let broken = dir.join("broken.toml");
        std::fs::write(&broken, "[network\nport = ").unwrap();
        let (cfg, source) = AgentConfig::load(&broken);
        assert!(matches!(source, ConfigSource::Invalid(_)));
        assert_eq!(cfg.network.port, 9001);

        let good = dir.join("good.toml");
        std::fs::write(&good, "[network]\nport = 7100\n").unwrap();
        let (cfg, source) = AgentConfig::load(&good);
        assert_eq!(source, ConfigSource::File);
        assert_eq!(cfg.network.port, 7100);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn bad_address_is_an_error() {
        let mut cfg = AgentConfig::default();
        cfg.network.address = "not-an-ip".into();
        assert!(cfg.to_session_config().is_err());
    }

    #[test]
    fn set_endpoint_overrides_file() {
        let mut cfg = AgentConfig::default();
        cfg.set_endpoint(Mode::Listen, "[::1]:7000".parse().unwrap());
        assert_eq!(
            cfg.endpoint().unwrap(),
            Endpoint::Listen("[::1]:7000".parse().unwrap())
        );
    }
}

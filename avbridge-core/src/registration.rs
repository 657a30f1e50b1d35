//! The descriptor announced to the host once per session.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Bumped whenever the descriptor's shape changes.
pub const REGISTRATION_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_IDENTIFIER: &str = "io.avbridge.helper";

bitflags! {
    /// What this helper can redirect.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const AUDIO_REDIRECT = 1 << 0;
        const VIDEO_REDIRECT = 1 << 1;
        const SCREEN_SHARE   = 1 << 2;
    }
}

impl Capabilities {
    const NAMES: [(Capabilities, &'static str); 3] = [
        (Capabilities::AUDIO_REDIRECT, "audio_redirect"),
        (Capabilities::VIDEO_REDIRECT, "video_redirect"),
        (Capabilities::SCREEN_SHARE, "screen_share"),
    ];

    /// Host-facing names of the set flags, in declaration order.
    pub fn host_names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn from_host_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(flag, _)| *flag)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.host_names())
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        names.iter().try_fold(Capabilities::empty(), |acc, name| {
            Capabilities::from_host_name(name)
                .map(|flag| acc | flag)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown capability `{name}`")))
        })
    }
}

/// Fixed, versioned identity of this helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub schema_version: u32,
    #[serde(rename = "plugin_id")]
    pub identifier: String,
    pub version: String,
    pub platform: String,
    pub capabilities: Capabilities,
}

impl Registration {
    pub fn new(identifier: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            schema_version: REGISTRATION_SCHEMA_VERSION,
            identifier: identifier.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            capabilities,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for Registration {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTIFIER, Capabilities::default())
    }
}

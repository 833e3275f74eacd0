use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Execution environment the session runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Resource constrained mobile target.
    Android,
    Ios,
    /// Browser, and every host that is neither of the mobile targets.
    Web,
}

impl Platform {
    pub fn detect() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else {
            Platform::Web
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Web => "web",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            "web" | "browser" | "desktop" => Ok(Platform::Web),
            other => Err(Error::Config(format!("Unknown platform: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Cpu,
    GpuNative,
    GpuWeb,
}

impl Backend {
    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::GpuNative => "GPU (native)",
            Self::GpuWeb => "GPU (web)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// Reduced-width network for constrained devices.
    Light,
    Standard,
}

impl ModelVariant {
    /// Width multiplier of the MobileNet-style network.
    pub fn alpha(self) -> f32 {
        match self {
            Self::Light => 0.25,
            Self::Standard => 1.0,
        }
    }
}

/// Policy derived from the platform. Resolved once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub backend: Backend,
    pub model_variant: ModelVariant,
    pub target_edge: u32,
}

pub fn resolve_profile(platform: Platform) -> CapabilityProfile {
    match platform {
        Platform::Android => CapabilityProfile {
            backend: Backend::Cpu,
            model_variant: ModelVariant::Light,
            target_edge: 96,
        },
        Platform::Ios => CapabilityProfile {
            backend: Backend::GpuNative,
            model_variant: ModelVariant::Standard,
            target_edge: 224,
        },
        Platform::Web => CapabilityProfile {
            backend: Backend::GpuWeb,
            model_variant: ModelVariant::Standard,
            target_edge: 224,
        },
    }
}

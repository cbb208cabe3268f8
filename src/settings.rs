use std::collections::HashMap;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Largest shadow map edge we allocate.
pub const MAX_SHADOW_RESOLUTION: u32 = 8192;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    /// Screen-space reflections on water.
    #[serde(default)]
    pub env_mapping: bool,
    /// Cloud shadows and SSAO in the ambient pass.
    #[serde(default)]
    pub cloud_shadow_scale: bool,
    /// Edge of each cascade's shadow map; 0 disables shadows.
    #[serde(default = "RenderSettings::default_shadow_resolution")]
    pub shadow_resolution: u32,
    #[serde(default = "RenderSettings::default_video_level")]
    pub brightness: f32,
    #[serde(default = "RenderSettings::default_video_level")]
    pub contrast: f32,
    #[serde(default = "RenderSettings::default_video_level")]
    pub gamma: f32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            env_mapping: false,
            cloud_shadow_scale: false,
            shadow_resolution: Self::default_shadow_resolution(),
            brightness: Self::default_video_level(),
            contrast: Self::default_video_level(),
            gamma: Self::default_video_level(),
        }
    }
}

impl RenderSettings {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RenderSettings>(&contents) {
                Ok(settings) => {
                    info!("Loaded render settings from {:?}", path);
                    settings.validate()
                }
                Err(err) => {
                    warn!(
                        "Failed to parse {:?} ({}). Falling back to default render settings.",
                        path, err
                    );
                    RenderSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Render settings file {:?} not found. Using default settings.",
                    path
                );
                RenderSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default render settings.",
                    path, err
                );
                RenderSettings::default()
            }
        }
    }

    /// Reads the engine's key/value configuration. Missing keys read as 0.
    pub fn from_store(store: &dyn SettingsStore) -> Self {
        RenderSettings {
            env_mapping: store.get_i("ENGINE", "zEnvMappingEnabled") != 0,
            cloud_shadow_scale: store.get_i("ENGINE", "zCloudShadowScale") != 0,
            shadow_resolution: store.get_i("ENGINE", "shadowResolution").max(0) as u32,
            brightness: store.get_f("VIDEO", "zVidBrightness"),
            contrast: store.get_f("VIDEO", "zVidContrast"),
            gamma: store.get_f("VIDEO", "zVidGamma"),
        }
        .validate()
    }

    pub fn validate(mut self) -> Self {
        if self.shadow_resolution > MAX_SHADOW_RESOLUTION {
            warn!(
                "Shadow resolution {} exceeds {}. Clamping.",
                self.shadow_resolution, MAX_SHADOW_RESOLUTION
            );
            self.shadow_resolution = MAX_SHADOW_RESOLUTION;
        }

        for (name, value) in [
            ("brightness", &mut self.brightness),
            ("contrast", &mut self.contrast),
            ("gamma", &mut self.gamma),
        ] {
            if !value.is_finite() {
                warn!("{} is not a number. Using default value.", name);
                *value = Self::default_video_level();
            } else if !(0.0..=1.0).contains(&*value) {
                warn!("{} {} is outside 0..1. Clamping.", name, value);
                *value = value.clamp(0.0, 1.0);
            }
        }

        self
    }

    const fn default_shadow_resolution() -> u32 {
        2048
    }

    const fn default_video_level() -> f32 {
        0.5
    }
}

/// Read-only section/key configuration owned by the host application.
pub trait SettingsStore {
    /// 0 when the key is missing.
    fn get_i(&self, section: &str, key: &str) -> i32;
    /// 0.0 when the key is missing.
    fn get_f(&self, section: &str, key: &str) -> f32;
}

/// JSON-backed [`SettingsStore`]: `{ "SECTION": { "key": value } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyValueSettings {
    sections: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl KeyValueSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_json_str(&contents) {
                Ok(store) => {
                    info!("Loaded engine settings from {:?}", path);
                    store
                }
                Err(err) => {
                    warn!("Failed to parse {:?} ({}). Using an empty store.", path, err);
                    Self::default()
                }
            },
            Err(err) => {
                warn!("Failed to read {:?} ({}). Using an empty store.", path, err);
                Self::default()
            }
        }
    }

    pub fn with(mut self, section: &str, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
        self
    }

    fn value(&self, section: &str, key: &str) -> Option<&serde_json::Value> {
        self.sections.get(section).and_then(|keys| keys.get(key))
    }
}

impl SettingsStore for KeyValueSettings {
    fn get_i(&self, section: &str, key: &str) -> i32 {
        match self.value(section, key) {
            Some(serde_json::Value::Bool(flag)) => i32::from(*flag),
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map_or(0, |v| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32),
            Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn get_f(&self, section: &str, key: &str) -> f32 {
        match self.value(section, key) {
            Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0) as f32,
            Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            Some(serde_json::Value::Bool(flag)) => f32::from(u8::from(*flag)),
            _ => 0.0,
        }
    }
}

/// Developer switches, passed in explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Run the direct-sunlight resolve pass.
    #[serde(default = "DebugConfig::enabled")]
    pub shadow_resolve: bool,
    /// Recompute culling volumes when invalidated; off freezes the last set.
    #[serde(default = "DebugConfig::enabled")]
    pub refresh_visibility: bool,
    /// Lay out debug tiles for the Hi-Z pyramid and shadow maps.
    #[serde(default)]
    pub hiz_overlay: bool,
    /// Check attachment transitions of every stream before submitting it.
    #[serde(default = "DebugConfig::validate_by_default")]
    pub validate_transitions: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            shadow_resolve: true,
            refresh_visibility: true,
            hiz_overlay: false,
            validate_transitions: Self::validate_by_default(),
        }
    }
}

impl DebugConfig {
    const fn enabled() -> bool {
        true
    }

    const fn validate_by_default() -> bool {
        cfg!(debug_assertions)
    }
}

//! Persistent device settings (JSON file in the platform data directory).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use somnus_core::{AudioCoreConfig, EqualizerPreset};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DeviceSettings {
    /// `"simulated"` or `"host"`.
    pub hardware: String,
    pub trigger_threshold: f32,
    pub record_seconds: f32,
    pub equalizer: EqualizerPreset,
    /// Container or compressed file played after each trigger; a chime when unset.
    pub response_file: Option<PathBuf>,
    /// Keep each trigger-phrase recording as a WAV file.
    pub save_recordings: bool,
    pub recordings_dir: Option<PathBuf>,
    /// Full core configuration; the fields above override parts of it.
    pub core: AudioCoreConfig,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            hardware: "simulated".into(),
            trigger_threshold: 300.0,
            record_seconds: 3.0,
            equalizer: EqualizerPreset::Voice,
            response_file: None,
            save_recordings: false,
            recordings_dir: None,
            core: AudioCoreConfig::default(),
        }
    }
}

impl DeviceSettings {
    pub fn normalize(&mut self) {
        self.hardware = normalize_hardware(&self.hardware);
        if !self.trigger_threshold.is_finite() {
            self.trigger_threshold = Self::default().trigger_threshold;
        }
        self.trigger_threshold = self.trigger_threshold.clamp(1.0, 20_000.0);
        if !self.record_seconds.is_finite() {
            self.record_seconds = Self::default().record_seconds;
        }
        self.record_seconds = self.record_seconds.clamp(0.5, 30.0);
        self.response_file = self
            .response_file
            .take()
            .filter(|p| !p.as_os_str().is_empty());
        self.recordings_dir = self
            .recordings_dir
            .take()
            .filter(|p| !p.as_os_str().is_empty());
    }

    /// Core configuration with the device-level overrides applied.
    pub fn core_config(&self) -> AudioCoreConfig {
        let mut config = self.core.clone();
        config.trigger.speech_threshold = self.trigger_threshold;
        config.playback.equalizer = self.equalizer;
        config.normalized()
    }

    pub fn recordings_dir(&self, settings_path: &Path) -> PathBuf {
        self.recordings_dir.clone().unwrap_or_else(|| {
            settings_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("recordings")
        })
    }
}

pub fn normalize_hardware(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "host" | "cpal" | "soundcard" => "host".into(),
        _ => "simulated".into(),
    }
}

/// `SOMNUS_*` variables take precedence over the file.
pub fn apply_env_overrides(settings: &mut DeviceSettings) {
    if let Ok(v) = std::env::var("SOMNUS_HARDWARE") {
        settings.hardware = v;
    }
    if let Some(v) = env_parse::<f32>("SOMNUS_TRIGGER_THRESHOLD") {
        settings.trigger_threshold = v;
    }
    if let Some(v) = env_parse::<f32>("SOMNUS_RECORD_SECONDS") {
        settings.record_seconds = v;
    }
    if let Ok(v) = std::env::var("SOMNUS_RESPONSE_FILE") {
        settings.response_file = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("SOMNUS_SAVE_RECORDINGS") {
        settings.save_recordings = matches!(v.trim(), "1" | "true" | "yes");
    }
    if let Ok(v) = std::env::var("SOMNUS_EQUALIZER") {
        match v.trim().to_ascii_lowercase().as_str() {
            "flat" => settings.equalizer = EqualizerPreset::Flat,
            "voice" => settings.equalizer = EqualizerPreset::Voice,
            other => tracing::warn!("ignoring unknown SOMNUS_EQUALIZER value {other:?}"),
        }
    }
    settings.normalize();
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparsable {key}={raw:?}");
            None
        }
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Somnus")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("somnus")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> DeviceSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| match serde_json::from_str::<DeviceSettings>(&raw) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(path = %path.display(), "malformed settings, using defaults: {e}");
                None
            }
        })
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &DeviceSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let s: DeviceSettings =
            serde_json::from_str(r#"{"recordSeconds":5.0,"core":{"capture":{"queueCapacity":8}}}"#)
                .unwrap();
        assert_eq!(s.record_seconds, 5.0);
        assert_eq!(s.hardware, "simulated");
        assert_eq!(s.core.capture.queue_capacity, 8);
        assert_eq!(s.core.capture.frame_samples, 512);
    }

    #[test]
    fn normalize_clamps_and_canonicalizes() {
        let mut s = DeviceSettings {
            hardware: " CPAL ".into(),
            trigger_threshold: f32::NAN,
            record_seconds: 600.0,
            response_file: Some(PathBuf::new()),
            ..DeviceSettings::default()
        };
        s.normalize();
        assert_eq!(s.hardware, "host");
        assert_eq!(s.trigger_threshold, 300.0);
        assert_eq!(s.record_seconds, 30.0);
        assert!(s.response_file.is_none());
    }

    #[test]
    fn overrides_flow_into_core_config() {
        let s = DeviceSettings {
            trigger_threshold: 42.0,
            equalizer: EqualizerPreset::Flat,
            ..DeviceSettings::default()
        };
        let config = s.core_config();
        assert_eq!(config.trigger.speech_threshold, 42.0);
        assert_eq!(config.playback.equalizer, EqualizerPreset::Flat);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let s = load_settings(Path::new("/nonexistent/somnus/settings.json"));
        assert_eq!(s, DeviceSettings::default());
    }
}

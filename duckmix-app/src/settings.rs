//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};

use duckmix_core::EngineConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    /// WAV file replayed as the remote agent's voice, for bench testing.
    pub remote_replay_path: Option<PathBuf>,
    /// Seconds to wait after attaching before the replay starts.
    pub replay_lead_in_secs: f32,
    pub capture_microphone: bool,
    pub engine: EngineConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            remote_replay_path: None,
            replay_lead_in_secs: 0.0,
            capture_microphone: true,
            engine: EngineConfig::default(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = normalize_device_name(self.preferred_input_device.take());
        self.preferred_output_device = normalize_device_name(self.preferred_output_device.take());
        self.remote_replay_path = self
            .remote_replay_path
            .take()
            .filter(|p| !p.as_os_str().is_empty());
        self.replay_lead_in_secs = if self.replay_lead_in_secs.is_finite() {
            self.replay_lead_in_secs.clamp(0.0, 30.0)
        } else {
            0.0
        };
        self.engine.normalize();
    }
}

fn normalize_device_name(raw: Option<String>) -> Option<String> {
    raw.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Duckmix")
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
            .join("duckmix")
            .join("settings.json")
    }
}

/// Read settings from `path`. Missing or malformed files yield defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
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
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&dir.path().join("absent.json"));
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn save_then_load_preserves_engine_tuning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = AppSettings {
            preferred_output_device: Some("Desk Speakers".into()),
            ..AppSettings::default()
        };
        settings.engine.gate_delay_ms = 750;
        settings.engine.ducking.idle_volume = 0.4;
        save_settings(&path, &settings).expect("save");

        let loaded = load_settings(&path);
        assert_eq!(loaded.preferred_output_device.as_deref(), Some("Desk Speakers"));
        assert_eq!(loaded.engine.gate_delay_ms, 750);
        assert_eq!(loaded.engine.ducking.idle_volume, 0.4);
    }

    #[test]
    fn blank_fields_are_cleared() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "preferredInputDevice": "  ", "remoteReplayPath": "", "replayLeadInSecs": -3 }"#,
        )
        .expect("write");

        let settings = load_settings(&path);
        assert_eq!(settings.preferred_input_device, None);
        assert_eq!(settings.remote_replay_path, None);
        assert_eq!(settings.replay_lead_in_secs, 0.0);
        assert!(settings.capture_microphone);
    }

    #[test]
    fn malformed_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").expect("write");
        assert_eq!(load_settings(&path), AppSettings::default());
    }
}

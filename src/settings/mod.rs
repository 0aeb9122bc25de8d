use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::host::EngineParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub input_ports: Vec<String>,
    pub output_ports: Vec<String>,
    pub auto_connect: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_ports: vec![
                "system:capture_1".to_string(),
                "system:capture_2".to_string(),
            ],
            output_ports: vec![
                "system:playback_1".to_string(),
                "system:playback_2".to_string(),
            ],
            auto_connect: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub audio: AudioSettings,
    pub engine: EngineParams,
    pub ir_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            audio: AudioSettings::default(),
            engine: EngineParams::default(),
            ir_dir: "./impulse_responses".to_string(),
        }
    }
}

impl Settings {
    const SETTINGS_FILE: &'static str = "settings.json";

    pub fn load() -> Result<Self> {
        let settings_path = Self::settings_path()?;

        if settings_path.exists() {
            let contents =
                fs::read_to_string(&settings_path).context("failed to read settings file")?;
            let settings =
                serde_json::from_str(&contents).context("failed to parse settings file")?;
            Ok(settings)
        } else {
            info!("no settings file found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let settings_path = Self::settings_path()?;

        let contents =
            serde_json::to_string_pretty(self).context("failed to serialise settings")?;
        fs::write(&settings_path, contents).context("failed to write settings file")?;

        info!("settings saved to {settings_path:?}");
        Ok(())
    }

    fn settings_path() -> Result<PathBuf> {
        Ok(std::env::current_dir()
            .context("failed to get current directory")?
            .join(Self::SETTINGS_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_json() -> Result<()> {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings)?;
        let back: Settings = serde_json::from_str(&json)?;

        assert_eq!(back.audio.input_ports, settings.audio.input_ports);
        assert_eq!(back.engine.min_part_size, settings.engine.min_part_size);
        assert_eq!(back.ir_dir, settings.ir_dir);
        Ok(())
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ai::gemini_live::LIVE_API_URL;
use crate::ai::{LiveConfig, DEFAULT_LIVE_MODEL, DEFAULT_SYSTEM_INSTRUCTION, DEFAULT_VOICE};
use crate::live_session::DEFAULT_OUTBOUND_QUEUE;

const DEFAULT_CONFIG_FILE: &str = "ecosnap.toml";
const CONFIG_PATH_ENV: &str = "ECOSNAP_CONFIG";
const API_KEY_ENVS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub connect_timeout_secs: u64,
    pub outbound_queue: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: LIVE_API_URL.into(),
            api_key: String::new(),
            model: DEFAULT_LIVE_MODEL.into(),
            voice: DEFAULT_VOICE.into(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.into(),
            connect_timeout_secs: 15,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

/// `$ECOSNAP_CONFIG`, or `ecosnap.toml` in the working directory.
pub fn default_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

impl Settings {
    /// Load settings from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            log::info!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
        toml::from_str(&content).map_err(|e| format!("{}: {e}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| e.to_string())?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| e.to_string())?;
        fs::write(path, content).map_err(|e| e.to_string())?;
        log::info!("Settings saved to {}", path.display());
        Ok(())
    }

    /// Environment API key wins over the file.
    pub fn apply_env(&mut self) {
        let from_env = API_KEY_ENVS
            .iter()
            .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()));
        self.apply_api_key(from_env);
    }

    fn apply_api_key(&mut self, key: Option<String>) {
        if let Some(key) = key {
            self.api_key = key.trim().to_string();
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn live_config(&self) -> LiveConfig {
        LiveConfig {
            model: self.model.clone(),
            voice: self.voice.clone(),
            system_instruction: self.system_instruction.clone(),
            ..LiveConfig::default()
        }
    }
}

//! Startup configuration overlay.
//!
//! Precedence, lowest first: the persisted settings record, the TOML file
//! given with `--config`, then command-line flags. `STREAMCHAT_API_KEY`
//! only fills a credential that is still empty after all of those.
//! Overlays apply to the running process and are not written back.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::ChatError;
use crate::settings::Settings;

pub const API_KEY_ENV: &str = "STREAMCHAT_API_KEY";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsOverlay {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
}

impl SettingsOverlay {
    pub fn from_toml(text: &str) -> Result<Self, ChatError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ChatError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Configuration(format!("cannot read {}: {e}", path.display())))?;
        let overlay = Self::from_toml(&text)?;
        debug!(target: "streamchat::config", path = %path.display(), "loaded configuration file");
        Ok(overlay)
    }

    /// Fields set in `higher` win over fields set in `self`.
    pub fn merged_with(self, higher: SettingsOverlay) -> SettingsOverlay {
        SettingsOverlay {
            api_key: higher.api_key.or(self.api_key),
            base_url: higher.base_url.or(self.base_url),
            model: higher.model.or(self.model),
            system_prompt: higher.system_prompt.or(self.system_prompt),
            temperature: higher.temperature.or(self.temperature),
            top_p: higher.top_p.or(self.top_p),
            presence_penalty: higher.presence_penalty.or(self.presence_penalty),
            frequency_penalty: higher.frequency_penalty.or(self.frequency_penalty),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == SettingsOverlay::default()
    }

    pub fn apply(&self, settings: &mut Settings) {
        if let Some(v) = &self.api_key {
            settings.api_key = v.clone();
        }
        if let Some(v) = &self.base_url {
            settings.api_base_url = v.clone();
        }
        if let Some(v) = &self.model {
            settings.model_name = v.clone();
        }
        if let Some(v) = &self.system_prompt {
            settings.system_prompt = v.clone();
        }
        if let Some(v) = self.temperature {
            settings.temperature = v;
        }
        if let Some(v) = self.top_p {
            settings.top_p = v;
        }
        if let Some(v) = self.presence_penalty {
            settings.presence_penalty = v;
        }
        if let Some(v) = self.frequency_penalty {
            settings.frequency_penalty = v;
        }
        settings.normalize();
    }
}

/// Fill an empty credential from `env_value` (normally the value of
/// [`API_KEY_ENV`]). Returns whether it was used.
pub fn fill_credential(settings: &mut Settings, env_value: Option<String>) -> bool {
    if !settings.api_key.trim().is_empty() {
        return false;
    }
    match env_value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(key) => {
            settings.api_key = key;
            true
        }
        None => false,
    }
}

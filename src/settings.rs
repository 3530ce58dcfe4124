//! Process-wide settings and comparison endpoint configuration.
//!
//! Settings live in one partition-independent record; a missing or partial
//! record is merged over [`Settings::default`].

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::ChatError;
use crate::providers::{EndpointTarget, Sampling};
use crate::storage::KeyValueStore;

pub const SETTINGS_KEY: &str = "aiChatSettingsGlobal";
pub const DEFAULT_BASE_URL: &str = "https://llama70b.gaia.domains/v1";
pub const DEFAULT_MODEL: &str = "llama70b";
pub const MAX_ACTIVE_ENDPOINTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonEndpoint {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    pub model: String,
    #[serde(default)]
    pub active: bool,
}

impl ComparisonEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>, model: impl Into<String>, credential: Option<String>) -> Self {
        ComparisonEndpoint {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            url: url.into(),
            credential,
            model: model.into(),
            active: false,
        }
    }

    /// Has both a URL and a model.
    pub fn is_usable(&self) -> bool {
        !self.url.trim().is_empty() && !self.model.trim().is_empty()
    }

    pub fn target(&self) -> EndpointTarget {
        EndpointTarget::new(&self.url, self.model.trim(), self.credential.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "apiBaseUrl")]
    pub api_base_url: String,
    #[serde(rename = "modelName")]
    pub model_name: String,
    #[serde(rename = "systemPrompt")]
    pub system_prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    #[serde(rename = "comparisonEndpoints")]
    pub endpoints: Vec<ComparisonEndpoint>,
}

impl Default for Settings {
    fn default() -> Self {
        let sampling = Sampling::default();
        Settings {
            api_key: String::new(),
            api_base_url: DEFAULT_BASE_URL.to_string(),
            model_name: DEFAULT_MODEL.to_string(),
            system_prompt: String::new(),
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            presence_penalty: sampling.presence_penalty,
            frequency_penalty: sampling.frequency_penalty,
            endpoints: Vec::new(),
        }
    }
}

impl Settings {
    /// Read the settings record; absent or unreadable records yield defaults.
    pub fn load(port: &dyn KeyValueStore) -> Self {
        match port.get(SETTINGS_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Settings>(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    error!(target: "streamchat::settings", error = %e, "failed to parse settings, using defaults");
                    Settings::default()
                }
            },
            Ok(None) => Settings::default(),
            Err(e) => {
                error!(target: "streamchat::settings", error = %e, "failed to read settings, using defaults");
                Settings::default()
            }
        }
    }

    /// Normalize and write the settings record.
    pub fn save(&mut self, port: &mut dyn KeyValueStore) -> Result<(), ChatError> {
        self.normalize();
        let json = serde_json::to_string(self)?;
        port.set(SETTINGS_KEY, &json)?;
        debug!(target: "streamchat::settings", base_url = %self.api_base_url, model = %self.model_name, "settings saved");
        Ok(())
    }

    /// Trim free-text fields, strip one trailing `/` from the base URL, and
    /// restore defaults for an empty base URL or model.
    pub fn normalize(&mut self) {
        self.api_key = self.api_key.trim().to_string();
        let url = self.api_base_url.trim();
        let url = url.strip_suffix('/').unwrap_or(url);
        self.api_base_url = if url.is_empty() { DEFAULT_BASE_URL.to_string() } else { url.to_string() };
        let model = self.model_name.trim();
        self.model_name = if model.is_empty() { DEFAULT_MODEL.to_string() } else { model.to_string() };
        self.system_prompt = self.system_prompt.trim().to_string();
        for v in [&mut self.temperature, &mut self.top_p, &mut self.presence_penalty, &mut self.frequency_penalty] {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
    }

    pub fn sampling(&self) -> Sampling {
        Sampling {
            temperature: self.temperature,
            top_p: self.top_p,
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
        }
    }

    pub fn system_prompt(&self) -> Option<&str> {
        let p = self.system_prompt.trim();
        (!p.is_empty()).then_some(p)
    }

    /// Target for the single-turn pipeline. Base URL, model and credential
    /// are all required.
    pub fn primary_target(&self) -> Result<EndpointTarget, ChatError> {
        if self.api_base_url.trim().is_empty() || self.model_name.trim().is_empty() {
            return Err(ChatError::Configuration("API Base URL or Model Name missing in Settings".into()));
        }
        if self.api_key.trim().is_empty() {
            return Err(ChatError::Configuration("API Key missing in Settings".into()));
        }
        Ok(EndpointTarget::new(
            &self.api_base_url,
            self.model_name.trim(),
            Some(self.api_key.trim().to_string()),
        ))
    }

    // -- comparison endpoints -------------------------------------------------

    pub fn add_endpoint(&mut self, endpoint: ComparisonEndpoint) -> String {
        let id = endpoint.id.clone();
        self.endpoints.push(endpoint);
        id
    }

    pub fn remove_endpoint(&mut self, id: &str) -> Result<ComparisonEndpoint, ChatError> {
        let idx = self
            .endpoints
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| ChatError::NotFound { kind: "endpoint", id: id.to_string() })?;
        Ok(self.endpoints.remove(idx))
    }

    pub fn endpoint(&self, id: &str) -> Option<&ComparisonEndpoint> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    /// Toggle activation. Activating a fourth endpoint is refused.
    pub fn set_endpoint_active(&mut self, id: &str, active: bool) -> Result<(), ChatError> {
        let already = self.endpoints.iter().filter(|e| e.active && e.id != id).count();
        let endpoint = self
            .endpoints
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| ChatError::NotFound { kind: "endpoint", id: id.to_string() })?;
        if active && !endpoint.active && already >= MAX_ACTIVE_ENDPOINTS {
            return Err(ChatError::Configuration(format!(
                "at most {MAX_ACTIVE_ENDPOINTS} comparison endpoints can be active"
            )));
        }
        endpoint.active = active;
        Ok(())
    }

    /// Endpoints flagged active, in configuration order.
    pub fn active_endpoints(&self) -> Vec<&ComparisonEndpoint> {
        self.endpoints.iter().filter(|e| e.active).collect()
    }
}

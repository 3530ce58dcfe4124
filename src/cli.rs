use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::SettingsOverlay;
use crate::error::ChatError;
use crate::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "streamchat")]
#[command(version)]
#[command(about = "Streaming chat client for OpenAI-compatible completion endpoints")]
pub struct Args {
    /// Identity scope (partition key); omitted means the local partition
    #[arg(long, global = true)]
    pub identity: Option<String>,

    /// SQLite database holding chats and settings
    #[arg(long, global = true, default_value = "streamchat.db")]
    pub db: PathBuf,

    /// TOML file overlaying the stored settings
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the API base URL for this run
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Override the model for this run
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Override the system prompt for this run
    #[arg(long, global = true)]
    pub system_prompt: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    /// Overlay built from command-line flags alone.
    pub fn flag_overlay(&self) -> SettingsOverlay {
        SettingsOverlay {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Send a message to the primary endpoint and stream the answer
    Send {
        text: String,
        /// Target chat; defaults to the active chat, or a new one
        #[arg(long)]
        chat: Option<String>,
    },
    /// Send a message to every active comparison endpoint in turn
    Compare {
        text: String,
        #[arg(long)]
        chat: Option<String>,
    },
    /// Start a new chat and make it active
    New,
    /// List chats, newest first
    List,
    /// Print a chat's messages (default: the active chat)
    Show { id: Option<String> },
    /// Make a chat active
    Use { id: String },
    Rename { id: String, title: String },
    Delete { id: String },
    /// Remove every message from a chat
    Clear { id: String },
    #[command(subcommand)]
    Settings(SettingsCommand),
    #[command(subcommand)]
    Endpoint(EndpointCommand),
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum SettingsCommand {
    /// Print the stored settings (credentials masked)
    Show,
    /// Change one stored setting
    Set { key: SettingKey, value: String },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingKey {
    ApiKey,
    BaseUrl,
    Model,
    SystemPrompt,
    Temperature,
    TopP,
    PresencePenalty,
    FrequencyPenalty,
}

impl SettingKey {
    /// Parse `value` and store it in the matching field.
    pub fn apply(self, settings: &mut Settings, value: &str) -> Result<(), ChatError> {
        let number = || {
            value
                .trim()
                .parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ChatError::Configuration(format!("{value:?} is not a number")))
        };
        match self {
            SettingKey::ApiKey => settings.api_key = value.to_string(),
            SettingKey::BaseUrl => settings.api_base_url = value.to_string(),
            SettingKey::Model => settings.model_name = value.to_string(),
            SettingKey::SystemPrompt => settings.system_prompt = value.to_string(),
            SettingKey::Temperature => settings.temperature = number()?,
            SettingKey::TopP => settings.top_p = number()?,
            SettingKey::PresencePenalty => settings.presence_penalty = number()?,
            SettingKey::FrequencyPenalty => settings.frequency_penalty = number()?,
        }
        Ok(())
    }
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum EndpointCommand {
    /// Register a comparison endpoint (inactive until toggled)
    Add {
        name: String,
        url: String,
        model: String,
        #[arg(long)]
        credential: Option<String>,
    },
    Remove { id: String },
    /// Activate or deactivate an endpoint; at most three can be active
    Toggle { id: String },
    List,
}

/// Show the first and last four characters of a credential.
pub fn mask_credential(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    if chars.is_empty() {
        return "(not set)".to_string();
    }
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

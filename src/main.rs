use std::env;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use streamchat::cli::{mask_credential, Args, Command, EndpointCommand, SettingsCommand};
use streamchat::comparison::PanelOutcome;
use streamchat::config::{fill_credential, SettingsOverlay, API_KEY_ENV};
use streamchat::identity::{follow_identity, IdentityProvider, StaticIdentity};
use streamchat::render::{format_chat_line, format_message, TerminalRenderer};
use streamchat::{ChatApp, ChatError, ComparisonEndpoint, HttpBackend, SqliteStore, TurnOutcome};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let store = SqliteStore::open(&args.db)?;
    let app = ChatApp::new(
        Box::new(store),
        Arc::new(HttpBackend::new()),
        Arc::new(TerminalRenderer::new()),
    );

    let identity = StaticIdentity::new(args.identity.clone());
    app.activate(identity.current().as_deref());
    tokio::spawn(follow_identity(app.clone(), identity.subscribe()));

    let result = run(&app, &args).await;

    if let Some(e) = app.take_persistence_error() {
        eprintln!("{} {}", "Could not save chat history:".bright_red().bold(), e);
    }
    match result {
        Err(e) if !e.is_user_visible() => Ok(()),
        other => other.map_err(Into::into),
    }
}

async fn run(app: &ChatApp, args: &Args) -> Result<(), ChatError> {
    match &args.command {
        Command::Send { text, chat } => {
            apply_overlays(app, args)?;
            let chat_id = resolve_chat(app, chat.as_deref())?;
            let turn = app.send_turn(&chat_id, text);
            tokio::pin!(turn);
            let finished = tokio::select! {
                out = &mut turn => Some(out),
                _ = tokio::signal::ctrl_c() => None,
            };
            let outcome = match finished {
                Some(out) => out?,
                None => {
                    app.abort_turn();
                    turn.await?
                }
            };
            if outcome == TurnOutcome::Cancelled {
                tracing::info!(target: "streamchat::main", chat_id = %chat_id, "send aborted");
            }
        }
        Command::Compare { text, chat } => {
            apply_overlays(app, args)?;
            let chat_id = resolve_chat(app, chat.as_deref())?;
            let comparison = app.compare(&chat_id, text);
            tokio::pin!(comparison);
            let finished = tokio::select! {
                out = &mut comparison => Some(out),
                _ = tokio::signal::ctrl_c() => None,
            };
            let report = match finished {
                Some(out) => out?,
                None => {
                    app.abort_comparison();
                    comparison.await?
                }
            };
            for panel in report.panels.iter().filter(|p| p.outcome == PanelOutcome::NotStarted) {
                println!("{} {}", panel.name.bright_yellow(), "[not started]".dimmed());
            }
        }
        Command::New => {
            let id = app.create_chat()?;
            println!("{id}");
        }
        Command::List => app.with_state(|st| {
            let active = st.transcript.active_chat_id();
            if st.transcript.chats().is_empty() {
                println!("{}", "No chats yet.".dimmed());
            }
            for chat in st.transcript.chats() {
                println!("{}", format_chat_line(chat, active == Some(chat.id.as_str())));
            }
        }),
        Command::Show { id } => app.with_state(|st| -> Result<(), ChatError> {
            let chat = match id {
                Some(id) => st.transcript.chat(id).ok_or_else(|| ChatError::chat_not_found(id))?,
                None => st
                    .transcript
                    .active_chat()
                    .ok_or_else(|| ChatError::Configuration("no chat is active".into()))?,
            };
            println!("{}", chat.title.bright_white().bold());
            for message in &chat.messages {
                println!("{}", format_message(message));
            }
            Ok(())
        })?,
        Command::Use { id } => app.set_active_chat(Some(id))?,
        Command::Rename { id, title } => app.rename_chat(id, title)?,
        Command::Delete { id } => app.delete_chat(id)?,
        Command::Clear { id } => app.clear_chat(id)?,
        Command::Settings(SettingsCommand::Show) => {
            let s = app.settings();
            println!("{}: {}", "API key".bright_yellow(), mask_credential(&s.api_key));
            println!("{}: {}", "Base URL".bright_yellow(), s.api_base_url);
            println!("{}: {}", "Model".bright_yellow(), s.model_name);
            println!("{}: {}", "System prompt".bright_yellow(), s.system_prompt().unwrap_or("(none)"));
            println!(
                "{}: temperature={} top_p={} presence_penalty={} frequency_penalty={}",
                "Sampling".bright_yellow(),
                s.temperature,
                s.top_p,
                s.presence_penalty,
                s.frequency_penalty
            );
            println!("{}: {}", "Comparison endpoints".bright_yellow(), s.endpoints.len());
        }
        Command::Settings(SettingsCommand::Set { key, value }) => {
            app.update_settings(|s| key.apply(s, value))?;
        }
        Command::Endpoint(cmd) => run_endpoint(app, cmd)?,
    }
    Ok(())
}

fn run_endpoint(app: &ChatApp, cmd: &EndpointCommand) -> Result<(), ChatError> {
    match cmd {
        EndpointCommand::Add { name, url, model, credential } => {
            let endpoint = ComparisonEndpoint::new(name.trim(), url.trim(), model.trim(), credential.clone());
            let id = app.update_settings(|s| Ok(s.add_endpoint(endpoint)))?;
            println!("{id}");
        }
        EndpointCommand::Remove { id } => {
            app.update_settings(|s| s.remove_endpoint(id).map(|_| ()))?;
        }
        EndpointCommand::Toggle { id } => {
            let active = app.update_settings(|s| {
                let now = !s.endpoint(id).map(|e| e.active).unwrap_or(false);
                s.set_endpoint_active(id, now)?;
                Ok(now)
            })?;
            println!("{}", if active { "active".bright_green() } else { "inactive".dimmed() });
        }
        EndpointCommand::List => {
            for e in app.settings().endpoints {
                let marker = if e.active { "*".bright_green().to_string() } else { " ".to_string() };
                println!("{marker} {} {} {} {}", e.id.dimmed(), e.name.bright_white(), e.url, e.model.bright_cyan());
            }
        }
    }
    Ok(())
}

/// Layer the config file, command-line flags, and the credential env var
/// over the stored settings for this run.
fn apply_overlays(app: &ChatApp, args: &Args) -> Result<(), ChatError> {
    let file = match &args.config {
        Some(path) => SettingsOverlay::from_file(path)?,
        None => SettingsOverlay::default(),
    };
    let overlay = file.merged_with(args.flag_overlay());
    let env_key = env::var(API_KEY_ENV).ok();
    app.override_settings(|s| {
        if !overlay.is_empty() {
            overlay.apply(s);
        }
        fill_credential(s, env_key);
    });
    Ok(())
}

/// The requested chat, else the active chat, else a fresh one.
fn resolve_chat(app: &ChatApp, requested: Option<&str>) -> Result<String, ChatError> {
    if let Some(id) = requested {
        return Ok(id.to_string());
    }
    match app.with_state(|st| st.transcript.active_chat_id().map(str::to_string)) {
        Some(id) => Ok(id),
        None => app.create_chat(),
    }
}

//! Terminal renderer for streamed answers.
//!
//! Observers receive the accumulated content on every delta; the renderer
//! remembers how much of each target it already printed and writes only the
//! new suffix.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Mutex;

use colored::*;

use crate::observer::StreamObserver;
use crate::providers::Role;
use crate::transcript::{Chat, Message, MessageKind};

/// Writes streamed text to stdout as it arrives.
#[derive(Debug, Default)]
pub struct TerminalRenderer {
    printed: Mutex<HashMap<String, usize>>,
}

impl TerminalRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Portion of `content` not yet printed for `target`, and record it as
    /// printed. A content that shrank or diverged restarts from zero.
    fn unseen<'a>(&self, target: &str, content: &'a str) -> &'a str {
        let mut printed = self.printed.lock().unwrap_or_else(|e| e.into_inner());
        let seen = printed.entry(target.to_string()).or_insert(0);
        let from = if *seen <= content.len() && content.is_char_boundary(*seen) { *seen } else { 0 };
        *seen = content.len();
        &content[from..]
    }

    fn forget(&self, target: &str) {
        self.printed.lock().unwrap_or_else(|e| e.into_inner()).remove(target);
    }
}

impl StreamObserver for TerminalRenderer {
    fn on_started(&self, target: &str, label: &str) {
        self.forget(target);
        println!("{} {}", "▶".bright_blue(), label.bright_yellow().bold());
    }

    fn on_delta_applied(&self, target: &str, content: &str) {
        let fresh = self.unseen(target, content);
        if !fresh.is_empty() {
            print!("{fresh}");
            let _ = io::stdout().flush();
        }
    }

    fn on_finalized(&self, target: &str, response_time: f64) {
        self.forget(target);
        println!("\n{}", format!("({response_time:.2}s)").dimmed());
    }

    fn on_error(&self, target: &str, message: &str) {
        self.forget(target);
        println!("\n{}", message.bright_red());
    }

    fn on_aborted(&self, target: &str) {
        self.forget(target);
        println!("\n{}", "[aborted]".yellow());
    }
}

/// Render a stored message for `show`.
pub fn format_message(message: &Message) -> String {
    let label = match message.role {
        Role::User => "you".bright_green().bold(),
        Role::Assistant => "assistant".bright_cyan().bold(),
        Role::System => "system".bright_magenta().bold(),
    };
    let body = match message.kind {
        MessageKind::Error => message.content.bright_red().to_string(),
        MessageKind::Text => message.content.clone(),
    };
    match message.response_time {
        Some(t) => format!("{label}: {body} {}", format!("({t:.2}s)").dimmed()),
        None => format!("{label}: {body}"),
    }
}

/// One line of the chat list.
pub fn format_chat_line(chat: &Chat, active: bool) -> String {
    let marker = if active { "*".bright_green().to_string() } else { " ".to_string() };
    format!(
        "{marker} {} {} {}",
        chat.id.dimmed(),
        chat.title.bright_white(),
        format!("[{} messages]", chat.messages.len()).dimmed()
    )
}

//! # Stage: Comparison Pipeline
//!
//! ## Responsibility
//! Sends one user turn to every active comparison endpoint, one endpoint at
//! a time, and renders each answer into its own transient panel.
//!
//! ## Guarantees
//! - Endpoints run strictly in sequence; at most one outbound stream is open.
//! - Each panel times itself from the moment its own request starts.
//! - A failing endpoint finalizes its panel as an error and the sequence
//!   moves on.
//! - One token covers the whole run: cancelling it aborts the running panel
//!   and no later endpoint starts.
//!
//! ## NOT Responsible For
//! - Persisting answers: only the user message enters the transcript

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cancel::{Domain, LiveHandle};
use crate::error::ChatError;
use crate::pipeline::{ChatApp, PipelineState};
use crate::providers::{ChatMessage, ChatRequest, Sampling};
use crate::settings::{ComparisonEndpoint, MAX_ACTIVE_ENDPOINTS};
use crate::transcript::round_seconds;

#[derive(Debug, Clone, PartialEq)]
pub enum PanelOutcome {
    Completed { content: String, response_time: f64 },
    Failed { message: String, response_time: f64 },
    Aborted,
    NotStarted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PanelResult {
    pub endpoint_id: String,
    pub name: String,
    pub model: String,
    pub outcome: PanelOutcome,
}

impl PanelResult {
    /// Completed or failed; either way the panel reached a final display.
    pub fn is_finalized(&self) -> bool {
        matches!(self.outcome, PanelOutcome::Completed { .. } | PanelOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonReport {
    pub user_message_id: String,
    pub panels: Vec<PanelResult>,
}

impl ComparisonReport {
    pub fn finalized_count(&self) -> usize {
        self.panels.iter().filter(|p| p.is_finalized()).count()
    }

    pub fn was_cancelled(&self) -> bool {
        self.panels.iter().any(|p| p.outcome == PanelOutcome::Aborted || p.outcome == PanelOutcome::NotStarted)
    }
}

/// Active endpoints a comparison will use, or why it cannot start.
pub fn select_endpoints(endpoints: &[ComparisonEndpoint]) -> Result<Vec<ComparisonEndpoint>, ChatError> {
    let active: Vec<&ComparisonEndpoint> = endpoints.iter().filter(|e| e.active).collect();
    if active.len() > MAX_ACTIVE_ENDPOINTS {
        return Err(ChatError::Configuration(format!(
            "{} comparison endpoints are active, at most {MAX_ACTIVE_ENDPOINTS} allowed",
            active.len()
        )));
    }
    let usable: Vec<ComparisonEndpoint> = active.into_iter().filter(|e| e.is_usable()).cloned().collect();
    if usable.is_empty() {
        return Err(ChatError::Configuration(
            "no active comparison endpoint with both a URL and a model".into(),
        ));
    }
    Ok(usable)
}

impl ChatApp {
    /// Record `user_text` in `chat_id` and stream it to each active
    /// comparison endpoint in turn.
    pub async fn compare(&self, chat_id: &str, user_text: &str) -> Result<ComparisonReport, ChatError> {
        let text = user_text.trim();

        let (handle, endpoints, user_message_id, messages, sampling) = {
            let mut st = self.lock();
            st.require_scope()?;
            st.require_chat(chat_id)?;
            if text.is_empty() {
                return Err(ChatError::Configuration("message is empty".into()));
            }
            let endpoints = select_endpoints(&st.settings.endpoints)?;

            let (handle, previous) = st.cancel.begin(Domain::Comparison, chat_id);
            if let Some(prev) = previous {
                st.discard(&prev);
            }
            st.transition(Domain::Comparison, handle.op_id, PipelineState::Requesting);

            let (user_message_id, messages) = match st.prepare_comparison(chat_id, text) {
                Ok(p) => p,
                Err(e) => {
                    st.cancel.release(Domain::Comparison, handle.op_id);
                    st.transition(Domain::Comparison, handle.op_id, PipelineState::Idle);
                    return Err(e);
                }
            };
            (handle, endpoints, user_message_id, messages, st.settings.sampling())
        };

        info!(target: "streamchat::comparison", chat_id = %chat_id, endpoints = endpoints.len(), "comparison started");

        let mut panels = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            if handle.token.is_cancelled() {
                panels.push(PanelResult {
                    endpoint_id: endpoint.id.clone(),
                    name: endpoint.name.clone(),
                    model: endpoint.model.clone(),
                    outcome: PanelOutcome::NotStarted,
                });
                continue;
            }
            panels.push(self.run_panel(&handle, endpoint, &messages, sampling).await);
        }

        {
            let mut st = self.lock();
            let terminal = if handle.token.is_cancelled() { PipelineState::Cancelled } else { PipelineState::Finalized };
            st.transition(Domain::Comparison, handle.op_id, terminal);
            st.cancel.release(Domain::Comparison, handle.op_id);
        }

        let report = ComparisonReport { user_message_id, panels };
        debug!(
            target: "streamchat::comparison",
            finalized = report.finalized_count(),
            cancelled = report.was_cancelled(),
            "comparison finished"
        );
        Ok(report)
    }

    async fn run_panel(
        &self,
        handle: &LiveHandle,
        endpoint: &ComparisonEndpoint,
        messages: &[ChatMessage],
        sampling: Sampling,
    ) -> PanelResult {
        let target = endpoint.target();
        let request = ChatRequest::streaming(target.model.clone(), messages.to_vec(), sampling);
        let token = &handle.token;

        self.observer.on_started(&endpoint.id, &endpoint.name);
        let started = Instant::now();

        let streamed: Result<String, ChatError> = async {
            let mut deltas = self.open(token, &target, &request).await?;
            self.lock().transition(Domain::Comparison, handle.op_id, PipelineState::Streaming);
            let mut content = String::new();
            while let Some(delta) = deltas.next_delta().await? {
                content.push_str(&delta);
                self.observer.on_delta_applied(&endpoint.id, &content);
            }
            Ok::<_, ChatError>(content)
        }
        .await;

        let response_time = round_seconds(started.elapsed().as_secs_f64());
        let outcome = match streamed {
            _ if token.is_cancelled() => PanelOutcome::Aborted,
            Err(ChatError::Cancelled) => PanelOutcome::Aborted,
            Ok(content) => PanelOutcome::Completed { content, response_time },
            Err(e) => {
                warn!(target: "streamchat::comparison", endpoint = %endpoint.name, error = %e, "comparison endpoint failed");
                PanelOutcome::Failed { message: e.display_message(), response_time }
            }
        };

        match &outcome {
            PanelOutcome::Completed { .. } => self.observer.on_finalized(&endpoint.id, response_time),
            PanelOutcome::Failed { message, .. } => self.observer.on_error(&endpoint.id, message),
            PanelOutcome::Aborted => self.observer.on_aborted(&endpoint.id),
            PanelOutcome::NotStarted => {}
        }

        PanelResult {
            endpoint_id: endpoint.id.clone(),
            name: endpoint.name.clone(),
            model: endpoint.model.clone(),
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(name: &str, active: bool) -> ComparisonEndpoint {
        let mut e = ComparisonEndpoint::new(name, format!("http://{name}/v1"), "m", None);
        e.active = active;
        e
    }

    #[test]
    fn test_select_skips_inactive_and_unusable() {
        let mut broken = ep("broken", true);
        broken.url.clear();
        let picked = select_endpoints(&[ep("a", true), ep("b", false), broken, ep("c", true)]).expect("ok");
        let names: Vec<&str> = picked.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn test_select_refuses_more_than_three_active() {
        let eps: Vec<_> = (0..4).map(|i| ep(&format!("e{i}"), true)).collect();
        assert!(matches!(select_endpoints(&eps), Err(ChatError::Configuration(_))));
    }

    #[test]
    fn test_select_requires_one_usable() {
        assert!(matches!(select_endpoints(&[ep("a", false)]), Err(ChatError::Configuration(_))));
        assert!(matches!(select_endpoints(&[]), Err(ChatError::Configuration(_))));
    }

    #[test]
    fn test_report_counts() {
        let panel = |outcome| PanelResult { endpoint_id: "x".into(), name: "x".into(), model: "m".into(), outcome };
        let report = ComparisonReport {
            user_message_id: "msg".into(),
            panels: vec![
                panel(PanelOutcome::Completed { content: "a".into(), response_time: 0.1 }),
                panel(PanelOutcome::Failed { message: "e".into(), response_time: 0.2 }),
                panel(PanelOutcome::Aborted),
                panel(PanelOutcome::NotStarted),
            ],
        };
        assert_eq!(report.finalized_count(), 2);
        assert!(report.was_cancelled());
    }
}

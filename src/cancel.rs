//! Cancellation coordinator: one live handle per domain.
//!
//! Starting an operation supersedes the previous handle of the same domain
//! only. Chat switches and identity teardown cancel both domains.

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    SingleTurn,
    Comparison,
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Domain::SingleTurn => write!(f, "single_turn"),
            Domain::Comparison => write!(f, "comparison"),
        }
    }
}

/// A live operation: its token plus the transcript target it streams into.
#[derive(Debug, Clone)]
pub struct LiveHandle {
    pub op_id: u64,
    pub token: CancellationToken,
    pub chat_id: String,
    /// Placeholder assistant message, single-turn only.
    pub placeholder: Option<String>,
}

#[derive(Debug, Default)]
pub struct CancellationCoordinator {
    next_op: u64,
    single: Option<LiveHandle>,
    comparison: Option<LiveHandle>,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, domain: Domain) -> &mut Option<LiveHandle> {
        match domain {
            Domain::SingleTurn => &mut self.single,
            Domain::Comparison => &mut self.comparison,
        }
    }

    pub fn live(&self, domain: Domain) -> Option<&LiveHandle> {
        match domain {
            Domain::SingleTurn => self.single.as_ref(),
            Domain::Comparison => self.comparison.as_ref(),
        }
    }

    /// Register a new operation. The previous handle of `domain`, if any, is
    /// cancelled and returned so the caller can clean up after it.
    pub fn begin(&mut self, domain: Domain, chat_id: &str) -> (LiveHandle, Option<LiveHandle>) {
        self.next_op += 1;
        let handle = LiveHandle {
            op_id: self.next_op,
            token: CancellationToken::new(),
            chat_id: chat_id.to_string(),
            placeholder: None,
        };
        let previous = self.slot(domain).replace(handle.clone());
        if let Some(prev) = &previous {
            prev.token.cancel();
            debug!(target: "streamchat::cancel", %domain, op_id = prev.op_id, "superseded in-flight operation");
        }
        (handle, previous)
    }

    /// Record the placeholder message of the live single-turn operation.
    pub fn attach_placeholder(&mut self, op_id: u64, message_id: &str) {
        if let Some(h) = self.single.as_mut().filter(|h| h.op_id == op_id) {
            h.placeholder = Some(message_id.to_string());
        }
    }

    /// Cancel the live handle of one domain.
    pub fn cancel(&mut self, domain: Domain) -> Option<LiveHandle> {
        let handle = self.slot(domain).take()?;
        handle.token.cancel();
        debug!(target: "streamchat::cancel", %domain, op_id = handle.op_id, "cancelled operation");
        Some(handle)
    }

    /// Cancel both domains.
    pub fn cancel_all(&mut self) -> Vec<LiveHandle> {
        [Domain::SingleTurn, Domain::Comparison]
            .into_iter()
            .filter_map(|d| self.cancel(d))
            .collect()
    }

    /// Release a finished operation's handle. A newer operation that already
    /// superseded it is left untouched.
    pub fn release(&mut self, domain: Domain, op_id: u64) {
        let slot = self.slot(domain);
        if slot.as_ref().is_some_and(|h| h.op_id == op_id) {
            *slot = None;
        }
    }
}

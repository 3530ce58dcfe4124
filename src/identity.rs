//! Identity scope collaborator.
//!
//! The identity is an opaque partition key supplied from outside (an account
//! address, a user name). `None` means no identity, which maps onto the
//! local partition. Changes are delivered over a `tokio::sync::watch`
//! channel; [`follow_identity`] applies them to a [`ChatApp`].

use tokio::sync::watch;
use tracing::{debug, info};

use crate::pipeline::ChatApp;

pub trait IdentityProvider: Send + Sync {
    /// Current partition key, or `None`.
    fn current(&self) -> Option<String>;

    /// Receiver that sees every subsequent identity change.
    fn subscribe(&self) -> watch::Receiver<Option<String>>;
}

/// Identity provider whose value is set programmatically.
#[derive(Debug)]
pub struct StaticIdentity {
    tx: watch::Sender<Option<String>>,
}

impl StaticIdentity {
    pub fn new(initial: Option<String>) -> Self {
        let (tx, _rx) = watch::channel(normalize(initial));
        StaticIdentity { tx }
    }

    /// Switch identity. Receivers are only woken when the value differs.
    pub fn set(&self, identity: Option<String>) {
        let identity = normalize(identity);
        self.tx.send_if_modified(|current| {
            if *current == identity {
                return false;
            }
            *current = identity;
            true
        });
    }
}

impl IdentityProvider for StaticIdentity {
    fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

fn normalize(identity: Option<String>) -> Option<String> {
    identity.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Apply identity changes to `app` until the provider goes away.
///
/// The value current at subscription time is applied first.
pub async fn follow_identity(app: ChatApp, mut rx: watch::Receiver<Option<String>>) {
    let initial = rx.borrow_and_update().clone();
    app.identity_changed(initial.as_deref());
    while rx.changed().await.is_ok() {
        let identity = rx.borrow_and_update().clone();
        debug!(target: "streamchat::identity", identity = ?identity, "identity change received");
        app.identity_changed(identity.as_deref());
    }
    info!(target: "streamchat::identity", "identity provider closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_identity_is_none() {
        let p = StaticIdentity::new(Some("   ".into()));
        assert_eq!(p.current(), None);
        p.set(Some(" 0xAbc ".into()));
        assert_eq!(p.current().as_deref(), Some("0xAbc"));
    }

    #[test]
    fn test_set_same_value_does_not_notify() {
        let p = StaticIdentity::new(Some("alice".into()));
        let rx = p.subscribe();
        p.set(Some("alice".into()));
        assert!(!rx.has_changed().expect("open"));
        p.set(Some("bob".into()));
        assert!(rx.has_changed().expect("open"));
    }
}

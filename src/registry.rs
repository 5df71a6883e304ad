//! Session registry (§4.8).
//!
//! Process-wide concurrent index of live call sessions keyed by carrier
//! call id. Consulted by the webhook/event router to find the owning
//! session's command channel, and by the campaign dispatcher to recognize
//! that a just-dialed outbound call already has an owning task.
//!
//! A handle is a cheap, cloneable command-channel sender; callers ask the
//! session to act, they never reach into its state directly.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Commands the registry's caller can ask a session to perform. The session
/// module defines the full variant set; the registry only needs a sender.
pub type SessionHandle<Cmd> = mpsc::Sender<Cmd>;

/// Concurrent registry of live sessions keyed by carrier call id.
pub struct SessionRegistry<Cmd> {
    sessions: DashMap<String, SessionHandle<Cmd>>,
}

impl<Cmd> Default for SessionRegistry<Cmd> {
    fn default() -> Self {
        Self { sessions: DashMap::new() }
    }
}

impl<Cmd> SessionRegistry<Cmd> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handle for `call_id`. Idempotent: if a handle is already
    /// registered and its channel is still open, the new registration is
    /// rejected (returns `false`) and logged. If the existing handle's
    /// channel is closed (the prior session already exited without
    /// deregistering), the new handle replaces it.
    pub fn register(&self, call_id: impl Into<String>, handle: SessionHandle<Cmd>) -> bool {
        let call_id = call_id.into();
        match self.sessions.get(&call_id) {
            Some(existing) if !existing.is_closed() => {
                warn!(call_id = %call_id, "duplicate session registration rejected, existing handle still live");
                false
            }
            _ => {
                self.sessions.insert(call_id.clone(), handle);
                info!(call_id = %call_id, "session registered");
                true
            }
        }
    }

    pub fn lookup(&self, call_id: &str) -> Option<SessionHandle<Cmd>> {
        self.sessions.get(call_id).map(|h| h.clone())
    }

    /// Remove a session's registration. Called once, when the session
    /// transitions to COMPLETED or FAILED.
    pub fn remove(&self, call_id: &str) {
        if self.sessions.remove(call_id).is_some() {
            info!(call_id = %call_id, "session removed from registry");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum TestCmd {
        Ping,
    }

    #[tokio::test]
    async fn register_then_lookup_then_remove() {
        let registry: Arc<SessionRegistry<TestCmd>> = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        assert!(registry.register("C1", tx));
        assert!(registry.lookup("C1").is_some());
        registry.remove("C1");
        assert!(registry.lookup("C1").is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_rejected_while_handle_live() {
        let registry: Arc<SessionRegistry<TestCmd>> = SessionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        assert!(registry.register("C1", tx1));
        assert!(!registry.register("C1", tx2));
    }

    #[tokio::test]
    async fn registration_succeeds_once_old_handle_channel_closed() {
        let registry: Arc<SessionRegistry<TestCmd>> = SessionRegistry::new();
        let (tx1, rx1) = mpsc::channel::<TestCmd>(1);
        assert!(registry.register("C1", tx1));
        drop(rx1);

        let (tx2, _rx2) = mpsc::channel(1);
        assert!(registry.register("C1", tx2));
    }

    #[tokio::test]
    async fn lookup_missing_call_id_is_none() {
        let registry: Arc<SessionRegistry<TestCmd>> = SessionRegistry::new();
        assert!(registry.lookup("missing").is_none());
    }
}

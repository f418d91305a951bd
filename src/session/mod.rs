//! Trace session lifecycle.
//!
//! `SessionManager` validates requests, spawns one engine task per session
//! together with its event hub, and exposes cancellation, status and event
//! subscription by session id. Sessions share only the chain provider.

pub mod hub;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::chain::ChainDataProvider;
use crate::patterns::{AddressReputation, RiskScorer, RiskWeights};
use crate::trace::{CancelFlag, EngineConfig, SequenceCounter, TraceParams, TraceSession, TraversalEngine};
use crate::types::{
    EventPayload, OutputRef, SessionId, SessionStatus, TraceError, TraceEvent, TraceSummary,
    DEFAULT_DEPTH_LIMIT,
};

pub use hub::{EventHub, EventStream};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_depth_limit: u32,
    pub default_confidence_cutoff: f64,
    /// Capacity of the engine → hub channel.
    pub event_buffer: usize,
    /// Capacity of each subscriber channel.
    pub subscriber_buffer: usize,
    /// Events kept for late inspection per session.
    pub recent_window: usize,
    /// Finished sessions kept for inspection.
    pub retain_finished: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_depth_limit: DEFAULT_DEPTH_LIMIT,
            default_confidence_cutoff: 0.0,
            event_buffer: 256,
            subscriber_buffer: 256,
            recent_window: 512,
            retain_finished: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Snapshot of one session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub root: OutputRef,
    pub depth_limit: u32,
    pub confidence_cutoff: f64,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub events_emitted: u64,
    pub subscribers: usize,
}

struct SessionHandle {
    params: TraceParams,
    cancel: CancelFlag,
    status: watch::Receiver<SessionStatus>,
    hub: Arc<EventHub>,
    seq: SequenceCounter,
    started_at: DateTime<Utc>,
}

impl SessionHandle {
    fn info(&self, id: SessionId) -> SessionInfo {
        SessionInfo {
            id,
            root: self.params.root.clone(),
            depth_limit: self.params.depth_limit,
            confidence_cutoff: self.params.confidence_cutoff,
            status: *self.status.borrow(),
            started_at: self.started_at,
            events_emitted: self.seq.current(),
            subscribers: self.hub.subscriber_count(),
        }
    }
}

pub struct SessionManager {
    provider: Arc<dyn ChainDataProvider>,
    reputation: Arc<dyn AddressReputation>,
    weights: RiskWeights,
    engine: EngineConfig,
    config: SessionConfig,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn ChainDataProvider>,
        reputation: Arc<dyn AddressReputation>,
        weights: RiskWeights,
        engine: EngineConfig,
        config: SessionConfig,
    ) -> Self {
        Self {
            provider,
            reputation,
            weights,
            engine,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Start a trace and return immediately. `None` selects the default.
    pub fn start(
        &self,
        root: OutputRef,
        depth_limit: Option<u32>,
        confidence_cutoff: Option<f64>,
    ) -> Result<SessionId, TraceError> {
        self.launch(root, depth_limit, confidence_cutoff, false)
            .map(|(id, _)| id)
    }

    /// Start a trace with a subscription attached before the first event.
    pub fn start_attached(
        &self,
        root: OutputRef,
        depth_limit: Option<u32>,
        confidence_cutoff: Option<f64>,
    ) -> Result<(SessionId, EventStream), TraceError> {
        let (id, stream) = self.launch(root, depth_limit, confidence_cutoff, true)?;
        let stream = stream.ok_or_else(|| TraceError::InternalInvariant("subscription missing".to_string()))?;
        Ok((id, stream))
    }

    fn launch(
        &self,
        root: OutputRef,
        depth_limit: Option<u32>,
        confidence_cutoff: Option<f64>,
        attach: bool,
    ) -> Result<(SessionId, Option<EventStream>), TraceError> {
        let params = TraceParams::new(
            root,
            depth_limit.unwrap_or(self.config.default_depth_limit),
            confidence_cutoff.unwrap_or(self.config.default_confidence_cutoff),
        )?;

        let id = SessionId::new();
        let cancel = CancelFlag::new();
        let seq = SequenceCounter::default();
        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (status_tx, status_rx) = watch::channel(SessionStatus::Pending);
        let status_tx = Arc::new(status_tx);

        let hub = EventHub::new(self.config.recent_window, self.config.subscriber_buffer);
        let stream = attach.then(|| hub.subscribe());
        tokio::spawn(hub.clone().run(event_rx, cancel.clone()));

        let scorer = RiskScorer::new(self.weights.clone(), self.reputation.clone());
        let engine = TraversalEngine::new(
            self.provider.clone(),
            self.engine.clone(),
            scorer,
            event_tx.clone(),
            status_tx.clone(),
        );
        let session = TraceSession::new(id, params.clone(), cancel.clone(), seq.clone());

        info!(
            session = %id,
            root = %params.root,
            depth_limit = params.depth_limit,
            cutoff = params.confidence_cutoff,
            "Session started"
        );

        // Supervisor: guarantees a terminal event if the engine task dies.
        let supervisor_seq = seq.clone();
        tokio::spawn(async move {
            let engine_task = tokio::spawn(engine.run(session));
            if let Err(e) = engine_task.await {
                error!(session = %id, error = %e, "Engine task aborted");
                status_tx.send_replace(SessionStatus::Failed);
                let terminal = TraceEvent {
                    session_id: id,
                    seq: supervisor_seq.next(),
                    payload: EventPayload::SessionTerminal {
                        status: SessionStatus::Failed,
                        reason: Some(format!("engine task aborted: {e}")),
                        summary: TraceSummary::default(),
                    },
                };
                let _ = event_tx.send(terminal).await;
            }
        });

        let handle = SessionHandle {
            params,
            cancel,
            status: status_rx,
            hub,
            seq,
            started_at: Utc::now(),
        };

        let mut sessions = self.write_sessions()?;
        sessions.insert(id, handle);
        self.prune_finished(&mut sessions);

        Ok((id, stream))
    }

    /// Request cancellation. Cancelling a finished session is a no-op.
    pub fn cancel(&self, id: SessionId) -> Result<(), TraceError> {
        let sessions = self.read_sessions()?;
        let handle = sessions.get(&id).ok_or(TraceError::SessionNotFound(id))?;
        if !handle.status.borrow().is_terminal() {
            info!(session = %id, "Cancellation requested");
        }
        handle.cancel.cancel();
        Ok(())
    }

    /// Cancel every running session (used on shutdown).
    pub fn cancel_all(&self) {
        if let Ok(sessions) = self.sessions.read() {
            for handle in sessions.values() {
                handle.cancel.cancel();
            }
        }
    }

    /// Subscribe to a session's events from now on.
    pub fn events(&self, id: SessionId) -> Result<EventStream, TraceError> {
        let sessions = self.read_sessions()?;
        let handle = sessions.get(&id).ok_or(TraceError::SessionNotFound(id))?;
        Ok(handle.hub.subscribe())
    }

    /// The bounded window of a session's most recent events.
    pub fn recent_events(&self, id: SessionId) -> Result<Vec<TraceEvent>, TraceError> {
        let sessions = self.read_sessions()?;
        let handle = sessions.get(&id).ok_or(TraceError::SessionNotFound(id))?;
        Ok(handle.hub.recent())
    }

    pub fn status(&self, id: SessionId) -> Result<SessionStatus, TraceError> {
        let sessions = self.read_sessions()?;
        let handle = sessions.get(&id).ok_or(TraceError::SessionNotFound(id))?;
        let status = *handle.status.borrow();
        Ok(status)
    }

    pub fn info(&self, id: SessionId) -> Result<SessionInfo, TraceError> {
        let sessions = self.read_sessions()?;
        let handle = sessions.get(&id).ok_or(TraceError::SessionNotFound(id))?;
        Ok(handle.info(id))
    }

    /// All known sessions, newest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut all: Vec<SessionInfo> = match self.sessions.read() {
            Ok(sessions) => sessions.iter().map(|(id, h)| h.info(*id)).collect(),
            Err(_) => Vec::new(),
        };
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .map(|s| s.values().filter(|h| !h.status.borrow().is_terminal()).count())
            .unwrap_or_default()
    }

    /// Wait until a session reaches a terminal status and its terminal
    /// event has been delivered.
    pub async fn wait(&self, id: SessionId) -> Result<SessionStatus, TraceError> {
        let (mut rx, hub) = {
            let sessions = self.read_sessions()?;
            let handle = sessions.get(&id).ok_or(TraceError::SessionNotFound(id))?;
            (handle.status.clone(), handle.hub.clone())
        };
        let reached = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s).ok();
        let status = reached.unwrap_or_else(|| *rx.borrow());
        hub.closed().await;
        Ok(status)
    }

    fn prune_finished(&self, sessions: &mut HashMap<SessionId, SessionHandle>) {
        let mut finished: Vec<(DateTime<Utc>, SessionId)> = sessions
            .iter()
            .filter(|(_, h)| h.status.borrow().is_terminal())
            .map(|(id, h)| (h.started_at, *id))
            .collect();
        if finished.len() <= self.config.retain_finished {
            return;
        }
        finished.sort_by_key(|(started, _)| *started);
        let excess = finished.len() - self.config.retain_finished;
        for (_, id) in finished.into_iter().take(excess) {
            sessions.remove(&id);
        }
    }

    fn read_sessions(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<SessionId, SessionHandle>>, TraceError> {
        self.sessions
            .read()
            .map_err(|_| TraceError::InternalInvariant("session table lock poisoned".to_string()))
    }

    fn write_sessions(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<SessionId, SessionHandle>>, TraceError> {
        self.sessions
            .write()
            .map_err(|_| TraceError::InternalInvariant("session table lock poisoned".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::patterns::AddressList;
    use crate::types::{ScriptType, Transaction, TxInput, TxOutput, NULL_TXID};

    fn txid(n: u8) -> String {
        format!("{:02x}", n).repeat(32)
    }

    fn make_chain() -> MemoryChain {
        let coinbase = Transaction {
            txid: txid(1),
            inputs: vec![TxInput::new(NULL_TXID, u32::MAX)],
            outputs: vec![TxOutput { index: 0, value: 5_000, address: None, script_type: ScriptType::P2pkh }],
            block_time: None,
        };
        let spend = Transaction {
            txid: txid(2),
            inputs: vec![TxInput::new(txid(1), 0)],
            outputs: vec![TxOutput { index: 0, value: 4_000, address: None, script_type: ScriptType::P2pkh }],
            block_time: None,
        };
        MemoryChain::from_transactions(vec![coinbase, spend])
    }

    fn make_manager(config: SessionConfig) -> SessionManager {
        SessionManager::new(
            Arc::new(make_chain()),
            Arc::new(AddressList::default()),
            RiskWeights::default(),
            EngineConfig::default(),
            config,
        )
    }

    #[tokio::test]
    async fn test_start_validates_parameters() {
        let manager = make_manager(SessionConfig::default());
        let root = OutputRef::new(txid(2), 0);
        assert!(matches!(
            manager.start(root.clone(), Some(0), None),
            Err(TraceError::InvalidParameter(_))
        ));
        assert!(matches!(
            manager.start(root.clone(), Some(101), None),
            Err(TraceError::InvalidParameter(_))
        ));
        assert!(matches!(
            manager.start(root, None, Some(1.5)),
            Err(TraceError::InvalidParameter(_))
        ));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_attached_session_runs_to_completion() {
        let manager = make_manager(SessionConfig::default());
        let (id, mut stream) = manager
            .start_attached(OutputRef::new(txid(2), 0), None, None)
            .unwrap();

        let mut events = Vec::new();
        while let Some(e) = stream.recv().await {
            events.push(e);
        }
        assert_eq!(events.len(), 4); // node, node, edge, terminal
        assert!(events.last().unwrap().payload.is_terminal());
        assert_eq!(manager.wait(id).await.unwrap(), SessionStatus::Completed);
        assert_eq!(manager.status(id).unwrap(), SessionStatus::Completed);
        assert_eq!(manager.recent_events(id).unwrap().len(), 4);
        assert_eq!(manager.info(id).unwrap().events_emitted, 4);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let manager = make_manager(SessionConfig::default());
        let id = SessionId::new();
        assert!(matches!(manager.cancel(id), Err(TraceError::SessionNotFound(_))));
        assert!(matches!(manager.events(id), Err(TraceError::SessionNotFound(_))));
        assert!(matches!(manager.status(id), Err(TraceError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_finished_session_is_noop() {
        let manager = make_manager(SessionConfig::default());
        let id = manager.start(OutputRef::new(txid(2), 0), None, None).unwrap();
        assert_eq!(manager.wait(id).await.unwrap(), SessionStatus::Completed);
        assert!(manager.cancel(id).is_ok());
        assert_eq!(manager.status(id).unwrap(), SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_finished_sessions_are_pruned() {
        let config = SessionConfig {
            retain_finished: 1,
            ..SessionConfig::default()
        };
        let manager = make_manager(config);
        let root = OutputRef::new(txid(2), 0);
        for _ in 0..3 {
            let id = manager.start(root.clone(), None, None).unwrap();
            manager.wait(id).await.unwrap();
        }
        let last = manager.start(root, None, None).unwrap();
        manager.wait(last).await.unwrap();
        assert!(manager.list().len() <= 2);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_pruning_evicts_oldest_finished_first() {
        let config = SessionConfig {
            retain_finished: 1,
            ..SessionConfig::default()
        };
        let manager = make_manager(config);
        let root = OutputRef::new(txid(2), 0);

        let oldest = manager.start(root.clone(), None, None).unwrap();
        manager.wait(oldest).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = manager.start(root.clone(), None, None).unwrap();
        manager.wait(newer).await.unwrap();

        // two finished sessions when the third starts: only the newer stays
        let latest = manager.start(root, None, None).unwrap();
        assert!(matches!(manager.status(oldest), Err(TraceError::SessionNotFound(_))));
        assert_eq!(manager.status(newer).unwrap(), SessionStatus::Completed);
        assert!(manager.status(latest).is_ok());
    }
}

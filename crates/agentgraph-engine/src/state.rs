//! Live execution sessions and their persistence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::graph::GraphDefinition;
use agentgraph_core::session::{ExecutionSession, NodeResult, NodeRun, Round};
use agentgraph_core::traits::SessionStore;

/// Length of generated session ids.
pub const SESSION_ID_LEN: usize = 12;
/// Fresh ids drawn before giving up on finding a free one.
pub const MAX_ID_ATTEMPTS: usize = 16;

/// A session shared between the scheduler and its node runners.
///
/// All mutations go through one async mutex, so concurrently running nodes
/// append their rounds and ledger entries one at a time.
#[derive(Clone)]
pub struct SharedSession {
    id: Arc<str>,
    inner: Arc<Mutex<ExecutionSession>>,
    store: Arc<dyn SessionStore>,
    running: Arc<AtomicBool>,
}

impl SharedSession {
    fn new(session: ExecutionSession, store: Arc<dyn SessionStore>) -> Self {
        Self {
            id: Arc::from(session.id.as_str()),
            inner: Arc::new(Mutex::new(session)),
            store,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, ExecutionSession> {
        self.inner.lock().await
    }

    /// Clone of the current document.
    pub async fn snapshot(&self) -> ExecutionSession {
        self.inner.lock().await.clone()
    }

    /// Claim the session for a run. Fails with `SessionBusy` while another
    /// run holds it; the claim is released when the guard drops.
    pub fn try_begin_run(&self) -> Result<RunGuard> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(AgentGraphError::SessionBusy(self.id.to_string()));
        }
        Ok(RunGuard {
            running: Arc::clone(&self.running),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn record_round_result(&self, round: Round) -> usize {
        self.inner.lock().await.record_round_result(round)
    }

    pub async fn mark_completed(&self, node: &str) {
        self.inner.lock().await.mark_completed(node);
    }

    pub async fn append_global_output(&self, node: &str, output: impl Into<String>) {
        self.inner.lock().await.append_global_output(node, output);
    }

    pub async fn update_handoff_usage(&self, node: &str, target: &str) {
        self.inner.lock().await.update_handoff_usage(node, target);
    }

    /// Record a finished node and persist, under a single lock acquisition.
    pub async fn record_node_run(&self, run: NodeRun) -> Result<NodeResult> {
        let mut session = self.inner.lock().await;
        let result = session.record_node_run(run);
        self.store.save(&session).await?;
        Ok(result)
    }

    /// Apply `f` to the document and persist the result.
    pub async fn update<T>(&self, f: impl FnOnce(&mut ExecutionSession) -> T) -> Result<T> {
        let mut session = self.inner.lock().await;
        let value = f(&mut session);
        session.touch();
        self.store.save(&session).await?;
        Ok(value)
    }

    /// Save the current document. Holding the lock while saving keeps
    /// snapshots from concurrent runners in order.
    pub async fn persist(&self) -> Result<()> {
        let session = self.inner.lock().await;
        self.store.save(&session).await
    }
}

/// Marks a session as running until dropped.
pub struct RunGuard {
    running: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Owns every live session of this process and the store behind them.
pub struct SessionManager {
    live: RwLock<HashMap<String, SharedSession>>,
    store: Arc<dyn SessionStore>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Create and persist a fresh session for a prepared graph.
    pub async fn create_session(
        &self,
        graph_name: &str,
        graph: GraphDefinition,
    ) -> Result<SharedSession> {
        let mut live = self.live.write().await;

        for attempt in 1..=MAX_ID_ATTEMPTS {
            let id = generate_session_id();
            if live.contains_key(&id) || self.store.exists(&id).await? {
                debug!(attempt, id = %id, "Session id collision, drawing again");
                continue;
            }

            let session = ExecutionSession::new(id.clone(), graph_name, graph);
            self.store.save(&session).await?;
            let shared = SharedSession::new(session, Arc::clone(&self.store));
            live.insert(id.clone(), shared.clone());
            info!(session = %id, graph = graph_name, "Session created");
            return Ok(shared);
        }

        Err(AgentGraphError::SessionIdExhausted(MAX_ID_ATTEMPTS))
    }

    /// Live session by id, loading it from the store if needed.
    pub async fn get_session(&self, id: &str) -> Result<SharedSession> {
        if let Some(session) = self.live.read().await.get(id) {
            return Ok(session.clone());
        }

        let mut live = self.live.write().await;
        if let Some(session) = live.get(id) {
            return Ok(session.clone());
        }
        let document = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| AgentGraphError::SessionNotFound(id.to_string()))?;
        let shared = SharedSession::new(document, Arc::clone(&self.store));
        live.insert(id.to_string(), shared.clone());
        debug!(session = id, "Session loaded from store");
        Ok(shared)
    }

    /// Remove a session from memory and from the store.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let mut live = self.live.write().await;
        if live.get(id).is_some_and(SharedSession::is_running) {
            return Err(AgentGraphError::SessionBusy(id.to_string()));
        }
        let was_live = live.remove(id).is_some();
        let was_stored = self.store.delete(id).await?;
        if !was_live && !was_stored {
            return Err(AgentGraphError::SessionNotFound(id.to_string()));
        }
        info!(session = id, "Session deleted");
        Ok(())
    }

    /// Stored session ids, most recently updated first.
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        self.store.list().await
    }
}

fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Process-local session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: std::sync::Mutex<HashMap<String, ExecutionSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &ExecutionSession) -> BoxFuture<'_, Result<()>> {
        let session = session.clone();
        Box::pin(async move {
            self.sessions
                .lock()
                .map_err(|e| AgentGraphError::Database(e.to_string()))?
                .insert(session.id.clone(), session);
            Ok(())
        })
    }

    fn load(&self, id: &str) -> BoxFuture<'_, Result<Option<ExecutionSession>>> {
        let id = id.to_string();
        Box::pin(async move {
            Ok(self
                .sessions
                .lock()
                .map_err(|e| AgentGraphError::Database(e.to_string()))?
                .get(&id)
                .cloned())
        })
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            Ok(self
                .sessions
                .lock()
                .map_err(|e| AgentGraphError::Database(e.to_string()))?
                .contains_key(&id))
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            Ok(self
                .sessions
                .lock()
                .map_err(|e| AgentGraphError::Database(e.to_string()))?
                .remove(&id)
                .is_some())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let sessions = self
                .sessions
                .lock()
                .map_err(|e| AgentGraphError::Database(e.to_string()))?;
            let mut entries: Vec<(&String, &ExecutionSession)> = sessions.iter().collect();
            entries.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
            Ok(entries.into_iter().map(|(id, _)| id.clone()).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgraph_test_utils::{handoff_graph, linear_graph};

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(MemorySessionStore::new()))
    }

    /// A store that claims every id is taken.
    struct FullStore;

    impl SessionStore for FullStore {
        fn save(&self, _: &ExecutionSession) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
        fn load(&self, _: &str) -> BoxFuture<'_, Result<Option<ExecutionSession>>> {
            Box::pin(async { Ok(None) })
        }
        fn exists(&self, _: &str) -> BoxFuture<'_, Result<bool>> {
            Box::pin(async { Ok(true) })
        }
        fn delete(&self, _: &str) -> BoxFuture<'_, Result<bool>> {
            Box::pin(async { Ok(false) })
        }
        fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
            Box::pin(async { Ok(vec![]) })
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let manager = manager();
        let session = manager.create_session("linear", linear_graph()).await.unwrap();
        assert_eq!(session.id().len(), SESSION_ID_LEN);
        assert!(session.id().chars().all(|c| c.is_ascii_alphanumeric()));

        let again = manager.get_session(session.id()).await.unwrap();
        assert!(Arc::ptr_eq(&session.inner, &again.inner));
        assert_eq!(manager.list_sessions().await.unwrap(), vec![session.id().to_string()]);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let manager = manager();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..50 {
            let session = manager.create_session("linear", linear_graph()).await.unwrap();
            assert!(ids.insert(session.id().to_string()));
        }
    }

    #[tokio::test]
    async fn test_id_exhaustion() {
        let manager = SessionManager::new(Arc::new(FullStore));
        let err = manager.create_session("linear", linear_graph()).await.err().unwrap();
        assert!(matches!(err, AgentGraphError::SessionIdExhausted(MAX_ID_ATTEMPTS)));
    }

    #[tokio::test]
    async fn test_get_loads_from_store() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let created = SessionManager::new(Arc::clone(&store))
            .create_session("linear", linear_graph())
            .await
            .unwrap();

        // A second manager over the same store, as after a restart.
        let manager = SessionManager::new(store);
        let loaded = manager.get_session(created.id()).await.unwrap();
        assert_eq!(loaded.snapshot().await.graph_name, "linear");

        let err = manager.get_session("missing").await.err().unwrap();
        assert!(matches!(err, AgentGraphError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let manager = manager();
        let session = manager.create_session("linear", linear_graph()).await.unwrap();
        let id = session.id().to_string();

        {
            let _guard = session.try_begin_run().unwrap();
            let err = manager.delete_session(&id).await.unwrap_err();
            assert!(matches!(err, AgentGraphError::SessionBusy(_)));
        }

        manager.delete_session(&id).await.unwrap();
        assert!(manager.get_session(&id).await.is_err());
        assert!(matches!(
            manager.delete_session(&id).await.unwrap_err(),
            AgentGraphError::SessionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_run_guard_is_exclusive() {
        let manager = manager();
        let session = manager.create_session("linear", linear_graph()).await.unwrap();

        let guard = session.try_begin_run().unwrap();
        assert!(session.is_running());
        assert!(matches!(
            session.try_begin_run().err().unwrap(),
            AgentGraphError::SessionBusy(_)
        ));
        drop(guard);
        assert!(!session.is_running());
        assert!(session.try_begin_run().is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_records_all_land() {
        let manager = manager();
        let session = manager.create_session("linear", linear_graph()).await.unwrap();
        session.update(|s| s.begin_turn("go")).await.unwrap();

        let writers = (0..20).map(|i| {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .record_node_run(NodeRun {
                        node_name: if i % 2 == 0 { "A".into() } else { "B".into() },
                        output: format!("out{i}"),
                        ..Default::default()
                    })
                    .await
                    .unwrap()
            })
        });
        for handle in writers.collect::<Vec<_>>() {
            handle.await.unwrap();
        }

        let doc = session.snapshot().await;
        assert_eq!(doc.rounds.len(), 21);
        let indices: Vec<usize> = doc.rounds.iter().map(|r| r.index).collect();
        assert_eq!(indices, (0..21).collect::<Vec<_>>());
        assert_eq!(doc.history("A").len() + doc.history("B").len(), 20);

        let stored = manager.store().load(session.id()).await.unwrap().unwrap();
        assert_eq!(stored.rounds.len(), 21);
    }

    #[tokio::test]
    async fn test_field_mutations_land_and_persist_on_demand() {
        let manager = manager();
        let session = manager.create_session("handoff", handoff_graph()).await.unwrap();

        let writers = (0..10).map(|i| {
            let session = session.clone();
            tokio::spawn(async move {
                let index = session
                    .record_round_result(Round {
                        index: 0,
                        node_name: "X".into(),
                        level: 0,
                        messages: vec![],
                        model: "x".into(),
                        output: format!("x{i}"),
                        error: None,
                        handoff_target: None,
                        handoff_source: None,
                        elapsed_ms: 0,
                        timestamp: chrono::Utc::now(),
                    })
                    .await;
                session.append_global_output("X", format!("x{i}")).await;
                index
            })
        });
        let mut indices = vec![];
        for handle in writers.collect::<Vec<_>>() {
            indices.push(handle.await.unwrap());
        }
        indices.sort_unstable();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());

        session.mark_completed("X").await;
        session.update_handoff_usage("X", "Y").await;
        session.update_handoff_usage("Z", "X").await;

        // Field mutations stay in memory until persisted.
        let stored = manager.store().load(session.id()).await.unwrap().unwrap();
        assert!(stored.rounds.is_empty());

        session.persist().await.unwrap();
        let stored = manager.store().load(session.id()).await.unwrap().unwrap();
        assert_eq!(stored.rounds.len(), 10);
        assert_eq!(stored.history("X").len(), 10);
        assert!(stored.completed.contains("X") && !stored.pending.contains("X"));
        assert_eq!(stored.execution_chain, vec!["X"]);

        let quota = stored.handoff_status("X").unwrap();
        assert_eq!((quota.used, quota.last_selection.as_deref()), (1, Some("Y")));
        assert!(stored.handoff_status("Z").is_none());
    }
}

//! The registry of participating clients.
//!
//! The registry is the single source of truth for who takes part in a study and which phase of
//! the current task each client is in. It also implements the counting barrier used by the
//! [`TaskOrchestrator`]: a phase is complete once no client is left in the phase's active state.
//!
//! [`TaskOrchestrator`]: crate::orchestrator::TaskOrchestrator

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
        RwLock,
    },
};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::utils::{lock, read, write};

/// The state of a client, drawn from the vocabulary of the task it takes part in.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// The client is registered but no task has been started for it.
    #[display(fmt = "IDLE")]
    Idle,
    /// The client received the init command and computes its local counts.
    #[display(fmt = "INIT")]
    Init,
    /// The client sent all its counts and waits for the global statistics.
    #[display(fmt = "INIT_STATS")]
    InitStats,
    /// The client received the global statistics.
    #[display(fmt = "DONE_INIT")]
    DoneInit,
    /// The client received the QC filters and applies them.
    #[display(fmt = "QC")]
    Qc,
    /// The client applied the QC filters.
    #[display(fmt = "QC_APPLIED")]
    QcApplied,
    /// Every client applied the QC filters.
    #[display(fmt = "DONE_QC")]
    DoneQc,
    /// The client missed a phase deadline.
    #[display(fmt = "FAILED")]
    Failed,
}

impl TaskState {
    const COUNT: usize = 8;

    fn index(self) -> usize {
        self as usize
    }
}

/// The kind of a task. Every kind moves its clients through its own sequence of states.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    /// Accumulation of the genotype counts and derivation of the summary statistics.
    #[display(fmt = "INIT")]
    Init,
    /// Filtering of the loci according to the summary statistics.
    #[display(fmt = "QC")]
    Qc,
}

impl TaskKind {
    /// The state of the clients while the task is running. The task's barrier fires when no
    /// client is left in this state.
    pub fn active_state(self) -> TaskState {
        match self {
            TaskKind::Init => TaskState::Init,
            TaskKind::Qc => TaskState::Qc,
        }
    }

    /// The state of a client which finished its part of the task.
    pub fn reported_state(self) -> TaskState {
        match self {
            TaskKind::Init => TaskState::InitStats,
            TaskKind::Qc => TaskState::QcApplied,
        }
    }

    /// The state of the clients once the task is complete.
    pub fn done_state(self) -> TaskState {
        match self {
            TaskKind::Init => TaskState::DoneInit,
            TaskKind::Qc => TaskState::DoneQc,
        }
    }
}

/// A participating client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// The unique name of the client.
    pub name: String,
    /// The state of the client in the current task.
    pub state: TaskState,
    /// An opaque address or session identifier of the client.
    pub address: Option<String>,
}

impl Client {
    fn new(name: String, address: Option<String>) -> Self {
        Self {
            name,
            state: TaskState::Idle,
            address,
        }
    }
}

/// Errors of the [`ClientRegistry`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("client {0} not found")]
    ClientNotFound(String),
}

/// Number of clients per [`TaskState`].
///
/// The counters are only updated while the lock of the client whose state changes is held, so
/// that a counter never misses a transition.
#[derive(Debug, Default)]
struct StateCounters([AtomicUsize; TaskState::COUNT]);

impl StateCounters {
    fn incr(&self, state: TaskState) {
        self.0[state.index()].fetch_add(1, Ordering::SeqCst);
    }

    fn decr(&self, state: TaskState) {
        self.0[state.index()].fetch_sub(1, Ordering::SeqCst);
    }

    fn get(&self, state: TaskState) -> usize {
        self.0[state.index()].load(Ordering::SeqCst)
    }

    fn transition(&self, from: TaskState, to: TaskState) {
        if from != to {
            self.incr(to);
            self.decr(from);
        }
    }
}

/// A store for all the clients the coordinator is tracking.
///
/// Each client sits behind its own lock: state changes of different clients never contend, and
/// the map itself is only write-locked on registration.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<Mutex<Client>>>>,
    counters: StateCounters,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client.
    ///
    /// Registering a known name again keeps its state and only refreshes its address.
    pub fn register(&self, name: &str, address: Option<String>) {
        let mut clients = write(&self.clients);
        if let Some(client) = clients.get(name) {
            let mut client = lock(client);
            debug!("client {} registered again", name);
            if address.is_some() {
                client.address = address;
            }
            return;
        }
        info!("registering client {}", name);
        clients.insert(
            name.to_string(),
            Arc::new(Mutex::new(Client::new(name.to_string(), address))),
        );
        self.counters.incr(TaskState::Idle);
    }

    /// Whether a client with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        read(&self.clients).contains_key(name)
    }

    /// Returns a snapshot of all the clients, ordered by name.
    pub fn list_clients(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = read(&self.clients)
            .values()
            .map(|client| lock(client).clone())
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        clients
    }

    /// Returns the state of the given client.
    pub fn state(&self, name: &str) -> Result<TaskState, RegistryError> {
        let entry = self.get(name)?;
        let state = lock(&entry).state;
        Ok(state)
    }

    /// Overwrites the state of the given client.
    pub fn set_state(&self, name: &str, state: TaskState) -> Result<(), RegistryError> {
        let entry = self.get(name)?;
        let mut client = lock(&entry);
        debug!("client {}: {} -> {}", name, client.state, state);
        self.counters.transition(client.state, state);
        client.state = state;
        Ok(())
    }

    /// Moves the given client to `to` if and only if it currently is in `from`.
    ///
    /// Returns whether the transition took place.
    pub fn transition(
        &self,
        name: &str,
        from: TaskState,
        to: TaskState,
    ) -> Result<bool, RegistryError> {
        let entry = self.get(name)?;
        let mut client = lock(&entry);
        if client.state != from {
            debug!(
                "client {} is in {}: ignoring transition {} -> {}",
                name, client.state, from, to
            );
            return Ok(false);
        }
        debug!("client {}: {} -> {}", name, from, to);
        self.counters.transition(from, to);
        client.state = to;
        Ok(true)
    }

    /// Returns the number of clients in the given state.
    ///
    /// This is the barrier predicate: a phase is complete when no client is left in the
    /// phase's active state, whichever state the clients moved on to.
    pub fn count_in_state(&self, state: TaskState) -> usize {
        self.counters.get(state)
    }

    /// Returns the names of the clients in the given state, ordered by name.
    pub fn clients_in_state(&self, state: TaskState) -> Vec<String> {
        self.list_clients()
            .into_iter()
            .filter(|client| client.state == state)
            .map(|client| client.name)
            .collect()
    }

    /// Returns the total number of registered clients.
    pub fn len(&self) -> usize {
        read(&self.clients).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, name: &str) -> Result<Arc<Mutex<Client>>, RegistryError> {
        read(&self.clients)
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::ClientNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let registry = ClientRegistry::new();
        registry.register("alice", Some("10.0.0.1:9000".into()));
        registry.set_state("alice", TaskState::Init).unwrap();
        registry.register("alice", None);

        let clients = registry.list_clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].state, TaskState::Init);
        assert_eq!(clients[0].address.as_deref(), Some("10.0.0.1:9000"));
        assert_eq!(registry.count_in_state(TaskState::Idle), 0);
        assert_eq!(registry.count_in_state(TaskState::Init), 1);
    }

    #[test]
    fn test_set_state_unknown_client() {
        let registry = ClientRegistry::new();
        assert_eq!(
            registry.set_state("mallory", TaskState::Init),
            Err(RegistryError::ClientNotFound("mallory".into()))
        );
        assert_eq!(registry.count_in_state(TaskState::Init), 0);
    }

    #[test]
    fn test_barrier_tolerates_skipped_states() {
        let registry = ClientRegistry::new();
        for name in &["a", "b", "c"] {
            registry.register(name, None);
            registry.set_state(name, TaskState::Init).unwrap();
        }
        assert_eq!(registry.count_in_state(TaskState::Init), 3);

        registry.set_state("a", TaskState::InitStats).unwrap();
        // skips INIT_STATS entirely
        registry.set_state("b", TaskState::DoneInit).unwrap();
        assert_eq!(registry.count_in_state(TaskState::Init), 1);
        assert_eq!(registry.clients_in_state(TaskState::Init), vec!["c"]);

        registry.set_state("c", TaskState::Failed).unwrap();
        assert_eq!(registry.count_in_state(TaskState::Init), 0);
    }

    #[test]
    fn test_transition_only_from_expected_state() {
        let registry = ClientRegistry::new();
        registry.register("a", None);
        registry.set_state("a", TaskState::Init).unwrap();

        assert!(registry
            .transition("a", TaskState::Init, TaskState::InitStats)
            .unwrap());
        assert!(!registry
            .transition("a", TaskState::Init, TaskState::InitStats)
            .unwrap());
        assert_eq!(registry.state("a").unwrap(), TaskState::InitStats);
        assert_eq!(registry.count_in_state(TaskState::InitStats), 1);
    }

    #[test]
    fn test_concurrent_transitions_keep_counters_consistent() {
        let registry = Arc::new(ClientRegistry::new());
        let names: Vec<String> = (0..64).map(|i| format!("client-{}", i)).collect();
        for name in &names {
            registry.register(name, None);
            registry.set_state(name, TaskState::Init).unwrap();
        }

        let handles: Vec<_> = names
            .into_iter()
            .map(|name| {
                let registry = registry.clone();
                thread::spawn(move || {
                    // every client reports twice, only one transition may count
                    let first = registry
                        .transition(&name, TaskState::Init, TaskState::InitStats)
                        .unwrap();
                    let second = registry
                        .transition(&name, TaskState::Init, TaskState::InitStats)
                        .unwrap();
                    assert!(first && !second);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.count_in_state(TaskState::Init), 0);
        assert_eq!(registry.count_in_state(TaskState::InitStats), 64);
        assert_eq!(registry.len(), 64);
    }
}

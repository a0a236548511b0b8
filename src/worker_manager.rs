//! Registry of connected launcher and worker processes, indexed by
//! `func_id`. Client ids for workers are allocated here and never
//! reused for the lifetime of the process.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::message_connection::MessageConnection;

#[derive(Default)]
struct Registry {
    launchers: HashMap<u16, Arc<MessageConnection>>,
    workers: HashMap<u16, Arc<MessageConnection>>,
    workers_by_func: HashMap<u16, BTreeSet<u16>>,
}

#[derive(Default)]
pub struct WorkerManager {
    // u32 so exhaustion of the 16-bit space is observable, not a wrap.
    next_client_id: AtomicU32,
    registry: Mutex<Registry>,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self {
            next_client_id: AtomicU32::new(1),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Reserves a nonzero client id for a worker, or `None` once the
    /// 16-bit space is exhausted. `u16::MAX` stays unassigned so the
    /// all-ones call-id sentinel can never be produced by a real call.
    pub fn allocate_client_id(&self) -> Option<u16> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        u16::try_from(id).ok().filter(|&id| id != u16::MAX)
    }

    /// Registers a launcher. At most one launcher per `func_id`.
    pub fn on_launcher_connected(&self, connection: Arc<MessageConnection>) -> bool {
        let func_id = connection.func_id();
        let mut registry = self.registry.lock().unwrap();
        if registry.launchers.contains_key(&func_id) {
            warn!(func_id, "rejecting duplicate launcher registration");
            return false;
        }
        registry.launchers.insert(func_id, connection);
        info!(func_id, "launcher connected");
        true
    }

    pub fn on_launcher_disconnected(&self, connection: &MessageConnection) {
        let func_id = connection.func_id();
        let mut registry = self.registry.lock().unwrap();
        match registry.launchers.get(&func_id) {
            Some(registered) if registered.id() == connection.id() => {
                registry.launchers.remove(&func_id);
                info!(func_id, "launcher disconnected");
            }
            _ => warn!(func_id, "disconnect from unregistered launcher"),
        }
    }

    pub fn on_func_worker_connected(&self, connection: Arc<MessageConnection>) -> bool {
        let func_id = connection.func_id();
        let client_id = connection.client_id();
        if client_id == 0 {
            warn!(func_id, "rejecting worker with client_id 0");
            return false;
        }
        let mut registry = self.registry.lock().unwrap();
        if registry.workers.contains_key(&client_id) {
            warn!(func_id, client_id, "rejecting duplicate worker registration");
            return false;
        }
        registry.workers.insert(client_id, connection);
        registry
            .workers_by_func
            .entry(func_id)
            .or_default()
            .insert(client_id);
        info!(func_id, client_id, "worker connected");
        true
    }

    pub fn on_func_worker_disconnected(&self, connection: &MessageConnection) {
        let func_id = connection.func_id();
        let client_id = connection.client_id();
        let mut registry = self.registry.lock().unwrap();
        if registry.workers.remove(&client_id).is_some() {
            if let Some(ids) = registry.workers_by_func.get_mut(&func_id) {
                ids.remove(&client_id);
            }
            info!(func_id, client_id, "worker disconnected");
        } else {
            warn!(func_id, client_id, "disconnect from unregistered worker");
        }
    }

    /// Connection of the worker owning `client_id`, if still registered.
    pub fn func_worker(&self, client_id: u16) -> Option<Arc<MessageConnection>> {
        self.registry.lock().unwrap().workers.get(&client_id).cloned()
    }

    pub fn worker_count(&self, func_id: u16) -> usize {
        self.registry
            .lock()
            .unwrap()
            .workers_by_func
            .get(&func_id)
            .map_or(0, |ids| ids.len())
    }
}

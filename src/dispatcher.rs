//! Per-function dispatch: keeps the ready set of worker connections for
//! one `func_id`, assigns at most one inflight call per worker, and
//! routes completions back, forwarding them to the originating worker
//! for internal calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use opentelemetry::KeyValue;
use tracing::{debug, error, warn};

use crate::message_connection::MessageConnection;
use crate::metrics::GatewayMetrics;
use crate::protocol::{FuncCall, Message};
use crate::worker_manager::WorkerManager;

/// Input handed to a worker: inline bytes, or the size of a payload the
/// worker must read from the call's input shm region.
#[derive(Debug, Clone)]
pub enum CallPayload {
    Inline(Bytes),
    Shm(usize),
}

impl CallPayload {
    pub fn len(&self) -> usize {
        match self {
            CallPayload::Inline(bytes) => bytes.len(),
            CallPayload::Shm(size) => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wire form: inline length, or negated size for shm payloads.
    fn wire_size(&self) -> i32 {
        match self {
            CallPayload::Inline(bytes) => bytes.len() as i32,
            CallPayload::Shm(size) => -(*size as i32),
        }
    }

    fn inline_bytes(&self) -> Bytes {
        match self {
            CallPayload::Inline(bytes) => bytes.clone(),
            CallPayload::Shm(_) => Bytes::new(),
        }
    }
}

struct DispatcherState {
    /// Idle workers keyed by connection id; the lowest id wins a new
    /// call, which keeps assignment deterministic.
    idle_workers: BTreeMap<u64, Arc<MessageConnection>>,
    busy_workers: HashMap<u64, (Arc<MessageConnection>, FuncCall)>,
    inflight: HashMap<u64, u64>,
}

pub struct Dispatcher {
    func_id: u16,
    worker_manager: Arc<WorkerManager>,
    metrics: GatewayMetrics,
    state: Mutex<DispatcherState>,
}

impl Dispatcher {
    pub fn new(func_id: u16, worker_manager: Arc<WorkerManager>, metrics: GatewayMetrics) -> Self {
        Self {
            func_id,
            worker_manager,
            metrics,
            state: Mutex::new(DispatcherState {
                idle_workers: BTreeMap::new(),
                busy_workers: HashMap::new(),
                inflight: HashMap::new(),
            }),
        }
    }

    pub fn func_id(&self) -> u16 {
        self.func_id
    }

    pub fn add_worker(&self, connection: Arc<MessageConnection>) {
        let mut state = self.state.lock().unwrap();
        debug!(
            func_id = self.func_id,
            conn_id = connection.id(),
            "worker available for dispatch"
        );
        state.idle_workers.insert(connection.id(), connection);
    }

    /// Drops a worker and returns the calls that were inflight on it;
    /// the caller turns those into discarded calls.
    pub fn remove_worker(&self, conn_id: u64) -> Vec<FuncCall> {
        let mut state = self.state.lock().unwrap();
        state.idle_workers.remove(&conn_id);
        match state.busy_workers.remove(&conn_id) {
            Some((_, call)) => {
                state.inflight.remove(&call.full_call_id());
                vec![call]
            }
            None => Vec::new(),
        }
    }

    /// Sends an Invoke to an available worker. Returns true iff a worker
    /// was available and the send succeeded; the caller treats false as
    /// dispatch failure, there is no retry here.
    pub fn on_new_func_call(
        &self,
        call: FuncCall,
        parent_call_id: u64,
        input: CallPayload,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some((&conn_id, _)) = state.idle_workers.iter().next() else {
            warn!(func_id = self.func_id, %call, "no available worker");
            return false;
        };
        let connection = state.idle_workers.remove(&conn_id).unwrap();
        let message = Message::new_invoke_func(call, parent_call_id, input.wire_size());
        if !connection.send_message(message, input.inline_bytes()) {
            // The connection died under us; its close handler will
            // remove the worker, nothing to put back.
            warn!(
                func_id = self.func_id,
                conn_id,
                %call,
                "send to worker failed"
            );
            return false;
        }
        state.inflight.insert(call.full_call_id(), conn_id);
        state.busy_workers.insert(conn_id, (connection, call));
        debug!(func_id = self.func_id, conn_id, %call, "dispatched");
        true
    }

    /// Releases the worker that ran `call` and, for internal calls,
    /// forwards the completion to the originating worker.
    pub fn on_func_call_completed(
        &self,
        call: FuncCall,
        processing_time: u32,
        dispatch_delay: u32,
        output: CallPayload,
    ) {
        if !self.release_worker(call) {
            return;
        }
        let attrs = [KeyValue::new("func_id", i64::from(self.func_id))];
        self.metrics
            .processing_time_us
            .record(u64::from(processing_time), &attrs);
        self.metrics
            .dispatch_delay_us
            .record(u64::from(dispatch_delay), &attrs);
        if call.client_id > 0 {
            let message = Message::new_func_call_complete(call, processing_time, output.wire_size());
            self.deliver_to_caller(call, message, output.inline_bytes());
        }
    }

    pub fn on_func_call_failed(&self, call: FuncCall, dispatch_delay: u32) {
        if !self.release_worker(call) {
            return;
        }
        let attrs = [KeyValue::new("func_id", i64::from(self.func_id))];
        self.metrics
            .dispatch_delay_us
            .record(u64::from(dispatch_delay), &attrs);
        if call.client_id > 0 {
            let message = Message::new_func_call_failed(call, dispatch_delay);
            self.deliver_to_caller(call, message, Bytes::new());
        }
    }

    fn release_worker(&self, call: FuncCall) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(conn_id) = state.inflight.remove(&call.full_call_id()) else {
            // Either a duplicate completion or the worker already
            // disconnected and the call went through the discard path.
            warn!(func_id = self.func_id, %call, "completion for unknown call");
            return false;
        };
        if let Some((connection, _)) = state.busy_workers.remove(&conn_id) {
            state.idle_workers.insert(conn_id, connection);
        }
        true
    }

    fn deliver_to_caller(&self, call: FuncCall, message: Message, payload: Bytes) {
        match self.worker_manager.func_worker(call.client_id) {
            Some(caller) => {
                if !caller.send_message(message, payload) {
                    warn!(%call, "failed to deliver completion to caller worker");
                }
            }
            None => error!(%call, "caller worker is gone, dropping completion"),
        }
    }
}

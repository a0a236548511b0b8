//! Admission core: owns the correlation tables for external calls,
//! enforces the running cap, drives the pending queue, classifies
//! worker messages, and drains discarded calls.
//!
//! The tables live under one mutex. Critical sections only move entries
//! between tables; finalization, socket writes, and shm work all happen
//! after the lock is released. A context is removed from its table
//! before its finalizer runs, which is what makes double delivery
//! impossible.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{ensure, Context};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::context::{ExternalCallContext, HttpOutcome, ResponseSink};
use crate::dispatcher::{CallPayload, Dispatcher};
use crate::func_config::FuncConfig;
use crate::message_connection::{ConnectionKind, MessageConnection};
use crate::metrics::{CallCounters, GatewayMetrics};
use crate::protocol::{
    compute_message_delay, FuncCall, Message, MessageType, ProtocolError, CONTAINER_ID_LENGTH,
    INVALID_CONTAINER_ID, INVALID_FUNC_CALL_ID, MESSAGE_INLINE_DATA_SIZE,
};
use crate::shm::{func_call_input_name, ShmRegion};
use crate::worker_manager::WorkerManager;

struct GatewayState {
    running_external: HashMap<u64, ExternalCallContext>,
    pending_external: VecDeque<ExternalCallContext>,
    dispatchers: HashMap<u16, Arc<Dispatcher>>,
    discarded_calls: Vec<FuncCall>,
    last_external_request_at: Option<Instant>,
}

pub struct Gateway {
    func_config: FuncConfig,
    func_config_json: Bytes,
    max_running_external_requests: usize,
    disable_monitor: bool,
    next_call_id: AtomicU32,
    inflight_contexts: Arc<AtomicI64>,
    counters: CallCounters,
    metrics: GatewayMetrics,
    worker_manager: Arc<WorkerManager>,
    state: Mutex<GatewayState>,
}

impl Gateway {
    pub fn new(
        func_config: FuncConfig,
        func_config_json: String,
        config: &ServerConfig,
        worker_manager: Arc<WorkerManager>,
        metrics: GatewayMetrics,
    ) -> Self {
        let max_running_external_requests = config.max_running_external_requests as usize;
        if max_running_external_requests > 0 {
            info!(max_running_external_requests, "admission cap enabled");
        }
        Self {
            func_config,
            func_config_json: Bytes::from(func_config_json),
            max_running_external_requests,
            disable_monitor: config.disable_monitor,
            next_call_id: AtomicU32::new(1),
            inflight_contexts: Arc::new(AtomicI64::new(0)),
            counters: CallCounters::default(),
            metrics,
            worker_manager,
            state: Mutex::new(GatewayState {
                running_external: HashMap::new(),
                pending_external: VecDeque::new(),
                dispatchers: HashMap::new(),
                discarded_calls: Vec::new(),
                last_external_request_at: None,
            }),
        }
    }

    pub fn func_config(&self) -> &FuncConfig {
        &self.func_config
    }

    pub fn worker_manager(&self) -> &Arc<WorkerManager> {
        &self.worker_manager
    }

    pub fn counters(&self) -> &CallCounters {
        &self.counters
    }

    pub fn running_external_count(&self) -> usize {
        self.state.lock().unwrap().running_external.len()
    }

    pub fn pending_external_count(&self) -> usize {
        self.state.lock().unwrap().pending_external.len()
    }

    /// New external invocation from the HTTP surface.
    pub fn on_external_http(&self, func_id: u16, body: Bytes, sink: oneshot::Sender<HttpOutcome>) {
        let call = FuncCall::new(func_id, 0, self.next_call_id.fetch_add(1, Ordering::Relaxed));
        let context = ExternalCallContext::new(
            call,
            body,
            ResponseSink::Http(sink),
            self.inflight_contexts.clone(),
        );
        self.new_external_func_call(context);
    }

    /// New external invocation from the gRPC surface. The (service,
    /// method) pair has already been resolved against the config.
    pub fn on_external_grpc(
        &self,
        func_id: u16,
        method_id: u16,
        body: Bytes,
        sink: oneshot::Sender<Result<Bytes, tonic::Status>>,
    ) {
        let call = FuncCall::with_method(
            func_id,
            method_id,
            0,
            self.next_call_id.fetch_add(1, Ordering::Relaxed),
        );
        let context = ExternalCallContext::new(
            call,
            body,
            ResponseSink::Grpc(sink),
            self.inflight_contexts.clone(),
        );
        self.new_external_func_call(context);
    }

    /// Validates the first frame on a new IPC connection and registers
    /// the peer. A rejected handshake gets no response; the caller
    /// closes the connection.
    pub(crate) fn on_new_handshake(
        &self,
        conn_id: u64,
        message: &Message,
        payload: Bytes,
        sender: mpsc::UnboundedSender<(Message, Bytes)>,
    ) -> anyhow::Result<Arc<MessageConnection>> {
        ensure!(
            message.is_handshake(),
            "first message is not a handshake (type {:?})",
            message.message_type
        );
        let func_id = message.func_call().func_id;
        ensure!(
            self.func_config.find_by_func_id(func_id).is_some(),
            "invalid func_id {func_id} in handshake"
        );

        let connection = match message.message_type {
            MessageType::LauncherHandshake => {
                ensure!(
                    payload.len() == CONTAINER_ID_LENGTH,
                    "launcher handshake does not carry a container id"
                );
                match std::str::from_utf8(&payload) {
                    Ok(container_id) if container_id != INVALID_CONTAINER_ID => {
                        if self.disable_monitor {
                            info!(func_id, container_id, "monitor disabled, not registering container");
                        } else {
                            info!(func_id, container_id, "function container registered");
                        }
                    }
                    Ok(_) => {}
                    Err(_) => warn!(func_id, "container id is not valid utf-8"),
                }
                let connection = Arc::new(MessageConnection::launcher(conn_id, func_id, sender));
                ensure!(
                    self.worker_manager.on_launcher_connected(connection.clone()),
                    "launcher registration rejected for func_id {func_id}"
                );
                connection
            }
            MessageType::FuncWorkerHandshake => {
                let client_id = self
                    .worker_manager
                    .allocate_client_id()
                    .context("worker client id space exhausted")?;
                let connection = Arc::new(MessageConnection::func_worker(
                    conn_id, func_id, client_id, sender,
                ));
                ensure!(
                    self.worker_manager
                        .on_func_worker_connected(connection.clone()),
                    "worker registration rejected for func_id {func_id}"
                );
                if let Some(dispatcher) = self.get_or_create_dispatcher(func_id) {
                    dispatcher.add_worker(connection.clone());
                }
                connection
            }
            _ => unreachable!(),
        };

        let response = Message::new_handshake_response(
            connection.client_id(),
            self.func_config_json.len(),
        );
        if !connection.send_message(response, self.func_config_json.clone()) {
            warn!(conn_id, "peer vanished before the handshake response");
        }
        info!(
            conn_id,
            func_id,
            launcher = connection.is_launcher(),
            "handshake done"
        );
        if !connection.is_launcher() {
            // A fresh worker may unblock calls whose previous worker
            // vanished, and pending calls waiting for capacity.
            self.process_discarded();
        }
        Ok(connection)
    }

    /// Routes a post-handshake frame. An unexpected type is a protocol
    /// violation and the connection gets closed by the caller.
    pub fn on_recv_worker_message(
        &self,
        connection: &Arc<MessageConnection>,
        message: &Message,
        payload: Bytes,
    ) -> Result<(), ProtocolError> {
        let delay = compute_message_delay(message);
        if delay >= 0 {
            self.metrics.message_delay_us.record(delay as u64, &[]);
        }
        match message.message_type {
            MessageType::InvokeFunc => self.on_invoke_func(message, payload),
            MessageType::FuncCallComplete | MessageType::FuncCallFailed => {
                self.on_func_call_finished(message, payload)
            }
            other => {
                error!(
                    conn_id = connection.id(),
                    message_type = other as u16,
                    "unexpected message on a running connection"
                );
                return Err(ProtocolError::UnexpectedMessage(other as u16));
            }
        }
        self.process_discarded();
        Ok(())
    }

    /// Tears down the peer's registrations; inflight calls routed to a
    /// vanished worker become discarded calls.
    pub fn on_connection_close(&self, connection: &Arc<MessageConnection>) {
        match connection.kind() {
            ConnectionKind::Launcher => {
                self.worker_manager.on_launcher_disconnected(connection);
            }
            ConnectionKind::FuncWorker => {
                self.worker_manager.on_func_worker_disconnected(connection);
                if let Some(dispatcher) = self.get_or_create_dispatcher(connection.func_id()) {
                    for call in dispatcher.remove_worker(connection.id()) {
                        self.discard_func_call(call);
                    }
                }
                self.process_discarded();
            }
        }
    }

    /// Worker-to-worker invocation.
    fn on_invoke_func(&self, message: &Message, payload: Bytes) {
        let call = message.func_call();
        let input = if message.payload_size < 0 {
            CallPayload::Shm(message.payload_size.unsigned_abs() as usize)
        } else {
            CallPayload::Inline(payload)
        };
        let dispatcher = {
            let mut state = self.state.lock().unwrap();
            if message.payload_size < 0 {
                self.metrics.input_use_shm.add(1, &[]);
            }
            self.get_or_create_dispatcher_locked(&mut state, call.func_id)
        };
        let dispatched = dispatcher
            .map(|d| d.on_new_func_call(call, message.parent_call_id, input))
            .unwrap_or(false);
        if !dispatched {
            // Internal dispatch failures are dropped; the caller applies
            // its own timeout.
            error!(func_id = call.func_id, %call, "dispatch failed for internal call");
        }
    }

    fn on_func_call_finished(&self, message: &Message, payload: Bytes) {
        let call = message.func_call();
        let completed = message.message_type == MessageType::FuncCallComplete;
        let mut finished_context = None;
        let mut next_dispatch = None;
        let dispatcher = {
            let mut state = self.state.lock().unwrap();
            if completed && message.payload_size < 0 {
                self.metrics.output_use_shm.add(1, &[]);
            }
            if call.is_external() {
                if let Some(context) = state.running_external.remove(&call.full_call_id()) {
                    finished_context = Some(context);
                    next_dispatch = self.promote_one_locked(&mut state);
                }
            }
            self.get_or_create_dispatcher_locked(&mut state, call.func_id)
        };

        if let Some(dispatcher) = dispatcher {
            if completed {
                let output = if message.payload_size < 0 {
                    CallPayload::Shm(message.payload_size.unsigned_abs() as usize)
                } else {
                    CallPayload::Inline(payload.clone())
                };
                dispatcher.on_func_call_completed(
                    call,
                    message.processing_time,
                    message.dispatch_delay,
                    output,
                );
            } else {
                dispatcher.on_func_call_failed(call, message.dispatch_delay);
            }
        }

        if call.is_external() {
            match finished_context {
                Some(context) => {
                    if completed {
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                        if message.payload_size < 0 {
                            context.finish_with_shm_output();
                        } else {
                            context.finish_with_output(payload);
                        }
                    } else {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        context.finish_with_error();
                    }
                }
                None => error!(%call, "completion for unknown external call"),
            }
        }

        if let Some((next_call, input)) = next_dispatch {
            if !self.dispatch_external(next_call, input) {
                self.fail_running_call(next_call);
            }
        }
    }

    fn new_external_func_call(&self, context: ExternalCallContext) {
        let call = context.call();
        let input = context.input().clone();
        let dispatch_now = {
            let mut state = self.state.lock().unwrap();
            self.counters.incoming.fetch_add(1, Ordering::Relaxed);
            self.metrics.incoming_external_requests.add(1, &[]);
            let now = Instant::now();
            if let Some(last) = state.last_external_request_at {
                let micros = now.duration_since(last).as_micros();
                if micros > 0 {
                    self.metrics
                        .external_requests_instant_rps
                        .record(1e6 / micros as f64, &[]);
                }
            }
            state.last_external_request_at = Some(now);
            self.metrics.inflight_external_requests.record(
                self.inflight_contexts.load(Ordering::Relaxed).max(0) as u64,
                &[],
            );
            if self.cap_allows(state.running_external.len()) {
                state.running_external.insert(call.full_call_id(), context);
                true
            } else {
                state.pending_external.push_back(context);
                self.metrics
                    .pending_external_requests
                    .record(state.pending_external.len() as u64, &[]);
                false
            }
        };
        if dispatch_now && !self.dispatch_external(call, input) {
            self.fail_running_call(call);
        }
    }

    /// Sends the Invoke for an external call already in the running
    /// table. Inputs over the inline limit go through a fresh input shm
    /// attached to the context so the region lives exactly as long as
    /// the call stays running.
    fn dispatch_external(&self, call: FuncCall, input: Bytes) -> bool {
        if input.len() > i32::MAX as usize {
            error!(%call, input_len = input.len(), "input too large to dispatch");
            return false;
        }
        let use_shm = input.len() > MESSAGE_INLINE_DATA_SIZE;
        let region = if use_shm {
            let name = func_call_input_name(call.full_call_id());
            match ShmRegion::create(&name, input.len()) {
                Ok(mut region) => {
                    region.as_mut_slice().copy_from_slice(&input);
                    Some(region)
                }
                Err(err) => {
                    error!(%call, error = %err, "failed to create input shm");
                    return false;
                }
            }
        } else {
            None
        };

        let dispatcher = {
            let mut state = self.state.lock().unwrap();
            if let Some(region) = region {
                self.metrics.input_use_shm.add(1, &[]);
                match state.running_external.get_mut(&call.full_call_id()) {
                    Some(context) => context.attach_input_shm(region),
                    None => {
                        // Discarded while the region was being filled;
                        // unlink it here since no context owns it.
                        let mut region = region;
                        region.enable_remove_on_destruction();
                        return false;
                    }
                }
            }
            self.get_or_create_dispatcher_locked(&mut state, call.func_id)
        };
        let Some(dispatcher) = dispatcher else {
            warn!(func_id = call.func_id, "no dispatcher for func_id");
            return false;
        };
        let payload = if use_shm {
            CallPayload::Shm(input.len())
        } else {
            CallPayload::Inline(input)
        };
        dispatcher.on_new_func_call(call, INVALID_FUNC_CALL_ID, payload)
    }

    /// Removes a call that failed to dispatch and answers it.
    fn fail_running_call(&self, call: FuncCall) {
        let context = {
            self.state
                .lock()
                .unwrap()
                .running_external
                .remove(&call.full_call_id())
        };
        if let Some(context) = context {
            error!(%call, "dispatch failed");
            self.counters.dispatch_failed.fetch_add(1, Ordering::Relaxed);
            context.finish_with_dispatch_failure();
        }
    }

    fn discard_func_call(&self, call: FuncCall) {
        let mut state = self.state.lock().unwrap();
        state.discarded_calls.push(call);
        self.metrics.discarded_func_calls.add(1, &[]);
    }

    /// Drains discarded calls and promotes pending ones while the cap
    /// permits. Runs at the tail of message and close handlers.
    pub fn process_discarded(&self) {
        let mut discarded_external = Vec::new();
        let mut discarded_internal = Vec::new();
        let mut to_dispatch = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.discarded_calls.is_empty() && state.pending_external.is_empty() {
                return;
            }
            for call in std::mem::take(&mut state.discarded_calls) {
                if call.is_external() {
                    if let Some(context) = state.running_external.remove(&call.full_call_id()) {
                        discarded_external.push(context);
                    }
                } else {
                    discarded_internal.push(call);
                }
            }
            while let Some(promoted) = self.promote_one_locked(&mut state) {
                to_dispatch.push(promoted);
            }
        }

        for context in discarded_external {
            let call = context.call();
            warn!(%call, "external call discarded");
            self.counters.dispatch_failed.fetch_add(1, Ordering::Relaxed);
            context.finish_with_dispatch_failure();
        }
        for call in discarded_internal {
            // The calling worker gets a synthesized failure.
            match self.worker_manager.func_worker(call.client_id) {
                Some(caller) => {
                    let message = Message::new_func_call_failed(call, 0);
                    if !caller.send_message(message, Bytes::new()) {
                        warn!(%call, "failed to deliver discard failure to caller");
                    }
                }
                None => warn!(%call, "caller worker gone, dropping discard failure"),
            }
        }
        for (call, input) in to_dispatch {
            if !self.dispatch_external(call, input) {
                self.fail_running_call(call);
            }
        }
    }

    fn promote_one_locked(&self, state: &mut GatewayState) -> Option<(FuncCall, Bytes)> {
        if state.pending_external.is_empty() || !self.cap_allows(state.running_external.len()) {
            return None;
        }
        let context = state.pending_external.pop_front()?;
        let call = context.call();
        let input = context.input().clone();
        state.running_external.insert(call.full_call_id(), context);
        Some((call, input))
    }

    fn cap_allows(&self, running: usize) -> bool {
        self.max_running_external_requests == 0 || running < self.max_running_external_requests
    }

    fn get_or_create_dispatcher(&self, func_id: u16) -> Option<Arc<Dispatcher>> {
        let mut state = self.state.lock().unwrap();
        self.get_or_create_dispatcher_locked(&mut state, func_id)
    }

    /// Dispatchers are created lazily, and only for known func ids.
    fn get_or_create_dispatcher_locked(
        &self,
        state: &mut GatewayState,
        func_id: u16,
    ) -> Option<Arc<Dispatcher>> {
        if let Some(dispatcher) = state.dispatchers.get(&func_id) {
            return Some(dispatcher.clone());
        }
        self.func_config.find_by_func_id(func_id)?;
        let dispatcher = Arc::new(Dispatcher::new(
            func_id,
            self.worker_manager.clone(),
            self.metrics.clone(),
        ));
        state.dispatchers.insert(func_id, dispatcher.clone());
        Some(dispatcher)
    }
}

//! In-flight state of one external invocation: the input bytes, the shm
//! regions tied to the call, and the channel the final response goes
//! out on.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;
use tokio::sync::oneshot;
use tonic::Status;
use tracing::error;

use crate::protocol::FuncCall;
use crate::shm::{func_call_output_name, ShmRegion};

/// Final HTTP answer for an external call.
#[derive(Debug)]
pub struct HttpOutcome {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Where the response goes: an HTTP handler or a gRPC handler awaiting
/// the call's oneshot.
pub enum ResponseSink {
    Http(oneshot::Sender<HttpOutcome>),
    Grpc(oneshot::Sender<Result<Bytes, Status>>),
}

/// Owns everything tied to one external call. Finalization consumes the
/// context, so each call is answered at most once by construction; a
/// context dropped without finalizing is a bug.
pub struct ExternalCallContext {
    call: FuncCall,
    input: Bytes,
    sink: Option<ResponseSink>,
    input_shm: Option<ShmRegion>,
    inflight: Arc<AtomicI64>,
}

impl ExternalCallContext {
    pub fn new(
        call: FuncCall,
        input: Bytes,
        sink: ResponseSink,
        inflight: Arc<AtomicI64>,
    ) -> Self {
        inflight.fetch_add(1, Ordering::Relaxed);
        Self {
            call,
            input,
            sink: Some(sink),
            input_shm: None,
            inflight,
        }
    }

    pub fn call(&self) -> FuncCall {
        self.call
    }

    pub fn input(&self) -> &Bytes {
        &self.input
    }

    /// The input region lives exactly as long as this context; it is
    /// unlinked when the context drops.
    pub fn attach_input_shm(&mut self, mut region: ShmRegion) {
        region.enable_remove_on_destruction();
        self.input_shm = Some(region);
    }

    /// Completion whose output lives in the call's output shm region.
    /// An unreadable region downgrades to the error finalization.
    pub fn finish_with_shm_output(self) {
        match ShmRegion::open(&func_call_output_name(self.call.full_call_id())) {
            Ok(mut region) => {
                region.enable_remove_on_destruction();
                let output = Bytes::copy_from_slice(region.as_slice());
                self.finish_with_output(output);
            }
            Err(err) => {
                error!(call = %self.call, error = %err, "failed to open output shm");
                self.finish_with_error();
            }
        }
    }

    pub fn finish_with_output(mut self, output: Bytes) {
        match self.sink.take() {
            Some(ResponseSink::Http(tx)) => {
                let _ = tx.send(HttpOutcome {
                    status: StatusCode::OK,
                    body: output,
                });
            }
            Some(ResponseSink::Grpc(tx)) => {
                let _ = tx.send(Ok(output));
            }
            None => unreachable!("context finalized twice"),
        }
    }

    /// The worker reported a failure.
    pub fn finish_with_error(mut self) {
        match self.sink.take() {
            Some(ResponseSink::Http(tx)) => {
                let _ = tx.send(HttpOutcome {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: Bytes::from_static(b"Function call failed\n"),
                });
            }
            Some(ResponseSink::Grpc(tx)) => {
                let _ = tx.send(Err(Status::unknown("function call failed")));
            }
            None => unreachable!("context finalized twice"),
        }
    }

    /// No dispatcher, no worker, send failure, or the call was discarded.
    pub fn finish_with_dispatch_failure(mut self) {
        match self.sink.take() {
            Some(ResponseSink::Http(tx)) => {
                let _ = tx.send(HttpOutcome {
                    status: StatusCode::NOT_FOUND,
                    body: Bytes::from(format!(
                        "Dispatch failed for func_id {}\n",
                        self.call.func_id
                    )),
                });
            }
            Some(ResponseSink::Grpc(tx)) => {
                let _ = tx.send(Err(Status::unimplemented(format!(
                    "dispatch failed for func_id {}",
                    self.call.func_id
                ))));
            }
            None => unreachable!("context finalized twice"),
        }
    }
}

impl Drop for ExternalCallContext {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(self.sink.is_none(), "context dropped without finalizing");
    }
}

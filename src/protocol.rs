//! Wire protocol shared by the gateway and its launcher/worker peers.
//!
//! Every frame on an IPC connection is a fixed-size [`Message`] header,
//! optionally followed by `payload_size` bytes of inline payload when
//! `payload_size >= 0`. A negative `payload_size` means the payload of
//! size `payload_size.abs()` lives in a shared-memory region named after
//! the call id (see [`crate::shm`]).

use bytes::{Buf, BufMut};
use nix::time::{clock_gettime, ClockId};
use thiserror::Error;

/// Largest payload that may travel inline in a message tail. Anything
/// bigger goes through shared memory.
pub const MESSAGE_INLINE_DATA_SIZE: usize = 1024;

/// Length of the container id carried by a launcher handshake.
pub const CONTAINER_ID_LENGTH: usize = 64;

/// Container id reported by launchers that do not run inside a container.
pub const INVALID_CONTAINER_ID: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Reserved `full_call_id` used as `parent_call_id` for external
/// invocations. All-ones cannot be produced by a real call because the
/// gateway never assigns client id `u16::MAX` and external calls carry
/// client id 0.
pub const INVALID_FUNC_CALL_ID: u64 = u64::MAX;

const FUNC_ID_MASK: u64 = 0xff;
const METHOD_ID_MASK: u64 = 0xff;
const CLIENT_ID_MASK: u64 = 0xffff;

/// Identity of one function invocation.
///
/// `client_id == 0` marks an external (HTTP/gRPC) invocation; a nonzero
/// value identifies the worker that originated an internal call. The
/// packed [`full_call_id`](Self::full_call_id) is the sole correlation
/// key for the lifetime of the gateway process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncCall {
    pub func_id: u16,
    pub method_id: u16,
    pub client_id: u16,
    pub call_id: u32,
}

impl FuncCall {
    pub fn new(func_id: u16, client_id: u16, call_id: u32) -> Self {
        Self::with_method(func_id, 0, client_id, call_id)
    }

    pub fn with_method(func_id: u16, method_id: u16, client_id: u16, call_id: u32) -> Self {
        Self {
            func_id,
            method_id,
            client_id,
            call_id,
        }
    }

    /// Packs the call into its 64-bit wire form:
    /// `func_id:8 | method_id:8 | client_id:16 | call_id:32`.
    pub fn full_call_id(&self) -> u64 {
        (u64::from(self.func_id) & FUNC_ID_MASK)
            | (u64::from(self.method_id) & METHOD_ID_MASK) << 8
            | (u64::from(self.client_id) & CLIENT_ID_MASK) << 16
            | u64::from(self.call_id) << 32
    }

    pub fn from_full_call_id(full_call_id: u64) -> Self {
        Self {
            func_id: (full_call_id & FUNC_ID_MASK) as u16,
            method_id: (full_call_id >> 8 & METHOD_ID_MASK) as u16,
            client_id: (full_call_id >> 16 & CLIENT_ID_MASK) as u16,
            call_id: (full_call_id >> 32) as u32,
        }
    }

    pub fn is_external(&self) -> bool {
        self.client_id == 0
    }
}

impl std::fmt::Display for FuncCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "func_id={} method_id={} client_id={} call_id={}",
            self.func_id, self.method_id, self.client_id, self.call_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    LauncherHandshake = 1,
    FuncWorkerHandshake = 2,
    HandshakeResponse = 3,
    InvokeFunc = 4,
    FuncCallComplete = 5,
    FuncCallFailed = 6,
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(MessageType::LauncherHandshake),
            2 => Ok(MessageType::FuncWorkerHandshake),
            3 => Ok(MessageType::HandshakeResponse),
            4 => Ok(MessageType::InvokeFunc),
            5 => Ok(MessageType::FuncCallComplete),
            6 => Ok(MessageType::FuncCallFailed),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
    #[error("unexpected message type {0} on a running connection")]
    UnexpectedMessage(u16),
}

/// Fixed-size control frame. All integers are little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub payload_size: i32,
    pub full_call_id: u64,
    pub parent_call_id: u64,
    /// Monotonic microseconds at send time; `<= 0` means unset.
    pub send_timestamp: i64,
    /// Worker-reported processing time in microseconds.
    pub processing_time: u32,
    /// Worker-reported dispatch delay in microseconds.
    pub dispatch_delay: u32,
}

impl Message {
    /// Encoded size of the header on the wire.
    pub const SIZE: usize = 64;

    pub fn new_launcher_handshake(func_id: u16) -> Self {
        Self::blank(
            MessageType::LauncherHandshake,
            FuncCall::new(func_id, 0, 0).full_call_id(),
        )
    }

    pub fn new_func_worker_handshake(func_id: u16) -> Self {
        Self::blank(
            MessageType::FuncWorkerHandshake,
            FuncCall::new(func_id, 0, 0).full_call_id(),
        )
    }

    /// Handshake responses carry the assigned client id (zero for
    /// launchers) and the function-config JSON as inline payload. They
    /// are the only frames whose inline payload may exceed
    /// [`MESSAGE_INLINE_DATA_SIZE`].
    pub fn new_handshake_response(client_id: u16, payload_size: usize) -> Self {
        let mut msg = Self::blank(
            MessageType::HandshakeResponse,
            FuncCall::new(0, client_id, 0).full_call_id(),
        );
        msg.payload_size = payload_size as i32;
        msg
    }

    pub fn new_invoke_func(call: FuncCall, parent_call_id: u64, payload_size: i32) -> Self {
        let mut msg = Self::blank(MessageType::InvokeFunc, call.full_call_id());
        msg.parent_call_id = parent_call_id;
        msg.payload_size = payload_size;
        msg
    }

    pub fn new_func_call_complete(
        call: FuncCall,
        processing_time: u32,
        payload_size: i32,
    ) -> Self {
        let mut msg = Self::blank(MessageType::FuncCallComplete, call.full_call_id());
        msg.processing_time = processing_time;
        msg.payload_size = payload_size;
        msg
    }

    pub fn new_func_call_failed(call: FuncCall, dispatch_delay: u32) -> Self {
        let mut msg = Self::blank(MessageType::FuncCallFailed, call.full_call_id());
        msg.dispatch_delay = dispatch_delay;
        msg
    }

    fn blank(message_type: MessageType, full_call_id: u64) -> Self {
        Self {
            message_type,
            payload_size: 0,
            full_call_id,
            parent_call_id: INVALID_FUNC_CALL_ID,
            send_timestamp: 0,
            processing_time: 0,
            dispatch_delay: 0,
        }
    }

    pub fn func_call(&self) -> FuncCall {
        FuncCall::from_full_call_id(self.full_call_id)
    }

    pub fn is_handshake(&self) -> bool {
        matches!(
            self.message_type,
            MessageType::LauncherHandshake | MessageType::FuncWorkerHandshake
        )
    }

    /// Number of inline payload bytes following the header.
    pub fn inline_payload_len(&self) -> usize {
        if self.payload_size > 0 {
            self.payload_size as usize
        } else {
            0
        }
    }

    pub fn encode(&self) -> [u8; Message::SIZE] {
        let mut buf = [0u8; Message::SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u16_le(self.message_type as u16);
        cursor.put_u16_le(0);
        cursor.put_i32_le(self.payload_size);
        cursor.put_u64_le(self.full_call_id);
        cursor.put_u64_le(self.parent_call_id);
        cursor.put_i64_le(self.send_timestamp);
        cursor.put_u32_le(self.processing_time);
        cursor.put_u32_le(self.dispatch_delay);
        buf
    }

    pub fn decode(raw: &[u8; Message::SIZE]) -> Result<Self, ProtocolError> {
        let mut cursor = &raw[..];
        let message_type = MessageType::try_from(cursor.get_u16_le())?;
        cursor.advance(2);
        let payload_size = cursor.get_i32_le();
        let full_call_id = cursor.get_u64_le();
        let parent_call_id = cursor.get_u64_le();
        let send_timestamp = cursor.get_i64_le();
        let processing_time = cursor.get_u32_le();
        let dispatch_delay = cursor.get_u32_le();
        Ok(Self {
            message_type,
            payload_size,
            full_call_id,
            parent_call_id,
            send_timestamp,
            processing_time,
            dispatch_delay,
        })
    }
}

/// Monotonic clock in microseconds, shared by all processes on the host.
pub fn monotonic_micros() -> i64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() * 1_000_000 + ts.tv_nsec() / 1_000,
        Err(_) => 0,
    }
}

/// Microseconds the message spent in flight, or -1 when the sender did
/// not stamp it.
pub fn compute_message_delay(message: &Message) -> i64 {
    if message.send_timestamp > 0 {
        monotonic_micros() - message.send_timestamp
    } else {
        -1
    }
}

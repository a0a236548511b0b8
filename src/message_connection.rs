//! Accepted IPC connections from launcher and worker processes.
//!
//! Each connection is driven by one reader task; writes are funneled
//! through an unbounded channel into a dedicated writer task, so a
//! connection is only ever written from one task. The first frame must
//! be a handshake; everything after it is routed to the gateway.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::gateway::Gateway;
use crate::protocol::{monotonic_micros, Message, ProtocolError, MESSAGE_INLINE_DATA_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Launcher,
    FuncWorker,
}

/// Write handle for a registered launcher or worker connection.
pub struct MessageConnection {
    id: u64,
    kind: ConnectionKind,
    func_id: u16,
    client_id: u16,
    sender: mpsc::UnboundedSender<(Message, Bytes)>,
}

impl MessageConnection {
    pub(crate) fn launcher(
        id: u64,
        func_id: u16,
        sender: mpsc::UnboundedSender<(Message, Bytes)>,
    ) -> Self {
        Self {
            id,
            kind: ConnectionKind::Launcher,
            func_id,
            client_id: 0,
            sender,
        }
    }

    pub(crate) fn func_worker(
        id: u64,
        func_id: u16,
        client_id: u16,
        sender: mpsc::UnboundedSender<(Message, Bytes)>,
    ) -> Self {
        Self {
            id,
            kind: ConnectionKind::FuncWorker,
            func_id,
            client_id,
            sender,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn is_launcher(&self) -> bool {
        self.kind == ConnectionKind::Launcher
    }

    pub fn func_id(&self) -> u16 {
        self.func_id
    }

    /// Zero for launcher connections.
    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    /// Enqueues a frame for the writer task. Returns false once the
    /// connection is gone.
    pub fn send_message(&self, message: Message, payload: Bytes) -> bool {
        self.sender.send((message, payload)).is_ok()
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("inline payload of {0} bytes exceeds the limit")]
    InlineTooLarge(usize),
}

impl FrameError {
    fn is_clean_close(&self) -> bool {
        matches!(self, FrameError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Reads one frame: a fixed-size header plus its inline payload tail.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_inline: usize,
) -> Result<(Message, Bytes), FrameError> {
    let mut header = [0u8; Message::SIZE];
    reader.read_exact(&mut header).await?;
    let message = Message::decode(&header)?;
    let len = message.inline_payload_len();
    if len > max_inline {
        return Err(FrameError::InlineTooLarge(len));
    }
    if len == 0 {
        return Ok((message, Bytes::new()));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok((message, Bytes::from(payload)))
}

/// Writes one frame, stamping the send timestamp.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    mut message: Message,
    payload: &[u8],
) -> io::Result<()> {
    debug_assert_eq!(message.inline_payload_len(), payload.len());
    message.send_timestamp = monotonic_micros();
    writer.write_all(&message.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await
}

/// Accept loop for the gateway's Unix IPC socket.
pub async fn run_ipc_listener(
    listener: UnixListener,
    gateway: Arc<Gateway>,
    mut shutdown: watch::Receiver<()>,
) {
    let mut next_conn_id: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("ipc listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let conn_id = next_conn_id;
                    next_conn_id += 1;
                    debug!(conn_id, "new message connection");
                    tokio::spawn(run_connection(stream, conn_id, gateway.clone()));
                }
                Err(err) => {
                    warn!(error = %err, "failed to accept message connection");
                }
            }
        }
    }
}

async fn run_connection(stream: UnixStream, conn_id: u64, gateway: Arc<Gateway>) {
    let (mut reader, mut writer) = stream.into_split();

    let (handshake, handshake_payload) =
        match read_frame(&mut reader, MESSAGE_INLINE_DATA_SIZE).await {
            Ok(frame) => frame,
            Err(err) => {
                warn!(conn_id, error = %err, "failed to read handshake");
                return;
            }
        };

    let (sender, mut outbound) = mpsc::unbounded_channel::<(Message, Bytes)>();
    tokio::spawn(async move {
        while let Some((message, payload)) = outbound.recv().await {
            if let Err(err) = write_frame(&mut writer, message, &payload).await {
                warn!(conn_id, error = %err, "write failed on message connection");
                break;
            }
        }
    });

    let connection = match gateway.on_new_handshake(conn_id, &handshake, handshake_payload, sender)
    {
        Ok(connection) => connection,
        Err(err) => {
            // Closing without a response is the contract for a bad handshake.
            error!(conn_id, error = %err, "handshake rejected, closing connection");
            return;
        }
    };

    loop {
        match read_frame(&mut reader, MESSAGE_INLINE_DATA_SIZE).await {
            Ok((message, payload)) => {
                if let Err(err) = gateway.on_recv_worker_message(&connection, &message, payload) {
                    error!(conn_id, error = %err, "protocol violation, closing connection");
                    break;
                }
            }
            Err(err) if err.is_clean_close() => {
                info!(conn_id, "message connection closed by peer");
                break;
            }
            Err(err) => {
                warn!(conn_id, error = %err, "read failed on message connection");
                break;
            }
        }
    }

    gateway.on_connection_close(&connection);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FuncCall, MessageType, INVALID_FUNC_CALL_ID};

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let call = FuncCall::new(1, 0, 9);
        let message = Message::new_invoke_func(call, INVALID_FUNC_CALL_ID, 5);
        write_frame(&mut client, message, b"hello").await.unwrap();

        let (read, payload) = read_frame(&mut server, MESSAGE_INLINE_DATA_SIZE)
            .await
            .unwrap();
        assert_eq!(read.message_type, MessageType::InvokeFunc);
        assert_eq!(read.func_call(), call);
        assert_eq!(payload.as_ref(), b"hello");
        assert!(read.send_timestamp > 0);
    }

    #[tokio::test]
    async fn oversized_inline_payload_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let call = FuncCall::new(1, 0, 10);
        let big = vec![0u8; MESSAGE_INLINE_DATA_SIZE + 1];
        let message = Message::new_invoke_func(call, INVALID_FUNC_CALL_ID, big.len() as i32);
        write_frame(&mut client, message, &big).await.unwrap();

        let err = read_frame(&mut server, MESSAGE_INLINE_DATA_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::InlineTooLarge(_)));
    }

    #[tokio::test]
    async fn eof_reads_as_clean_close() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_frame(&mut server, MESSAGE_INLINE_DATA_SIZE)
            .await
            .unwrap_err();
        assert!(err.is_clean_close());
    }
}

//! Actor that owns the command socket exclusively and serializes every
//! request through it in FIFO order. Generalizes the
//! `ChannelCommandSink`/`ChannelCommandSource` split: callers never touch
//! the socket directly, so there is no mutex to hold across an `.await`
//! and no way for two callers to interleave frames on the wire.

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;

use crate::codec::Packet;
use crate::error::{Error, Result};
use crate::proto::ResponseBlock;
use crate::transport::Transport;

/// One outgoing command. `data_out` is carried for completeness (some PTP
/// operations, e.g. `SetObjectPropValue`, send a data phase outbound) even
/// though no operation this client issues today uses it.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub opcode: u16,
    pub params: Vec<u32>,
    pub data_out: Option<Bytes>,
}

impl CommandRequest {
    pub fn new(opcode: u16, params: impl Into<Vec<u32>>) -> Self {
        Self {
            opcode,
            params: params.into(),
            data_out: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandReply {
    pub response: ResponseBlock,
    pub data_in: Option<Bytes>,
}

type PendingCommand = (CommandRequest, tokio::sync::oneshot::Sender<Result<CommandReply>>);

/// Cheaply cloneable handle callers use to issue commands. Internally a
/// `flume::Sender`, so many callers (the session facade, the download
/// pipeline, an event source's adaptive poller) can share one engine.
#[derive(Clone)]
pub struct CommandEngineHandle {
    tx: flume::Sender<PendingCommand>,
    cancel: CancellationToken,
}

impl CommandEngineHandle {
    pub async fn command(&self, request: CommandRequest) -> Result<CommandReply> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send_async((request, reply_tx))
            .await
            .map_err(|_| Error::PeerClosed)?;
        reply_rx.await.map_err(|_| Error::PeerClosed)?
    }

    pub async fn simple(&self, opcode: u16, params: impl Into<Vec<u32>>) -> Result<CommandReply> {
        self.command(CommandRequest::new(opcode, params)).await
    }

    /// Cancelling this token forces the command channel's in-flight
    /// `send_frame`/`recv_frame` to return immediately, the same token the
    /// underlying [`Transport`] selects against.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Owns the command [`Transport`] and a monotonically increasing
/// transaction id counter (wraps at `u32::MAX` back to 1; PTP reserves 0
/// for "no transaction").
pub struct CommandEngine {
    transport: Transport,
    rx: flume::Receiver<PendingCommand>,
    next_transaction_id: u32,
    timeout: std::time::Duration,
}

impl CommandEngine {
    pub fn spawn(
        transport: Transport,
        timeout: std::time::Duration,
    ) -> (CommandEngineHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = flume::unbounded();
        let cancel = transport.cancellation_token();
        let engine = CommandEngine {
            transport,
            rx,
            next_transaction_id: 1,
            timeout,
        };
        let join = tokio::spawn(engine.run());
        (CommandEngineHandle { tx, cancel }, join)
    }

    fn allocate_transaction_id(&mut self) -> u32 {
        let id = self.next_transaction_id;
        self.next_transaction_id = if id == u32::MAX { 1 } else { id + 1 };
        id
    }

    async fn run(mut self) {
        while let Ok((request, reply_tx)) = self.rx.recv_async().await {
            let result = self.execute(request).await;
            let fatal = matches!(&result, Err(e) if e.is_fatal());
            let _ = reply_tx.send(result);
            if fatal {
                break;
            }
        }
    }

    async fn execute(&mut self, request: CommandRequest) -> Result<CommandReply> {
        let transaction_id = self.allocate_transaction_id();

        self.transport
            .send_frame(
                &Packet::Command {
                    transaction_id,
                    opcode: request.opcode,
                    params: request.params,
                },
                self.timeout,
            )
            .await?;

        if let Some(payload) = request.data_out {
            self.transport
                .send_frame(
                    &Packet::Data {
                        transaction_id,
                        payload,
                    },
                    self.timeout,
                )
                .await?;
        }

        let mut data_in: Option<BytesMut> = None;

        loop {
            match self.transport.recv_frame(self.timeout).await? {
                Packet::Data { payload, .. } => {
                    data_in.get_or_insert_with(BytesMut::new).extend_from_slice(&payload);
                }
                Packet::StartData { .. } => {
                    data_in = Some(BytesMut::new());
                }
                Packet::EndData { payload, .. } => {
                    let mut buf = data_in.take().unwrap_or_default();
                    buf.extend_from_slice(&payload);
                    data_in = Some(buf);
                }
                Packet::Response {
                    code,
                    transaction_id: response_txn,
                    params,
                } => {
                    if response_txn != transaction_id {
                        return Err(Error::ProtocolError(format!(
                            "response transaction id {response_txn} does not match request {transaction_id}"
                        )));
                    }
                    return Ok(CommandReply {
                        response: ResponseBlock {
                            code,
                            transaction_id: response_txn,
                            params,
                        },
                        data_in: data_in.map(|b| b.freeze()),
                    });
                }
                other => {
                    return Err(Error::ProtocolError(format!(
                        "unexpected packet on command channel: {other:?}"
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trips_a_simple_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 8];
            socket.read_exact(&mut header).await.unwrap();
            let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
            let mut rest = vec![0u8; len - 8];
            socket.read_exact(&mut rest).await.unwrap();

            let response = codec::encode(&Packet::Response {
                transaction_id: 1,
                code: crate::proto::RESPONSE_OK,
                params: vec![],
            });
            socket.write_all(&response).await.unwrap();
        });

        let transport = Transport::connect(addr, Duration::from_secs(1)).await.unwrap();
        let (handle, _join) = CommandEngine::spawn(transport, Duration::from_secs(1));

        let reply = handle.simple(0x1002, vec![]).await.unwrap();
        assert!(reply.response.is_ok());
        assert_eq!(reply.response.transaction_id, 1);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn allocates_increasing_transaction_ids() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for expected_txn in 1..=2u32 {
                let mut header = [0u8; 8];
                socket.read_exact(&mut header).await.unwrap();
                let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
                let mut rest = vec![0u8; len - 8];
                socket.read_exact(&mut rest).await.unwrap();

                let response = codec::encode(&Packet::Response {
                    transaction_id: expected_txn,
                    code: crate::proto::RESPONSE_OK,
                    params: vec![],
                });
                socket.write_all(&response).await.unwrap();
            }
        });

        let transport = Transport::connect(addr, Duration::from_secs(1)).await.unwrap();
        let (handle, _join) = CommandEngine::spawn(transport, Duration::from_secs(1));

        let first = handle.simple(0x1001, vec![]).await.unwrap();
        let second = handle.simple(0x1001, vec![]).await.unwrap();
        assert_eq!(first.response.transaction_id, 1);
        assert_eq!(second.response.transaction_id, 2);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn accumulates_multiple_data_frames_before_the_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 8];
            socket.read_exact(&mut header).await.unwrap();
            let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
            let mut rest = vec![0u8; len - 8];
            socket.read_exact(&mut rest).await.unwrap();

            // A data phase split across a StartData frame, two consecutive
            // Data frames, and a final EndData frame: the whole payload
            // must survive intact, not just the last Data frame.
            socket
                .write_all(&codec::encode(&Packet::StartData {
                    transaction_id: 1,
                    total_len: 11,
                }))
                .await
                .unwrap();
            socket
                .write_all(&codec::encode(&Packet::Data {
                    transaction_id: 1,
                    payload: bytes::Bytes::from_static(b"hel"),
                }))
                .await
                .unwrap();
            socket
                .write_all(&codec::encode(&Packet::Data {
                    transaction_id: 1,
                    payload: bytes::Bytes::from_static(b"lo "),
                }))
                .await
                .unwrap();
            socket
                .write_all(&codec::encode(&Packet::EndData {
                    transaction_id: 1,
                    payload: bytes::Bytes::from_static(b"world"),
                }))
                .await
                .unwrap();
            socket
                .write_all(&codec::encode(&Packet::Response {
                    transaction_id: 1,
                    code: crate::proto::RESPONSE_OK,
                    params: vec![],
                }))
                .await
                .unwrap();
        });

        let transport = Transport::connect(addr, Duration::from_secs(1)).await.unwrap();
        let (handle, _join) = CommandEngine::spawn(transport, Duration::from_secs(1));

        let reply = handle.simple(0x1008, vec![]).await.unwrap();
        assert_eq!(reply.data_in.as_deref(), Some(&b"hello world"[..]));

        server.await.unwrap();
    }
}

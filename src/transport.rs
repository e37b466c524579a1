//! Framed, cancellation-safe TCP transport for a single PTP/IP socket
//! (command or event). A thin wrapper around [`tokio::net::TcpStream`],
//! split into owned halves so reads and writes can proceed independently,
//! guarded by a [`CancellationToken`] so `disconnect()` can force any
//! in-flight `recv_frame`/`send_frame` to return promptly instead of
//! blocking on a peer that has gone silent.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, Packet, HEADER_LEN};
use crate::error::{Error, Result};

/// One end of a PTP/IP connection: owns a socket and a cancellation token
/// scoped to that socket's lifetime. `Session` holds one for the command
/// channel and one for the event channel.
pub struct Transport {
    stream: TcpStream,
    cancel: CancellationToken,
}

impl Transport {
    /// Connects to `addr`, racing the connect attempt against `timeout`.
    /// Distinguishes "nobody answered in time" from "the OS told us no one
    /// is listening" so callers can react to each differently (a timeout
    /// is worth retrying on a scan wave; a refusal usually is not).
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let connect = TcpStream::connect(addr);
        let stream = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(Error::ConnectRefused(addr));
            }
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::HostUnreachable | std::io::ErrorKind::NetworkUnreachable
                ) =>
            {
                return Err(Error::HostUnreachable(addr));
            }
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => return Err(Error::ConnectTimeout(addr)),
        };
        stream.set_nodelay(true).ok();
        Ok(Self {
            stream,
            cancel: CancellationToken::new(),
        })
    }

    /// A token that, when cancelled, aborts any in-progress `send_frame`
    /// or `recv_frame` on this transport with [`Error::Cancelled`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Forces any in-flight read/write to return immediately and marks the
    /// transport unusable for further calls.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Encodes and writes `packet` in full, or returns `Cancelled` if
    /// `disconnect()` is called mid-write.
    pub async fn send_frame(&mut self, packet: &Packet, timeout: Duration) -> Result<()> {
        let bytes = codec::encode(packet);
        let write = self.stream.write_all(&bytes);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, write) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::Io(e)),
                Err(_) => Err(Error::Timeout),
            },
        }
    }

    /// Reads exactly one frame: the 8-byte header, then `length - 8`
    /// payload bytes, never less. Returns [`Error::PeerClosed`] if the
    /// connection closes cleanly before a full frame arrives.
    pub async fn recv_frame(&mut self, timeout: Duration) -> Result<Packet> {
        let read = self.read_exact_frame();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, read) => match result {
                Ok(inner) => inner,
                Err(_) => Err(Error::Timeout),
            },
        }
    }

    async fn read_exact_frame(&mut self) -> Result<Packet> {
        let mut header = [0u8; HEADER_LEN];
        self.read_exact_or_closed(&mut header).await?;

        let mut len_buf = &header[..4];
        let length = len_buf.get_u32_le() as usize;
        if length < HEADER_LEN {
            return Err(Error::Framing(crate::codec::FramingError::ShortFrame));
        }

        let mut frame = BytesMut::with_capacity(length);
        frame.extend_from_slice(&header);
        frame.resize(length, 0);
        self.read_exact_or_closed(&mut frame[HEADER_LEN..]).await?;

        Ok(codec::decode(&frame)?)
    }

    async fn read_exact_or_closed(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::PeerClosed),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut transport = Transport {
                stream: socket,
                cancel: CancellationToken::new(),
            };
            let packet = transport.recv_frame(Duration::from_secs(1)).await.unwrap();
            assert_eq!(
                packet,
                Packet::InitEventRequest {
                    connection_number: 7
                }
            );
            transport
                .send_frame(&Packet::InitEventAck, Duration::from_secs(1))
                .await
                .unwrap();
        });

        let mut client = Transport::connect(addr, Duration::from_secs(1)).await.unwrap();
        client
            .send_frame(
                &Packet::InitEventRequest { connection_number: 7 },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let ack = client.recv_frame(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ack, Packet::InitEventAck);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_recv() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut client = Transport::connect(addr, Duration::from_secs(1)).await.unwrap();
        let cancel = client.cancellation_token();
        let recv = tokio::spawn(async move { client.recv_frame(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = recv.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn connect_refused_when_nothing_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = Transport::connect(addr, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::ConnectRefused(_))));
    }
}

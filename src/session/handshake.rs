//! The five-stage PTP/IP connect sequence. Stages 1-4 are abort-safe:
//! cancelling closes whatever sockets are open and returns. Stage 5 is a
//! commit point — once `OpenSession` succeeds the handshake always
//! completes, because aborting after the camera has a session open would
//! leave it wedged rather than idle.

use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

use crate::codec::Packet;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::proto::{DeviceInfo, OperationCode, RESPONSE_OK};
use crate::session::command_engine::{CommandEngine, CommandEngineHandle};
use crate::transport::Transport;

/// The three `SDIO_Connect` phases Sony cameras expect in sequence before
/// the vendor handshake op `0x920D` is accepted. Not documented by Sony;
/// this ordering is the one observed to work in practice.
pub const SDIO_CONNECT_PHASES: [u32; 3] = [1, 2, 3];

pub struct HandshakeResult {
    pub command_engine: CommandEngineHandle,
    pub command_engine_join: tokio::task::JoinHandle<()>,
    pub event_transport: Transport,
    pub connection_number: u32,
    pub device_name: String,
    pub session_id: u32,
    pub device_info: DeviceInfo,
}

/// Drives stages 1-5 of the connect sequence against `addr`. `guid` and
/// `host_name` identify this installation to the camera; they must be
/// stable across reconnects for cameras that pair by host identity.
pub async fn connect(
    addr: SocketAddr,
    guid: Uuid,
    config: &ClientConfig,
) -> Result<HandshakeResult> {
    let handshake_timeout = Duration::from_millis(1_500);

    // Stage 1: TCP-connect the command socket, retrying transient refusals
    // and timeouts; fail fast on host-unreachable.
    let mut command_transport = connect_with_retries(addr, handshake_timeout, config).await?;

    // Stage 2: InitCommandRequest / InitCommandAck.
    command_transport
        .send_frame(
            &Packet::InitCommandRequest {
                guid: crate::guid::to_wire(guid),
                host_name: config.host_name.clone(),
                protocol_version: 0x0001_0000,
            },
            handshake_timeout,
        )
        .await
        .map_err(|e| stage_failure(2, e))?;

    let ack = command_transport
        .recv_frame(handshake_timeout)
        .await
        .map_err(|e| stage_failure(2, e))?;
    let (connection_number, device_name) = match ack {
        Packet::InitCommandAck {
            connection_number,
            device_name,
            ..
        } => (connection_number, device_name),
        Packet::InitFail { reason } => {
            return Err(Error::HandshakeFailed {
                stage: 2,
                reason: format!("camera rejected init with reason 0x{reason:08x}"),
            })
        }
        other => {
            return Err(Error::HandshakeFailed {
                stage: 2,
                reason: format!("unexpected reply to InitCommandRequest: {other:?}"),
            })
        }
    };

    // Stage 3: TCP-connect the event socket.
    let mut event_transport = Transport::connect(addr, handshake_timeout)
        .await
        .map_err(|e| stage_failure(3, e))?;

    // Stage 4: InitEventRequest / InitEventAck.
    event_transport
        .send_frame(
            &Packet::InitEventRequest { connection_number },
            handshake_timeout,
        )
        .await
        .map_err(|e| stage_failure(4, e))?;
    match event_transport
        .recv_frame(handshake_timeout)
        .await
        .map_err(|e| stage_failure(4, e))?
    {
        Packet::InitEventAck => {}
        other => {
            return Err(Error::HandshakeFailed {
                stage: 4,
                reason: format!("unexpected reply to InitEventRequest: {other:?}"),
            })
        }
    }

    // Stage 5: commit point. From here on we always finish the handshake
    // even if the caller asked us to cancel.
    let session_id = random_nonzero_u32();
    let (command_engine, command_engine_join) =
        CommandEngine::spawn(command_transport, config.command_timeout());

    let open_session = command_engine
        .command(crate::session::command_engine::CommandRequest::new(
            OperationCode::OpenSession.code(),
            vec![session_id],
        ))
        .await
        .map_err(|e| stage_failure(5, e))?;
    if !open_session.response.is_ok() {
        return Err(Error::CommandFailed {
            opcode: OperationCode::OpenSession.code(),
            response_code: open_session.response.code,
        });
    }

    let device_info_reply = command_engine
        .command(crate::session::command_engine::CommandRequest::new(
            OperationCode::GetDeviceInfo.code(),
            vec![],
        ))
        .await
        .map_err(|e| stage_failure(5, e))?;
    let device_info = device_info_reply
        .data_in
        .as_deref()
        .map(DeviceInfo::parse)
        .transpose()
        .map_err(Error::from)?
        .ok_or_else(|| Error::HandshakeFailed {
            stage: 5,
            reason: "GetDeviceInfo returned no data phase".into(),
        })?;

    if is_sony(&device_info) {
        complete_sony_handshake(&command_engine).await?;
    }

    Ok(HandshakeResult {
        command_engine,
        command_engine_join,
        event_transport,
        connection_number,
        device_name,
        session_id,
        device_info,
    })
}

/// Sony requires three `SDIO_Connect` calls with phase params `{1,0,0}`,
/// `{2,0,0}`, `{3,0,0}` followed by the vendor handshake op `0x920D`
/// before event polling is accepted.
async fn complete_sony_handshake(command_engine: &CommandEngineHandle) -> Result<()> {
    for phase in SDIO_CONNECT_PHASES {
        let reply = command_engine
            .simple(OperationCode::SonySdioConnect.code(), vec![phase, 0, 0])
            .await
            .map_err(|e| stage_failure(5, e))?;
        if reply.response.code != RESPONSE_OK {
            return Err(Error::CommandFailed {
                opcode: OperationCode::SonySdioConnect.code(),
                response_code: reply.response.code,
            });
        }
    }

    let reply = command_engine
        .simple(OperationCode::SonyVendorHandshake.code(), vec![])
        .await
        .map_err(|e| stage_failure(5, e))?;
    if reply.response.code != RESPONSE_OK {
        return Err(Error::CommandFailed {
            opcode: OperationCode::SonyVendorHandshake.code(),
            response_code: reply.response.code,
        });
    }
    Ok(())
}

fn is_sony(device_info: &DeviceInfo) -> bool {
    device_info.manufacturer.to_ascii_lowercase().contains("sony")
}

fn random_nonzero_u32() -> u32 {
    loop {
        let candidate = rand::random::<u32>();
        if candidate != 0 {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use tokio::net::{TcpListener, TcpStream};

    fn device_info_bytes(manufacturer: &str, model: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16_le(100);
        buf.put_u32_le(0);
        buf.put_u16_le(100);
        crate::wire::write_ptp_string(&mut buf, "");
        buf.put_u16_le(0);
        crate::wire::write_ptp_array_u16(&mut buf, &[0x1001, 0x1002, 0x1008]);
        crate::wire::write_ptp_array_u16(&mut buf, &[0x4002]);
        crate::wire::write_ptp_array_u16(&mut buf, &[]);
        crate::wire::write_ptp_array_u16(&mut buf, &[]);
        crate::wire::write_ptp_array_u16(&mut buf, &[0x3801]);
        crate::wire::write_ptp_string(&mut buf, manufacturer);
        crate::wire::write_ptp_string(&mut buf, model);
        crate::wire::write_ptp_string(&mut buf, "1.0");
        crate::wire::write_ptp_string(&mut buf, "000000000001");
        buf.to_vec()
    }

    async fn recv_packet(socket: &mut TcpStream) -> Packet {
        use tokio::io::AsyncReadExt;
        let mut header = [0u8; HEADER_LEN_FOR_TEST];
        socket.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
        let mut rest = vec![0u8; len - HEADER_LEN_FOR_TEST];
        socket.read_exact(&mut rest).await.unwrap();
        let mut frame = header.to_vec();
        frame.extend_from_slice(&rest);
        crate::codec::decode(&frame).unwrap()
    }

    const HEADER_LEN_FOR_TEST: usize = crate::codec::HEADER_LEN;

    async fn send_packet(socket: &mut TcpStream, packet: &Packet) {
        use tokio::io::AsyncWriteExt;
        socket.write_all(&crate::codec::encode(packet)).await.unwrap();
    }

    /// A minimal fake camera good for one connect sequence: accepts the
    /// command socket, replies to `InitCommandRequest`, accepts the event
    /// socket, replies to `InitEventRequest`, then answers `OpenSession` and
    /// `GetDeviceInfo` on the command channel. `sony` additionally answers
    /// the three `SDIO_Connect` phases plus the vendor handshake op.
    async fn spawn_fake_camera(manufacturer: &'static str, model: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut command, _) = listener.accept().await.unwrap();
            match recv_packet(&mut command).await {
                Packet::InitCommandRequest { .. } => {}
                other => panic!("expected InitCommandRequest, got {other:?}"),
            }
            send_packet(
                &mut command,
                &Packet::InitCommandAck {
                    connection_number: 7,
                    device_guid: [0u8; 16],
                    device_name: "Test Camera".into(),
                    device_version: 1,
                },
            )
            .await;

            let (mut event, _) = listener.accept().await.unwrap();
            match recv_packet(&mut event).await {
                Packet::InitEventRequest { connection_number } => assert_eq!(connection_number, 7),
                other => panic!("expected InitEventRequest, got {other:?}"),
            }
            send_packet(&mut event, &Packet::InitEventAck).await;

            match recv_packet(&mut command).await {
                Packet::Command { opcode, .. } => assert_eq!(opcode, OperationCode::OpenSession.code()),
                other => panic!("expected OpenSession, got {other:?}"),
            }
            send_packet(
                &mut command,
                &Packet::Response {
                    transaction_id: 1,
                    code: RESPONSE_OK,
                    params: vec![],
                },
            )
            .await;

            match recv_packet(&mut command).await {
                Packet::Command { opcode, .. } => assert_eq!(opcode, OperationCode::GetDeviceInfo.code()),
                other => panic!("expected GetDeviceInfo, got {other:?}"),
            }
            send_packet(
                &mut command,
                &Packet::Data {
                    transaction_id: 2,
                    payload: device_info_bytes(manufacturer, model).into(),
                },
            )
            .await;
            send_packet(
                &mut command,
                &Packet::Response {
                    transaction_id: 2,
                    code: RESPONSE_OK,
                    params: vec![],
                },
            )
            .await;

            if manufacturer.to_ascii_lowercase().contains("sony") {
                for phase in SDIO_CONNECT_PHASES {
                    match recv_packet(&mut command).await {
                        Packet::Command { opcode, transaction_id, params } => {
                            assert_eq!(opcode, OperationCode::SonySdioConnect.code());
                            assert_eq!(params.first(), Some(&phase));
                            send_packet(
                                &mut command,
                                &Packet::Response {
                                    transaction_id,
                                    code: RESPONSE_OK,
                                    params: vec![],
                                },
                            )
                            .await;
                        }
                        other => panic!("expected SonySdioConnect, got {other:?}"),
                    }
                }
                match recv_packet(&mut command).await {
                    Packet::Command { opcode, transaction_id, .. } => {
                        assert_eq!(opcode, OperationCode::SonyVendorHandshake.code());
                        send_packet(
                            &mut command,
                            &Packet::Response {
                                transaction_id,
                                code: RESPONSE_OK,
                                params: vec![],
                            },
                        )
                        .await;
                    }
                    other => panic!("expected SonyVendorHandshake, got {other:?}"),
                }
            }

            // Keep both sockets alive past the handshake so the client's
            // command engine and event transport don't observe a spurious
            // disconnect while the test still holds the `Session`.
            let _ = tokio::time::sleep(Duration::from_secs(5)).await;
            drop(command);
            drop(event);
        });

        addr
    }

    #[tokio::test]
    async fn successful_handshake_against_generic_camera() {
        let addr = spawn_fake_camera("Acme Corp", "Acme S1").await;
        let result = connect(addr, Uuid::new_v4(), &ClientConfig::default())
            .await
            .unwrap();

        assert_eq!(result.connection_number, 7);
        assert_eq!(result.device_name, "Test Camera");
        assert_ne!(result.session_id, 0);
        assert_eq!(result.device_info.manufacturer, "Acme Corp");
        assert_eq!(result.device_info.model, "Acme S1");
    }

    #[tokio::test]
    async fn sony_handshake_performs_sdio_connect_sequence() {
        let addr = spawn_fake_camera("Sony Corp", "Alpha 7").await;
        let result = connect(addr, Uuid::new_v4(), &ClientConfig::default())
            .await
            .unwrap();

        assert_eq!(result.device_info.manufacturer, "Sony Corp");
    }

    #[tokio::test]
    async fn stage2_init_fail_surfaces_as_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut command, _) = listener.accept().await.unwrap();
            match recv_packet(&mut command).await {
                Packet::InitCommandRequest { .. } => {}
                other => panic!("expected InitCommandRequest, got {other:?}"),
            }
            send_packet(&mut command, &Packet::InitFail { reason: 0xDEAD_0001 }).await;
        });

        let error = connect(addr, Uuid::new_v4(), &ClientConfig::default())
            .await
            .unwrap_err();
        match error {
            Error::HandshakeFailed { stage, reason } => {
                assert_eq!(stage, 2);
                assert!(reason.contains("dead0001"));
            }
            other => panic!("expected HandshakeFailed at stage 2, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_refused_retries_then_fails_after_configured_attempts() {
        // Bind then immediately drop the listener: every connect attempt
        // observes `ConnectRefused`, exercising the retry loop's give-up
        // path without needing a slow timeout.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig {
            scan_ip_retries: 1,
            scan_ip_retry_delay_ms: 10,
            ..ClientConfig::default()
        };

        let error = connect(addr, Uuid::new_v4(), &config).await.unwrap_err();
        assert!(matches!(error, Error::HandshakeFailed { stage: 1, .. }));
    }
}

fn stage_failure(stage: u8, error: Error) -> Error {
    match error {
        already @ Error::HandshakeFailed { .. } => already,
        other => Error::HandshakeFailed {
            stage,
            reason: other.to_string(),
        },
    }
}

async fn connect_with_retries(
    addr: SocketAddr,
    timeout: Duration,
    config: &ClientConfig,
) -> Result<Transport> {
    let mut attempt = 0;
    loop {
        match Transport::connect(addr, timeout).await {
            Ok(transport) => return Ok(transport),
            Err(Error::HostUnreachable(_)) => {
                return Err(Error::HandshakeFailed {
                    stage: 1,
                    reason: format!("host {addr} is unreachable"),
                })
            }
            Err(e @ (Error::ConnectRefused(_) | Error::ConnectTimeout(_))) => {
                attempt += 1;
                if attempt > config.scan_ip_retries {
                    return Err(Error::HandshakeFailed {
                        stage: 1,
                        reason: e.to_string(),
                    });
                }
                tokio::time::sleep(config.scan_ip_retry_delay()).await;
            }
            Err(e) => return Err(stage_failure(1, e)),
        }
    }
}

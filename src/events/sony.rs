//! Sony: async `ObjectAdded` notifications (vendor code `0xC201`) arrive on
//! the event socket carrying the fixed in-memory sentinel handle
//! `0xFFFFC001`. Before the session is allowed to call `GetObjectInfo` on
//! that handle, the ObjectInMemory gate (property `0xD215`) must read back
//! `>= 0x8000`; reading it too early races the camera's own JPEG encode and
//! yields a short or missing file.

use async_trait::async_trait;
use bytes::Buf;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, SonyPropertyReadStrategy};
use crate::error::{Error, Result};
use crate::events::{DetectedPhoto, EventSource, PtpEvent};
use crate::proto::{OperationCode, SonyPropertyCode};
use crate::session::command_engine::CommandEngineHandle;
use crate::transport::Transport;

/// Vendor event code mapped to `ObjectAdded` for Sony cameras.
pub const SONY_EVENT_OBJECT_ADDED: u16 = 0xC201;

/// Sony's object handle for an in-memory (not-yet-flushed-to-card) capture
/// is always this sentinel; there is exactly one "slot", so overlapping
/// captures are serialized by the gate itself.
pub const OBJECT_IN_MEMORY_HANDLE: u32 = 0xFFFF_C001;

/// The ObjectInMemory gate (`0xD215`) reports the capture ready once its
/// value reaches this threshold.
const OBJECT_READY_THRESHOLD: u32 = 0x8000;

pub struct SonyEventSource {
    command_engine: CommandEngineHandle,
    event_transport: Transport,
    config: ClientConfig,
    next_logical_id: u64,
}

impl SonyEventSource {
    pub fn new(
        command_engine: CommandEngineHandle,
        event_transport: Transport,
        config: ClientConfig,
    ) -> Self {
        Self {
            command_engine,
            event_transport,
            config,
            next_logical_id: 1,
        }
    }

    /// Reads the ObjectInMemory property, trying each configured strategy
    /// in order and returning the first that answers. Per spec the ordering
    /// is empirical, not a documented guarantee, hence configurable.
    async fn read_object_in_memory(&self) -> Result<u32> {
        for strategy in &self.config.sony_property_read_strategies {
            if let Some(value) = self.try_strategy(*strategy).await? {
                return Ok(value);
            }
        }
        Err(Error::ProtocolError(
            "no configured Sony property-read strategy returned data".into(),
        ))
    }

    async fn try_strategy(&self, strategy: SonyPropertyReadStrategy) -> Result<Option<u32>> {
        let opcode = match strategy {
            SonyPropertyReadStrategy::GetAllDevicePropData => {
                OperationCode::SonyGetAllDevicePropData.code()
            }
            SonyPropertyReadStrategy::GetDevicePropDesc => {
                OperationCode::SonyGetDevicePropDesc.code()
            }
            SonyPropertyReadStrategy::StandardGetDevicePropDesc => {
                OperationCode::GetDevicePropDesc.code()
            }
        };
        let property = SonyPropertyCode::ObjectInMemory as u16 as u32;
        let reply = self.command_engine.simple(opcode, vec![property]).await?;
        if !reply.response.is_ok() {
            return Ok(None);
        }
        Ok(reply
            .data_in
            .as_deref()
            .and_then(parse_device_prop_value))
    }

    /// Polls the gate until it reads `>= 0x8000` or the configured poll
    /// budget is exhausted.
    async fn wait_for_object_ready(&self) -> Result<()> {
        for _ in 0..self.config.sony_gate_max_polls {
            let value = self.read_object_in_memory().await?;
            if value >= OBJECT_READY_THRESHOLD {
                return Ok(());
            }
            tokio::time::sleep(self.config.sony_gate_poll_interval()).await;
        }
        Err(Error::ObjectInMemoryTimeout)
    }
}

/// Sony device property descriptors carry the current value as the last
/// field; for the scalar `u32` properties this client reads, the layout is
/// `DevicePropertyCode:u16 | DataType:u16 | GetSet:u8 | DefaultValue:u32 |
/// CurrentValue:u32 | ...`. This client only needs `CurrentValue`.
fn parse_device_prop_value(data: &[u8]) -> Option<u32> {
    let mut buf = data;
    if buf.remaining() < 13 {
        return None;
    }
    buf.advance(9); // code, data type, get/set
    let _default_value = buf.get_u32_le();
    if buf.remaining() < 4 {
        return None;
    }
    Some(buf.get_u32_le())
}

#[async_trait]
impl EventSource for SonyEventSource {
    async fn start(
        &mut self,
        tx: flume::Sender<DetectedPhoto>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let poll_timeout = self.config.event_poll_timeout();

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = self.event_transport.recv_frame(poll_timeout) => frame,
            };

            let packet = match frame {
                Ok(packet) => packet,
                Err(Error::Timeout) => continue,
                Err(Error::Cancelled) => break,
                Err(e) => return Err(e),
            };

            let event = match packet {
                crate::codec::Packet::Data { payload, .. }
                | crate::codec::Packet::EndData { payload, .. } => PtpEvent::parse(&payload),
                _ => None,
            };
            let Some(event) = event else { continue };
            if event.code != SONY_EVENT_OBJECT_ADDED {
                continue;
            }

            // Sony capture processing is strictly sequential at session
            // scope: resolve this event (gate, then emit) fully before
            // reading the next one off the wire.
            if let Err(Error::ObjectInMemoryTimeout) = self.wait_for_object_ready().await {
                tracing::warn!("sony object-in-memory gate timed out, skipping this capture");
                continue;
            }

            let logical_id = self.next_logical_id;
            self.next_logical_id += 1;

            let mut photo = DetectedPhoto::from_handle(OBJECT_IN_MEMORY_HANDLE);
            photo.logical_id = logical_id;

            if tx.send_async(photo).await.is_err() {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_prop_desc(value: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(SonyPropertyCode::ObjectInMemory as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // data type
        buf.push(0); // get/set
        buf.extend_from_slice(&0u32.to_le_bytes()); // default value
        buf.extend_from_slice(&value.to_le_bytes()); // current value
        buf
    }

    #[test]
    fn parses_current_value_from_prop_desc() {
        let bytes = encode_prop_desc(0x8001);
        assert_eq!(parse_device_prop_value(&bytes), Some(0x8001));
    }

    #[test]
    fn short_prop_desc_is_none() {
        assert_eq!(parse_device_prop_value(&[0u8; 4]), None);
    }

    #[test]
    fn sony_event_parses_from_data_packet() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&SONY_EVENT_OBJECT_ADDED.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&OBJECT_IN_MEMORY_HANDLE.to_le_bytes());
        let event = PtpEvent::parse(&payload).unwrap();
        assert_eq!(event.code, SONY_EVENT_OBJECT_ADDED);
        assert_eq!(event.params, vec![OBJECT_IN_MEMORY_HANDLE]);
    }
}

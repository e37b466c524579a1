//! Canon: no asynchronous events at all. The command channel is polled
//! with `GetEvent(0x9116)`, adaptively backing off when nothing is
//! happening so idle sessions don't hammer the camera.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Buf;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::events::{DetectedPhoto, EventSource};
use crate::proto::OperationCode;
use crate::session::command_engine::{CommandEngineHandle, CommandRequest};

/// TLV record type for an `ObjectAdded` notification inside a
/// `GetEvent` payload.
const RECORD_OBJECT_ADDED: u16 = 0xC1A7;

/// An undocumented Canon event record we don't know how to interpret.
/// Kept (rather than discarded) so its raw bytes can be catalogued from
/// logs instead of silently vanishing.
#[derive(Debug, Clone)]
pub struct UnknownRecord {
    pub record_type: u16,
    pub raw: Vec<u8>,
}

/// Fixed size of the descriptor carried by an `ObjectAdded` record:
/// handle(4) + format code(2) + reserved(2) + a 56-byte UTF-16LE filename
/// field, NUL-padded.
const OBJECT_ADDED_DESCRIPTOR_LEN: usize = 64;

pub struct CanonEventSource {
    command_engine: CommandEngineHandle,
    config: ClientConfig,
}

impl CanonEventSource {
    pub fn new(command_engine: CommandEngineHandle, config: ClientConfig) -> Self {
        Self {
            command_engine,
            config,
        }
    }
}

#[async_trait]
impl EventSource for CanonEventSource {
    async fn start(
        &mut self,
        tx: flume::Sender<DetectedPhoto>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.command_engine
            .simple(OperationCode::CanonSetEventMode.code(), vec![1])
            .await?;

        let mut interval = Duration::from_millis(self.config.canon_poll_min_ms as u64);
        let min = Duration::from_millis(self.config.canon_poll_min_ms as u64);
        let max = Duration::from_millis(self.config.canon_poll_max_ms as u64);
        let step = Duration::from_millis(self.config.canon_poll_step_ms as u64);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let reply = match self
                .command_engine
                .simple(OperationCode::CanonGetEvent.code(), vec![])
                .await
            {
                Ok(reply) => reply,
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => return Err(e),
            };

            let photos = reply
                .data_in
                .as_deref()
                .map(parse_object_added_records)
                .unwrap_or_default();

            if photos.is_empty() {
                interval = (interval + step).min(max);
            } else {
                interval = min;
                for photo in photos {
                    if tx.send_async(photo).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }

    async fn cleanup(&mut self, command_engine: &CommandEngineHandle) -> Result<()> {
        // Drain one last GetEvent so nothing is left queued on the camera,
        // then tell it to stop generating events before we disconnect.
        let _ = command_engine
            .command(CommandRequest::new(OperationCode::CanonGetEvent.code(), vec![]))
            .await;
        command_engine
            .simple(OperationCode::CanonSetEventMode.code(), vec![0])
            .await?;
        Ok(())
    }
}

/// Splits a `GetEvent` payload into `size:u32_le | record_type:u16_le |
/// reserved:u16_le | data` records, extracting an `ObjectAdded` descriptor
/// from each one matching [`RECORD_OBJECT_ADDED`]. Anything else is
/// preserved as an [`UnknownRecord`] and logged at `debug` rather than
/// dropped, so undocumented record types can be catalogued from logs.
fn parse_object_added_records(mut data: &[u8]) -> Vec<DetectedPhoto> {
    let mut photos = Vec::new();
    while data.remaining() >= 8 {
        let record_len = data.get_u32_le() as usize;
        let record_type = data.get_u16_le();
        let _reserved = data.get_u16_le();
        let body_len = record_len.saturating_sub(8).min(data.remaining());
        let body = &data[..body_len];
        data.advance(body_len);

        if record_type == RECORD_OBJECT_ADDED {
            if let Some(photo) = parse_descriptor(body) {
                photos.push(photo);
            }
        } else {
            let unknown = UnknownRecord {
                record_type,
                raw: body.to_vec(),
            };
            tracing::debug!(record_type = %format!("0x{:04x}", unknown.record_type), raw = ?unknown.raw, "unrecognized canon event record");
        }
    }
    photos
}

fn parse_descriptor(mut body: &[u8]) -> Option<DetectedPhoto> {
    if body.remaining() < OBJECT_ADDED_DESCRIPTOR_LEN {
        return None;
    }
    let handle = body.get_u32_le();
    let format_code = body.get_u16_le();
    let _reserved = body.get_u16_le();
    let name_bytes = &body[..OBJECT_ADDED_DESCRIPTOR_LEN - 8];
    let filename = decode_padded_utf16(name_bytes);

    Some(DetectedPhoto {
        handle,
        logical_id: handle as u64,
        filename: Some(filename),
        capture_date: None,
        size: None,
        vendor_raw_hint: crate::proto::is_raw_format(format_code),
    })
}

fn decode_padded_utf16(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_descriptor(handle: u32, format_code: u16, filename: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&handle.to_le_bytes());
        body.extend_from_slice(&format_code.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        let mut name_field = vec![0u8; OBJECT_ADDED_DESCRIPTOR_LEN - 8];
        let encoded: Vec<u8> = filename.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        name_field[..encoded.len()].copy_from_slice(&encoded);
        body.extend_from_slice(&name_field);
        body
    }

    #[test]
    fn parses_a_single_object_added_record() {
        let body = encode_descriptor(0x1234, 0x3801, "IMG_0001.JPG");
        let mut record = Vec::new();
        record.extend_from_slice(&((8 + body.len()) as u32).to_le_bytes());
        record.extend_from_slice(&RECORD_OBJECT_ADDED.to_le_bytes());
        record.extend_from_slice(&0u16.to_le_bytes());
        record.extend_from_slice(&body);

        let photos = parse_object_added_records(&record);
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].handle, 0x1234);
        assert_eq!(photos[0].filename.as_deref(), Some("IMG_0001.JPG"));
        assert!(!photos[0].vendor_raw_hint);
    }

    #[test]
    fn ignores_unknown_record_types() {
        let mut record = Vec::new();
        record.extend_from_slice(&12u32.to_le_bytes());
        record.extend_from_slice(&0xDEAD_u16.to_le_bytes());
        record.extend_from_slice(&0u16.to_le_bytes());
        record.extend_from_slice(&[0u8; 4]);

        assert!(parse_object_added_records(&record).is_empty());
    }

    #[test]
    fn empty_payload_yields_no_photos() {
        assert!(parse_object_added_records(&[]).is_empty());
    }
}

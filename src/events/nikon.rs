//! Nikon: polls vendor op `GetEvents(0x90C7)` on the command channel at a
//! fixed interval, modeled on Canon's adaptive poller but without the
//! backoff (Nikon's event record layout has not been exhaustively
//! validated against real hardware, hence this whole module sits behind
//! the `nikon-events` feature rather than being load-bearing by default).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Buf;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::{DetectedPhoto, EventSource};
use crate::proto::OperationCode;
use crate::session::command_engine::CommandEngineHandle;

/// Fixed poll cadence; Nikon's cameras have not shown the need for Canon's
/// adaptive backoff in observed traffic, so a flat interval is used.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Nikon event code for a newly captured object, mapped onto the common
/// `ObjectAdded` stream. Modeled on the standard PTP code since Nikon's
/// `0x90C7` payload has not been independently confirmed.
const NIKON_EVENT_OBJECT_ADDED: u16 = 0x4002;

pub struct NikonEventSource {
    command_engine: CommandEngineHandle,
}

impl NikonEventSource {
    pub fn new(command_engine: CommandEngineHandle) -> Self {
        Self { command_engine }
    }
}

#[async_trait]
impl EventSource for NikonEventSource {
    async fn start(
        &mut self,
        tx: flume::Sender<DetectedPhoto>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let reply = match self
                .command_engine
                .simple(OperationCode::NikonGetEvents.code(), vec![])
                .await
            {
                Ok(reply) => reply,
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => return Err(e),
            };

            let photos = reply
                .data_in
                .as_deref()
                .map(parse_events)
                .unwrap_or_default();

            for photo in photos {
                if tx.send_async(photo).await.is_err() {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

/// `GetEvents` data is a sequence of `EventCode:u16 | Param1:u32` records.
/// Modeled on Canon's TLV shape but simplified, per the note that this
/// layout is unvalidated.
fn parse_events(mut data: &[u8]) -> Vec<DetectedPhoto> {
    let mut photos = Vec::new();
    while data.remaining() >= 6 {
        let code = data.get_u16_le();
        let handle = data.get_u32_le();
        if code == NIKON_EVENT_OBJECT_ADDED {
            photos.push(DetectedPhoto::from_handle(handle));
        }
    }
    photos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_added_record() {
        let mut data = Vec::new();
        data.extend_from_slice(&NIKON_EVENT_OBJECT_ADDED.to_le_bytes());
        data.extend_from_slice(&0x4242u32.to_le_bytes());
        let photos = parse_events(&data);
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].handle, 0x4242);
    }

    #[test]
    fn ignores_unknown_event_code() {
        let mut data = Vec::new();
        data.extend_from_slice(&0x9999u16.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        assert!(parse_events(&data).is_empty());
    }
}

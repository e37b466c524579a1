//! Fallback event source for cameras whose manufacturer string doesn't
//! match a known vendor: reads standard PTP async events straight off the
//! event socket. No polling, no gating — whatever the device pushes is
//! translated directly into `DetectedPhoto`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::{DetectedPhoto, EventSource, PtpEvent, EVENT_CAPTURE_COMPLETE, EVENT_OBJECT_ADDED};
use crate::transport::Transport;

pub struct GenericEventSource {
    event_transport: Transport,
}

impl GenericEventSource {
    pub fn new(event_transport: Transport) -> Self {
        Self { event_transport }
    }
}

#[async_trait]
impl EventSource for GenericEventSource {
    async fn start(
        &mut self,
        tx: flume::Sender<DetectedPhoto>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let poll_timeout = std::time::Duration::from_secs(1);

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

            // CaptureComplete carries no object handle of its own; only
            // ObjectAdded identifies a concrete object to fetch.
            if event.code != EVENT_OBJECT_ADDED {
                if event.code == EVENT_CAPTURE_COMPLETE {
                    tracing::debug!("generic capture-complete event observed");
                }
                continue;
            }
            let Some(&handle) = event.params.first() else {
                continue;
            };

            if tx.send_async(DetectedPhoto::from_handle(handle)).await.is_err() {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_added_event_carries_handle_as_first_param() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&EVENT_OBJECT_ADDED.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&0x1234u32.to_le_bytes());
        let event = PtpEvent::parse(&payload).unwrap();
        assert_eq!(event.params.first(), Some(&0x1234));
    }
}

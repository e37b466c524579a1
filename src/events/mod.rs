//! Vendor-specific event sources. One implementation is selected at
//! session start based on `DeviceInfo::manufacturer`, each producing the
//! same `DetectedPhoto` stream regardless of whether the camera pushes
//! events asynchronously (Generic) or must be polled (Canon, Sony, Nikon).

pub mod canon;
pub mod generic;
pub mod sony;

#[cfg(feature = "nikon-events")]
pub mod nikon;

use async_trait::async_trait;
use bytes::Buf;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::session::command_engine::CommandEngineHandle;
use crate::transport::Transport;

/// Standard PTP event codes relevant to photo detection, used directly by
/// [`generic`] and as a translation target by the vendor-specific sources.
pub const EVENT_OBJECT_ADDED: u16 = 0x4002;
pub const EVENT_CAPTURE_COMPLETE: u16 = 0x400D;

/// The standard PTP asynchronous event shape carried on the event socket:
/// `EventCode:u16 | TransactionID:u32 | Parameter1..3:u32`. Sony's vendor
/// event `0xC201` and the generic `ObjectAdded`/`CaptureComplete` events
/// both arrive in this shape, just with different codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtpEvent {
    pub code: u16,
    pub transaction_id: u32,
    pub params: Vec<u32>,
}

impl PtpEvent {
    pub fn parse(mut data: &[u8]) -> Option<Self> {
        if data.remaining() < 6 {
            return None;
        }
        let code = data.get_u16_le();
        let transaction_id = data.get_u32_le();
        let mut params = Vec::new();
        while data.remaining() >= 4 {
            params.push(data.get_u32_le());
        }
        Some(Self {
            code,
            transaction_id,
            params,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPhoto {
    pub handle: u32,
    /// Distinct from `handle` only for Sony in-memory captures, where
    /// every event reuses the sentinel handle `0xFFFFC001`; the event
    /// source assigns a fresh logical id per capture so the session and
    /// download pipeline can still dedup and track them individually.
    pub logical_id: u64,
    pub filename: Option<String>,
    pub capture_date: Option<String>,
    /// Compressed object size, when the vendor's event descriptor carries
    /// one directly (none of the sources in this crate do today — every
    /// vendor's event payload omits size, so the session fills this in
    /// from `GetObjectInfo` before emitting the detect event). Kept on
    /// `DetectedPhoto` rather than threaded separately so a future source
    /// that does carry it (e.g. a richer TLV record) has somewhere to put
    /// it without changing this type's shape again.
    pub size: Option<u64>,
    pub vendor_raw_hint: bool,
}

impl DetectedPhoto {
    pub fn from_handle(handle: u32) -> Self {
        Self {
            handle,
            logical_id: handle as u64,
            filename: None,
            capture_date: None,
            size: None,
            vendor_raw_hint: false,
        }
    }
}

/// Shared shape for every vendor's event loop: produce `DetectedPhoto`
/// values on `tx` until `cancel` fires, then run vendor-specific teardown
/// before returning.
#[async_trait]
pub trait EventSource: Send {
    async fn start(
        &mut self,
        tx: flume::Sender<DetectedPhoto>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Vendor-specific graceful teardown, run by the session after `start`
    /// returns (whether because of cancellation or a fatal error). Default
    /// is a no-op for vendors with nothing to clean up (Nikon, Generic).
    async fn cleanup(&mut self, _command_engine: &CommandEngineHandle) -> Result<()> {
        Ok(())
    }
}

pub use canon::CanonEventSource;
pub use generic::GenericEventSource;
pub use sony::SonyEventSource;

#[cfg(feature = "nikon-events")]
pub use nikon::NikonEventSource;

/// Picks the event source implementation for a connected camera.
/// `event_transport` is consumed by `Generic`/`Sony`, which read directly
/// off the event socket; Canon and Nikon ignore it, since they poll the
/// command channel instead.
pub fn select_for_device(
    manufacturer: &str,
    command_engine: CommandEngineHandle,
    event_transport: Transport,
    config: &crate::config::ClientConfig,
) -> Box<dyn EventSource> {
    let lower = manufacturer.to_ascii_lowercase();
    if lower.contains("canon") {
        Box::new(CanonEventSource::new(command_engine, config.clone()))
    } else if lower.contains("sony") {
        Box::new(SonyEventSource::new(command_engine, event_transport, config.clone()))
    } else if cfg!(feature = "nikon-events") && lower.contains("nikon") {
        #[cfg(feature = "nikon-events")]
        {
            Box::new(NikonEventSource::new(command_engine))
        }
        #[cfg(not(feature = "nikon-events"))]
        {
            Box::new(GenericEventSource::new(event_transport))
        }
    } else {
        Box::new(GenericEventSource::new(event_transport))
    }
}

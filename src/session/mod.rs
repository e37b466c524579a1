//! The session facade: owns the command/event sockets, the command engine
//! actor, the vendor event source, and the download pipeline, and exposes
//! one coherent `connect → start → disconnect` lifecycle. Delegate
//! callbacks are realized as a `flume` channel (§9's "replace
//! object-oriented delegates with a message channel whose consumer drains
//! on one task") with a thin trait-based adapter (`SessionDelegate`) on top
//! for consumers that prefer callbacks over polling a receiver.

pub mod command_engine;
pub mod handshake;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::download::{self, DownloadOutcome};
use crate::error::{Error, Result};
use crate::events::{self, DetectedPhoto, EventSource};
use crate::proto::DeviceInfo;
use crate::session::command_engine::CommandEngineHandle;

/// How long `disconnect()` waits for the event source and download
/// orchestrator tasks to wind down on their own before proceeding anyway.
const DISCONNECT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Running,
    Disconnecting,
    Closed,
}

/// Vendor dispatch tag plus the small capability set §9 calls for, so
/// branching on "is this Sony" happens once at construction rather than
/// scattered through the download pipeline and event sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Canon,
    Nikon,
    Sony,
    Generic,
}

impl Vendor {
    pub fn from_device_info(info: &DeviceInfo) -> Self {
        let manufacturer = info.manufacturer.to_ascii_lowercase();
        if manufacturer.contains("canon") {
            Vendor::Canon
        } else if manufacturer.contains("sony") {
            Vendor::Sony
        } else if cfg!(feature = "nikon-events") && manufacturer.contains("nikon") {
            Vendor::Nikon
        } else {
            Vendor::Generic
        }
    }

    pub fn supports_partial_object(self) -> bool {
        matches!(self, Vendor::Sony)
    }

    pub fn needs_object_in_memory_gate(self) -> bool {
        matches!(self, Vendor::Sony)
    }

    pub fn transaction_ids_contiguous(self) -> bool {
        // Sony silently ignores gapped transaction ids; every other vendor
        // in scope tolerates gaps, but the command engine never produces
        // any, so this is purely descriptive.
        true
    }
}

/// The ordered event stream a session produces. Mirrors §6's
/// `SessionDelegate`, one callback at a time, rather than object-oriented
/// dispatch.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected(Arc<DeviceInfo>),
    /// `handle` here is the session's synthesized *logical id*, not
    /// necessarily the raw wire object handle: Sony in-memory captures all
    /// share the wire sentinel `0xFFFFC001`, so the session substitutes a
    /// per-capture id a sink can use to tell two captures apart. For every
    /// other vendor the two coincide.
    DetectedPhoto {
        handle: u64,
        filename: Option<String>,
        capture_date: Option<String>,
        size: Option<u64>,
    },
    CompletedDownload {
        handle: u64,
        bytes: Bytes,
    },
    SkippedRaw {
        filename: String,
    },
    Failed(Arc<Error>),
    Disconnected,
}

/// Callback-style adapter over [`SessionEvent`] for consumers who would
/// rather implement a trait than drain a channel themselves. Every method
/// has a no-op default so a consumer only overrides what it cares about.
pub trait SessionDelegate: Send {
    fn session_did_connect(&mut self, _device_info: &DeviceInfo) {}
    fn session_did_detect_photo(
        &mut self,
        _handle: u64,
        _filename: Option<&str>,
        _capture_date: Option<&str>,
        _size: Option<u64>,
    ) {
    }
    fn session_did_complete_download(&mut self, _handle: u64, _bytes: &[u8]) {}
    fn session_did_skip_raw(&mut self, _filename: &str) {}
    fn session_did_fail(&mut self, _error: &Error) {}
    fn session_did_disconnect(&mut self) {}
}

fn dispatch_to_delegate(delegate: &mut dyn SessionDelegate, event: &SessionEvent) {
    match event {
        SessionEvent::Connected(info) => delegate.session_did_connect(info),
        SessionEvent::DetectedPhoto {
            handle,
            filename,
            capture_date,
            size,
        } => delegate.session_did_detect_photo(
            *handle,
            filename.as_deref(),
            capture_date.as_deref(),
            *size,
        ),
        SessionEvent::CompletedDownload { handle, bytes } => {
            delegate.session_did_complete_download(*handle, bytes)
        }
        SessionEvent::SkippedRaw { filename } => delegate.session_did_skip_raw(filename),
        SessionEvent::Failed(error) => delegate.session_did_fail(error),
        SessionEvent::Disconnected => delegate.session_did_disconnect(),
    }
}

struct SessionTasks {
    command_engine_join: tokio::task::JoinHandle<()>,
    /// `Some` until `start()` is called, at which point it is moved onto
    /// the event-source task and replaced by `event_source_join`.
    event_source: Option<Box<dyn EventSource>>,
    /// Resolves to the event source handed back once its loop exits, so
    /// `disconnect()` can run vendor-specific `cleanup()` on the same
    /// object that ran `start()`.
    event_source_join: Option<tokio::task::JoinHandle<Box<dyn EventSource>>>,
    orchestrator_join: Option<tokio::task::JoinHandle<()>>,
}

struct SessionInner {
    session_id: u32,
    guid: Uuid,
    host_name: String,
    connection_number: u32,
    device_name: String,
    vendor: Vendor,
    device_info: Arc<DeviceInfo>,
    config: ClientConfig,
    command_engine: CommandEngineHandle,
    command_cancel: CancellationToken,
    event_cancel: CancellationToken,
    run_cancel: CancellationToken,
    state: std::sync::Mutex<SessionState>,
    event_tx: flume::Sender<SessionEvent>,
    event_rx: flume::Receiver<SessionEvent>,
    tasks: AsyncMutex<Option<SessionTasks>>,
    disconnect_started: AtomicBool,
}

/// A connected camera session. `Session::connect` performs the full §4.4
/// handshake (including its commit point); `start` begins vendor event
/// polling and the download pipeline; `disconnect` tears both down in the
/// vendor-aware order §4.6 requires, idempotently. Cheap to clone: every
/// clone refers to the same underlying connection (there is exactly one
/// session per connection regardless of how many handles exist).
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

impl Session {
    /// Performs the full connect sequence against `addr`. Returns a session
    /// in the `Connected` state; call [`Session::start`] to begin producing
    /// events.
    pub async fn connect(addr: SocketAddr, guid: Uuid, config: ClientConfig) -> Result<Self> {
        let handshake::HandshakeResult {
            command_engine,
            command_engine_join,
            event_transport,
            connection_number,
            device_name,
            session_id,
            device_info,
        } = handshake::connect(addr, guid, &config).await?;

        let vendor = Vendor::from_device_info(&device_info);
        let event_cancel = event_transport.cancellation_token();
        let run_cancel = CancellationToken::new();

        let event_source = events::select_for_device(
            &device_info.manufacturer,
            command_engine.clone(),
            event_transport,
            &config,
        );

        let (event_tx, event_rx) = flume::unbounded();

        Ok(Self(Arc::new(SessionInner {
            session_id,
            guid,
            host_name: config.host_name.clone(),
            connection_number,
            device_name,
            vendor,
            device_info: Arc::new(device_info),
            config,
            command_cancel: command_engine.cancellation_token(),
            command_engine,
            event_cancel,
            run_cancel,
            state: std::sync::Mutex::new(SessionState::Connected),
            event_tx,
            event_rx,
            tasks: AsyncMutex::new(Some(SessionTasks {
                command_engine_join,
                event_source: Some(event_source),
                event_source_join: None,
                orchestrator_join: None,
            })),
            disconnect_started: AtomicBool::new(false),
        })))
    }

    pub fn session_id(&self) -> u32 {
        self.0.session_id
    }

    pub fn guid(&self) -> Uuid {
        self.0.guid
    }

    pub fn host_name(&self) -> &str {
        &self.0.host_name
    }

    pub fn connection_number(&self) -> u32 {
        self.0.connection_number
    }

    /// The device's self-reported name from `InitCommandAck`, distinct from
    /// `device_info().model` (the `GetDeviceInfo` model string) — some
    /// cameras report a user-assigned name here instead of a model number.
    pub fn device_name(&self) -> &str {
        &self.0.device_name
    }

    pub fn vendor(&self) -> Vendor {
        self.0.vendor
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.0.device_info
    }

    pub fn state(&self) -> SessionState {
        *self.0.state.lock().expect("session state mutex poisoned")
    }

    /// A cloneable receiver for consumers who want to drain events
    /// themselves instead of implementing [`SessionDelegate`].
    pub fn events(&self) -> flume::Receiver<SessionEvent> {
        self.0.event_rx.clone()
    }

    /// Begins vendor event polling and the download pipeline. Emits
    /// `Connected` immediately so it is always the first event a consumer
    /// observes. Transitions `Connected -> Running`.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.0.state.lock().expect("session state mutex poisoned");
            if *state != SessionState::Connected {
                return Ok(());
            }
            *state = SessionState::Running;
        }

        let _ = self
            .0
            .event_tx
            .send_async(SessionEvent::Connected(self.0.device_info.clone()))
            .await;

        let mut guard = self.0.tasks.lock().await;
        let tasks = guard.as_mut().expect("tasks taken before start");

        let (photo_tx, photo_rx) = flume::unbounded::<DetectedPhoto>();
        let run_cancel = self.0.run_cancel.clone();

        // Run the already-selected event source on its own task; it owns
        // no shared state besides the command engine handle and photo_tx,
        // so it can be cancelled independently of the orchestrator below.
        // The task hands the event source back on exit so `disconnect()`
        // can run vendor cleanup on the same object that ran `start()`.
        let mut event_source = tasks.event_source.take().expect("event source taken twice");
        let event_source_cancel = run_cancel.clone();
        let self_for_event_errors = self.clone();
        let event_source_join = tokio::spawn(async move {
            if let Err(e) = event_source.start(photo_tx, event_source_cancel).await {
                tracing::warn!(error = %e, "event source exited with an error");
                let _ = self_for_event_errors
                    .0
                    .event_tx
                    .send_async(SessionEvent::Failed(Arc::new(e)))
                    .await;
                let session = self_for_event_errors.clone();
                tokio::spawn(async move { let _ = session.disconnect().await; });
            }
            event_source
        });
        tasks.event_source_join = Some(event_source_join);

        let orchestrator = Orchestrator {
            command_engine: self.0.command_engine.clone(),
            config: self.0.config.clone(),
            vendor: self.0.vendor,
            event_tx: self.0.event_tx.clone(),
            session: self.clone(),
        };
        let orchestrator_join = tokio::spawn(orchestrator.run(photo_rx, run_cancel));
        tasks.orchestrator_join = Some(orchestrator_join);

        Ok(())
    }

    /// Closes the session. Safe to call from any state, any number of
    /// times: the teardown body runs exactly once; later calls observe the
    /// same `Closed` state and return immediately.
    pub async fn disconnect(&self) -> Result<()> {
        if self
            .0
            .disconnect_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        {
            let mut state = self.0.state.lock().expect("session state mutex poisoned");
            *state = SessionState::Disconnecting;
        }

        // Stop the event source and orchestrator loops first so vendor
        // cleanup (e.g. Canon's SetEventMode(0)) can still use the command
        // engine before we cancel its transport.
        self.0.run_cancel.cancel();

        let mut guard = self.0.tasks.lock().await;
        if let Some(mut tasks) = guard.take() {
            let recovered_event_source = match tasks.event_source_join.take() {
                Some(join) => match tokio::time::timeout(DISCONNECT_JOIN_TIMEOUT, join).await {
                    Ok(Ok(event_source)) => Some(event_source),
                    _ => None,
                },
                // start() was never called: nothing to clean up.
                None => None,
            };

            if let Some(mut event_source) = recovered_event_source {
                if let Err(e) = event_source.cleanup(&self.0.command_engine).await {
                    tracing::warn!(error = %e, "vendor event source cleanup failed");
                }
            }

            let _ = self
                .0
                .command_engine
                .simple(crate::proto::OperationCode::CloseSession.code(), vec![])
                .await;

            if let Some(join) = tasks.orchestrator_join.take() {
                let _ = tokio::time::timeout(DISCONNECT_JOIN_TIMEOUT, join).await;
            }

            self.0.command_cancel.cancel();
            self.0.event_cancel.cancel();
            tasks.command_engine_join.abort();
        }

        {
            let mut state = self.0.state.lock().expect("session state mutex poisoned");
            *state = SessionState::Closed;
        }

        let _ = self.0.event_tx.send_async(SessionEvent::Disconnected).await;
        Ok(())
    }

    /// Drains `events()` and dispatches each to `delegate` until
    /// `Disconnected` is observed or the channel closes. Convenience for
    /// consumers using the trait form instead of the channel form.
    pub async fn drive(&self, delegate: &mut dyn SessionDelegate) {
        while let Ok(event) = self.0.event_rx.recv_async().await {
            let is_terminal = matches!(event, SessionEvent::Disconnected);
            dispatch_to_delegate(delegate, &event);
            if is_terminal {
                break;
            }
        }
    }
}

/// Drains detected photos one at a time and runs the download pipeline for
/// each, emitting `DetectedPhoto`, then `CompletedDownload`/`SkippedRaw`, in
/// the order photos were detected. A single task, so there is nowhere for
/// two downloads to interleave.
struct Orchestrator {
    command_engine: CommandEngineHandle,
    config: ClientConfig,
    vendor: Vendor,
    event_tx: flume::Sender<SessionEvent>,
    session: Session,
}

impl Orchestrator {
    async fn run(self, photo_rx: flume::Receiver<DetectedPhoto>, cancel: CancellationToken) {
        loop {
            let photo = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                photo = photo_rx.recv_async() => match photo {
                    Ok(photo) => photo,
                    Err(_) => break,
                },
            };

            // The value exposed to the sink is `logical_id`, not the raw
            // wire handle: for Sony every in-memory capture shares the same
            // sentinel handle (`0xFFFFC001`), so the wire handle alone can't
            // distinguish two captures detected back to back. Every other
            // vendor's `DetectedPhoto::from_handle` sets `logical_id` equal
            // to `handle`, so this is a no-op for them.
            let public_handle = photo.logical_id;

            // No vendor event descriptor in this crate carries the object's
            // size, so it's read via `GetObjectInfo` before the detect event
            // goes out; `download_body` below reuses this same `ObjectInfo`
            // rather than fetching it again.
            let info = download::fetch_object_info(&self.command_engine, photo.handle).await;

            let _ = self
                .event_tx
                .send_async(SessionEvent::DetectedPhoto {
                    handle: public_handle,
                    filename: photo.filename.clone(),
                    capture_date: photo.capture_date.clone(),
                    size: info.as_ref().ok().map(|info| info.object_compressed_size),
                })
                .await;

            let outcome = match info {
                Ok(info) => {
                    download::download_body(
                        &self.command_engine,
                        photo.handle,
                        info,
                        &self.config,
                        self.vendor.supports_partial_object(),
                    )
                    .await
                }
                Err(error) => Err(error),
            };

            match outcome {
                Ok(DownloadOutcome::Downloaded {
                    filename: _,
                    capture_date: _,
                    bytes,
                }) => {
                    let _ = self
                        .event_tx
                        .send_async(SessionEvent::CompletedDownload {
                            handle: public_handle,
                            bytes,
                        })
                        .await;
                }
                Ok(DownloadOutcome::RawSkipped { filename }) => {
                    let _ = self
                        .event_tx
                        .send_async(SessionEvent::SkippedRaw { filename })
                        .await;
                }
                Err(error) => {
                    let fatal = error.is_fatal();
                    let _ = self
                        .event_tx
                        .send_async(SessionEvent::Failed(Arc::new(error)))
                        .await;
                    if fatal {
                        // Spawned separately: this task is itself
                        // `orchestrator_join`, and `disconnect()` awaits
                        // that handle, so calling it inline here would
                        // have the task wait on its own completion.
                        let session = self.session.clone();
                        tokio::spawn(async move { let _ = session.disconnect().await; });
                        break;
                    }
                }
            }
        }
    }
}

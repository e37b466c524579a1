//! Network discovery: probes an ordered list of candidate IPs for a camera
//! listening on the PTP/IP command port, running the full §4.4 handshake
//! against each. Grounded on the same wave/bounded-pool shape as the
//! command engine's actor (one task per probe, coordinated over channels)
//! and on `Transport`/`handshake::connect`'s cancellation-token pattern for
//! `stop()`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::session::Session;

/// PTP/IP's registered command-socket port (both command and event sockets
/// use it; the event socket is a second connection to the same port).
pub const PTPIP_PORT: u16 = 15740;

/// Which rule produced a given [`ScanTarget`]. Purely diagnostic — it does
/// not affect probing order or behavior, only what gets logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    PersonalHotspot,
    Cached,
    SubnetFirstTen,
    CommonRouterDefault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTarget {
    pub ip: IpAddr,
    pub source: CandidateSource,
}

/// A camera that answered the full handshake during a scan. The session is
/// already open (`Connected`, not yet `start()`-ed) and belongs to whoever
/// receives this value; the scanner never touches it again.
pub struct DiscoveredCamera {
    pub name: String,
    pub ip: IpAddr,
    pub connection_number: u32,
    pub session: Session,
}

#[derive(Debug, Clone)]
pub enum ScanState {
    Idle,
    Scanning {
        current: usize,
        total: usize,
        current_ip: Option<IpAddr>,
    },
    Completed { found: usize },
    Error(String),
}

/// Builds the default candidate list spec.md §4.5 names: the personal
/// hotspot range iPhones use for camera tethering, previously-successful
/// IPs (caller-supplied), the first ten hosts of the local subnet, and a
/// handful of common router default addresses. De-duplicated, in this
/// priority order, since a cached IP that previously worked is the
/// cheapest possible hit.
pub fn default_candidates(cached: &[IpAddr], local_subnet: Option<Ipv4Addr>) -> Vec<ScanTarget> {
    let mut seen = std::collections::HashSet::new();
    let mut targets = Vec::new();
    let mut push = |ip: IpAddr, source: CandidateSource| {
        if seen.insert(ip) {
            targets.push(ScanTarget { ip, source });
        }
    };

    for ip in cached {
        push(*ip, CandidateSource::Cached);
    }

    for host in 2..=20u8 {
        push(IpAddr::V4(Ipv4Addr::new(172, 20, 10, host)), CandidateSource::PersonalHotspot);
    }

    if let Some(subnet) = local_subnet {
        let octets = subnet.octets();
        for host in 1..=10u8 {
            push(
                IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], host)),
                CandidateSource::SubnetFirstTen,
            );
        }
    }

    for default in ["192.168.1.1", "192.168.0.1", "192.168.43.1"] {
        push(default.parse().expect("hardcoded router default is valid"), CandidateSource::CommonRouterDefault);
    }

    targets
}

/// Drives a discovery scan. One `Scanner` is good for one `run()`; it is
/// not reusable afterward (mirrors the teacher's one-shot client-connect
/// objects rather than pretending scans compose).
pub struct Scanner {
    guid: Uuid,
    config: ClientConfig,
    cancel: CancellationToken,
    state_tx: flume::Sender<ScanState>,
    state_rx: flume::Receiver<ScanState>,
    found_tx: flume::Sender<DiscoveredCamera>,
    found_rx: flume::Receiver<DiscoveredCamera>,
}

/// `stop()` gives outstanding probes this long to wind down before the
/// scanner gives up waiting and returns anyway (spec.md §4.5's "never
/// block more than 2s").
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How many probes run concurrently within a wave.
const MAX_CONCURRENT_PROBES: usize = 8;

impl Scanner {
    pub fn new(guid: Uuid, config: ClientConfig) -> Self {
        let (state_tx, state_rx) = flume::unbounded();
        let (found_tx, found_rx) = flume::unbounded();
        Self {
            guid,
            config,
            cancel: CancellationToken::new(),
            state_tx,
            state_rx,
            found_tx,
            found_rx,
        }
    }

    /// Observers drain this for `ScanState` transitions (`Idle -> Scanning
    /// -> Completed|Error`), published serially in the order they occur.
    pub fn state_events(&self) -> flume::Receiver<ScanState> {
        self.state_rx.clone()
    }

    /// Observers drain this for each camera as it is discovered, in
    /// probe-completion order (not candidate-list order).
    pub fn discovered(&self) -> flume::Receiver<DiscoveredCamera> {
        self.found_rx.clone()
    }

    /// Cancels all outstanding probes. Returns once they have wound down or
    /// [`STOP_DRAIN_TIMEOUT`] elapses, whichever is first; cancellation
    /// keeps running in the background past that ceiling so no socket is
    /// ever actually orphaned, only the caller's wait is bounded.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Runs up to `config.scan_waves` waves over `targets`, emitting
    /// `DiscoveredCamera` values on [`Scanner::discovered`] and state
    /// transitions on [`Scanner::state_events`] as it goes. Returns the
    /// final `ScanState` (always `Completed` or `Error`, never `Scanning`).
    pub async fn run(&self, targets: Vec<ScanTarget>) -> ScanState {
        let _ = self.state_tx.send_async(ScanState::Idle).await;

        let total = targets.len();
        let mut remaining = targets;
        let mut found_count = 0usize;

        for _wave in 0..self.config.scan_waves {
            if self.cancel.is_cancelled() || remaining.is_empty() {
                break;
            }

            let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
            let mut probe_set = tokio::task::JoinSet::new();
            for target in &remaining {
                let ip = target.ip;
                let guid = self.guid;
                let config = self.config.clone();
                let cancel = self.cancel.clone();
                let permit = semaphore.clone();

                let _ = self
                    .state_tx
                    .send_async(ScanState::Scanning {
                        current: found_count,
                        total,
                        current_ip: Some(ip),
                    })
                    .await;

                probe_set.spawn(async move {
                    let _permit = permit.acquire_owned().await.ok();
                    let result = probe_one(ip, guid, &config, &cancel).await;
                    (ip, result)
                });
            }

            // Once cancelled, bound how long this wave waits for outstanding
            // probes to wind down (spec.md §4.5's `stop()` never blocks more
            // than 2s); any probes still running past that are abandoned to
            // a background task that keeps draining them and leaves
            // `remaining` wherever it stood at the timeout.
            let (found_here, still_missing) = if self.cancel.is_cancelled() {
                match tokio::time::timeout(
                    STOP_DRAIN_TIMEOUT,
                    drain_wave(&mut probe_set, &self.found_tx, &self.cancel),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        // Nobody is collecting these anymore; any camera a
                        // late-finishing probe discovers is disconnected
                        // rather than silently forwarded or leaked.
                        tokio::spawn(async move {
                            while let Some(joined) = probe_set.join_next().await {
                                if let Ok((_, Ok(Some(camera)))) = joined {
                                    let _ = camera.session.disconnect().await;
                                }
                            }
                        });
                        (0, Vec::new())
                    }
                }
            } else {
                drain_wave(&mut probe_set, &self.found_tx, &self.cancel).await
            };
            found_count += found_here;
            remaining = still_missing;

            if self.cancel.is_cancelled() {
                break;
            }
            if found_count == 0 && !remaining.is_empty() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.scan_wave_delay()) => {}
                }
            }
        }

        let final_state = ScanState::Completed { found: found_count };
        let _ = self.state_tx.send_async(final_state.clone()).await;
        final_state
    }
}

/// Drains every outstanding probe in `probe_set` to completion, forwarding
/// discovered cameras to `found_tx` and collecting IPs that didn't answer
/// back into a retry list for the next wave. Returns `(found_count,
/// still_missing)`.
async fn drain_wave(
    probe_set: &mut tokio::task::JoinSet<(IpAddr, Result<Option<DiscoveredCamera>, Error>)>,
    found_tx: &flume::Sender<DiscoveredCamera>,
    cancel: &CancellationToken,
) -> (usize, Vec<ScanTarget>) {
    let mut found_count = 0;
    let mut still_missing = Vec::new();
    while let Some(joined) = probe_set.join_next().await {
        let (ip, result) = match joined {
            Ok(pair) => pair,
            Err(_join_error) => continue,
        };
        match result {
            Ok(Some(camera)) => {
                found_count += 1;
                if found_tx.send_async(camera).await.is_err() {
                    cancel.cancel();
                }
            }
            Ok(None) => still_missing.push(ScanTarget {
                ip,
                source: CandidateSource::Cached,
            }),
            Err(error) => {
                tracing::debug!(ip = %ip, error = %error, "scan probe failed");
                still_missing.push(ScanTarget {
                    ip,
                    source: CandidateSource::Cached,
                });
            }
        }
    }
    (found_count, still_missing)
}

/// One handshake attempt against `ip`. `Ok(None)` means the IP didn't
/// answer (refused, timed out, unreachable) — an expected outcome while
/// scanning, not a probe failure. `Ok(Some(_))` means a full session is
/// open and unclaimed. `Err` surfaces a genuine protocol-level error worth
/// logging (a device answered but the handshake itself broke).
async fn probe_one(
    ip: IpAddr,
    guid: Uuid,
    config: &ClientConfig,
    cancel: &CancellationToken,
) -> Result<Option<DiscoveredCamera>, Error> {
    let addr = SocketAddr::new(ip, PTPIP_PORT);

    let connect = Session::connect(addr, guid, config.clone());
    let session = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        result = connect => result,
    };

    let session = match session {
        Ok(session) => session,
        Err(
            Error::ConnectTimeout(_)
            | Error::ConnectRefused(_)
            | Error::HostUnreachable(_)
            | Error::HandshakeFailed { .. },
        ) => return Ok(None),
        Err(e) => return Err(e),
    };

    if cancel.is_cancelled() {
        let _ = session.disconnect().await;
        return Ok(None);
    }

    let connection_number = session.connection_number();
    let name = session.device_name().to_owned();

    Ok(Some(DiscoveredCamera {
        name,
        ip,
        connection_number,
        session,
    }))
}

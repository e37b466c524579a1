//! The per-photo download pipeline: `GetObjectInfo` → RAW filter →
//! `GetObject`/`GetPartialObject` → sink. Runs strictly one object at a
//! time, driven by the session facade, so sink delivery order always
//! matches detection order (the command engine's own serialization makes
//! this free — there is nowhere for two downloads to interleave).

use bytes::{Bytes, BytesMut};

use crate::config::{ClientConfig, RawPolicy};
use crate::error::{Error, Result};
use crate::proto::{ObjectInfo, OperationCode};
use crate::session::command_engine::CommandEngineHandle;

/// What the download pipeline produced for one detected photo.
pub enum DownloadOutcome {
    Downloaded {
        filename: String,
        capture_date: String,
        bytes: Bytes,
    },
    RawSkipped {
        filename: String,
    },
}

/// Issues `GetObjectInfo(0x1008)` for `handle` and parses the reply. Split
/// out from [`download_body`] so the session can read the object's size
/// (for `session_did_detect_photo`) before the RAW filter and body fetch
/// run, without paying for two `GetObjectInfo` round trips.
pub async fn fetch_object_info(command_engine: &CommandEngineHandle, handle: u32) -> Result<ObjectInfo> {
    let info_reply = command_engine
        .simple(OperationCode::GetObjectInfo.code(), vec![handle])
        .await
        .map_err(|e| wrap_download_error(handle, e))?;
    if !info_reply.response.is_ok() {
        return Err(Error::DownloadFailed {
            handle,
            reason: format!(
                "GetObjectInfo failed with response code 0x{:04x}",
                info_reply.response.code
            ),
        });
    }
    let data = info_reply.data_in.ok_or_else(|| Error::DownloadFailed {
        handle,
        reason: "GetObjectInfo returned no data phase".into(),
    })?;
    ObjectInfo::parse(&data).map_err(|e| Error::DownloadFailed {
        handle,
        reason: e.to_string(),
    })
}

/// Applies the RAW filter to an already-fetched `info`, and — unless
/// skipped — downloads the full object body. `supports_partial_object`
/// selects `GetPartialObject` chunked transfer (Sony) over a single
/// `GetObject` data phase (everyone else).
pub async fn download_body(
    command_engine: &CommandEngineHandle,
    handle: u32,
    info: ObjectInfo,
    config: &ClientConfig,
    supports_partial_object: bool,
) -> Result<DownloadOutcome> {
    if info.is_raw() && matches!(config.raw_policy, RawPolicy::JpegOnly) {
        return Ok(DownloadOutcome::RawSkipped {
            filename: info.filename,
        });
    }

    let bytes = if supports_partial_object {
        download_partial(command_engine, handle, info.object_compressed_size, config).await?
    } else {
        download_whole(command_engine, handle).await?
    };

    Ok(DownloadOutcome::Downloaded {
        filename: info.filename,
        capture_date: info.capture_date,
        bytes,
    })
}

/// Fetches object info for `handle`, applies the RAW filter, and — unless
/// skipped — downloads the full object body. Convenience wrapper over
/// [`fetch_object_info`] + [`download_body`] for callers that don't need
/// the info in between (tests; any future non-session caller).
pub async fn download(
    command_engine: &CommandEngineHandle,
    handle: u32,
    config: &ClientConfig,
    supports_partial_object: bool,
) -> Result<DownloadOutcome> {
    let info = fetch_object_info(command_engine, handle).await?;
    download_body(command_engine, handle, info, config, supports_partial_object).await
}

async fn download_whole(command_engine: &CommandEngineHandle, handle: u32) -> Result<Bytes> {
    let reply = command_engine
        .simple(OperationCode::GetObject.code(), vec![handle])
        .await
        .map_err(|e| wrap_download_error(handle, e))?;
    if !reply.response.is_ok() {
        return Err(Error::DownloadFailed {
            handle,
            reason: format!("GetObject failed with response code 0x{:04x}", reply.response.code),
        });
    }
    reply.data_in.ok_or_else(|| Error::DownloadFailed {
        handle,
        reason: "GetObject returned no data phase".into(),
    })
}

async fn download_partial(
    command_engine: &CommandEngineHandle,
    handle: u32,
    total_size: u64,
    config: &ClientConfig,
) -> Result<Bytes> {
    let chunk_size = config.partial_object_chunk_bytes as u64;
    let mut out = BytesMut::with_capacity(total_size as usize);
    let mut offset: u64 = 0;

    while offset < total_size {
        let this_chunk = chunk_size.min(total_size - offset);
        let reply = command_engine
            .simple(
                OperationCode::GetPartialObject.code(),
                vec![handle, offset as u32, this_chunk as u32],
            )
            .await
            .map_err(|e| wrap_download_error(handle, e))?;
        if !reply.response.is_ok() {
            return Err(Error::DownloadFailed {
                handle,
                reason: format!(
                    "GetPartialObject failed with response code 0x{:04x}",
                    reply.response.code
                ),
            });
        }
        let chunk = reply.data_in.ok_or_else(|| Error::DownloadFailed {
            handle,
            reason: "GetPartialObject returned no data phase".into(),
        })?;
        offset += chunk.len() as u64;
        out.extend_from_slice(&chunk);
        if chunk.is_empty() {
            break;
        }
    }

    Ok(out.freeze())
}

/// Only a genuinely lost command socket (or a framing violation, which
/// means the peer can no longer be trusted at all) tears down the session.
/// Everything else observed while fetching a single object — a timeout, an
/// error response code — is this object's problem alone.
fn wrap_download_error(handle: u32, error: Error) -> Error {
    match error {
        fatal @ (Error::Io(_) | Error::PeerClosed | Error::Cancelled | Error::Framing(_) | Error::ProtocolError(_)) => {
            fatal
        }
        other => Error::DownloadFailed {
            handle,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_command_failed_as_download_failed() {
        let wrapped = wrap_download_error(
            0x1234,
            Error::CommandFailed {
                opcode: 0x1008,
                response_code: 0x2002,
            },
        );
        assert!(matches!(wrapped, Error::DownloadFailed { handle: 0x1234, .. }));
    }

    #[test]
    fn wraps_timeout_as_download_failed() {
        let wrapped = wrap_download_error(0x1234, Error::Timeout);
        assert!(matches!(wrapped, Error::DownloadFailed { handle: 0x1234, .. }));
    }

    #[test]
    fn preserves_transport_level_fatal_errors() {
        let wrapped = wrap_download_error(0x1234, Error::PeerClosed);
        assert!(matches!(wrapped, Error::PeerClosed));
    }
}

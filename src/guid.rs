//! Persistent client GUID: generated once with [`uuid::Uuid::new_v4`] and
//! cached to a small JSON file so repeat connections to the same camera
//! present a stable identity across process restarts, the way the PTP/IP
//! spec expects a host's GUID to be durable rather than re-rolled per run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::WireGuid;
use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct GuidFile {
    guid: Uuid,
}

/// Loads the GUID at `path`, creating and persisting a fresh one if the
/// file does not exist yet. Parent directories are created as needed.
pub fn load_or_create(path: &Path) -> Result<Uuid> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let parsed: GuidFile = serde_json::from_str(&contents)
                .map_err(|e| Error::ProtocolError(format!("malformed guid store: {e}")))?;
            Ok(parsed.guid)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let guid = Uuid::new_v4();
            persist(path, guid)?;
            Ok(guid)
        }
        Err(e) => Err(Error::Io(e)),
    }
}

fn persist(path: &Path, guid: Uuid) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_json::to_string_pretty(&GuidFile { guid })
        .expect("GuidFile serialization is infallible");
    std::fs::write(path, contents)?;
    Ok(())
}

/// The default location for the GUID store, next to wherever the OS keeps
/// other small per-user application state.
pub fn default_store_path() -> PathBuf {
    dirs_path().join("ptpip-camera-client").join("client_guid.json")
}

fn dirs_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn to_wire(guid: Uuid) -> WireGuid {
    *guid.as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_then_reuses_guid() {
        let dir = std::env::temp_dir().join(format!("ptpip-guid-test-{}", Uuid::new_v4()));
        let path = dir.join("guid.json");

        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first, second);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn wire_guid_round_trips_bytes() {
        let guid = Uuid::new_v4();
        let wire = to_wire(guid);
        assert_eq!(wire, *guid.as_bytes());
    }
}

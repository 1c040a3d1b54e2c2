//! Durable store kept as a single JSON document on disk.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use netguard_core::{DeviceSnapshot, DeviceState, ScanSummary, StateTransition};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::state::{StoreDocument, StoreState, DOCUMENT_VERSION};
use crate::{CycleRecord, DeviceStore, Result, StoreError};

/// [`DeviceStore`] persisted to one JSON file.
///
/// The full database is held in memory. Each write applies the change to
/// a copy, writes and syncs the copy to `{path}.tmp` and renames it over `path`;
/// only after the rename succeeds does the in-memory copy change. A crash
/// mid-write leaves the previous document intact.
pub struct JsonFileStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let doc: StoreDocument = serde_json::from_slice(&bytes)?;
                if doc.version != DOCUMENT_VERSION {
                    return Err(StoreError::InvalidRecord(format!(
                        "unsupported store version {} in {}",
                        doc.version,
                        path.display()
                    )));
                }
                StoreState::from_document(doc)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(io_error(&path, e)),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        tracing::info!(path = %path.display(), "Device store opened");
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the state, flush it, then publish it.
    async fn mutate<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut StoreState) -> Result<()> + Send,
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        change(&mut next)?;

        let json = serde_json::to_vec_pretty(&next.to_document())?;
        let tmp = self.path.with_extension("tmp");
        write_synced(&tmp, &json)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;

        *guard = next;
        Ok(())
    }
}

/// Write `bytes` and flush them to the device before returning.
async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl DeviceStore for JsonFileStore {
    async fn get_prior_state(&self, address: IpAddr) -> Result<Option<DeviceState>> {
        Ok(self.state.read().await.device(address))
    }

    async fn list_devices(&self) -> Result<Vec<DeviceState>> {
        Ok(self.state.read().await.devices())
    }

    async fn upsert_device(&self, device: &DeviceState) -> Result<()> {
        self.mutate(|s| {
            s.upsert_device(device);
            Ok(())
        })
        .await
    }

    async fn append_transition(&self, transition: &StateTransition) -> Result<()> {
        self.mutate(|s| s.append_transition(transition)).await
    }

    async fn apply_operator_change(
        &self,
        device: &DeviceState,
        transition: Option<&StateTransition>,
    ) -> Result<()> {
        self.mutate(|s| s.apply_operator_change(device, transition))
            .await
    }

    async fn persist_cycle(&self, record: &CycleRecord) -> Result<()> {
        self.mutate(|s| s.apply_cycle(record)).await?;
        tracing::debug!(
            path = %self.path.display(),
            devices = record.devices.len(),
            transitions = record.transitions.len(),
            "Cycle persisted"
        );
        Ok(())
    }

    async fn transitions(&self, address: Option<IpAddr>) -> Result<Vec<StateTransition>> {
        Ok(self.state.read().await.transitions(address))
    }

    async fn scan_history(&self, limit: usize) -> Result<Vec<ScanSummary>> {
        Ok(self.state.read().await.scan_history(limit))
    }

    async fn snapshots(&self, address: IpAddr, limit: usize) -> Result<Vec<DeviceSnapshot>> {
        Ok(self.state.read().await.snapshots(address, limit))
    }
}

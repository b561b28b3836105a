//! Snapshot persistence with write coalescing.
//!
//! Mutations apply to the in-memory document immediately (readers get
//! read-your-writes through the shared lock) and are flushed to disk by
//! a background writer that batches everything arriving within a 200 ms
//! window into one temp-write/fsync/rename cycle. `mutate` resolves only
//! after the batch containing the mutation has reached disk, which is
//! what lets the admin API respond "persisted" truthfully.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, error, info};

use super::{ProxyState, SCHEMA_VERSION};
use crate::errors::StateError;

const COALESCE_WINDOW: Duration = Duration::from_millis(200);

type Ack = oneshot::Sender<Result<(), String>>;

#[derive(Clone)]
pub struct StateStore {
    doc: Arc<RwLock<ProxyState>>,
    path: Arc<PathBuf>,
    dirty_tx: mpsc::UnboundedSender<Ack>,
}

impl StateStore {
    /// Read the snapshot (or initialize an empty one if the file is
    /// missing) and start the background writer. A snapshot that exists
    /// but does not parse is a refusal to start, never an overwrite.
    pub async fn open(path: PathBuf) -> Result<Self, StateError> {
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => parse_state(&path, &raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("[PROXY] no state file at {}, starting empty", path.display());
                ProxyState::empty()
            }
            Err(e) => return Err(StateError::io(path.display().to_string(), e)),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StateError::io(parent.display().to_string(), e))?;
        }

        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let store = Self {
            doc: Arc::new(RwLock::new(doc)),
            path: Arc::new(path),
            dirty_tx,
        };

        tokio::spawn(writer_loop(
            store.doc.clone(),
            store.path.clone(),
            dirty_rx,
        ));

        Ok(store)
    }

    /// Run a closure against the current document.
    pub async fn read<R>(&self, f: impl FnOnce(&ProxyState) -> R) -> R {
        f(&*self.doc.read().await)
    }

    /// Apply a mutation and wait until it has been persisted.
    pub async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut ProxyState) -> R,
    ) -> Result<R, StateError> {
        let result = {
            let mut doc = self.doc.write().await;
            f(&mut doc)
        };
        self.flush().await?;
        Ok(result)
    }

    /// Wait for everything mutated so far to reach disk.
    pub async fn flush(&self) -> Result<(), StateError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.dirty_tx.send(ack_tx).map_err(|_| StateError::Closed)?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(StateError::Io {
                path: self.path.display().to_string(),
                source: std::io::Error::other(message),
            }),
            Err(_) => Err(StateError::Closed),
        }
    }
}

fn parse_state(path: &Path, raw: &str) -> Result<ProxyState, StateError> {
    let state: ProxyState = serde_json::from_str(raw).map_err(|e| StateError::Corrupt {
        path: path.display().to_string(),
        offset: byte_offset(raw, e.line(), e.column()),
        message: e.to_string(),
    })?;
    if state.schema_version != SCHEMA_VERSION {
        return Err(StateError::SchemaVersion {
            found: state.schema_version,
            expected: SCHEMA_VERSION,
        });
    }
    Ok(state)
}

/// Translate serde_json's 1-based line/column into a byte offset for
/// the corruption report.
fn byte_offset(raw: &str, line: usize, column: usize) -> usize {
    let mut offset = 0;
    for (i, text) in raw.split_inclusive('\n').enumerate() {
        if i + 1 == line {
            return offset + column.saturating_sub(1).min(text.len());
        }
        offset += text.len();
    }
    offset
}

async fn writer_loop(
    doc: Arc<RwLock<ProxyState>>,
    path: Arc<PathBuf>,
    mut dirty_rx: mpsc::UnboundedReceiver<Ack>,
) {
    while let Some(first) = dirty_rx.recv().await {
        let mut acks = vec![first];

        // Coalesce everything that arrives inside the window.
        let window = tokio::time::sleep(COALESCE_WINDOW);
        tokio::pin!(window);
        loop {
            tokio::select! {
                more = dirty_rx.recv() => match more {
                    Some(ack) => acks.push(ack),
                    None => break,
                },
                _ = &mut window => break,
            }
        }

        let snapshot = {
            let doc = doc.read().await;
            serde_json::to_vec_pretty(&*doc)
        };

        let outcome = match snapshot {
            Ok(bytes) => write_atomic(&path, &bytes).await,
            Err(e) => Err(std::io::Error::other(e.to_string())),
        };

        match &outcome {
            Ok(()) => debug!("[PROXY] state flushed ({} mutations)", acks.len()),
            Err(e) => error!("[PROXY] state flush failed: {e}"),
        }

        let result = outcome.map_err(|e| e.to_string());
        for ack in acks {
            let _ = ack.send(result.clone());
        }
    }
}

/// Temp-write, fsync, rename. The canonical path never holds a partial
/// document.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    if let Some(parent) = path.parent() {
        // Make the rename itself durable.
        if let Ok(dir) = tokio::fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RouteRecord;
    use iop_common::api::HealthStatus;

    fn route(target: &str) -> RouteRecord {
        RouteRecord {
            target: target.to_string(),
            project: "demo".to_string(),
            health_path: "/up".to_string(),
            ssl: true,
            health: HealthStatus::Unknown,
            request_timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn mutations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(path.clone()).await.unwrap();
        store
            .mutate(|state| {
                state.staging = true;
                state
                    .routes
                    .insert("demo.example".to_string(), route("demo-web:3000"));
            })
            .await
            .unwrap();

        let reopened = StateStore::open(path).await.unwrap();
        let (staging, target) = reopened
            .read(|state| {
                (
                    state.staging,
                    state.routes.get("demo.example").map(|r| r.target.clone()),
                )
            })
            .await;
        assert!(staging);
        assert_eq!(target.as_deref(), Some("demo-web:3000"));
    }

    #[tokio::test]
    async fn corrupt_state_refuses_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{\"schema_version\": 1, \"routes\": {")
            .await
            .unwrap();

        let err = StateStore::open(path.clone()).await.unwrap_err();
        match err {
            StateError::Corrupt { offset, .. } => assert!(offset > 0),
            other => panic!("expected corrupt, got {other}"),
        }
        // The file was not overwritten.
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.ends_with('{'));
    }

    #[tokio::test]
    async fn coalesced_writes_ack_every_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::open(path).await.unwrap();

        let a = store.mutate(|s| s.routes.insert("a.example".into(), route("a:1")));
        let b = store.mutate(|s| s.routes.insert("b.example".into(), route("b:2")));
        let (a, b) = tokio::join!(a, b);
        a.unwrap();
        b.unwrap();

        let count = store.read(|s| s.routes.len()).await;
        assert_eq!(count, 2);
    }

    #[test]
    fn byte_offset_counts_lines() {
        let raw = "line one\nline two\n";
        assert_eq!(byte_offset(raw, 1, 1), 0);
        assert_eq!(byte_offset(raw, 2, 1), 9);
        assert_eq!(byte_offset(raw, 2, 5), 13);
    }
}

//! Durable snapshot of application state across process generations.
//!
//! One named blob on disk, written when a generation stops or hands off and
//! read once when the next generation starts. The encoding is pluggable via
//! [`SnapshotCodec`]; [`JsonCodec`] is the default.

use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Error produced by a codec.
pub type CodecError = Box<dyn std::error::Error + Send + Sync>;

/// Encodes and decodes a state value.
pub trait SnapshotCodec<S>: Send + Sync {
    fn encode(&self, state: &S) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<S, CodecError>;
}

/// Pretty-printed JSON encoding through serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<S> SnapshotCodec<S> for JsonCodec
where
    S: Serialize + DeserializeOwned,
{
    fn encode(&self, state: &S) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec_pretty(state)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<S, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Snapshot errors.
///
/// `Corrupt` and `Read` are fatal at startup. `Encode` and `Write` happen
/// during shutdown and are only logged by the caller.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: CodecError,
    },

    #[error("failed to read snapshot {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] CodecError),

    #[error("failed to write snapshot {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of [`SnapshotStore::restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restored<S> {
    pub state: S,
    /// `false` when no snapshot existed and `state` is the zero value.
    pub found: bool,
}

/// Reads and writes one snapshot location.
#[derive(Debug, Clone)]
pub struct SnapshotStore<S, C = JsonCodec> {
    path: PathBuf,
    codec: C,
    _state: PhantomData<fn() -> S>,
}

impl<S> SnapshotStore<S, JsonCodec>
where
    S: Serialize + DeserializeOwned,
{
    /// JSON-encoded store at `path`.
    pub fn json(path: impl Into<PathBuf>) -> Self {
        Self::with_codec(path, JsonCodec)
    }
}

impl<S, C> SnapshotStore<S, C>
where
    C: SnapshotCodec<S>,
{
    pub fn with_codec(path: impl Into<PathBuf>, codec: C) -> Self {
        Self {
            path: path.into(),
            codec,
            _state: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the snapshot with `state`.
    ///
    /// Writes a sibling temp file, syncs it and renames it into place, so a
    /// reader never observes a half-written snapshot.
    pub async fn save(&self, state: &S) -> Result<(), SnapshotError> {
        let bytes = self.codec.encode(state).map_err(SnapshotError::Encode)?;
        let tmp = self.temp_path();

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &self.path).await
        };

        if let Err(source) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SnapshotError::Write {
                path: self.path.clone(),
                source,
            });
        }

        info!(path = %self.path.display(), bytes = bytes.len(), "Snapshot saved");
        Ok(())
    }

    /// Read the snapshot, or the zero state if none was ever written.
    pub async fn restore(&self) -> Result<Restored<S>, SnapshotError>
    where
        S: Default,
    {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot found, starting from zero state");
                return Ok(Restored {
                    state: S::default(),
                    found: false,
                });
            }
            Err(source) => {
                return Err(SnapshotError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let state = self
            .codec
            .decode(&bytes)
            .map_err(|source| SnapshotError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        info!(path = %self.path.display(), "Snapshot restored");
        Ok(Restored { state, found: true })
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Counters {
        handled: u64,
        label: String,
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::<Counters>::json(dir.path().join("state.json"));
        let state = Counters {
            handled: 42,
            label: "gen-1".to_string(),
        };

        store.save(&state).await.unwrap();
        let restored = store.restore().await.unwrap();

        assert!(restored.found);
        assert_eq!(restored.state, state);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_zero_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::<Counters>::json(dir.path().join("never-written.json"));

        let restored = store.restore().await.unwrap();
        assert_eq!(
            restored,
            Restored {
                state: Counters::default(),
                found: false
            }
        );
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{\"handled\": \"not a number\"").unwrap();

        let store = SnapshotStore::<Counters>::json(&path);
        let err = store.restore().await.unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::<Counters>::json(dir.path().join("state.json"));

        store
            .save(&Counters {
                handled: 1,
                label: "old".to_string(),
            })
            .await
            .unwrap();
        store
            .save(&Counters {
                handled: 2,
                label: "new".to_string(),
            })
            .await
            .unwrap();

        let restored = store.restore().await.unwrap();
        assert_eq!(restored.state.handled, 2);
        assert_eq!(restored.state.label, "new");
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::<Counters>::json(dir.path().join("missing-dir").join("state.json"));

        let err = store.save(&Counters::default()).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Write { .. }));
    }

    /// Any codec satisfying encode/decode can back the store.
    struct DecimalCodec;

    impl SnapshotCodec<u64> for DecimalCodec {
        fn encode(&self, state: &u64) -> Result<Vec<u8>, CodecError> {
            Ok(state.to_string().into_bytes())
        }

        fn decode(&self, bytes: &[u8]) -> Result<u64, CodecError> {
            Ok(std::str::from_utf8(bytes)?.trim().parse()?)
        }
    }

    #[tokio::test]
    async fn test_custom_codec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("count");
        let store = SnapshotStore::<u64, _>::with_codec(&path, DecimalCodec);

        store.save(&7).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "7");
        assert_eq!(store.restore().await.unwrap().state, 7);

        std::fs::write(&path, "seven").unwrap();
        assert!(matches!(
            store.restore().await,
            Err(SnapshotError::Corrupt { .. })
        ));
    }
}

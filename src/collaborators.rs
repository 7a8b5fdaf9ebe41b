//! Interfaces to the rest of the recorder: the stream list and snapshot capture

use crate::config::NvrConfig;
use bytes::Bytes;
use std::path::PathBuf;
use tracing::debug;

/// A camera stream as reported by the recorder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub enabled: bool,
}

/// Lists the recorder's configured streams
pub trait StreamStore: Send + Sync {
    fn list_streams(&self) -> Vec<StreamInfo>;
}

/// Produces the latest JPEG snapshot of a stream, if one is available
pub trait SnapshotSource: Send + Sync {
    fn get_snapshot(&self, stream: &str) -> Option<Bytes>;
}

/// Stream list taken from the `[[streams]]` configuration tables
#[derive(Debug, Clone, Default)]
pub struct ConfigStreamStore {
    streams: Vec<StreamInfo>,
}

impl ConfigStreamStore {
    pub fn new(streams: Vec<StreamInfo>) -> Self {
        Self { streams }
    }

    pub fn from_config(config: &NvrConfig) -> Self {
        Self::new(
            config
                .streams
                .iter()
                .map(|s| StreamInfo {
                    name: s.name.clone(),
                    enabled: s.enabled,
                })
                .collect(),
        )
    }
}

impl StreamStore for ConfigStreamStore {
    fn list_streams(&self) -> Vec<StreamInfo> {
        self.streams.clone()
    }
}

/// Reads `{directory}/{stream}.jpg`, written by the recorder's snapshot pipeline
#[derive(Debug, Clone)]
pub struct DirectorySnapshotSource {
    directory: PathBuf,
}

impl DirectorySnapshotSource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

impl SnapshotSource for DirectorySnapshotSource {
    fn get_snapshot(&self, stream: &str) -> Option<Bytes> {
        let path = self.directory.join(format!("{stream}.jpg"));
        match std::fs::read(&path) {
            Ok(data) if !data.is_empty() => Some(Bytes::from(data)),
            Ok(_) => None,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No snapshot available");
                None
            }
        }
    }
}

/// Snapshot source used when no snapshot directory is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshots;

impl SnapshotSource for NoSnapshots {
    fn get_snapshot(&self, _stream: &str) -> Option<Bytes> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_stream_store_lists_configured_streams() {
        let store = ConfigStreamStore::from_config(&NvrConfig::test_config());
        assert_eq!(
            store.list_streams(),
            vec![StreamInfo {
                name: "Front Door".to_string(),
                enabled: true
            }]
        );
    }

    #[test]
    fn test_directory_snapshot_source_reads_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("garage.jpg"), [0xFFu8, 0xD8, 0xFF]).unwrap();
        std::fs::write(dir.path().join("empty.jpg"), b"").unwrap();

        let source = DirectorySnapshotSource::new(dir.path());

        assert_eq!(
            source.get_snapshot("garage").as_deref(),
            Some(&[0xFF, 0xD8, 0xFF][..])
        );
        assert!(source.get_snapshot("empty").is_none());
        assert!(source.get_snapshot("missing").is_none());
    }
}

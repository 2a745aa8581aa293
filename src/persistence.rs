/// Persistence of node memories and network snapshots.
///
/// Two layers live here:
///
/// - [`NodeStorage`], the per-node capability: a node memory is an opaque
///   blob keyed by node identifier. [`InMemoryStorage`] is the default;
///   [`FileStorage`] keeps one JSON file per node.
/// - Whole-network snapshots: [`save`] writes every fact held by a network
///   to a single file, [`load`] reads it back and [`NetworkSnapshot::replay`]
///   asserts the facts into a network compiled from the same program.
///
/// Files are written to a temporary path first and then renamed, so a crash
/// never leaves a half-written snapshot behind.
///
/// # Usage
///
/// ```ignore
/// persistence::save(&network, &path).await?;
///
/// let snapshot = persistence::load(&path).await?;
/// snapshot.replay(&fresh_network)?;
/// ```
use crate::error::{ReteError, ReteResult};
use crate::memory::MemorySnapshot;
use crate::network::ReteNetwork;
use crate::types::Fact;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;
use uuid::Uuid;

/// Format version of network snapshots.
const SNAPSHOT_VERSION: u32 = 1;

/// Storage of node memories keyed by node identifier.
///
/// Implementations are called from inside propagation and must not block
/// for long.
pub trait NodeStorage: Send + Sync {
    /// Store the memory of a node, replacing any previous one.
    fn save_memory(&self, node_id: &str, memory: &MemorySnapshot) -> ReteResult<()>;

    /// Memory of a node, `None` when nothing was saved.
    fn load_memory(&self, node_id: &str) -> ReteResult<Option<MemorySnapshot>>;

    /// Forget a node. Returns whether anything was stored.
    fn delete_memory(&self, node_id: &str) -> ReteResult<bool>;

    /// Identifiers of every stored node, sorted.
    fn list_nodes(&self) -> ReteResult<Vec<String>>;
}

/// Node memories kept in a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    memories: DashMap<String, MemorySnapshot>,
}

impl InMemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored memories.
    pub fn len(&self) -> usize {
        self.memories.len()
    }

    /// Nothing stored.
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}

impl NodeStorage for InMemoryStorage {
    fn save_memory(&self, node_id: &str, memory: &MemorySnapshot) -> ReteResult<()> {
        self.memories.insert(node_id.to_string(), memory.clone());
        Ok(())
    }

    fn load_memory(&self, node_id: &str) -> ReteResult<Option<MemorySnapshot>> {
        Ok(self.memories.get(node_id).map(|m| m.value().clone()))
    }

    fn delete_memory(&self, node_id: &str) -> ReteResult<bool> {
        Ok(self.memories.remove(node_id).is_some())
    }

    fn list_nodes(&self) -> ReteResult<Vec<String>> {
        let mut ids: Vec<String> = self.memories.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// Node memories stored as JSON files in one directory.
///
/// File names are the hex-encoded node identifiers, so any identifier maps
/// to a valid file name. Identifiers whose hex form would pass
/// [`MAX_HEX_NAME`] are named by their SHA-256 digest instead; every file
/// also records its identifier so both forms can be listed.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

/// Longest hex file stem, well under the usual 255-byte name limit.
const MAX_HEX_NAME: usize = 200;

/// Prefix of digest-named files. Not a hex digit, so never ambiguous.
const DIGEST_PREFIX: &str = "sha256-";

#[derive(Serialize, Deserialize)]
struct StoredMemory {
    node_id: String,
    memory: MemorySnapshot,
}

impl FileStorage {
    /// Storage rooted at `dir`, created when missing.
    pub fn new(dir: impl Into<PathBuf>) -> ReteResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| ReteError::StorageError(format!("Failed to create directory: {}", e)))?;
        Ok(Self { dir })
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, node_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem_for(node_id)))
    }

    fn read_stored(&self, path: &Path) -> ReteResult<Option<StoredMemory>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ReteError::StorageError(format!("Failed to read memory: {}", e))),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ReteError::StorageError(format!("Failed to deserialize memory: {}", e)))
    }
}

fn file_stem_for(node_id: &str) -> String {
    let encoded = hex::encode(node_id);
    if encoded.len() <= MAX_HEX_NAME {
        encoded
    } else {
        format!("{}{}", DIGEST_PREFIX, hex::encode(Sha256::digest(node_id.as_bytes())))
    }
}

fn decode_hex_name(stem: &str) -> Option<String> {
    hex::decode(stem).ok().and_then(|b| String::from_utf8(b).ok())
}

impl NodeStorage for FileStorage {
    fn save_memory(&self, node_id: &str, memory: &MemorySnapshot) -> ReteResult<()> {
        let stored = StoredMemory {
            node_id: node_id.to_string(),
            memory: memory.clone(),
        };
        let bytes = serde_json::to_vec(&stored)
            .map_err(|e| ReteError::StorageError(format!("Failed to serialize memory: {}", e)))?;

        // Each writer stages into its own file, the rename is atomic.
        let mut staged = NamedTempFile::new_in(&self.dir).map_err(|e| {
            ReteError::StorageError(format!("Failed to create temporary file: {}", e))
        })?;
        staged.write_all(&bytes).map_err(|e| {
            ReteError::StorageError(format!("Failed to write temporary file: {}", e))
        })?;
        staged
            .persist(self.path_for(node_id))
            .map(|_| ())
            .map_err(|e| ReteError::StorageError(format!("Failed to rename file: {}", e.error)))
    }

    fn load_memory(&self, node_id: &str) -> ReteResult<Option<MemorySnapshot>> {
        match self.read_stored(&self.path_for(node_id))? {
            Some(stored) if stored.node_id == node_id => Ok(Some(stored.memory)),
            Some(stored) => Err(ReteError::StorageError(format!(
                "Memory file for '{}' holds '{}'",
                node_id, stored.node_id
            ))),
            None => Ok(None),
        }
    }

    fn delete_memory(&self, node_id: &str) -> ReteResult<bool> {
        match std::fs::remove_file(self.path_for(node_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ReteError::StorageError(format!("Failed to delete memory: {}", e))),
        }
    }

    fn list_nodes(&self) -> ReteResult<Vec<String>> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| ReteError::StorageError(format!("Failed to list directory: {}", e)))?;
        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with(DIGEST_PREFIX) {
                if let Some(stored) = self.read_stored(&path)? {
                    ids.push(stored.node_id);
                }
            } else if let Some(id) = decode_hex_name(stem) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Every fact a network held at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    /// Format version for future compatibility
    pub version: u32,
    /// When the snapshot was taken
    pub saved_at: DateTime<Utc>,
    /// Facts in assertion order
    pub facts: Vec<Fact>,
}

impl NetworkSnapshot {
    /// Capture the facts of a network.
    pub fn capture(network: &ReteNetwork) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            facts: network.facts().iter().map(|f| (**f).clone()).collect(),
        }
    }

    /// Assert every fact into `network`, which should be compiled from the
    /// same program. Returns the number of facts asserted.
    pub fn replay(&self, network: &ReteNetwork) -> ReteResult<usize> {
        network.assert_facts(self.facts.iter().cloned())
    }
}

/// Save the facts of a network to disk.
///
/// # Errors
///
/// Returns `ReteError::StorageError` if:
/// - The parent directory cannot be created
/// - Serialization fails
/// - The temporary file cannot be written or renamed
pub async fn save(network: &ReteNetwork, path: &Path) -> ReteResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ReteError::StorageError(format!("Failed to create directory: {}", e)))?;
    }

    let snapshot = NetworkSnapshot::capture(network);
    let bytes = serde_json::to_vec(&snapshot)
        .map_err(|e| ReteError::StorageError(format!("Failed to serialize network: {}", e)))?;

    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    fs::write(&temp_path, &bytes)
        .await
        .map_err(|e| ReteError::StorageError(format!("Failed to write temporary file: {}", e)))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| ReteError::StorageError(format!("Failed to rename file: {}", e)))?;

    tracing::debug!("Saved {} facts to {}", snapshot.facts.len(), path.display());
    Ok(())
}

/// Load a network snapshot from disk.
///
/// # Errors
///
/// Returns `ReteError::StorageError` if the file cannot be read or parsed,
/// or was written by an incompatible version.
pub async fn load(path: &Path) -> ReteResult<NetworkSnapshot> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| ReteError::StorageError(format!("Failed to read snapshot file: {}", e)))?;

    let snapshot: NetworkSnapshot = serde_json::from_slice(&bytes)
        .map_err(|e| ReteError::StorageError(format!("Failed to deserialize snapshot: {}", e)))?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(ReteError::StorageError(format!(
            "Incompatible snapshot version: {} (expected {})",
            snapshot.version, SNAPSHOT_VERSION
        )));
    }
    Ok(snapshot)
}

/// Check if a snapshot file exists at the given path.
pub async fn exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

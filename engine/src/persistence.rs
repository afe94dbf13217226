//! Model manifest persistence.
//!
//! Only the model parameters are persisted; keys and positions always come
//! from the backing store. File layout:
//!
//! ```text
//! magic: u32 LE | len: u64 LE | bincode(ModelManifest) | crc32: u32 LE
//! ```
//!
//! Writes go to a temp file, are fsynced, then renamed over the target.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::LearnedIndexConfig;
use crate::error::{IndexError, Result};
use crate::index::LearnedIndex;
use crate::rmi_core::{IndexSnapshot, LinearModel, RootModel};
use crate::store::BackingStore;
use crate::{Key, Position};

const MANIFEST_MAGIC: u32 = 0x524D_4931; // "RMI1"
const MANIFEST_VERSION: u32 = 1;
/// magic + length prefix + crc32 trailer
const MANIFEST_FRAME_BYTES: u64 = 4 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub version: u32,
    pub created_at: u64,
    /// Backing-store row count the models were trained on.
    pub row_count: u64,
    pub root: RootModel,
    pub segments: Vec<LinearModel>,
}

impl ModelManifest {
    pub fn from_snapshot(snapshot: &IndexSnapshot) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            version: MANIFEST_VERSION,
            created_at,
            row_count: snapshot.len() as u64,
            root: *snapshot.root(),
            segments: snapshot.segments().to_vec(),
        }
    }

    /// Pair the cached models with freshly scanned entries.
    ///
    /// Fails when the row count or segment coverage no longer matches.
    pub fn into_snapshot(
        self,
        keys: Vec<Key>,
        positions: Vec<Position>,
        generation: u64,
    ) -> Result<IndexSnapshot> {
        if self.row_count != keys.len() as u64 {
            return Err(IndexError::InvariantViolation {
                key: 0,
                segment: 0,
                detail: format!(
                    "manifest trained on {} rows, store has {}",
                    self.row_count,
                    keys.len()
                ),
            });
        }
        IndexSnapshot::from_parts(self.root, self.segments, keys, positions, generation)
    }

    #[instrument(level = "debug", skip(self, path), fields(rows = self.row_count, segments = self.segments.len()))]
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        let file = File::create(&temp_path).context("Failed to create manifest temp file")?;
        let mut writer = BufWriter::new(file);

        let bytes = bincode::serialize(self).context("Failed to serialize model manifest")?;
        writer.write_all(&MANIFEST_MAGIC.to_le_bytes())?;
        writer.write_all(&(bytes.len() as u64).to_le_bytes())?;
        writer.write_all(&bytes)?;
        writer.write_all(&crc32fast::hash(&bytes).to_le_bytes())?;

        writer.flush()?;
        writer.get_ref().sync_all()?;

        std::fs::rename(&temp_path, path).context("Failed to rename model manifest")?;
        Ok(())
    }

    #[instrument(level = "debug", skip(path))]
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = File::open(path.as_ref()).context("Failed to open model manifest")?;
        let file_len = file.metadata().context("Failed to stat model manifest")?.len();
        let mut reader = BufReader::new(file);

        let mut word = [0u8; 4];
        reader.read_exact(&mut word)?;
        let magic = u32::from_le_bytes(word);
        if magic != MANIFEST_MAGIC {
            bail!(
                "Invalid manifest magic: expected {:#x}, got {:#x}",
                MANIFEST_MAGIC,
                magic
            );
        }

        let mut len = [0u8; 8];
        reader.read_exact(&mut len)?;
        let len = u64::from_le_bytes(len);
        let available = file_len.saturating_sub(MANIFEST_FRAME_BYTES);
        if len > available {
            bail!(
                "Manifest length {} exceeds the {} payload bytes in the file",
                len,
                available
            );
        }
        let mut bytes = vec![0u8; len as usize];
        reader.read_exact(&mut bytes)?;

        reader.read_exact(&mut word)?;
        let stored = u32::from_le_bytes(word);
        let computed = crc32fast::hash(&bytes);
        if stored != computed {
            bail!(
                "Manifest checksum mismatch: stored={:#x}, computed={:#x}",
                stored,
                computed
            );
        }

        let manifest: Self =
            bincode::deserialize(&bytes).context("Failed to deserialize model manifest")?;
        if manifest.version != MANIFEST_VERSION {
            bail!("Unsupported manifest version {}", manifest.version);
        }
        Ok(manifest)
    }
}

impl<S: BackingStore> LearnedIndex<S> {
    /// Persist the published models.
    pub fn save_manifest(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        ModelManifest::from_snapshot(&self.snapshot()).save(path)
    }

    /// Construct an index that reuses cached models when they still match the
    /// store, and otherwise stays dirty so the first read retrains.
    ///
    /// Cached models are adopted only when every stored key lies within its
    /// segment's recorded bound.
    pub fn open_with_manifest(
        store: S,
        config: LearnedIndexConfig,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let index = Self::new(store, config)?;
        let manifest = match ModelManifest::load(path.as_ref()) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "model manifest unusable, will rebuild");
                return Ok(index);
            }
        };

        let adopted = index.with_store(|store| -> Result<bool> {
            let rows = store.row_count().map_err(IndexError::Store)?;
            if rows != manifest.row_count {
                warn!(
                    manifest_rows = manifest.row_count,
                    store_rows = rows,
                    "model manifest row count mismatch, will rebuild"
                );
                return Ok(false);
            }

            let mut keys: Vec<Key> = Vec::with_capacity(rows as usize);
            let mut positions: Vec<Position> = Vec::with_capacity(rows as usize);
            for (key, position) in store.scan_sorted().map_err(IndexError::Store)? {
                if let Some(&previous) = keys.last() {
                    if key < previous {
                        return Err(IndexError::CorruptSnapshot {
                            position: keys.len() as Position,
                            previous,
                            key,
                        });
                    }
                }
                keys.push(key);
                positions.push(position);
            }

            let snapshot = match manifest.into_snapshot(keys, positions, 1) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(error = %e, "model manifest does not cover the store, will rebuild");
                    return Ok(false);
                }
            };
            // Equal row counts do not imply equal keys.
            if let Err(e) = snapshot.verify_error_bounds() {
                warn!(error = %e, "cached models do not fit the stored keys, will rebuild");
                return Ok(false);
            }
            index.publish(Arc::new(snapshot));
            Ok(true)
        })?;

        if adopted {
            info!(keys = index.len(), "adopted cached models from manifest");
        }
        Ok(index)
    }
}

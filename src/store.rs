use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::domain::{Feature, MetadataUpdate, SourceMetadata};
use crate::error::HarvestError;
use crate::registry::is_valid_source_id;

const SCHEMA_VERSION: u32 = 1;

/// Local feature cache keyed by (source id, feature identity).
///
/// Mutations land in memory first and reach disk on [`CacheStore::flush`],
/// which rewrites each touched file through a temp file and rename. Dropping
/// the store flushes anything still pending.
#[derive(Debug)]
pub struct CacheStore {
    root: Option<Utf8PathBuf>,
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    features: HashMap<String, SourceEntries>,
    metadata: HashMap<String, SourceMetadata>,
    dirty_features: BTreeSet<String>,
    dirty_metadata: BTreeSet<String>,
    removed: BTreeSet<String>,
}

impl State {
    fn is_dirty(&self) -> bool {
        !self.dirty_features.is_empty()
            || !self.dirty_metadata.is_empty()
            || !self.removed.is_empty()
    }
}

/// Entries for one source in insertion order, with an identity index.
#[derive(Debug, Default)]
struct SourceEntries {
    order: Vec<(String, Feature)>,
    index: HashMap<String, usize>,
}

impl SourceEntries {
    fn upsert(&mut self, id: String, feature: Feature) -> bool {
        match self.index.get(&id) {
            Some(&slot) => {
                self.order[slot].1 = feature;
                false
            }
            None => {
                self.index.insert(id.clone(), self.order.len());
                self.order.push((id, feature));
                true
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub replaced: usize,
}

#[derive(Serialize)]
struct FeatureFileRef<'a> {
    schema_version: u32,
    source: &'a str,
    entries: Vec<StoredFeatureRef<'a>>,
}

#[derive(Serialize)]
struct StoredFeatureRef<'a> {
    id: &'a str,
    feature: &'a Feature,
}

#[derive(Deserialize)]
struct FeatureFile {
    schema_version: u32,
    source: String,
    entries: Vec<StoredFeature>,
}

#[derive(Deserialize)]
struct StoredFeature {
    id: String,
    feature: Feature,
}

impl CacheStore {
    /// Opens (or creates) a cache rooted at `root`, loading every source.
    ///
    /// Any file that fails to parse aborts the open with
    /// [`HarvestError::CacheCorruption`].
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, HarvestError> {
        let root = root.into();
        fs::create_dir_all(features_dir(&root).as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        fs::create_dir_all(metadata_dir(&root).as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;

        let mut state = State::default();
        for (source_id, path) in list_json(&features_dir(&root))? {
            let entries = load_feature_file(&source_id, &path)?;
            state.features.insert(source_id, entries);
        }
        for (source_id, path) in list_json(&metadata_dir(&root))? {
            let content = read_file(&path)?;
            let metadata: SourceMetadata =
                serde_json::from_slice(&content).map_err(|err| corruption(&path, err))?;
            state.metadata.insert(source_id, metadata);
        }

        tracing::debug!(
            root = %root,
            sources = state.features.len(),
            "opened feature cache"
        );
        Ok(Self {
            root: Some(root),
            state: RwLock::new(state),
        })
    }

    /// A store that never touches disk.
    pub fn open_in_memory() -> Self {
        Self {
            root: None,
            state: RwLock::new(State::default()),
        }
    }

    pub fn root(&self) -> Option<&Utf8Path> {
        self.root.as_deref()
    }

    pub fn get_source_metadata(&self, source_id: &str) -> Option<SourceMetadata> {
        self.read().metadata.get(source_id).cloned()
    }

    pub fn needs_refresh(&self, source_id: &str, max_age_hours: u64) -> bool {
        self.needs_refresh_at(source_id, max_age_hours, Utc::now())
    }

    /// Missing or truncated metadata always needs a refresh.
    pub fn needs_refresh_at(
        &self,
        source_id: &str,
        max_age_hours: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(metadata) = self.get_source_metadata(source_id) else {
            return true;
        };
        if metadata.truncated {
            return true;
        }
        let max_age = i64::try_from(max_age_hours)
            .ok()
            .and_then(Duration::try_hours)
            .unwrap_or(Duration::MAX);
        now.signed_duration_since(metadata.last_fetched) > max_age
    }

    pub fn get_features(&self, source_id: &str) -> Vec<Feature> {
        self.read()
            .features
            .get(source_id)
            .map(|entries| {
                entries
                    .order
                    .iter()
                    .map(|(_, feature)| feature.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn feature_count(&self, source_id: &str) -> usize {
        self.read()
            .features
            .get(source_id)
            .map(|entries| entries.order.len())
            .unwrap_or(0)
    }

    pub fn upsert_features<F>(
        &self,
        source_id: &str,
        features: &[Feature],
        identity: F,
    ) -> Result<UpsertSummary, HarvestError>
    where
        F: Fn(&Feature, usize) -> String,
    {
        check_source_id(source_id)?;
        let ids: Vec<String> = features
            .iter()
            .enumerate()
            .map(|(index, feature)| identity(feature, index))
            .collect();

        let mut state = self.write();
        let entries = state.features.entry(source_id.to_string()).or_default();
        let mut summary = UpsertSummary::default();
        for (id, feature) in ids.into_iter().zip(features) {
            if entries.upsert(id, feature.clone()) {
                summary.inserted += 1;
            } else {
                summary.replaced += 1;
            }
        }
        state.dirty_features.insert(source_id.to_string());
        Ok(summary)
    }

    pub fn update_source_metadata(
        &self,
        source_id: &str,
        update: MetadataUpdate,
    ) -> Result<SourceMetadata, HarvestError> {
        self.update_source_metadata_at(source_id, update, Utc::now())
    }

    pub fn update_source_metadata_at(
        &self,
        source_id: &str,
        update: MetadataUpdate,
        now: DateTime<Utc>,
    ) -> Result<SourceMetadata, HarvestError> {
        check_source_id(source_id)?;
        let mut state = self.write();
        let previous = state.metadata.get(source_id);
        let metadata = SourceMetadata {
            record_count: update
                .record_count
                .or(previous.map(|meta| meta.record_count))
                .unwrap_or(0),
            last_fetched: now,
            truncated: update
                .truncated
                .or(previous.map(|meta| meta.truncated))
                .unwrap_or(false),
        };
        state
            .metadata
            .insert(source_id.to_string(), metadata.clone());
        state.dirty_metadata.insert(source_id.to_string());
        Ok(metadata)
    }

    /// Every source with stored metadata, sorted by id.
    pub fn list_sources(&self) -> Vec<(String, SourceMetadata)> {
        let state = self.read();
        let mut sources: Vec<_> = state
            .metadata
            .iter()
            .map(|(id, meta)| (id.clone(), meta.clone()))
            .collect();
        sources.sort_by(|a, b| a.0.cmp(&b.0));
        sources
    }

    /// Drops all features and metadata for a source. Returns whether anything
    /// was stored.
    pub fn clear_source(&self, source_id: &str) -> Result<bool, HarvestError> {
        check_source_id(source_id)?;
        let mut state = self.write();
        let had_features = state.features.remove(source_id).is_some();
        let had_metadata = state.metadata.remove(source_id).is_some();
        state.dirty_features.remove(source_id);
        state.dirty_metadata.remove(source_id);
        state.removed.insert(source_id.to_string());
        Ok(had_features || had_metadata)
    }

    /// Writes pending changes to disk. Features are written before metadata so
    /// a fresh timestamp never points at stale feature files.
    pub fn flush(&self) -> Result<(), HarvestError> {
        let mut state = self.write();
        let Some(root) = self.root.as_ref() else {
            state.dirty_features.clear();
            state.dirty_metadata.clear();
            state.removed.clear();
            return Ok(());
        };
        if !state.is_dirty() {
            return Ok(());
        }

        for source_id in &state.removed {
            remove_if_exists(&feature_path(root, source_id))?;
            remove_if_exists(&metadata_path(root, source_id))?;
        }
        state.removed.clear();

        for source_id in &state.dirty_features {
            let Some(entries) = state.features.get(source_id) else {
                continue;
            };
            let file = FeatureFileRef {
                schema_version: SCHEMA_VERSION,
                source: source_id,
                entries: entries
                    .order
                    .iter()
                    .map(|(id, feature)| StoredFeatureRef { id, feature })
                    .collect(),
            };
            let content = serde_json::to_vec(&file)
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            write_bytes_atomic(&feature_path(root, source_id), &content)?;
        }
        state.dirty_features.clear();

        for source_id in &state.dirty_metadata {
            let Some(metadata) = state.metadata.get(source_id) else {
                continue;
            };
            let content = serde_json::to_vec_pretty(metadata)
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            write_bytes_atomic(&metadata_path(root, source_id), &content)?;
        }
        state.dirty_metadata.clear();

        tracing::debug!(root = %root, "flushed feature cache");
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        let dirty = self.read().is_dirty();
        if dirty {
            if let Err(err) = self.flush() {
                tracing::warn!(error = %err, "failed to flush feature cache on close");
            }
        }
    }
}

/// Writes `content` to a temp file next to `path`, then renames it into place.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".parcel-harvest")
        .suffix(".tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(())
}

fn features_dir(root: &Utf8Path) -> Utf8PathBuf {
    root.join("features")
}

fn metadata_dir(root: &Utf8Path) -> Utf8PathBuf {
    root.join("metadata")
}

fn feature_path(root: &Utf8Path, source_id: &str) -> Utf8PathBuf {
    features_dir(root).join(format!("{source_id}.json"))
}

fn metadata_path(root: &Utf8Path, source_id: &str) -> Utf8PathBuf {
    metadata_dir(root).join(format!("{source_id}.json"))
}

fn check_source_id(source_id: &str) -> Result<(), HarvestError> {
    if is_valid_source_id(source_id) {
        Ok(())
    } else {
        Err(HarvestError::UnknownSource(source_id.to_string()))
    }
}

fn list_json(dir: &Utf8Path) -> Result<Vec<(String, Utf8PathBuf)>, HarvestError> {
    let mut items = Vec::new();
    let entries =
        fs::read_dir(dir.as_std_path()).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|_| HarvestError::Filesystem("non-utf8 path in cache".to_string()))?;
        if !path.is_file() || path.extension() != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem() {
            items.push((stem.to_string(), path.clone()));
        }
    }
    items.sort();
    Ok(items)
}

fn load_feature_file(source_id: &str, path: &Utf8Path) -> Result<SourceEntries, HarvestError> {
    let content = read_file(path)?;
    let file: FeatureFile = serde_json::from_slice(&content).map_err(|err| corruption(path, err))?;
    if file.schema_version != SCHEMA_VERSION {
        return Err(corruption(
            path,
            format!("unsupported schema_version {}", file.schema_version),
        ));
    }
    if file.source != source_id {
        return Err(corruption(
            path,
            format!("file holds source {:?}", file.source),
        ));
    }

    let mut entries = SourceEntries::default();
    for stored in file.entries {
        let id = stored.id.clone();
        if !entries.upsert(stored.id, stored.feature) {
            return Err(corruption(path, format!("duplicate feature id {id:?}")));
        }
    }
    Ok(entries)
}

fn read_file(path: &Utf8Path) -> Result<Vec<u8>, HarvestError> {
    fs::read(path.as_std_path()).map_err(|err| corruption(path, err))
}

fn remove_if_exists(path: &Utf8Path) -> Result<(), HarvestError> {
    if path.as_std_path().exists() {
        fs::remove_file(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

fn corruption(path: &Utf8Path, err: impl std::fmt::Display) -> HarvestError {
    HarvestError::CacheCorruption {
        path: path.to_string(),
        message: err.to_string(),
    }
}

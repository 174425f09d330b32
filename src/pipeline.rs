use camino::Utf8Path;
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Serialize;

use crate::arcgis::{ArcgisFetcher, http_client};
use crate::domain::{ApiDescriptor, MetadataUpdate, OutputFormat, Source};
use crate::error::HarvestError;
use crate::fetch::{BatchFetcher, FetchOptions, ProgressSink, fetch_all};
use crate::output::write_features;
use crate::registry::SourceRegistry;
use crate::store::CacheStore;

/// Builds the page fetcher for a source's API descriptor.
pub trait AdapterFactory {
    fn adapter(&self, source: &Source) -> Result<Box<dyn BatchFetcher>, HarvestError>;
}

#[derive(Clone)]
pub struct HttpAdapterFactory {
    client: Client,
}

impl HttpAdapterFactory {
    pub fn new() -> Result<Self, HarvestError> {
        Ok(Self {
            client: http_client()?,
        })
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn adapter(&self, source: &Source) -> Result<Box<dyn BatchFetcher>, HarvestError> {
        match &source.api {
            ApiDescriptor::Arcgis(descriptor) => Ok(Box::new(ArcgisFetcher::with_client(
                self.client.clone(),
                descriptor.clone(),
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub max_age_hours: u64,
    pub force: bool,
    pub format: OutputFormat,
    pub fetch: FetchOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunAction {
    Cache,
    Fetched,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub source_id: String,
    pub action: RunAction,
    pub record_count: usize,
    pub fetched: Option<usize>,
    pub pages: Option<usize>,
    pub inserted: Option<usize>,
    pub replaced: Option<usize>,
    pub truncated: bool,
    pub output_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub source_id: String,
    pub name: Option<String>,
    pub cached_features: usize,
    pub record_count: Option<u64>,
    pub last_fetched: Option<DateTime<Utc>>,
    pub truncated: bool,
    pub needs_refresh: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceListing {
    pub id: String,
    pub name: String,
    pub api: &'static str,
    pub attribution: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub source_id: String,
    pub cleared: bool,
}

pub struct Pipeline<'a, A: AdapterFactory> {
    registry: &'a SourceRegistry,
    store: &'a CacheStore,
    adapters: A,
}

impl<'a, A: AdapterFactory> Pipeline<'a, A> {
    pub fn new(registry: &'a SourceRegistry, store: &'a CacheStore, adapters: A) -> Self {
        Self {
            registry,
            store,
            adapters,
        }
    }

    /// Serves a source from cache when fresh, otherwise fetches, upserts and
    /// records metadata. Either way the merged cache content is written to
    /// `output_path`.
    pub fn run(
        &self,
        source_id: &str,
        output_path: &Utf8Path,
        options: &RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, HarvestError> {
        let source = self.registry.get(source_id)?;

        if !options.force && !self.store.needs_refresh(&source.id, options.max_age_hours) {
            let features = self.store.get_features(&source.id);
            tracing::info!(
                source = %source.id,
                count = features.len(),
                "cache is fresh, skipping fetch"
            );
            write_features(output_path, &features, options.format)?;
            return Ok(RunReport {
                source_id: source.id.clone(),
                action: RunAction::Cache,
                record_count: features.len(),
                fetched: None,
                pages: None,
                inserted: None,
                replaced: None,
                truncated: false,
                output_path: output_path.to_string(),
            });
        }

        tracing::info!(source = %source.id, api = source.api.kind(), "fetching source");
        let adapter = self.adapters.adapter(source)?;
        let result = fetch_all(&source.id, adapter.as_ref(), &options.fetch, sink)?;

        let summary = self.store.upsert_features(&source.id, &result.features, |feature, index| {
            source.identity.identity_of(feature, index)
        })?;
        self.store.update_source_metadata(
            &source.id,
            MetadataUpdate {
                record_count: Some(result.total_fetched as u64),
                truncated: Some(result.truncated),
            },
        )?;
        self.store.flush()?;

        let features = self.store.get_features(&source.id);
        write_features(output_path, &features, options.format)?;
        tracing::info!(
            source = %source.id,
            fetched = result.total_fetched,
            inserted = summary.inserted,
            replaced = summary.replaced,
            output = %output_path,
            "source refreshed"
        );

        Ok(RunReport {
            source_id: source.id.clone(),
            action: RunAction::Fetched,
            record_count: features.len(),
            fetched: Some(result.total_fetched),
            pages: Some(result.pages),
            inserted: Some(summary.inserted),
            replaced: Some(summary.replaced),
            truncated: result.truncated,
            output_path: output_path.to_string(),
        })
    }

    /// Cache state for every configured source, plus cached sources no longer
    /// in the registry.
    pub fn status(&self, max_age_hours: u64) -> Vec<StatusEntry> {
        let mut entries: Vec<StatusEntry> = self
            .registry
            .sources()
            .iter()
            .map(|source| {
                self.status_entry(&source.id, Some(source.name.clone()), max_age_hours)
            })
            .collect();
        for (source_id, _) in self.store.list_sources() {
            if self.registry.get(&source_id).is_err() {
                entries.push(self.status_entry(&source_id, None, max_age_hours));
            }
        }
        entries
    }

    pub fn clear(&self, source_id: &str) -> Result<ClearResult, HarvestError> {
        let cleared = self.store.clear_source(source_id)?;
        self.store.flush()?;
        Ok(ClearResult {
            source_id: source_id.to_string(),
            cleared,
        })
    }

    fn status_entry(
        &self,
        source_id: &str,
        name: Option<String>,
        max_age_hours: u64,
    ) -> StatusEntry {
        let metadata = self.store.get_source_metadata(source_id);
        StatusEntry {
            source_id: source_id.to_string(),
            name,
            cached_features: self.store.feature_count(source_id),
            record_count: metadata.as_ref().map(|meta| meta.record_count),
            last_fetched: metadata.as_ref().map(|meta| meta.last_fetched),
            truncated: metadata.as_ref().is_some_and(|meta| meta.truncated),
            needs_refresh: self.store.needs_refresh(source_id, max_age_hours),
        }
    }
}

pub fn list_sources(registry: &SourceRegistry) -> Vec<SourceListing> {
    registry
        .sources()
        .iter()
        .map(|source| SourceListing {
            id: source.id.clone(),
            name: source.name.clone(),
            api: source.api.kind(),
            attribution: source.attribution.clone(),
        })
        .collect()
}

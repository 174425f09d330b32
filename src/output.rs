use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::domain::{Feature, OutputFormat};
use crate::error::HarvestError;
use crate::pipeline::{ClearResult, RunReport, SourceListing, StatusEntry};
use crate::store::write_bytes_atomic;

#[derive(Serialize)]
struct CollectionRef<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    features: &'a [Feature],
}

/// Default artifact location for a source: `<dir>/<source_id>.<ext>`.
pub fn output_path(output_dir: &Utf8Path, source_id: &str, format: OutputFormat) -> Utf8PathBuf {
    output_dir.join(format!("{source_id}.{}", format.extension()))
}

/// Writes features to `path`, replacing any previous file atomically.
pub fn write_features(
    path: &Utf8Path,
    features: &[Feature],
    format: OutputFormat,
) -> Result<(), HarvestError> {
    let content = match format {
        OutputFormat::Geojson => encode_feature_collection(features)?,
        OutputFormat::Ndjson => encode_ndjson(features)?,
    };
    write_bytes_atomic(path, &content)
        .map_err(|err| HarvestError::Output(format!("{path}: {err}")))
}

pub fn encode_feature_collection(features: &[Feature]) -> Result<Vec<u8>, HarvestError> {
    serde_json::to_vec(&CollectionRef {
        kind: "FeatureCollection",
        features,
    })
    .map_err(|err| HarvestError::Output(err.to_string()))
}

/// One feature per line, the streaming input the tile generator accepts.
pub fn encode_ndjson(features: &[Feature]) -> Result<Vec<u8>, HarvestError> {
    let mut content = Vec::new();
    for feature in features {
        serde_json::to_writer(&mut content, feature)
            .map_err(|err| HarvestError::Output(err.to_string()))?;
        content.push(b'\n');
    }
    Ok(content)
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_runs(reports: &[RunReport]) -> io::Result<()> {
        Self::print_json(&reports)
    }

    pub fn print_status(entries: &[StatusEntry]) -> io::Result<()> {
        Self::print_json(&entries)
    }

    pub fn print_sources(sources: &[SourceListing]) -> io::Result<()> {
        Self::print_json(&sources)
    }

    pub fn print_clear(result: &ClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A single geometry + attributes record, shaped as a GeoJSON `Feature`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default = "feature_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default)]
    pub geometry: Option<Value>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn new(geometry: Option<Value>, properties: Map<String, Value>) -> Self {
        Self {
            kind: feature_type(),
            id: None,
            geometry,
            properties,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

fn feature_type() -> String {
    "Feature".to_string()
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: "FeatureCollection".to_string(),
            features,
        }
    }
}

/// Static description of one upstream endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub attribution: Option<String>,
    #[serde(default)]
    pub identity: IdentityRule,
    pub api: ApiDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ApiDescriptor {
    Arcgis(ArcgisDescriptor),
}

impl ApiDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiDescriptor::Arcgis(_) => "arcgis",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcgisDescriptor {
    pub url: String,
    pub out_fields: Vec<String>,
    #[serde(default)]
    pub filter: Option<String>,
    /// Field paging is ordered by; layers name it `OBJECTID`, `FID`, `OBJECTID_1`...
    #[serde(default)]
    pub object_id_field: Option<String>,
}

impl ArcgisDescriptor {
    pub fn order_by_field(&self) -> &str {
        self.object_id_field
            .as_deref()
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .unwrap_or("OBJECTID")
    }
}

/// How a feature's identity is derived for upserts.
///
/// Reads the configured attribute when it holds a non-empty scalar and falls
/// back to the feature's position within the batch being applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRule {
    #[serde(default)]
    pub field: Option<String>,
}

impl IdentityRule {
    pub fn by_field(field: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
        }
    }

    pub fn identity_of(&self, feature: &Feature, index: usize) -> String {
        self.field
            .as_deref()
            .and_then(|field| feature.attribute(field))
            .and_then(scalar_key)
            .unwrap_or_else(|| format!("#{index}"))
    }
}

fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub record_count: u64,
    pub last_fetched: DateTime<Utc>,
    #[serde(default)]
    pub truncated: bool,
}

/// Fields merged into stored metadata; `None` keeps the stored value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataUpdate {
    pub record_count: Option<u64>,
    pub truncated: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Geojson,
    Ndjson,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Geojson => "geojson",
            OutputFormat::Ndjson => "ndjson",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

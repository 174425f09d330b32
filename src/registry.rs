use std::collections::HashSet;

use crate::domain::{ApiDescriptor, Source};
use crate::error::HarvestError;

/// Sources known to this process, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Source>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<Source>) -> Result<Self, HarvestError> {
        let mut seen = HashSet::new();
        for source in &sources {
            if !is_valid_source_id(&source.id) {
                return Err(HarvestError::InvalidConfig(format!(
                    "invalid source id {:?}: use letters, digits, '-', '_' or '.'",
                    source.id
                )));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(HarvestError::InvalidConfig(format!(
                    "duplicate source id: {}",
                    source.id
                )));
            }
            validate_api(source)?;
        }
        Ok(Self { sources })
    }

    pub fn get(&self, id: &str) -> Result<&Source, HarvestError> {
        self.sources
            .iter()
            .find(|source| source.id == id)
            .ok_or_else(|| HarvestError::UnknownSource(id.to_string()))
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(|source| source.id.as_str())
    }
}

/// Source ids double as cache file stems.
pub fn is_valid_source_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}

fn validate_api(source: &Source) -> Result<(), HarvestError> {
    match &source.api {
        ApiDescriptor::Arcgis(arcgis) => {
            if arcgis.url.trim().is_empty() {
                return Err(HarvestError::InvalidConfig(format!(
                    "source {} has an empty ArcGIS url",
                    source.id
                )));
            }
            if arcgis.out_fields.is_empty() {
                return Err(HarvestError::InvalidConfig(format!(
                    "source {} has no out_fields",
                    source.id
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArcgisDescriptor, IdentityRule};

    fn source(id: &str) -> Source {
        Source {
            id: id.to_string(),
            name: id.to_string(),
            attribution: None,
            identity: IdentityRule::by_field("APN"),
            api: ApiDescriptor::Arcgis(ArcgisDescriptor {
                url: "https://example.test/FeatureServer/0".to_string(),
                out_fields: vec!["APN".to_string()],
                filter: None,
                object_id_field: None,
            }),
        }
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = SourceRegistry::new(vec![source("a"), source("a")]).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_path_like_ids() {
        assert!(is_valid_source_id("la-county_parcels.v2"));
        assert!(!is_valid_source_id("../escape"));
        assert!(!is_valid_source_id("a/b"));
        assert!(!is_valid_source_id(""));
        let err = SourceRegistry::new(vec![source("a b")]).unwrap_err();
        assert!(matches!(err, HarvestError::InvalidConfig(_)));
    }

    #[test]
    fn unknown_source_fails_loudly() {
        let registry = SourceRegistry::new(vec![source("a")]).unwrap();
        assert!(registry.get("a").is_ok());
        let err = registry.get("b").unwrap_err();
        assert!(matches!(err, HarvestError::UnknownSource(id) if id == "b"));
    }
}

use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use parcel_harvest::config::{Config, ConfigLoader};
use parcel_harvest::domain::ApiDescriptor;
use parcel_harvest::error::HarvestError;

const CONFIG: &str = r#"{
  "schema_version": 1,
  "settings": {
    "cache_dir": "/var/cache/parcel-harvest",
    "output_dir": "public/data",
    "max_age_hours": 12,
    "concurrency": 6,
    "batch_size": 2000,
    "retry_delay_ms": 50
  },
  "sources": [
    {
      "id": "la-parcels",
      "name": "Los Angeles County Parcels",
      "attribution": "LA County Assessor",
      "identity": { "field": "APN" },
      "api": {
        "type": "arcgis",
        "url": "https://gis.example/arcgis/rest/services/Parcels/FeatureServer/0",
        "out_fields": ["APN", "SitusAddress"],
        "filter": "UseType = 'Residential'"
      }
    }
  ]
}"#;

#[test]
fn parses_sources_and_settings() {
    let config: Config = serde_json::from_str(CONFIG).unwrap();
    let resolved = ConfigLoader::resolve_config(config).unwrap();

    assert_eq!(resolved.settings.cache_dir, Utf8PathBuf::from("/var/cache/parcel-harvest"));
    assert_eq!(resolved.settings.output_dir, Utf8PathBuf::from("public/data"));
    assert_eq!(resolved.settings.max_age_hours, 12);
    assert_eq!(resolved.settings.concurrency, 6);
    assert_eq!(resolved.settings.batch_size, 2000);
    assert_eq!(resolved.settings.retry_delay, Duration::from_millis(50));

    let source = resolved.registry.get("la-parcels").unwrap();
    assert_eq!(source.identity.field.as_deref(), Some("APN"));
    let ApiDescriptor::Arcgis(arcgis) = &source.api;
    assert_eq!(arcgis.out_fields, vec!["APN", "SitusAddress"]);
    assert_eq!(arcgis.filter.as_deref(), Some("UseType = 'Residential'"));
}

#[test]
fn unknown_api_type_is_a_parse_error() {
    let text = CONFIG.replace("\"arcgis\"", "\"wfs\"");
    assert!(serde_json::from_str::<Config>(&text).is_err());
}

#[test]
fn zero_concurrency_is_invalid() {
    let text = CONFIG.replace("\"concurrency\": 6", "\"concurrency\": 0");
    let config: Config = serde_json::from_str(&text).unwrap();
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, HarvestError::InvalidConfig(_));
}

#[test]
fn empty_out_fields_are_invalid() {
    let text = CONFIG.replace("[\"APN\", \"SitusAddress\"]", "[]");
    let config: Config = serde_json::from_str(&text).unwrap();
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, HarvestError::InvalidConfig(_));
}

#[test]
fn explicit_missing_path_is_a_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    let err = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, HarvestError::ConfigRead(_));
}

#[test]
fn loads_from_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("parcel-harvest.json");
    std::fs::write(&path, CONFIG).unwrap();

    let resolved = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap();
    assert_eq!(resolved.registry.ids().collect::<Vec<_>>(), vec!["la-parcels"]);
}

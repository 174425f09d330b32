use std::collections::BTreeSet;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{Duration, Utc};
use serde_json::{Map, json};

use parcel_harvest::domain::{Feature, IdentityRule, MetadataUpdate};
use parcel_harvest::error::HarvestError;
use parcel_harvest::store::CacheStore;

fn parcel(apn: &str, owner: &str) -> Feature {
    let mut properties = Map::new();
    properties.insert("APN".to_string(), json!(apn));
    properties.insert("OWNER".to_string(), json!(owner));
    Feature::new(
        Some(json!({"type": "Point", "coordinates": [-118.2, 34.0]})),
        properties,
    )
}

fn as_set(features: &[Feature]) -> BTreeSet<String> {
    features
        .iter()
        .map(|feature| serde_json::to_string(feature).unwrap())
        .collect()
}

fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
    (temp, root)
}

#[test]
fn upsert_is_idempotent() {
    let store = CacheStore::open_in_memory();
    let rule = IdentityRule::by_field("APN");
    let batch = vec![parcel("100", "a"), parcel("200", "b"), parcel("300", "c")];

    store
        .upsert_features("parcels", &batch, |f, i| rule.identity_of(f, i))
        .unwrap();
    let first = as_set(&store.get_features("parcels"));
    let summary = store
        .upsert_features("parcels", &batch, |f, i| rule.identity_of(f, i))
        .unwrap();
    let second = as_set(&store.get_features("parcels"));

    assert_eq!(first, second);
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.replaced, 3);
}

#[test]
fn last_value_wins_per_identity() {
    let store = CacheStore::open_in_memory();
    let rule = IdentityRule::by_field("APN");
    let batch = vec![parcel("100", "first"), parcel("100", "second"), parcel("100", "third")];

    store
        .upsert_features("parcels", &batch, |f, i| rule.identity_of(f, i))
        .unwrap();

    let features = store.get_features("parcels");
    assert_eq!(features, vec![parcel("100", "third")]);
}

#[test]
fn sources_are_isolated() {
    let store = CacheStore::open_in_memory();
    let rule = IdentityRule::by_field("APN");
    store
        .upsert_features("north", &[parcel("1", "a")], |f, i| rule.identity_of(f, i))
        .unwrap();
    store
        .upsert_features("south", &[parcel("1", "b")], |f, i| rule.identity_of(f, i))
        .unwrap();

    assert_eq!(store.get_features("north"), vec![parcel("1", "a")]);
    assert_eq!(store.get_features("south"), vec![parcel("1", "b")]);
    assert!(store.get_features("east").is_empty());
}

#[test]
fn staleness_follows_the_clock() {
    let store = CacheStore::open_in_memory();
    let now = Utc::now();

    assert!(store.needs_refresh_at("parcels", 24, now));

    store
        .update_source_metadata_at(
            "parcels",
            MetadataUpdate {
                record_count: Some(3),
                truncated: None,
            },
            now,
        )
        .unwrap();
    assert!(!store.needs_refresh_at("parcels", 24, now));
    assert!(!store.needs_refresh_at("parcels", 24, now + Duration::hours(24)));
    assert!(store.needs_refresh_at("parcels", 24, now + Duration::hours(25)));
}

#[test]
fn fresh_metadata_is_not_stale_with_real_clock() {
    let store = CacheStore::open_in_memory();
    store
        .update_source_metadata("parcels", MetadataUpdate::default())
        .unwrap();
    assert!(!store.needs_refresh("parcels", 1));
    assert_eq!(store.get_source_metadata("parcels").unwrap().record_count, 0);
}

#[test]
fn flushed_state_survives_reopen() {
    let (_temp, root) = temp_root();
    let rule = IdentityRule::by_field("APN");
    {
        let store = CacheStore::open(root.clone()).unwrap();
        store
            .upsert_features("parcels", &[parcel("1", "a"), parcel("2", "b")], |f, i| {
                rule.identity_of(f, i)
            })
            .unwrap();
        store
            .update_source_metadata(
                "parcels",
                MetadataUpdate {
                    record_count: Some(2),
                    truncated: Some(false),
                },
            )
            .unwrap();
        store.flush().unwrap();
    }

    let reopened = CacheStore::open(root).unwrap();
    assert_eq!(
        reopened.get_features("parcels"),
        vec![parcel("1", "a"), parcel("2", "b")]
    );
    assert_eq!(reopened.get_source_metadata("parcels").unwrap().record_count, 2);

    reopened
        .upsert_features("parcels", &[parcel("1", "z")], |f, i| rule.identity_of(f, i))
        .unwrap();
    assert_eq!(reopened.feature_count("parcels"), 2);
}

#[test]
fn drop_flushes_pending_writes() {
    let (_temp, root) = temp_root();
    {
        let store = CacheStore::open(root.clone()).unwrap();
        store
            .upsert_features("parcels", &[parcel("1", "a")], |f, i| {
                IdentityRule::by_field("APN").identity_of(f, i)
            })
            .unwrap();
    }

    let reopened = CacheStore::open(root).unwrap();
    assert_eq!(reopened.get_features("parcels"), vec![parcel("1", "a")]);
}

#[test]
fn corrupted_feature_file_fails_open() {
    let (_temp, root) = temp_root();
    std::fs::create_dir_all(root.join("features").as_std_path()).unwrap();
    std::fs::write(
        root.join("features").join("parcels.json").as_std_path(),
        b"{\"schema_version\": 1, \"source\": \"parcels\", \"entries\": [",
    )
    .unwrap();

    let err = CacheStore::open(root).unwrap_err();
    assert_matches!(err, HarvestError::CacheCorruption { .. });
}

#[test]
fn corrupted_metadata_fails_open() {
    let (_temp, root) = temp_root();
    std::fs::create_dir_all(root.join("metadata").as_std_path()).unwrap();
    std::fs::write(
        root.join("metadata").join("parcels.json").as_std_path(),
        b"{\"record_count\": \"many\"}",
    )
    .unwrap();

    let err = CacheStore::open(root).unwrap_err();
    assert_matches!(err, HarvestError::CacheCorruption { .. });
}

#[test]
fn clear_source_removes_files() {
    let (_temp, root) = temp_root();
    let store = CacheStore::open(root.clone()).unwrap();
    store
        .upsert_features("parcels", &[parcel("1", "a")], |f, i| {
            IdentityRule::by_field("APN").identity_of(f, i)
        })
        .unwrap();
    store
        .update_source_metadata("parcels", MetadataUpdate::default())
        .unwrap();
    store.flush().unwrap();
    assert!(root.join("features/parcels.json").as_std_path().exists());

    assert!(store.clear_source("parcels").unwrap());
    store.flush().unwrap();

    assert!(!root.join("features/parcels.json").as_std_path().exists());
    assert!(!root.join("metadata/parcels.json").as_std_path().exists());
    assert!(store.get_source_metadata("parcels").is_none());
    assert!(store.list_sources().is_empty());
}

#[test]
fn list_sources_is_sorted() {
    let store = CacheStore::open_in_memory();
    for id in ["zeta", "alpha", "mid"] {
        store
            .update_source_metadata(id, MetadataUpdate::default())
            .unwrap();
    }
    let ids: Vec<_> = store.list_sources().into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
}

use serde_json::{Map, json};

use parcel_harvest::domain::{ApiDescriptor, Feature, FeatureCollection, IdentityRule, Source};

fn with_props(props: serde_json::Value) -> Feature {
    let properties: Map<String, serde_json::Value> = serde_json::from_value(props).unwrap();
    Feature::new(None, properties)
}

#[test]
fn identity_reads_field() {
    let rule = IdentityRule::by_field("APN");
    assert_eq!(rule.identity_of(&with_props(json!({"APN": " 5123-001 "})), 7), "5123-001");
    assert_eq!(rule.identity_of(&with_props(json!({"APN": 42})), 7), "42");
}

#[test]
fn identity_falls_back_to_position() {
    let rule = IdentityRule::by_field("APN");
    assert_eq!(rule.identity_of(&with_props(json!({})), 3), "#3");
    assert_eq!(rule.identity_of(&with_props(json!({"APN": ""})), 4), "#4");
    assert_eq!(rule.identity_of(&with_props(json!({"APN": null})), 5), "#5");
    assert_eq!(IdentityRule::default().identity_of(&with_props(json!({"APN": "x"})), 6), "#6");
}

#[test]
fn feature_collection_shape() {
    let collection = FeatureCollection::new(vec![with_props(json!({"APN": "1"}))]);
    let value = serde_json::to_value(&collection).unwrap();
    assert_eq!(value["type"], "FeatureCollection");
    assert_eq!(value["features"][0]["type"], "Feature");
    assert_eq!(value["features"][0]["properties"]["APN"], "1");
}

#[test]
fn api_descriptor_is_tagged() {
    let source: Source = serde_json::from_value(json!({
        "id": "parcels",
        "name": "Parcels",
        "api": {"type": "arcgis", "url": "https://gis.example/0", "out_fields": ["*"]}
    }))
    .unwrap();
    assert_eq!(source.api.kind(), "arcgis");
    assert_eq!(source.identity, IdentityRule::default());
    let ApiDescriptor::Arcgis(arcgis) = &source.api;
    assert!(arcgis.filter.is_none());

    let back = serde_json::to_value(&source.api).unwrap();
    assert_eq!(back["type"], "arcgis");
}

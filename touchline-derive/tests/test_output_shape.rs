//! Tests for the OutputShape derive

#![allow(dead_code)]

use std::collections::BTreeMap;

use touchline::shape::{extract, FieldKind, Shaped};
use touchline::OutputShape;

#[derive(OutputShape)]
struct FixtureOut {
    opponent: String,
    played_on: String,
}

#[derive(OutputShape)]
#[shape(name = "PlayerCard")]
struct PlayerOut {
    name: String,
    shirt_number: Option<i32>,
    matches: Vec<FixtureOut>,
    captaincy: Option<Box<FixtureOut>>,
    #[shape(lazy)]
    notes: Option<String>,
    #[shape(rename = "match")]
    fixture: FixtureOut,
    #[shape(scalar)]
    extras: BTreeMap<String, String>,
}

#[derive(OutputShape)]
#[shape(rename_all = "camelCase")]
struct CamelOut {
    last_name: String,
    shirt_number: i32,
}

#[derive(OutputShape)]
struct Coach {
    name: String,
    assistant: Option<Box<Coach>>,
}

#[test]
fn test_descriptor_name_and_field_order() {
    let shape = PlayerOut::output_shape();
    assert_eq!(shape.name(), "PlayerCard");
    let names: Vec<&str> = shape.fields().iter().map(|f| f.name()).collect();
    assert_eq!(
        names,
        vec!["name", "shirt_number", "matches", "captaincy", "notes", "match", "extras"]
    );
}

#[test]
fn test_nested_fields_see_through_containers() {
    let shape = PlayerOut::output_shape();
    let kind_of = |name: &str| {
        shape
            .fields()
            .iter()
            .find(|f| f.name() == name)
            .map(|f| f.kind())
            .expect("field exists")
    };

    assert!(matches!(kind_of("name"), FieldKind::Scalar));
    assert!(matches!(kind_of("shirt_number"), FieldKind::Scalar));
    assert!(matches!(kind_of("extras"), FieldKind::Scalar));
    for nested in ["matches", "captaincy", "match"] {
        let FieldKind::Nested(inner) = kind_of(nested) else {
            panic!("{nested} should be nested");
        };
        assert_eq!(inner().name(), "FixtureOut");
    }
}

#[test]
fn test_lazy_fields_are_marked() {
    let shape = PlayerOut::output_shape();
    let lazy: Vec<&str> = shape
        .fields()
        .iter()
        .filter(|f| f.is_lazy())
        .map(|f| f.name())
        .collect();
    assert_eq!(lazy, vec!["notes"]);
}

#[test]
fn test_rename_all_camel_case() {
    let names: Vec<&str> = CamelOut::output_shape()
        .fields()
        .iter()
        .map(|f| f.name())
        .collect();
    assert_eq!(names, vec!["lastName", "shirtNumber"]);
}

#[test]
fn test_descriptor_is_cached() {
    assert!(std::ptr::eq(PlayerOut::output_shape(), PlayerOut::output_shape()));
}

#[test]
fn test_self_referencing_shape_extracts() {
    let graph = extract(Coach::output_shape(), 8).expect("cycle is cut");
    assert_eq!(graph.columns(), &["name".to_string()]);
    assert!(graph.relationship("assistant").is_none());
}

#[test]
fn test_extracted_graph_skips_lazy_fields() {
    let graph = extract(PlayerOut::output_shape(), 8).expect("extracts");
    assert!(graph.columns().iter().any(|c| c == "name"));
    assert!(!graph.columns().iter().any(|c| c == "notes"));
    let matches = graph.relationship("matches").expect("matches graph");
    assert_eq!(matches.columns(), &["opponent".to_string(), "played_on".to_string()]);
}

#![forbid(unsafe_code)]

use std::fs;

use chrono::{NaiveDate, NaiveDateTime};
use dg_conformance::{
    ConformanceError, DEFAULT_SUM_TOLERANCE, PopulationSource, ScenarioConfig, ScenarioReport,
    run_scenario, validate, write_scenario_report,
};
use dg_frame::{ChangeKind, ChangeSet, Population};
use dg_groupby::AggregateEntry;
use dg_incremental::{IncrementalEngine, Stage};
use dg_io::write_trips_csv_string;
use dg_runtime::{RuntimeMode, RuntimePolicy};
use dg_simulate::{PopulationSynth, UpdateSample, default_zone_catalogue};
use dg_types::{GroupKey, RecordId, TripRecord};

fn at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 1, 15)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .expect("valid timestamp")
}

fn trip(borough: &str, zone: &str, hour: u32, amount: f64) -> TripRecord {
    TripRecord::new(at(hour, 5), amount, 1)
        .with_zone(borough, zone)
        .with_trip_distance(2.0)
}

fn small_config(name: &str, rows: usize, changes: usize) -> ScenarioConfig {
    ScenarioConfig {
        name: name.to_owned(),
        population: PopulationSource::Synthetic(PopulationSynth::new(rows, 11)),
        inserts: changes,
        updates: changes,
        deletes: changes,
        seed: 7,
        ..ScenarioConfig::default()
    }
}

#[test]
fn scenario_a_inserts_into_existing_group() {
    let amounts = [10.0, 12.5, 8.25, 30.0, 14.0, 9.5, 22.0, 17.75];
    let population = amounts
        .iter()
        .map(|amount| trip("A", "Z", 9, *amount))
        .collect::<Population>();
    let key = GroupKey::new("A", "Z", 9);

    let mut engine =
        IncrementalEngine::baseline(population, RuntimePolicy::strict()).expect("baseline");
    let before = engine.state().entry_or_zero(&key);
    assert_eq!(before, AggregateEntry::new(8, amounts.iter().sum()));

    let report = engine
        .apply_insert(vec![trip("A", "Z", 9, 5.0), trip("A", "Z", 9, 7.5)])
        .expect("insert");
    assert_eq!(report.rows, 2);
    assert_eq!(report.groups_touched, 1);

    let after = engine.state().entry_or_zero(&key);
    assert_eq!(after.count, before.count + 2);
    assert!((after.sum - (before.sum + 12.5)).abs() < DEFAULT_SUM_TOLERANCE);

    let validation = validate(engine.state(), engine.population()).expect("validate");
    assert!(validation.passed);
}

#[test]
fn scenario_b_update_migrates_between_hour_buckets() {
    let population = Population::from_records(vec![
        trip("Manhattan", "SoHo", 10, 20.0),
        trip("Manhattan", "SoHo", 10, 15.0),
        trip("Manhattan", "SoHo", 11, 9.0),
    ]);
    let source = GroupKey::new("Manhattan", "SoHo", 10);
    let target = GroupKey::new("Manhattan", "SoHo", 11);

    let mut engine =
        IncrementalEngine::baseline(population, RuntimePolicy::strict()).expect("baseline");
    engine.apply_insert(Vec::new()).expect("empty insert");

    let moved = RecordId(0);
    let pre_image = ChangeSet::capture(ChangeKind::UpdateOld, engine.population(), &[moved])
        .expect("capture");
    let post_image = ChangeSet::new(
        ChangeKind::UpdateNew,
        vec![(moved, trip("Manhattan", "SoHo", 11, 20.0))],
    );
    engine
        .apply_update(UpdateSample {
            pre_image,
            post_image,
        })
        .expect("update");

    assert_eq!(engine.state().entry_or_zero(&source), AggregateEntry::new(1, 15.0));
    assert_eq!(engine.state().entry_or_zero(&target), AggregateEntry::new(2, 29.0));
    assert!(
        validate(engine.state(), engine.population())
            .expect("validate")
            .passed
    );
}

#[test]
fn scenario_c_deleting_a_whole_group_keeps_a_zero_entry() {
    let population = Population::from_records(vec![
        trip("Queens", "Astoria", 18, 11.1),
        trip("Queens", "Astoria", 18, 23.3),
        trip("Queens", "Astoria", 18, 0.7),
        trip("Brooklyn", "Park Slope", 18, 40.0),
    ]);
    let emptied = GroupKey::new("Queens", "Astoria", 18);

    let mut engine =
        IncrementalEngine::baseline(population, RuntimePolicy::strict()).expect("baseline");
    engine.apply_insert(Vec::new()).expect("empty insert");
    engine
        .apply_update(UpdateSample {
            pre_image: ChangeSet::new(ChangeKind::UpdateOld, Vec::new()),
            post_image: ChangeSet::new(ChangeKind::UpdateNew, Vec::new()),
        })
        .expect("empty update");
    engine
        .apply_delete(&[RecordId(0), RecordId(1), RecordId(2)])
        .expect("delete");

    let entry = engine.state().get(&emptied).copied().expect("key retained");
    assert_eq!(entry.count, 0);
    assert_eq!(entry.sum, 0.0);
    assert_eq!(engine.state().len(), 2);

    let validation = validate(engine.state(), engine.population()).expect("validate");
    assert!(validation.passed);
    assert_eq!(validation.vanished_keys, 1);

    let outcome = engine.finish().expect("finish");
    assert_eq!(outcome.final_population.len(), 1);
}

#[test]
fn scenario_d_fifty_thousand_rows_with_five_thousand_of_each_change() {
    let config = ScenarioConfig {
        name: "scenario-d".to_owned(),
        ..ScenarioConfig::default()
    };
    let report = run_scenario(&config).expect("scenario");

    assert_eq!(report.initial_rows, 50_000);
    assert_eq!(report.final_rows, 50_000);
    assert_eq!(report.validation.max_count_diff, 0);
    assert!(report.validation.max_sum_diff < 1e-6);
    assert!(report.is_green());
    assert!(report.validation.mismatched_keys.is_empty());

    let stages = report.stages.iter().map(|stage| stage.stage).collect::<Vec<_>>();
    assert_eq!(
        stages,
        vec![Stage::Baseline, Stage::Insert, Stage::Update, Stage::Delete]
    );
    assert!(report.stages[1..].iter().all(|stage| stage.rows == 5_000));
    assert!(report.speedup > 0.0);
}

#[test]
fn fixed_seed_scenarios_are_reproducible() {
    let config = small_config("repeat", 1_500, 300);
    let first = run_scenario(&config).expect("first run");
    let second = run_scenario(&config).expect("second run");
    assert_eq!(first.state_digest, second.state_digest);
    assert_eq!(first.groups, second.groups);

    let reseeded = ScenarioConfig {
        seed: 8,
        ..config
    };
    let third = run_scenario(&reseeded).expect("reseeded run");
    assert_ne!(first.state_digest, third.state_digest);
}

#[test]
fn partitioned_full_recompute_stays_green() {
    let config = ScenarioConfig {
        partitions: 4,
        ..small_config("partitioned", 6_000, 800)
    };
    let report = run_scenario(&config).expect("scenario");
    assert!(report.is_green());
}

#[test]
fn hardened_scenario_skips_unknown_zones_and_stays_green() {
    let config = ScenarioConfig {
        population: PopulationSource::Synthetic(
            PopulationSynth::new(2_000, 3).with_unknown_zone_ratio(0.1),
        ),
        mode: RuntimeMode::Hardened,
        ..small_config("hardened", 2_000, 200)
    };
    let report = run_scenario(&config).expect("scenario");
    assert!(report.is_green());
    assert!(report.skipped_rows > 0);
    assert!(report.audit_records >= report.skipped_rows);
}

#[test]
fn strict_scenario_rejects_unknown_zones() {
    let config = ScenarioConfig {
        population: PopulationSource::Synthetic(
            PopulationSynth::new(500, 3).with_unknown_zone_ratio(0.5),
        ),
        ..small_config("strict", 500, 50)
    };
    let err = run_scenario(&config).expect_err("missing zone must fail");
    assert!(matches!(err, ConformanceError::Incremental(_)));
}

#[test]
fn config_loads_from_yaml_and_json_files() {
    let dir = tempfile::tempdir().expect("tempdir");

    let yaml = dir.path().join("scenario.yaml");
    fs::write(
        &yaml,
        "name: from-yaml\n\
         seed: 9\n\
         deletes: 100\n\
         partitions: 2\n\
         population:\n  kind: synthetic\n  rows: 1000\n  seed: 5\n",
    )
    .expect("write yaml");
    let config = ScenarioConfig::from_path(&yaml).expect("yaml config");
    assert_eq!(config.name, "from-yaml");
    assert_eq!(config.seed, 9);
    assert_eq!(config.deletes, 100);
    assert_eq!(config.inserts, 5_000);
    assert_eq!(config.plan().exec.partitions, 2);
    assert_eq!(
        config.population,
        PopulationSource::Synthetic(PopulationSynth::new(1_000, 5))
    );

    let json = dir.path().join("scenario.json");
    fs::write(&json, r#"{"name": "from-json", "mode": "hardened", "tolerance": 0.001}"#)
        .expect("write json");
    let config = ScenarioConfig::from_path(&json).expect("json config");
    assert_eq!(config.mode, RuntimeMode::Hardened);
    assert_eq!(config.tolerance, 0.001);
    assert_eq!(config.policy(), RuntimePolicy::hardened());

    let toml = dir.path().join("scenario.toml");
    fs::write(&toml, "name = 'nope'").expect("write toml");
    assert!(matches!(
        ScenarioConfig::from_path(&toml),
        Err(ConformanceError::UnsupportedConfigFormat(_))
    ));
}

#[test]
fn report_is_written_as_pretty_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("reports").join("small.json");

    let report = run_scenario(&small_config("written", 800, 100)).expect("scenario");
    write_scenario_report(&path, &report).expect("write report");

    let text = fs::read_to_string(&path).expect("read report");
    assert!(text.contains("\n  \"name\": \"written\""));
    let parsed: ScenarioReport = serde_json::from_str(&text).expect("parse report");
    assert_eq!(parsed.state_digest, report.state_digest);
    assert_eq!(parsed.validation.passed, report.validation.passed);
    assert_eq!(parsed.stages, report.stages);
}

#[test]
fn csv_population_matches_synthetic_population() {
    let dir = tempfile::tempdir().expect("tempdir");
    let synth = PopulationSynth::new(1_200, 21);

    let trips_path = dir.path().join("trips.csv");
    let raw = synth.raw_trips().expect("raw trips");
    fs::write(&trips_path, write_trips_csv_string(&raw).expect("trips csv")).expect("write trips");

    let zones_path = dir.path().join("zones.csv");
    let mut zones = String::from("LocationID,Borough,Zone,service_zone\n");
    for descriptor in default_zone_catalogue() {
        zones.push_str(&format!(
            "{},\"{}\",\"{}\",\"{}\"\n",
            descriptor.location_id,
            descriptor.borough.unwrap_or_default(),
            descriptor.zone.unwrap_or_default(),
            descriptor.service_zone.unwrap_or_default()
        ));
    }
    fs::write(&zones_path, zones).expect("write zones");

    let from_csv = ScenarioConfig {
        population: PopulationSource::Csv {
            trips: trips_path,
            zones: Some(zones_path),
            clean: true,
        },
        ..small_config("csv", 1_200, 150)
    };
    let synthetic = ScenarioConfig {
        population: PopulationSource::Synthetic(synth),
        ..small_config("synthetic", 1_200, 150)
    };

    let csv_report = run_scenario(&from_csv).expect("csv scenario");
    let synthetic_report = run_scenario(&synthetic).expect("synthetic scenario");
    assert!(csv_report.is_green());
    assert_eq!(csv_report.initial_rows, synthetic_report.initial_rows);
    assert_eq!(csv_report.groups, synthetic_report.groups);
    assert_eq!(csv_report.state_digest, synthetic_report.state_digest);
}

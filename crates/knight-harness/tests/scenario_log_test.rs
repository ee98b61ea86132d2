use std::path::PathBuf;

use knight_core::KnightConfig;
use knight_harness::structured_log::{sha256_hex, validate_log_file, validate_log_line};
use knight_harness::{LogEmitter, RunOptions, Scenario, run_scenario};

fn temp_log(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("knight-harness-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    dir.join(name)
}

#[test]
fn scenario_log_validates_and_matches_digest() {
    let path = temp_log("all_scenarios.jsonl");
    let options = RunOptions {
        seed: 0xC0DE,
        ops: 4_000,
        ..RunOptions::default()
    };

    let mut emitter = LogEmitter::to_file(&path, "itest").expect("log file");
    for scenario in Scenario::all() {
        let report = run_scenario(scenario, &options, &mut emitter).expect("scenario");
        assert!(
            report.passed(),
            "{}: {:?}",
            scenario.as_str(),
            report.failed_checks().collect::<Vec<_>>()
        );
        assert!(report.lifecycle_events > 0, "{} logged nothing", scenario.as_str());
    }
    emitter.flush().expect("flush");

    let (lines, errors) = validate_log_file(&path).expect("read log");
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(lines, emitter.lines());

    let bytes = std::fs::read(&path).expect("read log");
    assert_eq!(sha256_hex(&bytes), emitter.digest());
    assert_eq!(bytes.len() as u64, emitter.bytes_written());

    let content = String::from_utf8(bytes).expect("utf8");
    let mut starts = 0;
    let mut ends = 0;
    let mut components = std::collections::HashSet::new();
    for (i, line) in content.lines().enumerate() {
        let entry = validate_log_line(line, i + 1).expect("valid line");
        assert_eq!(entry.run_id.as_deref(), Some("itest"));
        match entry.event.as_str() {
            "scenario_start" => starts += 1,
            "scenario_end" => ends += 1,
            _ => {}
        }
        if let Some(component) = entry.component {
            components.insert(component);
        }
    }
    assert_eq!(starts, 4);
    assert_eq!(ends, 4);
    for component in ["page", "lump", "code_cache", "hash_table", "harness"] {
        assert!(components.contains(component), "no {component} records");
    }

    let _ = std::fs::remove_file(&path);
}

#[test]
fn tight_code_regions_still_pass() {
    let options = RunOptions {
        seed: 7,
        ops: 3_000,
        config: KnightConfig::default().with_code_region_size(0),
    };
    let mut emitter = LogEmitter::to_sink("tight");
    let report = run_scenario(Scenario::CodeChurn, &options, &mut emitter).expect("scenario");
    assert!(report.passed(), "{:?}", report.failed_checks().collect::<Vec<_>>());
    assert!(report.regions > 1);
}

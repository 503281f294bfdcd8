//! End-to-end checks of the run-set lifecycle: persisting metadata, parsing
//! capture files, resume-skip detection, and cross-run-set alignment.

use std::fs;
use std::path::Path;

use clusterperf::results::{
    align, load_metadata, load_run, load_run_set, run_complete, save_metadata, TestMetadata,
    RESULT_HEADER,
};

fn metadata(bin: &str) -> TestMetadata {
    TestMetadata {
        bin: bin.to_string(),
        cluster: "alpha".to_string(),
        nodes: vec![1, 2, 3, 4],
        env: "SERVER_TRACE=off".to_string(),
        args: vec!["--cache=25%".to_string()],
        test: "./kv --read-percent=95 --splits=1000 --duration=300s --concurrency=%d".to_string(),
        date: "2026-08-01T09_30_00".to_string(),
    }
}

fn write_capture(dir: &Path, name: &str, ops_sec: f64) {
    let body = format!(
        "./kv --read-percent=95 --concurrency={name}\n\
         {RESULT_HEADER}\n  300.0s 0 120000 {ops_sec:.1} 24.1 20.0 55.0 90.0 120.0\n"
    );
    fs::write(dir.join(name), body).unwrap();
}

#[test]
fn run_set_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    save_metadata(dir.path(), &metadata("dbserver-6151ae1")).unwrap();
    for (c, ops) in [(3, 150.0), (6, 290.0), (12, 540.0)] {
        write_capture(dir.path(), &c.to_string(), ops);
    }
    // An in-flight capture and the metadata file are not runs.
    fs::write(dir.path().join("24"), "still running\n").unwrap();

    let data = load_run_set(dir.path()).unwrap();
    assert_eq!(data.metadata, metadata("dbserver-6151ae1"));
    let concurrencies: Vec<i64> = data.runs.iter().map(|r| r.concurrency).collect();
    assert_eq!(concurrencies, vec![3, 6, 12]);
    assert_eq!(data.runs[1].ops_sec, 290.0);
}

#[test]
fn resume_skips_only_complete_runs() {
    let dir = tempfile::tempdir().unwrap();
    save_metadata(dir.path(), &metadata("dbserver-6151ae1")).unwrap();
    write_capture(dir.path(), "10", 100.0);
    write_capture(dir.path(), "20", 180.0);
    fs::write(dir.path().join("30"), "killed before the summary\n").unwrap();

    assert!(run_complete(dir.path(), "10"));
    assert!(run_complete(dir.path(), "20"));
    assert!(!run_complete(dir.path(), "30"));
    assert!(!run_complete(dir.path(), "40"));

    // The interrupted capture reads as "no run" rather than an error, so a
    // resumed sweep will redo it.
    assert!(load_run(dir.path(), "30").unwrap().is_none());
}

#[test]
fn metadata_mismatch_is_visible_to_resume_validation() {
    let dir = tempfile::tempdir().unwrap();
    save_metadata(dir.path(), &metadata("dbserver-6151ae1")).unwrap();

    let loaded = load_metadata(dir.path()).unwrap();
    assert_eq!(loaded.bin, "dbserver-6151ae1");
    assert_ne!(loaded, metadata("dbserver-83c2ff0"));
}

#[test]
fn aligned_comparison_across_two_run_sets() {
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    save_metadata(dir1.path(), &metadata("dbserver-6151ae1")).unwrap();
    save_metadata(dir2.path(), &metadata("dbserver-83c2ff0")).unwrap();

    for (c, ops) in [(1, 10.0), (2, 20.0), (4, 40.0), (8, 80.0)] {
        write_capture(dir1.path(), &c.to_string(), ops);
    }
    for (c, ops) in [(2, 30.0), (4, 50.0), (8, 90.0), (16, 170.0)] {
        write_capture(dir2.path(), &c.to_string(), ops);
    }

    let d1 = load_run_set(dir1.path()).unwrap();
    let d2 = load_run_set(dir2.path()).unwrap();
    let aligned = align(&[d1, d2]);

    // Overlap is [2, 8]; both sets observed 2, 4, and 8 directly.
    for set in &aligned {
        let axis: Vec<i64> = set.runs.iter().map(|r| r.concurrency).collect();
        assert_eq!(axis, vec![2, 4, 8]);
    }
    assert_eq!(aligned[0].runs[0].ops_sec, 20.0);
    assert_eq!(aligned[1].runs[0].ops_sec, 30.0);
}

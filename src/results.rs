//! The run-set result model: persisted metadata, parsed benchmark runs, and
//! alignment of differently-sampled run-sets for comparison.
//!
//! A run-set directory holds one `metadata` file plus one file per
//! concurrency value (or named run) containing the raw captured console
//! output of the load generator. Runs are re-derived from those captures on
//! every load.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Column-header marker emitted by the load generator ahead of its cumulative
/// summary line. A capture without it is an incomplete run.
pub const RESULT_HEADER: &str =
    "_elapsed___errors_____ops(total)___ops/sec(cum)__avg(ms)__p50(ms)__p95(ms)__p99(ms)_pMax(ms)";

/// Persisted description of a run-set. Resuming a run-set requires the
/// freshly detected binary version, node list, and environment to match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMetadata {
    pub bin: String,
    pub cluster: String,
    pub nodes: Vec<usize>,
    pub env: String,
    pub args: Vec<String>,
    /// Load generator invocation template with a `%d` concurrency
    /// placeholder.
    pub test: String,
    pub date: String,
}

pub fn save_metadata(dir: &Path, meta: &TestMetadata) -> Result<()> {
    let path = dir.join("metadata");
    let json = serde_json::to_string_pretty(meta)?;
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))
}

pub fn load_metadata(dir: &Path) -> Result<TestMetadata> {
    let path = dir.join("metadata");
    let data = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// One parsed benchmark run. Immutable once parsed; the concurrency level
/// comes from the capture file's name, not its contents.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRun {
    pub concurrency: i64,
    pub elapsed: f64,
    pub errors: i64,
    pub ops: i64,
    pub ops_sec: f64,
    pub avg_lat: f64,
    pub p50_lat: f64,
    pub p95_lat: f64,
    pub p99_lat: f64,
}

/// Parse the capture file `name` inside `dir` into a run.
///
/// Returns `Ok(None)` for "no run": a name that is not an integer, a missing
/// file, or a capture without the header marker (an interrupted run). An
/// unreadable file or a malformed line after the marker is an error. The
/// distinction drives resume-skip detection.
pub fn load_run(dir: &Path, name: &str) -> Result<Option<TestRun>> {
    let concurrency: i64 = match name.parse() {
        Ok(n) => n,
        Err(_) => return Ok(None),
    };

    let path = dir.join(name);
    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };

    match parse_summary(&data)? {
        None => Ok(None),
        Some(run) => Ok(Some(TestRun {
            concurrency,
            ..run
        })),
    }
}

/// True if a complete capture for `name` already exists, i.e. the run can be
/// skipped on resume. An unreadable capture is re-run, not skipped.
pub fn run_complete(dir: &Path, name: &str) -> bool {
    if let Ok(n) = name.parse::<i64>() {
        return matches!(load_run(dir, &n.to_string()), Ok(Some(_)));
    }
    // Named runs carry no concurrency; completeness is the header marker.
    match fs::read_to_string(dir.join(name)) {
        Ok(data) => matches!(parse_summary(&data), Ok(Some(_))),
        Err(_) => false,
    }
}

fn parse_summary(data: &str) -> Result<Option<TestRun>> {
    let Some(at) = data.find(RESULT_HEADER) else {
        return Ok(None);
    };
    let rest = &data[at + RESULT_HEADER.len()..];

    let mut fields = rest.split_whitespace();
    let mut next = |what: &str| {
        fields
            .next()
            .with_context(|| format!("capture truncated before {what}"))
    };

    let elapsed = next("elapsed")?;
    let elapsed: f64 = elapsed
        .strip_suffix('s')
        .with_context(|| format!("elapsed {elapsed:?} missing 's' suffix"))?
        .parse()
        .with_context(|| format!("bad elapsed {elapsed:?}"))?;
    let errors: i64 = next("errors")?.parse().context("bad error count")?;
    let ops: i64 = next("ops")?.parse().context("bad op count")?;
    let ops_sec: f64 = next("ops/sec")?.parse().context("bad ops/sec")?;
    let avg_lat: f64 = next("avg latency")?.parse().context("bad avg latency")?;
    let p50_lat: f64 = next("p50 latency")?.parse().context("bad p50 latency")?;
    let p95_lat: f64 = next("p95 latency")?.parse().context("bad p95 latency")?;
    let p99_lat: f64 = next("p99 latency")?.parse().context("bad p99 latency")?;
    // pMax is present in the capture but not modeled.

    Ok(Some(TestRun {
        concurrency: 0,
        elapsed,
        errors,
        ops,
        ops_sec,
        avg_lat,
        p50_lat,
        p95_lat,
        p99_lat,
    }))
}

/// A loaded run-set: metadata plus its runs ordered by concurrency.
#[derive(Debug, Clone)]
pub struct TestData {
    pub metadata: TestMetadata,
    pub runs: Vec<TestRun>,
}

/// Load every parseable run in a run-set directory, ordered by concurrency.
pub fn load_run_set(dir: &Path) -> Result<TestData> {
    let metadata = load_metadata(dir)?;

    let mut runs = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(run) = load_run(dir, &name)? {
            runs.push(run);
        }
    }
    runs.sort_by_key(|r| r.concurrency);

    Ok(TestData { metadata, runs })
}

impl TestData {
    /// True if `concurrency` was observed directly.
    pub fn exists(&self, concurrency: i64) -> bool {
        self.runs
            .binary_search_by_key(&concurrency, |r| r.concurrency)
            .is_ok()
    }

    /// The aligned sample at `concurrency`: the observed run when exact, a
    /// linear interpolation between the bracketing observed runs otherwise,
    /// clamped to the nearest boundary sample outside the observed range.
    pub fn sample(&self, concurrency: i64) -> TestRun {
        match self
            .runs
            .binary_search_by_key(&concurrency, |r| r.concurrency)
        {
            Ok(i) => self.runs[i].clone(),
            Err(0) => self.runs[0].clone(),
            Err(i) if i == self.runs.len() => self.runs[self.runs.len() - 1].clone(),
            Err(i) => {
                let a = &self.runs[i - 1];
                let b = &self.runs[i];
                let t = (concurrency - a.concurrency) as f64
                    / (b.concurrency - a.concurrency) as f64;
                let lerp = |x: f64, y: f64| x + (y - x) * t;
                TestRun {
                    concurrency,
                    elapsed: lerp(a.elapsed, b.elapsed),
                    // The error count is not an interpolable rate.
                    errors: 0,
                    ops: lerp(a.ops as f64, b.ops as f64) as i64,
                    ops_sec: lerp(a.ops_sec, b.ops_sec),
                    avg_lat: lerp(a.avg_lat, b.avg_lat),
                    p50_lat: lerp(a.p50_lat, b.p50_lat),
                    p95_lat: lerp(a.p95_lat, b.p95_lat),
                    p99_lat: lerp(a.p99_lat, b.p99_lat),
                }
            }
        }
    }
}

/// Align two or more run-sets onto a shared concurrency axis.
///
/// The axis is every integer concurrency in
/// `[max(per-set minimum), min(per-set maximum)]` observed by at least one
/// set; each set contributes one sample per axis point. Any set without runs
/// empties the axis.
pub fn align(sets: &[TestData]) -> Vec<TestData> {
    if sets.iter().any(|d| d.runs.is_empty()) {
        return sets
            .iter()
            .map(|d| TestData {
                metadata: d.metadata.clone(),
                runs: Vec::new(),
            })
            .collect();
    }

    let min = sets
        .iter()
        .map(|d| d.runs[0].concurrency)
        .max()
        .unwrap_or(0);
    let max = sets
        .iter()
        .map(|d| d.runs[d.runs.len() - 1].concurrency)
        .min()
        .unwrap_or(0);

    let mut aligned: Vec<TestData> = sets
        .iter()
        .map(|d| TestData {
            metadata: d.metadata.clone(),
            runs: Vec::new(),
        })
        .collect();
    for concurrency in min..=max {
        if !sets.iter().any(|d| d.exists(concurrency)) {
            continue;
        }
        for (set, out) in sets.iter().zip(aligned.iter_mut()) {
            out.runs.push(set.sample(concurrency));
        }
    }
    aligned
}

/// Print one run-set, or align and compare exactly two.
pub fn dump(dirs: &[std::path::PathBuf]) -> Result<()> {
    match dirs {
        [] => bail!("no run-set directory specified"),
        [dir] => dump_one(&load_run_set(dir)?),
        [dir1, dir2] => dump_compare(&load_run_set(dir1)?, &load_run_set(dir2)?),
        _ => bail!("too many run-set directories: {dirs:?}"),
    }
}

fn dump_one(data: &TestData) -> Result<()> {
    println!("{}", data.metadata.test);
    println!("_____N_____ops/sec__avg(ms)__p50(ms)__p95(ms)__p99(ms)");
    for r in &data.runs {
        println!(
            "{:6} {:10.1} {:8.1} {:8.1} {:8.1} {:8.1}",
            r.concurrency, r.ops_sec, r.avg_lat, r.p50_lat, r.p95_lat, r.p99_lat
        );
    }
    Ok(())
}

fn dump_compare(d1: &TestData, d2: &TestData) -> Result<()> {
    let aligned = align(&[d1.clone(), d2.clone()]);
    let (a1, a2) = (&aligned[0], &aligned[1]);
    println!("{}", a1.metadata.test);
    println!("_____N__ops/sec(1)__ops/sec(2)_____delta");
    for (r1, r2) in a1.runs.iter().zip(&a2.runs) {
        println!(
            "{:6} {:11.1} {:11.1} {:7.2}%",
            r1.concurrency,
            r1.ops_sec,
            r2.ops_sec,
            100.0 * (r2.ops_sec - r1.ops_sec) / r1.ops_sec
        );
    }
    Ok(())
}

/// Histogram of per-node version strings; more than one distinct value means
/// the cluster is running mixed binaries.
pub fn version_histogram<I: IntoIterator<Item = String>>(versions: I) -> HashMap<String, usize> {
    let mut histogram = HashMap::new();
    for v in versions {
        *histogram.entry(v).or_insert(0) += 1;
    }
    histogram
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_capture(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    fn run(concurrency: i64, ops_sec: f64) -> TestRun {
        TestRun {
            concurrency,
            elapsed: 10.0,
            errors: 0,
            ops: (ops_sec * 10.0) as i64,
            ops_sec,
            avg_lat: 1.0,
            p50_lat: 1.0,
            p95_lat: 2.0,
            p99_lat: 3.0,
        }
    }

    fn data(runs: Vec<TestRun>) -> TestData {
        TestData {
            metadata: TestMetadata {
                bin: "bin-deadbeef".to_string(),
                cluster: "alpha".to_string(),
                nodes: vec![1, 2, 3],
                env: String::new(),
                args: Vec::new(),
                test: "./kv --concurrency=%d".to_string(),
                date: "2026-01-02T03_04_05".to_string(),
            },
            runs,
        }
    }

    #[test]
    fn parse_complete_capture() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!("noise before\n{RESULT_HEADER}\n  12.3s 0 5000 406.5 24.1 20.0 55.0 90.0 120.0\n");
        write_capture(dir.path(), "64", &body);

        let run = load_run(dir.path(), "64").unwrap().unwrap();
        assert_eq!(run.concurrency, 64);
        assert_eq!(run.elapsed, 12.3);
        assert_eq!(run.errors, 0);
        assert_eq!(run.ops, 5000);
        assert_eq!(run.ops_sec, 406.5);
        assert_eq!(run.avg_lat, 24.1);
        assert_eq!(run.p50_lat, 20.0);
        assert_eq!(run.p95_lat, 55.0);
        assert_eq!(run.p99_lat, 90.0);
    }

    #[test]
    fn missing_header_is_no_run_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(dir.path(), "8", "load generator died before summary\n");
        assert!(load_run(dir.path(), "8").unwrap().is_none());
    }

    #[test]
    fn missing_file_and_non_integer_name_are_no_run() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_run(dir.path(), "32").unwrap().is_none());
        write_capture(dir.path(), "metadata", "{}");
        assert!(load_run(dir.path(), "metadata").unwrap().is_none());
    }

    #[test]
    fn truncated_summary_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(dir.path(), "16", &format!("{RESULT_HEADER}\n  12.3s 0\n"));
        assert!(load_run(dir.path(), "16").is_err());
    }

    #[test]
    fn run_set_orders_by_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("metadata"),
            serde_json::to_string(&data(vec![]).metadata).unwrap(),
        )
        .unwrap();
        for c in [32, 8, 16] {
            let body = format!("{RESULT_HEADER}\n  10.0s 0 1000 {c}.0 1.0 1.0 2.0 3.0 4.0\n");
            write_capture(dir.path(), &c.to_string(), &body);
        }
        // An interrupted capture is skipped, not fatal.
        write_capture(dir.path(), "64", "interrupted\n");

        let loaded = load_run_set(dir.path()).unwrap();
        let order: Vec<i64> = loaded.runs.iter().map(|r| r.concurrency).collect();
        assert_eq!(order, vec![8, 16, 32]);
    }

    #[test]
    fn alignment_of_overlapping_sets_is_exact() {
        let d1 = data(vec![run(1, 10.0), run(2, 20.0), run(4, 40.0), run(8, 80.0)]);
        let d2 = data(vec![run(2, 25.0), run(4, 45.0), run(8, 85.0), run(16, 165.0)]);

        let aligned = align(&[d1, d2]);
        let axis: Vec<i64> = aligned[0].runs.iter().map(|r| r.concurrency).collect();
        assert_eq!(axis, vec![2, 4, 8]);
        assert_eq!(
            aligned[1].runs.iter().map(|r| r.concurrency).collect::<Vec<_>>(),
            vec![2, 4, 8]
        );

        // Both sets observed those points directly, so no interpolation.
        assert_eq!(aligned[0].runs[0], run(2, 20.0));
        assert_eq!(aligned[1].runs[2], run(8, 85.0));
    }

    #[test]
    fn interpolation_at_midpoint() {
        let d = data(vec![run(2, 100.0), run(4, 200.0)]);
        let s = d.sample(3);
        assert_eq!(s.concurrency, 3);
        assert_eq!(s.ops_sec, 150.0);
        assert_eq!(s.elapsed, 10.0);
    }

    #[test]
    fn out_of_range_samples_clamp_to_boundaries() {
        let d = data(vec![run(4, 100.0), run(8, 200.0)]);
        assert_eq!(d.sample(2), run(4, 100.0));
        assert_eq!(d.sample(100), run(8, 200.0));
    }

    #[test]
    fn empty_set_empties_the_alignment() {
        let d1 = data(vec![run(1, 10.0)]);
        let d2 = data(vec![]);
        let aligned = align(&[d1, d2]);
        assert!(aligned[0].runs.is_empty());
        assert!(aligned[1].runs.is_empty());
    }

    #[test]
    fn metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let meta = data(vec![]).metadata;
        save_metadata(dir.path(), &meta).unwrap();
        assert_eq!(load_metadata(dir.path()).unwrap(), meta);
    }

    #[test]
    fn version_histogram_counts_distinct_values() {
        let h = version_histogram(
            ["v1.2", "v1.2", "v1.3"].into_iter().map(String::from),
        );
        assert_eq!(h.len(), 2);
        assert_eq!(h["v1.2"], 2);
        assert_eq!(h["v1.3"], 1);
    }

    #[test]
    fn dump_rejects_bad_arity() {
        assert!(dump(&[]).is_err());
        let many: Vec<PathBuf> = (0..3).map(|i| PathBuf::from(format!("d{i}"))).collect();
        assert!(dump(&many).is_err());
    }
}

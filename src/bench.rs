//! The resumable benchmark driver.
//!
//! A test bootstraps the cluster and sweeps the load generator across
//! increasing concurrency levels, persisting one capture file per run so an
//! interrupted invocation can resume where it stopped. Resuming validates
//! the persisted metadata against the cluster's freshly detected state:
//! continuing with mismatched binaries, node lists, or environments would
//! silently mix incomparable data.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cluster::{Cluster, ClusterConfig};
use crate::results::{self, TestMetadata};
use crate::ssh::SshError;

/// Options shared by every test invocation.
pub struct TestOpts {
    /// Duration of each individual load run.
    pub duration: Duration,
    /// Concurrency sweep specification, `<lo>[-<hi>[/<step>]]`; every value
    /// scales by the number of active server nodes.
    pub concurrency: String,
    /// Cancelled on SIGINT/SIGTERM/SIGQUIT, or by tests.
    pub interrupt: CancellationToken,
}

const TESTS: &[&str] = &["kv_0", "kv_95", "nightly"];

pub fn known_tests() -> &'static [&'static str] {
    TESTS
}

/// Wire the interrupt token to the process's terminate-ish signals.
pub fn signal_interrupt() -> Result<CancellationToken> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = int.recv() => {}
            _ = term.recv() => {}
            _ = quit.recv() => {}
        }
        info!("interrupt received, stopping after the current run");
        t.cancel();
    });
    Ok(token)
}

/// Resolve a test argument: either a test name, or the directory of a
/// previous run-set (named `<test>.<binary-tag>`) to resume.
fn find_test(arg: &str) -> Result<(&'static str, Option<PathBuf>)> {
    if let Some(test) = TESTS.iter().find(|&&t| t == arg) {
        return Ok((test, None));
    }
    let base = Path::new(arg)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = base.split('.').next().unwrap_or_default();
    if let Some(test) = TESTS.iter().find(|&&t| t == stem) {
        return Ok((test, Some(PathBuf::from(arg))));
    }
    bail!("unknown test: {arg}");
}

/// Run (or resume) the named test against the configured cluster.
pub async fn run_test(arg: &str, config: ClusterConfig, opts: TestOpts) -> Result<()> {
    let (test, dir) = find_test(arg)?;
    match test {
        "kv_0" => {
            concurrency_sweep(config, "kv_0", "./kv --read-percent=0 --splits=1000", dir, opts)
                .await
        }
        "kv_95" => {
            concurrency_sweep(config, "kv_95", "./kv --read-percent=95 --splits=1000", dir, opts)
                .await
        }
        "nightly" => nightly(config, dir, opts).await,
        _ => unreachable!(),
    }
}

/// Sweep the load generator across increasing concurrency levels, skipping
/// any level that already has a complete capture. Server processes are
/// stopped unconditionally at the end, whether the sweep completed, was
/// interrupted, or aborted on error.
async fn concurrency_sweep(
    config: ClusterConfig,
    test_name: &str,
    load_cmd: &str,
    dir: Option<PathBuf>,
    opts: TestOpts,
) -> Result<()> {
    let template = format!(
        "{load_cmd} --duration={}s --concurrency=%d",
        opts.duration.as_secs()
    );
    let (c, dir, meta) = setup(config, test_name, &template, dir).await?;

    let result = async {
        let (lo, hi, step) = parse_concurrency(&opts.concurrency, c.server_nodes().len())?;
        let mut concurrency = lo;
        while concurrency <= hi {
            let run_name = concurrency.to_string();
            if results::run_complete(&dir, &run_name) {
                debug!("{}: skipping completed run {run_name}", c.name);
                concurrency += step;
                continue;
            }
            match one_run(&c, &dir, &run_name, &meta.test, &opts.interrupt).await {
                Ok(()) if opts.interrupt.is_cancelled() => break,
                Ok(()) => {}
                Err(err) if is_killed(&err) => break,
                Err(err) => return Err(err),
            }
            concurrency += step;
        }
        Ok(())
    }
    .await;

    let stopped = c.stop().await;
    result.and(stopped)
}

/// Run a fixed list of named load profiles once each, with the same resume,
/// interrupt, and stop semantics as the concurrency sweep.
async fn nightly(config: ClusterConfig, dir: Option<PathBuf>, opts: TestOpts) -> Result<()> {
    const RUNS: &[(&str, &str)] = &[
        (
            "kv_0",
            "./kv --read-percent=0 --splits=1000 --concurrency=384 --duration=10m",
        ),
        (
            "kv_95",
            "./kv --read-percent=95 --splits=1000 --concurrency=384 --duration=10m",
        ),
    ];

    let (c, dir, _) = setup(config, "nightly", "nightly", dir).await?;

    let result = async {
        for (run_name, cmd) in RUNS {
            if results::run_complete(&dir, run_name) {
                debug!("{}: skipping completed run {run_name}", c.name);
                continue;
            }
            match one_run(&c, &dir, run_name, cmd, &opts.interrupt).await {
                Ok(()) if opts.interrupt.is_cancelled() => break,
                Ok(()) => {}
                Err(err) if is_killed(&err) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
    .await;

    let stopped = c.stop().await;
    result.and(stopped)
}

/// Wipe, (re)start, then drive one load run into its capture file.
async fn one_run(
    c: &Cluster,
    dir: &Path,
    run_name: &str,
    template: &str,
    interrupt: &CancellationToken,
) -> Result<()> {
    c.wipe().await?;
    c.start().await?;
    let cmd = template.replace("%d", run_name);
    c.run_load(&cmd, &dir.join(run_name), interrupt).await
}

fn is_killed(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SshError>()
        .is_some_and(SshError::is_sigkill)
}

/// Build the cluster and resolve the run-set directory and metadata:
/// detect the (required unanimous) binary version, then either create and
/// persist fresh metadata or validate against a resumed run-set. Finishes by
/// caching the server binary into the run-set directory.
async fn setup(
    mut config: ClusterConfig,
    test_name: &str,
    template: &str,
    dir: Option<PathBuf>,
) -> Result<(Cluster, PathBuf, TestMetadata)> {
    let existing = match &dir {
        Some(dir) => {
            let prev = results::load_metadata(dir)?;
            // Resuming pins the cluster and server arguments recorded when
            // the run-set was created.
            config.name = prev.cluster.clone();
            config.args = prev.args.clone();
            Some(prev)
        }
        None => None,
    };

    let c = config.build()?;
    if c.load_gen == 0 {
        bail!("{}: no load generator node specified", c.name);
    }

    let mut meta = TestMetadata {
        bin: detect_binary_tag(&c).await?,
        cluster: c.name.clone(),
        nodes: c.nodes.clone(),
        env: c.env.clone(),
        args: c.args.clone(),
        test: template.to_string(),
        date: Utc::now().format("%Y-%m-%dT%H_%M_%S").to_string(),
    };

    let (dir, meta) = match (dir, existing) {
        (Some(dir), Some(prev)) => {
            if check_resume(&meta, &prev)? == Resume::PushBinary {
                put_bin(&c, &dir).await.with_context(|| {
                    format!("server binary changed: {} != {}", meta.bin, prev.bin)
                })?;
                meta.bin = detect_binary_tag(&c).await?;
                if meta.bin != prev.bin {
                    bail!("server binary changed: {} != {}", meta.bin, prev.bin);
                }
            }
            (dir, prev)
        }
        _ => {
            let dir = PathBuf::from(format!("{test_name}.{}", meta.bin));
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating run-set directory {}", dir.display()))?;
            results::save_metadata(&dir, &meta)?;
            (dir, meta)
        }
    };

    println!("{}: {}", c.name, dir.display());
    get_bin(&c, &dir).await?;
    Ok((c, dir, meta))
}

#[derive(Debug, PartialEq)]
enum Resume {
    Proceed,
    /// The detected binary differs: push the cached one and re-detect.
    PushBinary,
}

/// Decide whether a run-set can be resumed against the freshly detected
/// cluster state. A changed node list or environment is unrecoverable; a
/// changed binary can be repaired by redeploying the cached one.
fn check_resume(fresh: &TestMetadata, prev: &TestMetadata) -> Result<Resume> {
    if fresh.nodes != prev.nodes {
        bail!(
            "node list changed: {:?} != {:?}",
            fresh.nodes,
            prev.nodes
        );
    }
    if fresh.env != prev.env {
        bail!("environment changed: {:?} != {:?}", fresh.env, prev.env);
    }
    if fresh.bin != prev.bin {
        return Ok(Resume::PushBinary);
    }
    Ok(Resume::Proceed)
}

/// Detect the single binary version running across the server nodes. Zero
/// or conflicting versions is fatal.
async fn detect_binary_tag(c: &Cluster) -> Result<String> {
    let versions = c.versions().await?;
    match versions.len() {
        0 => bail!("unable to determine server version"),
        1 => {
            let version = versions.keys().next().map(String::as_str).unwrap_or("");
            if version.is_empty() {
                bail!("unable to determine server version");
            }
            Ok(c.flavor.binary_tag(version))
        }
        _ => bail!("mismatched server versions: {versions:?}"),
    }
}

fn cached_bin(c: &Cluster, dir: &Path) -> PathBuf {
    let name = c
        .flavor
        .binary()
        .rsplit('/')
        .next()
        .unwrap_or("binary")
        .to_string();
    dir.join(name)
}

/// Cache the server binary from the first node into the run-set directory.
async fn get_bin(c: &Cluster, dir: &Path) -> Result<()> {
    let local = cached_bin(c, dir);
    if local.exists() {
        return Ok(());
    }
    let first = [c.nodes[0]];
    c.get(&first, c.flavor.binary(), &local.to_string_lossy())
        .await
}

/// Push the cached server binary back out to every node.
async fn put_bin(c: &Cluster, dir: &Path) -> Result<()> {
    let local = cached_bin(c, dir);
    if !local.exists() {
        bail!("no cached binary at {}", local.display());
    }
    c.put(&local, c.flavor.binary()).await
}

/// Parse a duration like "5m", "300s", "1h", or plain seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    let (value, scale) = match s.split_at(s.len() - 1) {
        (v, "h") => (v, 3600),
        (v, "m") => (v, 60),
        (v, "s") => (v, 1),
        _ => (s, 1),
    };
    let value: u64 = value
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(Duration::from_secs(value * scale))
}

/// Parse `<lo>[-<hi>[/<step>]]`, multiplying each value by the number of
/// active server nodes.
fn parse_concurrency(spec: &str, server_count: usize) -> Result<(u64, u64, u64)> {
    let n = server_count.max(1) as u64;

    let (range, step) = match spec.split_once('/') {
        Some((range, step)) => {
            let step: u64 = step
                .parse()
                .with_context(|| format!("unable to parse concurrency setting: {spec}"))?;
            (range, step)
        }
        None => (spec, 1),
    };
    if step == 0 {
        bail!("unable to parse concurrency setting: {spec}");
    }

    let (lo, hi) = match range.split_once('-') {
        Some((lo, hi)) => {
            let lo: u64 = lo
                .parse()
                .with_context(|| format!("unable to parse concurrency setting: {spec}"))?;
            let hi: u64 = hi
                .parse()
                .with_context(|| format!("unable to parse concurrency setting: {spec}"))?;
            (lo, hi)
        }
        None => {
            let lo: u64 = range
                .parse()
                .with_context(|| format!("unable to parse concurrency setting: {spec}"))?;
            (lo, lo)
        }
    };

    Ok((lo * n, hi * n, step * n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::RESULT_HEADER;

    fn meta(bin: &str, nodes: Vec<usize>, env: &str) -> TestMetadata {
        TestMetadata {
            bin: bin.to_string(),
            cluster: "alpha".to_string(),
            nodes,
            env: env.to_string(),
            args: Vec::new(),
            test: "./kv --concurrency=%d".to_string(),
            date: "2026-01-02T03_04_05".to_string(),
        }
    }

    #[test]
    fn durations_accept_suffixes() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("300s").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn concurrency_scales_by_server_count() {
        assert_eq!(parse_concurrency("1-64", 3).unwrap(), (3, 192, 3));
        assert_eq!(parse_concurrency("2-8/2", 4).unwrap(), (8, 32, 8));
        assert_eq!(parse_concurrency("16", 2).unwrap(), (32, 32, 2));
    }

    #[test]
    fn concurrency_rejects_garbage() {
        assert!(parse_concurrency("", 3).is_err());
        assert!(parse_concurrency("a-b", 3).is_err());
        assert!(parse_concurrency("1-8/0", 3).is_err());
        assert!(parse_concurrency("1-8/x", 3).is_err());
    }

    #[test]
    fn find_test_resolves_names_and_resume_dirs() {
        assert_eq!(find_test("kv_0").unwrap(), ("kv_0", None));
        assert_eq!(
            find_test("kv_95.dbserver-6151ae1").unwrap(),
            ("kv_95", Some(PathBuf::from("kv_95.dbserver-6151ae1")))
        );
        assert_eq!(
            find_test("results/nightly.dbserver-abc").unwrap(),
            ("nightly", Some(PathBuf::from("results/nightly.dbserver-abc")))
        );
        assert!(find_test("no_such_test").is_err());
    }

    #[test]
    fn resume_validation() {
        let fresh = meta("dbserver-aaa", vec![1, 2, 3], "X=1");

        // Identical state proceeds.
        assert_eq!(
            check_resume(&fresh, &meta("dbserver-aaa", vec![1, 2, 3], "X=1")).unwrap(),
            Resume::Proceed
        );
        // A changed binary is repairable by redeploying.
        assert_eq!(
            check_resume(&fresh, &meta("dbserver-bbb", vec![1, 2, 3], "X=1")).unwrap(),
            Resume::PushBinary
        );
        // A changed node list or environment is always rejected.
        assert!(check_resume(&fresh, &meta("dbserver-aaa", vec![1, 2], "X=1")).is_err());
        assert!(check_resume(&fresh, &meta("dbserver-aaa", vec![1, 2, 3], "X=2")).is_err());
        // Node list trumps the repairable binary mismatch.
        assert!(check_resume(&fresh, &meta("dbserver-bbb", vec![1, 2], "X=1")).is_err());
    }

    #[test]
    fn interrupted_sweep_resumes_after_completed_runs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["10", "20"] {
            let body = format!("{RESULT_HEADER}\n  10.0s 0 1000 100.0 1.0 1.0 2.0 3.0 4.0\n");
            fs::write(dir.path().join(name), body).unwrap();
        }
        // A capture that stopped before the summary is not complete.
        fs::write(dir.path().join("30"), "interrupted mid-run\n").unwrap();

        let (lo, hi, step) = parse_concurrency("10-50/10", 1).unwrap();
        let mut pending = Vec::new();
        let mut concurrency = lo;
        while concurrency <= hi {
            if !results::run_complete(dir.path(), &concurrency.to_string()) {
                pending.push(concurrency);
            }
            concurrency += step;
        }
        assert_eq!(pending, vec![30, 40, 50]);
    }
}

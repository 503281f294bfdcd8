//! Cluster topology and the operations fanned out across its nodes.
//!
//! A `Cluster` pairs a static topology (node identities, security mode,
//! designated load-generator node, environment and argument overrides) with
//! the connection pool and the server-flavor implementation chosen at
//! construction time. Node indices are stable `1..=N` for the topology's
//! lifetime.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::hosts;
use crate::parallel::{parallel, Progress};
use crate::server::{ServerFlavor, SqlServer, LOAD_PORT};
use crate::ssh::{RemoteSession, SshPool};

/// Static description of a cluster as loaded from its hosts file: one
/// `user@host [locality]` entry per node.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub name: String,
    pub hosts: Vec<String>,
    pub users: Vec<String>,
    pub localities: Vec<String>,
}

impl Topology {
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Everything the CLI knows before the topology is loaded.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster name, optionally suffixed with `:<nodes>` selecting a subset
    /// of node indices (`1-3,8-9` syntax).
    pub name: String,
    pub secure: bool,
    pub env: String,
    pub args: Vec<String>,
    pub binary: String,
    /// 1-based index of the load-generator node; 0 designates none.
    pub load_gen: usize,
    /// Bound on each blocking remote I/O operation; `None` is unbounded.
    pub cmd_timeout: Option<Duration>,
}

impl ClusterConfig {
    pub fn build(&self) -> Result<Cluster> {
        let (name, node_spec) = match self.name.split_once(':') {
            Some((name, spec)) => (name, spec),
            None => (self.name.as_str(), "all"),
        };
        if name.is_empty() {
            bail!("no cluster specified");
        }
        let topology = hosts::load_topology(name)?;
        let nodes = parse_nodes(node_spec, topology.len())
            .with_context(|| format!("cluster {name}"))?;
        if self.load_gen > topology.len() {
            bail!(
                "{name}: load generator index {} exceeds {} nodes",
                self.load_gen,
                topology.len()
            );
        }
        Ok(Cluster {
            name: name.to_string(),
            nodes,
            topology,
            load_gen: self.load_gen,
            secure: self.secure,
            env: self.env.clone(),
            args: self.args.clone(),
            flavor: Arc::new(SqlServer::new(&self.binary)),
            pool: Arc::new(SshPool::new(self.cmd_timeout)),
        })
    }
}

/// Parse a node selection: `all`, or a comma-separated list of 1-based
/// indices and inclusive ranges (`1-3,8-9`). The result is sorted and
/// de-duplicated.
pub fn parse_nodes(spec: &str, total: usize) -> Result<Vec<usize>> {
    if spec == "all" {
        return Ok((1..=total).collect());
    }

    let mut selected = std::collections::BTreeSet::new();
    for part in spec.split(',') {
        match part.split_once('-') {
            None => {
                let i: usize = part
                    .parse()
                    .with_context(|| format!("unable to parse nodes specification: {part:?}"))?;
                selected.insert(i);
            }
            Some((from, to)) => {
                let from: usize = from
                    .parse()
                    .with_context(|| format!("unable to parse nodes specification: {part:?}"))?;
                let to: usize = to
                    .parse()
                    .with_context(|| format!("unable to parse nodes specification: {part:?}"))?;
                selected.extend(from..=to);
            }
        }
    }
    for &i in &selected {
        if i == 0 || i > total {
            bail!("node {i} out of range 1..={total}");
        }
    }
    Ok(selected.into_iter().collect())
}

/// An addressable cluster: topology plus the pool and flavor it operates
/// through.
pub struct Cluster {
    pub name: String,
    /// Selected node indices, 1-based, sorted.
    pub nodes: Vec<usize>,
    pub topology: Topology,
    pub load_gen: usize,
    pub secure: bool,
    pub env: String,
    pub args: Vec<String>,
    pub flavor: Arc<dyn ServerFlavor>,
    pub pool: Arc<SshPool>,
}

impl Cluster {
    pub fn host(&self, index: usize) -> &str {
        &self.topology.hosts[index - 1]
    }

    pub fn user(&self, index: usize) -> &str {
        &self.topology.users[index - 1]
    }

    /// The nodes running server processes: every selected node except the
    /// designated load generator, when there is one.
    pub fn server_nodes(&self) -> Vec<usize> {
        if self.load_gen == 0 {
            return self.nodes.clone();
        }
        self.nodes
            .iter()
            .copied()
            .filter(|&i| i != self.load_gen)
            .collect()
    }

    /// Fan `unit` out across `nodes`, handing each invocation an established
    /// session for its node. Display lines are keyed by node index.
    pub async fn parallel_sessions<T, F>(
        &self,
        label: String,
        nodes: Vec<usize>,
        unit: F,
    ) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(usize, &RemoteSession, &Progress) -> Result<T> + Send + Sync + 'static,
    {
        let names: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
        let targets: Vec<(String, String)> = nodes
            .iter()
            .map(|&n| (self.user(n).to_string(), self.host(n).to_string()))
            .collect();
        let pool = Arc::clone(&self.pool);
        parallel(&label, &names, move |i, progress| {
            let (user, host) = &targets[i];
            let session = pool.session(user, host)?;
            unit(nodes[i], &session, &progress)
        })
        .await
    }

    pub async fn start(&self) -> Result<()> {
        self.flavor.start(self).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.flavor.stop(self).await
    }

    pub async fn wipe(&self) -> Result<()> {
        self.flavor.wipe(self).await
    }

    pub async fn status(&self) -> Result<()> {
        self.flavor.status(self).await
    }

    /// Per-node binary version histogram across the selected nodes.
    pub async fn versions(&self) -> Result<std::collections::HashMap<String, usize>> {
        self.flavor.versions(self).await
    }

    /// Run `cmd` on `nodes`, printing one output line per node unless
    /// `quiet`. All nodes run to completion; the first failure is returned
    /// after every result has been printed.
    pub async fn run(&self, nodes: &[usize], quiet: bool, cmd: &str) -> Result<()> {
        let cmd = cmd.trim().to_string();
        let short = if cmd.len() > 30 {
            format!("{}...", &cmd[..27])
        } else {
            cmd.clone()
        };
        let label = format!("{}: {}", self.name, short);

        let run_cmd = cmd.clone();
        let results = self
            .parallel_sessions(label, nodes.to_vec(), move |_, session, _| {
                match session.combined_output(&run_cmd) {
                    Ok(output) => Ok((String::from_utf8_lossy(&output).trim().to_string(), None)),
                    Err(err) => {
                        let mut msg = String::from_utf8_lossy(err.output().unwrap_or_default())
                            .trim()
                            .to_string();
                        if !msg.is_empty() {
                            msg.push('\n');
                        }
                        msg.push_str(&err.to_string());
                        Ok((msg, Some(err.to_string())))
                    }
                }
            })
            .await?;

        if !quiet {
            for (node, (msg, _)) in self.nodes_zip(nodes, &results) {
                println!("  {node:>2}: {msg}");
            }
        }
        for (node, (_, err)) in self.nodes_zip(nodes, &results) {
            if let Some(err) = err {
                bail!("node {node}: {err}");
            }
        }
        Ok(())
    }

    fn nodes_zip<'a, T>(
        &self,
        nodes: &'a [usize],
        results: &'a [T],
    ) -> impl Iterator<Item = (usize, &'a T)> {
        nodes.iter().copied().zip(results.iter())
    }

    /// Copy one local file to every selected node, with per-node progress.
    pub async fn put(&self, src: &Path, dest: &str) -> Result<()> {
        println!("{}: putting {} {}", self.name, src.display(), dest);
        let src = src.to_path_buf();
        let dest = dest.to_string();
        let label = format!("{}: put", self.name);
        self.parallel_sessions(label, self.nodes.clone(), move |_, session, progress| {
            session.push(&src, &dest, &|p| progress.update(p))?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Fetch one remote file from each of `nodes`. When fetching from more
    /// than one node the local file name is prefixed with the node index to
    /// avoid collisions.
    pub async fn get(&self, nodes: &[usize], src: &str, dest: &str) -> Result<()> {
        println!("{}: getting {} {}", self.name, src, dest);
        let multi = nodes.len() > 1;
        let src = src.to_string();
        let dest = PathBuf::from(dest);
        let label = format!("{}: get", self.name);
        self.parallel_sessions(label, nodes.to_vec(), move |node, session, progress| {
            let local = if multi {
                prefix_file_name(&dest, node)
            } else {
                dest.clone()
            };
            session.fetch(&src, &local, &|p| progress.update(p))?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Run the load generator command on the designated node, duplicating
    /// its combined output to the console and to `capture`.
    ///
    /// Cancelling `interrupt` while the command runs triggers a best-effort
    /// remote kill of the load process; the resulting killed-by-signal error
    /// is surfaced to the caller for classification.
    pub async fn run_load(
        &self,
        cmd: &str,
        capture: &Path,
        interrupt: &CancellationToken,
    ) -> Result<()> {
        if self.load_gen == 0 {
            bail!("{}: no load generator node specified", self.name);
        }
        let full = format!("{cmd} '{}'", self.flavor.load_url(self));
        let user = self.user(self.load_gen).to_string();
        let host = self.host(self.load_gen).to_string();
        let pool = Arc::clone(&self.pool);
        let path = capture.to_path_buf();

        let mut task = tokio::task::spawn_blocking(move || -> Result<()> {
            let session = pool.session(&user, &host)?;
            let mut file = File::create(&path)?;
            println!("{full}");
            writeln!(file, "{full}")?;
            let mut out = Tee(file.try_clone()?, io::stdout());
            let mut err = Tee(file, io::stderr());
            session.run_streaming(&full, &mut out, &mut err)?;
            Ok(())
        });

        tokio::select! {
            res = &mut task => res?,
            _ = interrupt.cancelled() => {
                // Best effort; the load command's own death reports the
                // interruption.
                let _ = self.stop_load().await;
                task.await?
            }
        }
    }

    /// Kill the load generator process on its node by listening port.
    pub async fn stop_load(&self) -> Result<()> {
        if self.load_gen == 0 {
            bail!("{}: no load generator node specified", self.name);
        }
        let label = format!("{}: stopping load", self.name);
        let cmd = format!("sudo kill -9 $(lsof -t -i :{LOAD_PORT}) 2>/dev/null || true");
        self.parallel_sessions(label, vec![self.load_gen], move |_, session, _| {
            session.combined_output(&cmd)?;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

fn prefix_file_name(dest: &Path, node: usize) -> PathBuf {
    let file = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match dest.parent() {
        Some(parent) if parent != Path::new("") => parent.join(format!("{node}.{file}")),
        _ => PathBuf::from(format!("{node}.{file}")),
    }
}

/// Duplicates writes to two writers, e.g. a capture file and the console.
struct Tee<A: Write, B: Write>(A, B);

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_all(buf)?;
        self.1.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.1.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all_nodes() {
        assert_eq!(parse_nodes("all", 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn parse_ranges_and_singles() {
        assert_eq!(parse_nodes("1-3,8-9", 9).unwrap(), vec![1, 2, 3, 8, 9]);
        assert_eq!(parse_nodes("5", 9).unwrap(), vec![5]);
        // Overlaps collapse and order is by index.
        assert_eq!(parse_nodes("8,1-3,2", 9).unwrap(), vec![1, 2, 3, 8]);
    }

    #[test]
    fn parse_rejects_garbage_and_out_of_range() {
        assert!(parse_nodes("1-x", 4).is_err());
        assert!(parse_nodes("0", 4).is_err());
        assert!(parse_nodes("5", 4).is_err());
    }

    fn test_cluster(load_gen: usize) -> Cluster {
        let n = 4;
        Cluster {
            name: "alpha".to_string(),
            nodes: (1..=n).collect(),
            topology: Topology {
                name: "alpha".to_string(),
                hosts: (1..=n).map(|i| format!("alpha-{i:04}.test.io")).collect(),
                users: (1..=n).map(|_| "ops".to_string()).collect(),
                localities: (1..=n).map(|_| String::new()).collect(),
            },
            load_gen,
            secure: false,
            env: String::new(),
            args: Vec::new(),
            flavor: Arc::new(SqlServer::new("./dbserver")),
            pool: Arc::new(SshPool::new(None)),
        }
    }

    #[test]
    fn server_nodes_exclude_the_load_generator() {
        assert_eq!(test_cluster(4).server_nodes(), vec![1, 2, 3]);
        assert_eq!(test_cluster(0).server_nodes(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn node_accessors_are_one_based() {
        let c = test_cluster(0);
        assert_eq!(c.host(1), "alpha-0001.test.io");
        assert_eq!(c.host(4), "alpha-0004.test.io");
        assert_eq!(c.user(2), "ops");
    }

    #[test]
    fn get_prefixes_file_names_per_node() {
        assert_eq!(
            prefix_file_name(Path::new("dbserver"), 3),
            PathBuf::from("3.dbserver")
        );
        assert_eq!(
            prefix_file_name(Path::new("out/dbserver"), 12),
            PathBuf::from("out/12.dbserver")
        );
    }

    #[test]
    fn tee_duplicates_writes() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        {
            let mut tee = Tee(&mut a, &mut b);
            tee.write_all(b"one two").unwrap();
        }
        assert_eq!(a, b"one two");
        assert_eq!(a, b);
    }
}

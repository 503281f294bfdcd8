//! The per-flavor capability interface for the server processes under test,
//! and the SQL server flavor.
//!
//! The orchestration skeleton only needs `{start, stop, wipe, status,
//! versions}` plus the URL the load generator dials; everything
//! flavor-specific lives behind this trait, selected at cluster
//! construction time. The shell each operation runs must be idempotent and
//! report failure as a non-zero exit or signal.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::cluster::Cluster;
use crate::results::version_histogram;

/// Port the server processes listen on.
pub const SERVER_PORT: u16 = 26257;
/// Port the load generator's local endpoint listens on.
pub const LOAD_PORT: u16 = 27183;

#[async_trait]
pub trait ServerFlavor: Send + Sync {
    /// Start server processes on all server nodes. Node index 1 is the
    /// bootstrap node; all others join against it.
    async fn start(&self, c: &Cluster) -> Result<()>;

    /// Stop server processes on all selected nodes. Idempotent.
    async fn stop(&self, c: &Cluster) -> Result<()>;

    /// Stop processes and wipe data and log state on all selected nodes.
    async fn wipe(&self, c: &Cluster) -> Result<()>;

    /// Print a per-node status line for all selected nodes.
    async fn status(&self, c: &Cluster) -> Result<()>;

    /// Query every selected node's binary version, tallied into a histogram
    /// keyed by version string.
    async fn versions(&self, c: &Cluster) -> Result<HashMap<String, usize>>;

    /// Connection URL the load generator dials on its own node.
    fn load_url(&self, c: &Cluster) -> String;

    /// Short tag identifying the binary, used in run-set directory names.
    fn binary_tag(&self, version: &str) -> String;

    /// Remote path of the server binary.
    fn binary(&self) -> &str;
}

/// A SQL-speaking distributed server started from a single binary, with
/// symmetric nodes joining the bootstrap node.
pub struct SqlServer {
    binary: String,
    /// Process name, for kill-by-name patterns.
    proc: String,
}

impl SqlServer {
    pub fn new(binary: &str) -> Self {
        let proc = binary
            .rsplit('/')
            .next()
            .unwrap_or(binary)
            .to_string();
        SqlServer {
            binary: binary.to_string(),
            proc,
        }
    }

    fn node_url(&self, c: &Cluster, host: &str, port: u16) -> String {
        let mut url = format!("postgres://root@{host}:{port}");
        if c.secure {
            url.push_str(
                "?sslcert=certs%2Fnode.crt&sslkey=certs%2Fnode.key&\
                 sslrootcert=certs%2Fca.crt&sslmode=verify-full",
            );
        } else {
            url.push_str("?sslmode=disable");
        }
        url
    }

    fn start_cmd(&self, c: &Cluster, host: &str, join: &str) -> String {
        let mut args = Vec::new();
        if c.secure {
            args.push("--certs-dir=certs".to_string());
        } else {
            args.push("--insecure".to_string());
        }
        args.push("--store=path=/mnt/data1".to_string());
        args.push("--log-dir=logs".to_string());
        args.push("--cache=50%".to_string());
        args.push("--background".to_string());
        // A node whose join target is itself bootstraps the cluster.
        if join != host {
            args.push(format!("--join={join}"));
        }
        args.extend(c.args.iter().cloned());
        format!(
            "{} {} start {} > {}.stdout 2> {}.stderr",
            c.env,
            self.binary,
            args.join(" "),
            self.proc,
            self.proc
        )
    }

    fn kill_cmd(&self) -> String {
        format!(
            "sudo pkill -9 \"{}|kv|ycsb\" || true ;\n\
             sudo kill -9 $(lsof -t -i :{SERVER_PORT} -i :{LOAD_PORT}) 2>/dev/null || true ;\n",
            self.proc
        )
    }
}

#[async_trait]
impl ServerFlavor for SqlServer {
    async fn start(&self, c: &Cluster) -> Result<()> {
        let label = format!("{}: starting", c.name);
        let nodes = c.server_nodes();
        let join = c.host(1).to_string();
        let cmds: HashMap<usize, String> = nodes
            .iter()
            .map(|&n| (n, self.start_cmd(c, c.host(n), &join)))
            .collect();
        let bootstrapped = nodes.contains(&1);

        c.parallel_sessions(label, nodes, move |node, session, _| {
            session.combined_output(&cmds[&node])?;
            Ok(())
        })
        .await?;

        if bootstrapped {
            let label = format!("{}: initializing cluster settings", c.name);
            let cmd = format!(
                "{} sql --url '{}' -e \"set cluster setting diagnostics.reporting.enabled = false;\"",
                self.binary,
                self.node_url(c, "localhost", SERVER_PORT)
            );
            let out = c
                .parallel_sessions(label, vec![1], move |_, session, _| {
                    let output = session.combined_output(&cmd)?;
                    Ok(String::from_utf8_lossy(&output).trim().to_string())
                })
                .await?;
            if let Some(msg) = out.first() {
                if !msg.is_empty() {
                    println!("{msg}");
                }
            }
        }
        Ok(())
    }

    async fn stop(&self, c: &Cluster) -> Result<()> {
        let label = format!("{}: stopping", c.name);
        let cmd = self.kill_cmd();
        c.parallel_sessions(label, c.nodes.clone(), move |_, session, _| {
            session.combined_output(&cmd)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn wipe(&self, c: &Cluster) -> Result<()> {
        let label = format!("{}: wiping", c.name);
        let cmd = format!(
            "{}sudo find /mnt/data* -maxdepth 1 -type f -exec rm -f {{}} \\; ;\n\
             sudo rm -fr /mnt/data*/{{auxiliary,local,tmp,{}}} ;\n\
             sudo find logs -type f -not -name supervisor.log -exec rm -f {{}} \\; ;\n",
            self.kill_cmd(),
            self.proc
        );
        c.parallel_sessions(label, c.nodes.clone(), move |_, session, _| {
            session.combined_output(&cmd)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn status(&self, c: &Cluster) -> Result<()> {
        let label = format!("{}: status", c.name);
        let cmd = format!(
            "out=$(sudo lsof -i :{SERVER_PORT} -i :{LOAD_PORT} | \
             awk '!/COMMAND/ {{print $1, $2}}' | sort | uniq);\n\
             vers=$({} version 2>/dev/null | awk '/Build Tag:/ {{print $NF}}');\n\
             if [ -n \"${{out}}\" -a -n \"${{vers}}\" ]; then\n\
             echo ${{out}} | sed \"s/{}/{}-${{vers}}/g\";\n\
             else\n  echo ${{out}};\nfi\n",
            self.binary, self.proc, self.proc
        );
        let statuses = c
            .parallel_sessions(label, c.nodes.clone(), move |_, session, _| {
                let msg = match session.combined_output(&cmd) {
                    Ok(output) => String::from_utf8_lossy(&output).trim().to_string(),
                    Err(err) => err.to_string(),
                };
                Ok(if msg.is_empty() {
                    "not running".to_string()
                } else {
                    msg
                })
            })
            .await?;

        for (node, status) in c.nodes.iter().zip(&statuses) {
            println!("  {node:>2}: {status}");
        }
        Ok(())
    }

    async fn versions(&self, c: &Cluster) -> Result<HashMap<String, usize>> {
        let label = format!("{}: {} version", c.name, self.proc);
        let cmd = format!("{} version | awk '/Build Tag:/ {{print $NF}}'", self.binary);
        let outputs = c
            .parallel_sessions(label, c.server_nodes(), move |_, session, _| {
                let output = session.combined_output(&cmd)?;
                Ok(String::from_utf8_lossy(&output).trim().to_string())
            })
            .await?;
        Ok(version_histogram(outputs))
    }

    fn load_url(&self, c: &Cluster) -> String {
        self.node_url(c, "localhost", LOAD_PORT)
    }

    fn binary_tag(&self, version: &str) -> String {
        format!("{}-{version}", self.proc)
    }

    fn binary(&self) -> &str {
        &self.binary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_tag_uses_process_name() {
        let f = SqlServer::new("./bin/dbserver");
        assert_eq!(f.binary_tag("6151ae1"), "dbserver-6151ae1");
        assert_eq!(f.binary(), "./bin/dbserver");
    }
}

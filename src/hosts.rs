//! Cluster topology files.
//!
//! Each file under the hosts directory names one cluster and holds one
//! `user@host [locality]` line per node. The user defaults to the invoking
//! user; `#` comments and blank lines are skipped.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::cluster::Topology;

const HOSTS_DIR_ENV: &str = "CLUSTERPERF_HOSTS";

fn hosts_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(HOSTS_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    let home = std::env::var("HOME").unwrap_or_default();
    PathBuf::from(home).join(".clusterperf").join("hosts")
}

/// Load the named cluster's topology from the hosts directory.
pub fn load_topology(name: &str) -> Result<Topology> {
    let path = hosts_dir().join(name);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("unknown cluster {name}: {}", path.display()))?;
    parse_topology(name, &contents)
}

fn parse_topology(name: &str, contents: &str) -> Result<Topology> {
    let mut topology = Topology {
        name: name.to_string(),
        ..Topology::default()
    };

    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [] => continue,
            [first, ..] if first.starts_with('#') => continue,
            [addr] | [addr, _] => {
                let (user, host) = match addr.split_once('@') {
                    Some((user, host)) if !user.is_empty() && !host.is_empty() => {
                        (user.to_string(), host.to_string())
                    }
                    Some(_) => bail!(
                        "invalid hosts line, expected <username>@<host> [locality], got {line:?}"
                    ),
                    None => (whoami::username(), addr.to_string()),
                };
                let locality = fields.get(1).unwrap_or(&"").to_string();
                topology.hosts.push(host);
                topology.users.push(user);
                topology.localities.push(locality);
            }
            _ => bail!("invalid hosts line, expected <username>@<host> [locality], got {line:?}"),
        }
    }

    if topology.is_empty() {
        bail!("cluster {name} has no nodes");
    }
    Ok(topology)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_users_hosts_and_localities() {
        let contents = "\
# fleet for the weekly sweep
ops@alpha-0001.test.io us-east1-b
ops@alpha-0002.test.io us-east1-c

alpha-0003.test.io
";
        let t = parse_topology("alpha", contents).unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.hosts[0], "alpha-0001.test.io");
        assert_eq!(t.users[0], "ops");
        assert_eq!(t.localities[1], "us-east1-c");
        // Missing user falls back to the invoking user.
        assert_eq!(t.users[2], whoami::username());
        assert_eq!(t.localities[2], "");
    }

    #[test]
    fn reject_malformed_lines() {
        assert!(parse_topology("a", "@nohost\n").is_err());
        assert!(parse_topology("a", "user@\n").is_err());
        assert!(parse_topology("a", "h1 l1 extra\n").is_err());
    }

    #[test]
    fn empty_file_is_an_error() {
        assert!(parse_topology("a", "# only a comment\n").is_err());
    }
}

//! Fire-and-forget software installation across cluster nodes.

use anyhow::{bail, Result};
use tracing::info;

use crate::cluster::Cluster;

const TOOLS: &str = "\
sudo apt-get update ;
sudo apt-get install -y \
  fio \
  iftop \
  iotop \
  sysstat \
  linux-tools-common ;
";

const HAPROXY: &str = "\
sudo apt-get update ;
sudo apt-get install -y haproxy ;
sudo service haproxy stop ;
";

/// Install each named package on every selected node, discarding per-node
/// output.
pub async fn install(c: &Cluster, packages: &[String]) -> Result<()> {
    for package in packages {
        let cmd = match package.as_str() {
            "tools" => TOOLS,
            "haproxy" => HAPROXY,
            _ => bail!("unknown package: {package}"),
        };
        info!("{}: installing {package}", c.name);
        let nodes = c.nodes.clone();
        c.run(&nodes, true, cmd).await?;
    }
    Ok(())
}

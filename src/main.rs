//! Command-line interface for clusterperf
//!
//! # Usage Examples
//!
//! ```bash
//! # Start, inspect, and stop a cluster
//! clusterperf start alpha
//! clusterperf status alpha
//! clusterperf stop alpha
//!
//! # Operate on a subset of nodes
//! clusterperf wipe alpha:1-3,8-9
//!
//! # Push a freshly built binary to every node
//! clusterperf put alpha ./dbserver
//!
//! # Run a concurrency sweep with node 7 driving the load
//! clusterperf test alpha kv_95 --load-gen 7 --duration 5m --concurrency 1-64
//!
//! # Resume an interrupted sweep from its run-set directory
//! clusterperf test alpha kv_95.dbserver-6151ae1 --load-gen 7
//!
//! # Compare two run-sets
//! clusterperf dump kv_95.dbserver-6151ae1 kv_95.dbserver-83c2ff0
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use clusterperf::bench::{self, TestOpts};
use clusterperf::cluster::ClusterConfig;
use clusterperf::{install, results};

#[derive(Parser)]
#[command(name = "clusterperf")]
#[command(about = "A tool for manipulating benchmark clusters and running resumable load sweeps")]
#[command(version)]
struct Cli {
    /// Use a secure cluster
    #[arg(long, global = true)]
    secure: bool,

    /// Extra server node arguments
    #[arg(short = 'a', long = "args", global = true, value_name = "ARG")]
    server_args: Vec<String>,

    /// Server node environment variables
    #[arg(short = 'e', long, global = true, default_value = "", env = "CLUSTERPERF_ENV")]
    env: String,

    /// Remote path of the server binary
    #[arg(
        long,
        global = true,
        default_value = "./dbserver",
        env = "CLUSTERPERF_BINARY"
    )]
    binary: String,

    /// 1-based index of the load generator node (0 for none)
    #[arg(long = "load-gen", global = true, default_value_t = 0, value_name = "INDEX")]
    load_gen: usize,

    /// Seconds to bound each remote command I/O operation (0 for unbounded)
    #[arg(long = "cmd-timeout", global = true, default_value_t = 0, value_name = "SECS")]
    cmd_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

/// Every cluster-facing command names the cluster first, optionally
/// suffixed with `:<nodes>` to select a subset of node indices, e.g.
/// `alpha:1-3,8-9`.
#[derive(Subcommand)]
enum Commands {
    /// Start a cluster
    Start { cluster: String },

    /// Stop a cluster
    Stop { cluster: String },

    /// Stop a cluster and wipe its data and log state
    Wipe { cluster: String },

    /// Retrieve the status of a cluster
    Status { cluster: String },

    /// Run a command on the nodes in a cluster
    Run {
        cluster: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Copy a local file to the nodes in a cluster
    Put {
        cluster: String,
        src: PathBuf,
        dest: Option<String>,
    },

    /// Copy a remote file from the nodes in a cluster
    ///
    /// If the file is retrieved from multiple nodes the destination file
    /// name is prefixed with the node index.
    Get {
        cluster: String,
        src: String,
        dest: Option<String>,
    },

    /// Run a test on a cluster, placing results in a run-set directory
    ///
    /// The test name must be one of kv_0, kv_95, or nightly. Alternately, an
    /// interrupted test can be resumed by naming the run-set directory of a
    /// previous invocation, e.g. `kv_0.dbserver-6151ae1`; resuming fails if
    /// the detected binary, node list, or environment no longer match.
    Test {
        cluster: String,

        /// Test name, or a previous run-set directory to resume
        name: String,

        /// The duration to run each load generator invocation
        #[arg(short, long, default_value = "5m")]
        duration: String,

        /// The concurrency sweep, `<lo>[-<hi>[/<step>]]`, scaled by the
        /// number of active server nodes
        #[arg(short, long, default_value = "1-64")]
        concurrency: String,
    },

    /// Install software on the nodes in a cluster
    Install {
        cluster: String,

        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// Dump one run-set, or align and compare two
    Dump {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
    },
}

impl Cli {
    fn cluster_config(&self, name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            secure: self.secure,
            env: self.env.clone(),
            args: self.server_args.clone(),
            binary: self.binary.clone(),
            load_gen: self.load_gen,
            cmd_timeout: (self.cmd_timeout > 0).then(|| Duration::from_secs(self.cmd_timeout)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Start { cluster } => cli.cluster_config(cluster).build()?.start().await,
        Commands::Stop { cluster } => cli.cluster_config(cluster).build()?.stop().await,
        Commands::Wipe { cluster } => cli.cluster_config(cluster).build()?.wipe().await,
        Commands::Status { cluster } => cli.cluster_config(cluster).build()?.status().await,

        Commands::Run { cluster, command } => {
            let c = cli.cluster_config(cluster).build()?;
            let nodes = c.nodes.clone();
            c.run(&nodes, false, &command.join(" ")).await
        }

        Commands::Put { cluster, src, dest } => {
            let c = cli.cluster_config(cluster).build()?;
            let dest = match dest {
                Some(dest) => dest.clone(),
                None => base_name(&src.to_string_lossy()),
            };
            c.put(src, &dest).await
        }

        Commands::Get { cluster, src, dest } => {
            let c = cli.cluster_config(cluster).build()?;
            let dest = match dest {
                Some(dest) => dest.clone(),
                None => base_name(src),
            };
            let nodes = c.nodes.clone();
            c.get(&nodes, src, &dest).await
        }

        Commands::Test {
            cluster,
            name,
            duration,
            concurrency,
        } => {
            let opts = TestOpts {
                duration: bench::parse_duration(duration)?,
                concurrency: concurrency.clone(),
                interrupt: bench::signal_interrupt()?,
            };
            bench::run_test(name, cli.cluster_config(cluster), opts).await
        }

        Commands::Install { cluster, packages } => {
            let c = cli.cluster_config(cluster).build()?;
            install::install(&c, packages).await
        }

        Commands::Dump { dirs } => results::dump(dirs),
    }
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

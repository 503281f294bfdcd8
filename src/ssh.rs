//! SSH connection pooling and the scp-style file transfer sub-protocol.
//!
//! One connection is established per `user@host` target, lazily, and cached
//! for the life of the process; there is no reconnection of a broken
//! connection. Authentication is agent-based only (`SSH_AUTH_SOCK`), and the
//! remote host key is verified against the user's `known_hosts` file. Every
//! command gets a fresh exec channel on top of the cached connection.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ssh2::{CheckResult, KnownHostFileKind, Session};
use thiserror::Error;

const SSH_PORT: u16 = 22;
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced by the transport layer.
///
/// Connection errors (agent, dial, handshake, host key) are fatal to the
/// operation that needed the connection and are never retried. Command errors
/// distinguish a non-zero exit from death by signal so that an intentionally
/// killed load generator can be told apart from a genuine failure.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("SSH_AUTH_SOCK empty or agent unavailable")]
    Agent,

    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("handshake with {host} failed: {source}")]
    Handshake {
        host: String,
        #[source]
        source: ssh2::Error,
    },

    #[error("authentication of {user}@{host} failed")]
    Auth { user: String, host: String },

    #[error("host key verification for {host} failed: {reason}")]
    HostKey { host: String, reason: String },

    #[error("command exited with status {status}")]
    Exit { status: i32, output: Vec<u8> },

    #[error("command killed by signal {signal}")]
    Signal { signal: String },

    #[error(transparent)]
    Ssh(#[from] ssh2::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SshError {
    /// True if the remote command died from SIGKILL, which is how a
    /// deliberately stopped load generator run terminates.
    pub fn is_sigkill(&self) -> bool {
        matches!(self, SshError::Signal { signal } if signal == "KILL")
    }

    /// Captured combined output, if this error kind carries any.
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            SshError::Exit { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// A cache of one live SSH connection per `user@host` target.
///
/// Lookup/insert of the per-target slot happens under a coarse lock; the
/// actual connection establishment happens under the target's own lock, so
/// concurrent callers for the same target serialize only while the connection
/// comes up and callers for different targets never block each other.
pub struct SshPool {
    targets: Mutex<HashMap<String, Arc<Target>>>,
    cmd_timeout: Option<Duration>,
}

#[derive(Default)]
struct Target {
    conn: Mutex<Option<Arc<Session>>>,
}

impl SshPool {
    /// `cmd_timeout` bounds each blocking remote I/O operation; `None`
    /// preserves the historical unbounded wait.
    pub fn new(cmd_timeout: Option<Duration>) -> Self {
        SshPool {
            targets: Mutex::new(HashMap::new()),
            cmd_timeout,
        }
    }

    /// Return a ready-to-use command session for `user@host`, establishing
    /// and caching the underlying connection on first use.
    pub fn session(&self, user: &str, host: &str) -> Result<RemoteSession, SshError> {
        let target = {
            let mut targets = self.targets.lock().expect("ssh pool lock poisoned");
            targets
                .entry(format!("{user}@{host}"))
                .or_default()
                .clone()
        };

        let mut conn = target.conn.lock().expect("ssh target lock poisoned");
        let session = match &*conn {
            Some(session) => Arc::clone(session),
            None => {
                let session = Arc::new(self.connect(user, host)?);
                *conn = Some(Arc::clone(&session));
                session
            }
        };
        drop(conn);

        Ok(RemoteSession {
            session,
            host: host.to_string(),
        })
    }

    fn connect(&self, user: &str, host: &str) -> Result<Session, SshError> {
        tracing::debug!("establishing connection to {user}@{host}");
        if std::env::var("SSH_AUTH_SOCK").unwrap_or_default().is_empty() {
            return Err(SshError::Agent);
        }

        let addr = format!("{host}:{SSH_PORT}");
        let resolved = addr
            .to_socket_addrs()
            .map_err(|source| SshError::Dial {
                addr: addr.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| SshError::Dial {
                addr: addr.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no address resolved"),
            })?;
        let tcp = TcpStream::connect_timeout(&resolved, DIAL_TIMEOUT).map_err(|source| {
            SshError::Dial {
                addr: addr.clone(),
                source,
            }
        })?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|source| SshError::Handshake {
            host: host.to_string(),
            source,
        })?;

        verify_host_key(&session, host)?;

        // Try each agent identity in order until one authenticates.
        let mut agent = session.agent()?;
        agent.connect().map_err(|_| SshError::Agent)?;
        agent.list_identities()?;
        for identity in agent.identities()? {
            if agent.userauth(user, &identity).is_ok() && session.authenticated() {
                break;
            }
        }
        if !session.authenticated() {
            return Err(SshError::Auth {
                user: user.to_string(),
                host: host.to_string(),
            });
        }

        if let Some(timeout) = self.cmd_timeout {
            session.set_timeout(timeout.as_millis() as u32);
        }
        Ok(session)
    }
}

fn verify_host_key(session: &Session, host: &str) -> Result<(), SshError> {
    let mut known = session.known_hosts()?;
    let home = std::env::var("HOME").unwrap_or_default();
    let path = Path::new(&home).join(".ssh").join("known_hosts");
    known
        .read_file(&path, KnownHostFileKind::OpenSSH)
        .map_err(|e| SshError::HostKey {
            host: host.to_string(),
            reason: format!("reading {}: {e}", path.display()),
        })?;

    let (key, _) = session.host_key().ok_or_else(|| SshError::HostKey {
        host: host.to_string(),
        reason: "no host key presented".to_string(),
    })?;
    let reason = match known.check_port(host, SSH_PORT, key) {
        CheckResult::Match => return Ok(()),
        CheckResult::NotFound => "host not found in known_hosts",
        CheckResult::Mismatch => "host key mismatch",
        CheckResult::Failure => "host key check failed",
    };
    Err(SshError::HostKey {
        host: host.to_string(),
        reason: reason.to_string(),
    })
}

/// A command session bound to one pooled connection.
pub struct RemoteSession {
    session: Arc<Session>,
    host: String,
}

impl RemoteSession {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Run `cmd`, returning its combined stdout+stderr. A non-zero exit or
    /// death by signal is an error; the captured output rides along on the
    /// exit-status error.
    pub fn combined_output(&self, cmd: &str) -> Result<Vec<u8>, SshError> {
        let mut channel = self.session.channel_session()?;
        channel.exec(cmd)?;

        let mut output = Vec::new();
        channel.read_to_end(&mut output)?;
        channel.stderr().read_to_end(&mut output)?;

        channel.wait_close()?;
        if let Some(signal) = channel.exit_signal()?.exit_signal {
            return Err(SshError::Signal { signal });
        }
        let status = channel.exit_status()?;
        if status != 0 {
            return Err(SshError::Exit { status, output });
        }
        Ok(output)
    }

    /// Run `cmd`, streaming stdout and stderr to the given writers as the
    /// command produces them.
    pub fn run_streaming(
        &self,
        cmd: &str,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<(), SshError> {
        let mut channel = self.session.channel_session()?;
        channel.exec(cmd)?;

        let mut buf = [0u8; 8192];
        loop {
            let n = channel.read(&mut buf)?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n])?;
            stdout.flush()?;
        }
        loop {
            let n = channel.stderr().read(&mut buf)?;
            if n == 0 {
                break;
            }
            stderr.write_all(&buf[..n])?;
            stderr.flush()?;
        }

        channel.wait_close()?;
        if let Some(signal) = channel.exit_signal()?.exit_signal {
            return Err(SshError::Signal { signal });
        }
        let status = channel.exit_status()?;
        if status != 0 {
            return Err(SshError::Exit {
                status,
                output: Vec::new(),
            });
        }
        Ok(())
    }

    /// Push a local file to `dest` on the remote side.
    ///
    /// The remote end runs a delete-then-receive command while this side
    /// writes the single-file push header `C<mode> <size> <basename>\n`,
    /// streams the raw bytes through a progress-observing writer, and
    /// finishes with a NUL byte.
    pub fn push(&self, src: &Path, dest: &str, progress: &dyn Fn(f64)) -> Result<(), SshError> {
        let mut file = File::open(src)?;
        let meta = file.metadata()?;
        let size = meta.len();
        let base = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut channel = self.session.channel_session()?;
        channel.exec(&format!("rm -f {dest} ; scp -t {dest}"))?;

        write!(
            channel,
            "C0{:o} {} {}\n",
            meta.permissions().mode() & 0o777,
            size,
            base
        )?;
        let mut writer = ProgressWriter {
            inner: &mut channel,
            done: 0,
            total: size,
            progress,
        };
        io::copy(&mut file, &mut writer)?;
        channel.write_all(b"\x00")?;
        channel.send_eof()?;

        channel.wait_close()?;
        if let Some(signal) = channel.exit_signal()?.exit_signal {
            return Err(SshError::Signal { signal });
        }
        let status = channel.exit_status()?;
        if status != 0 {
            return Err(SshError::Exit {
                status,
                output: Vec::new(),
            });
        }
        Ok(())
    }

    /// Fetch a single remote file into `dest` on the local side.
    pub fn fetch(&self, src: &str, dest: &Path, progress: &dyn Fn(f64)) -> Result<(), SshError> {
        let (mut channel, stat) = self.session.scp_recv(Path::new(src))?;
        let total = stat.size();
        let mut file = File::create(dest)?;

        let mut done = 0u64;
        let mut buf = [0u8; 8192];
        while done < total {
            let want = buf.len().min((total - done) as usize);
            let n = channel.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            done += n as u64;
            progress(done as f64 / total as f64);
        }

        channel.send_eof()?;
        channel.wait_eof()?;
        channel.wait_close()?;
        Ok(())
    }
}

/// Wraps a writer and reports the fraction of `total` written so far.
struct ProgressWriter<'a> {
    inner: &'a mut dyn Write,
    done: u64,
    total: u64,
    progress: &'a dyn Fn(f64),
}

impl Write for ProgressWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.done += n as u64;
        (self.progress)(self.done as f64 / self.total as f64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

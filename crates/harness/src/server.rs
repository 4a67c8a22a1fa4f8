//! Target process lifecycle - spawning and readiness-checking the file server
//! that hosts the application under test

use std::collections::HashSet;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};

/// How readiness is probed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Any HTTP response to `GET /`
    #[default]
    Http,
    /// A TCP connect succeeds
    Tcp,
}

/// Configuration for spawning the target server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Program and arguments; `{root}` and `{port}` are substituted
    pub command: Vec<String>,

    pub readiness: Readiness,

    pub startup_timeout_ms: u64,

    /// Time between SIGTERM and a hard kill
    pub stop_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: [
                "python3",
                "-m",
                "http.server",
                "{port}",
                "--bind",
                "127.0.0.1",
                "--directory",
                "{root}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            readiness: Readiness::Http,
            startup_timeout_ms: 15_000,
            stop_grace_ms: 500,
        }
    }
}

impl ServerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    fn render(&self, root: &Path, port: u16) -> Vec<String> {
        let root = root.to_string_lossy();
        let port = port.to_string();
        self.command
            .iter()
            .map(|arg| arg.replace("{root}", &root).replace("{port}", &port))
            .collect()
    }
}

/// Hands out ports that are free and not already held by another lease
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease an OS-assigned free port
    pub fn lease(&self) -> HarnessResult<PortLease> {
        for _ in 0..16 {
            let port = find_free_port()?;
            if self.leased.lock().insert(port) {
                return Ok(self.lease_for(port));
            }
        }
        Err(HarnessError::ServerStart(
            "could not find a free port that is not already leased".to_string(),
        ))
    }

    /// Lease a fixed port chosen by the scenario
    pub fn pin(&self, port: u16) -> HarnessResult<PortLease> {
        if self.leased.lock().insert(port) {
            Ok(self.lease_for(port))
        } else {
            Err(HarnessError::ServerStart(format!(
                "port {} is already leased by another scenario",
                port
            )))
        }
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased.lock().contains(&port)
    }

    fn lease_for(&self, port: u16) -> PortLease {
        PortLease {
            port,
            leased: Arc::clone(&self.leased),
        }
    }
}

/// A reserved port, released on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.leased.lock().remove(&self.port);
    }
}

/// Handle to a running server process
pub struct ServerHandle {
    child: Option<Child>,
    pid: u32,
    base_url: String,
    lease: PortLease,
    readiness: Readiness,
    stop_grace: Duration,
}

impl ServerHandle {
    /// Spawn the server and wait until it accepts connections. Any failure,
    /// including a readiness timeout, is a `ServerStart` error and leaves no
    /// process behind.
    pub async fn spawn(config: &ServerConfig, root: &Path, lease: PortLease) -> HarnessResult<Self> {
        let mut handle = Self::start(config, root, lease)?;
        match handle.wait_ready(config.startup_timeout()).await {
            Ok(()) => {
                info!("Server is ready at {}", handle.base_url);
                Ok(handle)
            }
            Err(e) => {
                handle.shutdown().await;
                Err(match e {
                    HarnessError::ServerStart(_) => e,
                    other => HarnessError::ServerStart(other.to_string()),
                })
            }
        }
    }

    /// Spawn the process without waiting for readiness
    pub fn start(config: &ServerConfig, root: &Path, lease: PortLease) -> HarnessResult<Self> {
        if !root.is_dir() {
            return Err(HarnessError::ServerStart(format!(
                "root directory {} does not exist",
                root.display()
            )));
        }

        let port = lease.port();
        let argv = config.render(root, port);
        let (program, args) = argv.split_first().ok_or_else(|| {
            HarnessError::ServerStart("server command is empty".to_string())
        })?;

        info!("Spawning target server on port {}: {}", port, argv.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HarnessError::ServerStart(format!("failed to spawn {}: {}", program, e)))?;

        Ok(Self {
            pid: child.id(),
            child: Some(child),
            base_url: format!("http://127.0.0.1:{}", port),
            lease,
            readiness: config.readiness,
            stop_grace: Duration::from_millis(config.stop_grace_ms),
        })
    }

    /// Poll until the server accepts connections
    pub async fn wait_ready(&mut self, timeout_duration: Duration) -> HarnessResult<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        let addr = format!("127.0.0.1:{}", self.port());

        let start = Instant::now();
        let mut attempts = 0u32;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            if let Some(status) = self.exit_status() {
                return Err(HarnessError::ServerStart(format!(
                    "server exited during startup ({})",
                    status
                )));
            }

            let ready = match self.readiness {
                Readiness::Tcp => tokio::net::TcpStream::connect(&addr).await.is_ok(),
                Readiness::Http => match client.get(&self.base_url).send().await {
                    Ok(_) => true,
                    Err(e) => {
                        // Connection refused is expected while the server is starting
                        if !e.is_connect() {
                            warn!("Readiness check error: {}", e);
                        }
                        false
                    }
                },
            };
            if ready {
                debug!("Server ready after {} attempt(s)", attempts);
                return Ok(());
            }

            sleep(Duration::from_millis(100)).await;
        }

        Err(HarnessError::timeout(
            format!("server on port {} to accept connections", self.port()),
            timeout_duration.as_millis() as u64,
        ))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&mut self) -> bool {
        self.child.is_some() && self.exit_status().is_none()
    }

    fn exit_status(&mut self) -> Option<std::process::ExitStatus> {
        self.child.as_mut().and_then(|c| c.try_wait().ok().flatten())
    }

    /// Stop the server from async code, yielding while the grace period
    /// runs. Idempotent and infallible.
    pub async fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!("Stopping target server (pid: {})", self.pid);

        if self.terminate() {
            let deadline = Instant::now() + self.stop_grace;
            while Instant::now() < deadline {
                if let Ok(Some(_)) = child.try_wait() {
                    return;
                }
                sleep(Duration::from_millis(20)).await;
            }
        }
        self.kill(child);
    }

    /// Blocking variant of [`shutdown`](Self::shutdown), used on drop.
    pub fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!("Stopping target server (pid: {})", self.pid);

        if self.terminate() {
            let deadline = Instant::now() + self.stop_grace;
            while Instant::now() < deadline {
                if let Ok(Some(_)) = child.try_wait() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
        self.kill(child);
    }

    /// Ask for a graceful exit. False when no signal could be sent.
    fn terminate(&self) -> bool {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM).is_ok()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    fn kill(&self, mut child: Child) {
        if let Err(e) = child.kill() {
            debug!("Kill of pid {} failed: {}", self.pid, e);
        }
        if let Err(e) = child.wait() {
            warn!("Failed to reap server pid {}: {}", self.pid, e);
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn find_free_port() -> HarnessResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| HarnessError::ServerStart(format!("failed to bind a free port: {}", e)))?;
    Ok(listener.local_addr()?.port())
}

/// Root directory for a served scenario, resolved against `base`
pub fn resolve_root(base: &Path, root: &Path) -> PathBuf {
    if root.is_absolute() {
        root.to_path_buf()
    } else {
        base.join(root)
    }
}

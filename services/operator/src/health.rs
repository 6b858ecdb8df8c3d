//! Health probing, interim status, and the degraded watcher helper.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use octi_reconcile::{HealthProbe, HealthWatcher, ProbeError, ReconcileResult, StatusSink, WatchError};
use tracing::{debug, info, warn};

/// HTTP health probe with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

/// The URL without its query string; health URLs carry an access key.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str) -> Result<(), ProbeError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.without_url().to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            debug!(url = %redact_url(url), status = %status, "health probe failed");
            Err(ProbeError::Unhealthy {
                status: status.as_u16(),
            })
        }
    }
}

/// Logs interim status and optionally mirrors it into a file the host reads.
#[derive(Debug, Default, Clone)]
pub struct LogStatusSink {
    path: Option<PathBuf>,
}

impl LogStatusSink {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl StatusSink for LogStatusSink {
    fn interim(&self, status: &ReconcileResult) {
        info!(status = %status, "interim status");
        let Some(path) = &self.path else {
            return;
        };
        let written = serde_json::to_vec(status)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| std::fs::write(path, bytes).map_err(anyhow::Error::from));
        if let Err(e) = written {
            warn!(error = %e, path = %path.display(), "failed to write interim status");
        }
    }
}

/// Environment variable carrying the watched URL to the helper. The URL
/// holds the health access key, so it never goes on the command line.
pub const WATCH_URL_ENV: &str = "OCTI_WATCH_URL";

/// Probes a helper makes before giving up.
pub const WATCH_MAX_ATTEMPTS: u32 = 360;

/// Pid file held by a running `wait-healthy` helper.
///
/// At most one helper runs per state directory; the file is removed when
/// the lock drops.
#[derive(Debug)]
pub struct HelperLock {
    path: PathBuf,
}

impl HelperLock {
    /// Whether a live process holds the lock at `path`.
    pub fn is_held(path: &Path) -> bool {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .is_some_and(|pid| Path::new("/proc").join(pid.to_string()).exists())
    }

    /// Take the lock for this process, or `None` if a live helper holds it.
    /// A pid file left by a dead process is replaced.
    pub fn acquire(path: &Path) -> io::Result<Option<Self>> {
        if Self::is_held(path) {
            return Ok(None);
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale helper pid file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e),
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(Some(Self {
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for HelperLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(error = %e, path = %self.path.display(), "failed to remove helper pid file");
        }
    }
}

/// Arms the watcher by spawning a detached `wait-healthy` helper process.
///
/// The helper is bounded by [`WATCH_MAX_ATTEMPTS`], never writes to the
/// invoking process's stdout and appends its logs to a file in the state
/// directory.
#[derive(Debug, Clone)]
pub struct SpawnWatcher {
    program: PathBuf,
    notify_command: String,
    interval: Duration,
    state_dir: PathBuf,
}

impl SpawnWatcher {
    pub fn new(
        program: PathBuf,
        notify_command: String,
        interval: Duration,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            program,
            notify_command,
            interval,
            state_dir,
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("wait-healthy.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("wait-healthy.log")
    }

    /// The helper invocation for `url`.
    pub fn command(&self, url: &str) -> io::Result<tokio::process::Command> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file())?;
        let mut command = tokio::process::Command::new(&self.program);
        command
            .arg("wait-healthy")
            .arg("--interval-secs")
            .arg(self.interval.as_secs().max(1).to_string())
            .arg("--max-attempts")
            .arg(WATCH_MAX_ATTEMPTS.to_string())
            .arg("--notify")
            .arg(&self.notify_command)
            .arg("--pid-file")
            .arg(self.pid_file())
            .env(WATCH_URL_ENV, url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));
        Ok(command)
    }
}

#[async_trait]
impl HealthWatcher for SpawnWatcher {
    async fn arm(&self, url: &str) -> Result<(), WatchError> {
        if HelperLock::is_held(&self.pid_file()) {
            info!("health watcher already running");
            return Ok(());
        }
        let child = self
            .command(url)
            .and_then(|mut command| command.spawn())
            .map_err(|e| WatchError(e.to_string()))?;
        info!(pid = child.id(), url = %redact_url(url), "health watcher spawned");
        Ok(())
    }
}

/// Poll `url` until it passes, then run `notify` through the shell.
///
/// `max_attempts` of `None` polls forever.
pub async fn wait_healthy(
    probe: &dyn HealthProbe,
    url: &str,
    interval: Duration,
    max_attempts: Option<u32>,
    notify: &str,
) -> Result<()> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match probe.probe(url).await {
            Ok(()) => break,
            Err(e) => debug!(attempt = attempts, error = %e, "platform not healthy yet"),
        }
        if max_attempts.is_some_and(|max| attempts >= max) {
            bail!("platform did not become healthy after {attempts} attempts");
        }
        tokio::time::sleep(interval).await;
    }

    info!(attempts, "platform healthy, notifying");
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(notify)
        .status()
        .await
        .context("failed to run notify command")?;
    if !status.success() {
        bail!("notify command exited with {status}");
    }
    Ok(())
}

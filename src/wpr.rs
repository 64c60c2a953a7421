//! Supervision of the external record/replay proxy.
//!
//! A [`WprProcess`] owns exactly one child process bound to two ports. Its
//! lifecycle is `NotStarted -> Starting -> Running -> Stopping -> Exited`:
//! `start` spawns and verifies liveness once after a grace delay, `stop`
//! sends an interrupt, and `wait` reaps the child within a bounded timeout.

use std::{
    env,
    fs::{self, File},
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Result, bail};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::WprSettings;
use crate::error::BenchError;

pub const ARCHIVE_EXTENSION: &str = "wprgo";

/// Verb passed to the proxy binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WprMode {
    Record,
    Replay,
}

impl WprMode {
    pub fn verb(&self) -> &'static str {
        match self {
            WprMode::Record => "record",
            WprMode::Replay => "replay",
        }
    }
}

/// Materialised command specification ready to be spawned or logged.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    binary: PathBuf,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new(binary: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(&self.args);
        command
    }

    pub fn describe(&self) -> String {
        format!("{} {}", self.binary.display(), self.args.join(" "))
    }
}

/// Locate the proxy binary: explicit setting, then environment, then `PATH`.
pub fn resolve_binary(settings: &WprSettings) -> Result<PathBuf> {
    if let Some(path) = &settings.binary {
        return Ok(path.clone());
    }
    if let Ok(path) = env::var("PAGERACE_WPR_BINARY") {
        return Ok(PathBuf::from(path));
    }
    if let Ok(path) = which::which("wpr") {
        return Ok(path);
    }
    bail!("wpr binary not found; set PAGERACE_WPR_BINARY or configure wpr.binary")
}

/// Build the `<bin> record|replay ... <archive>` invocation.
pub fn build_command(
    binary: &Path,
    mode: WprMode,
    settings: &WprSettings,
    http_port: u16,
    https_port: u16,
    archive: &Path,
) -> CommandSpec {
    let path = |p: &Path| p.to_string_lossy().to_string();
    let args = vec![
        mode.verb().to_string(),
        "--https_cert_file".into(),
        path(&settings.cert_file),
        "--https_key_file".into(),
        path(&settings.key_file),
        "--http_port".into(),
        http_port.to_string(),
        "--https_port".into(),
        https_port.to_string(),
        "--inject_scripts".into(),
        path(&settings.inject_scripts),
        path(archive),
    ];
    CommandSpec::new(binary, args)
}

/// Per-run stdout/stderr capture files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WprLogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl WprLogPaths {
    pub fn for_run(log_dir: &Path, site: &str, run_id: &str, archive_id: Option<usize>) -> Self {
        let stem = match archive_id {
            Some(id) => format!("{site}-{run_id}-{id}"),
            None => format!("{site}-{run_id}"),
        };
        Self {
            stdout: log_dir.join(format!("{stem}.stdout.log")),
            stderr: log_dir.join(format!("{stem}.stderr.log")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WprState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Exited(Option<i32>),
}

impl std::fmt::Display for WprState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WprState::NotStarted => write!(f, "not started"),
            WprState::Starting => write!(f, "starting"),
            WprState::Running => write!(f, "running"),
            WprState::Stopping => write!(f, "stopping"),
            WprState::Exited(Some(code)) => write!(f, "exited ({code})"),
            WprState::Exited(None) => write!(f, "exited"),
        }
    }
}

/// Handle on one supervised proxy instance.
#[derive(Debug)]
pub struct WprProcess {
    name: String,
    command: CommandSpec,
    logs: WprLogPaths,
    http_port: u16,
    https_port: u16,
    start_grace: Duration,
    wait_timeout: Duration,
    state: WprState,
    child: Option<Child>,
}

impl WprProcess {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        command: CommandSpec,
        logs: WprLogPaths,
        http_port: u16,
        https_port: u16,
        start_grace: Duration,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            logs,
            http_port,
            https_port,
            start_grace,
            wait_timeout,
            state: WprState::NotStarted,
            child: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WprState {
        self.state
    }

    pub fn ports(&self) -> (u16, u16) {
        (self.http_port, self.https_port)
    }

    pub fn logs(&self) -> &WprLogPaths {
        &self.logs
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    fn invalid(&self, action: &'static str) -> BenchError {
        BenchError::ProcessState {
            name: self.name.clone(),
            action,
            state: self.state.to_string(),
        }
    }

    /// Spawn the proxy and confirm it survived the grace delay.
    pub async fn start(&mut self) -> Result<(), BenchError> {
        if self.state != WprState::NotStarted {
            return Err(self.invalid("start"));
        }

        let spawn_err = |source| BenchError::Spawn {
            name: self.name.clone(),
            source,
        };
        for path in [&self.logs.stdout, &self.logs.stderr] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(spawn_err)?;
            }
        }
        let stdout = File::create(&self.logs.stdout).map_err(spawn_err)?;
        let stderr = File::create(&self.logs.stderr).map_err(spawn_err)?;

        let mut command = self.command.to_command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        debug!(name = %self.name, command = %self.command.describe(), "spawning");
        let child = command.spawn().map_err(spawn_err)?;
        self.state = WprState::Starting;
        self.child = Some(child);

        tokio::time::sleep(self.start_grace).await;

        let alive = match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                self.state = WprState::Exited(status.code());
                false
            }
            Some(Err(err)) => {
                warn!(name = %self.name, error = %err, "liveness check failed");
                false
            }
            None => false,
        };

        if !alive {
            if self.state == WprState::Starting {
                self.state = WprState::Exited(None);
            }
            return Err(BenchError::ProcessStart {
                name: self.name.clone(),
                stdout_log: self.logs.stdout.clone(),
                stderr_log: self.logs.stderr.clone(),
            });
        }

        self.state = WprState::Running;
        info!(
            name = %self.name,
            pid = self.pid(),
            http_port = self.http_port,
            https_port = self.https_port,
            "proxy started"
        );
        Ok(())
    }

    /// Ask the proxy to shut down gracefully.
    pub fn stop(&mut self) -> Result<(), BenchError> {
        if self.state != WprState::Running {
            return Err(self.invalid("stop"));
        }
        let Some(child) = self.child.as_mut() else {
            return Err(self.invalid("stop"));
        };
        interrupt(child);
        self.state = WprState::Stopping;
        debug!(name = %self.name, "interrupt sent");
        Ok(())
    }

    /// Reap the proxy after `stop`; non-zero exit or a timeout is an error.
    pub async fn wait(&mut self) -> Result<(), BenchError> {
        if self.state != WprState::Stopping {
            return Err(self.invalid("wait"));
        }
        let Some(child) = self.child.as_mut() else {
            return Err(self.invalid("wait"));
        };

        match tokio::time::timeout(self.wait_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                self.state = WprState::Exited(status.code());
                if status.success() {
                    info!(name = %self.name, "proxy exited");
                    Ok(())
                } else {
                    Err(BenchError::ProcessExit {
                        name: self.name.clone(),
                        code: status.code(),
                    })
                }
            }
            Ok(Err(err)) => {
                warn!(name = %self.name, error = %err, "wait failed");
                self.state = WprState::Exited(None);
                Err(BenchError::ProcessExit {
                    name: self.name.clone(),
                    code: None,
                })
            }
            Err(_) => Err(BenchError::ProcessWaitTimeout {
                name: self.name.clone(),
                timeout: self.wait_timeout,
            }),
        }
    }

    /// Forcefully terminate the proxy without a graceful shutdown.
    pub async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.kill().await {
                warn!(name = %self.name, error = %err, "kill failed");
            }
        }
        if !matches!(self.state, WprState::Exited(_)) {
            self.state = WprState::Exited(None);
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        warn!(pid, error = %err, "failed to send interrupt");
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shell(name: &str, script: &str, dir: &Path) -> WprProcess {
        WprProcess::new(
            name,
            CommandSpec::new("/bin/sh", vec!["-c".into(), script.into()]),
            WprLogPaths::for_run(&dir.join("logs"), "site", "run", None),
            9000,
            9001,
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
    }

    const TRAPPED_LOOP: &str = "while true; do sleep 0.05; done";

    #[test]
    fn command_follows_invocation_shape() {
        let settings = WprSettings::default();
        let command = build_command(
            Path::new("/usr/bin/wpr"),
            WprMode::Replay,
            &settings,
            9000,
            9001,
            Path::new("/runs/wpr/alpha-3.wprgo"),
        );
        assert_eq!(command.args()[0], "replay");
        assert_eq!(
            command.describe(),
            "/usr/bin/wpr replay --https_cert_file wpr_cert.pem --https_key_file wpr_key.pem \
             --http_port 9000 --https_port 9001 --inject_scripts deterministic.js \
             /runs/wpr/alpha-3.wprgo"
        );
    }

    #[test]
    fn log_paths_include_archive_id() {
        let dir = Path::new("/logs");
        let plain = WprLogPaths::for_run(dir, "alpha", "r1", None);
        assert_eq!(plain.stdout, dir.join("alpha-r1.stdout.log"));
        let with_id = WprLogPaths::for_run(dir, "alpha", "r1", Some(4));
        assert_eq!(with_id.stderr, dir.join("alpha-r1-4.stderr.log"));
    }

    #[test]
    fn explicit_binary_wins() {
        let mut settings = WprSettings::default();
        settings.binary = Some(PathBuf::from("/opt/wpr/wpr"));
        assert_eq!(
            resolve_binary(&settings).expect("binary"),
            PathBuf::from("/opt/wpr/wpr")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_exit_zero_resolves() {
        let dir = tempdir().expect("tempdir");
        let script = format!("trap 'exit 0' INT; {TRAPPED_LOOP}");
        let mut process = shell("wpr ok", &script, dir.path());

        process.start().await.expect("started");
        assert_eq!(process.state(), WprState::Running);
        assert!(process.pid().is_some());
        assert!(process.logs().stdout.exists());

        process.stop().expect("stop");
        process.wait().await.expect("clean exit");
        assert_eq!(process.state(), WprState::Exited(Some(0)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let script = format!("trap 'exit 1' INT; {TRAPPED_LOOP}");
        let mut process = shell("wpr failing", &script, dir.path());

        process.start().await.expect("started");
        process.stop().expect("stop");
        let err = process.wait().await.expect_err("exit code 1");
        assert!(matches!(err, BenchError::ProcessExit { code: Some(1), .. }));
        let rendered = err.to_string();
        assert!(rendered.contains("wpr failing"));
        assert!(rendered.contains('1'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_fails_liveness_check() {
        let dir = tempdir().expect("tempdir");
        let mut process = shell("wpr crash", "echo boom >&2; exit 3", dir.path());

        let err = process.start().await.expect_err("not alive");
        match err {
            BenchError::ProcessStart { stderr_log, .. } => {
                let captured = fs::read_to_string(stderr_log).expect("stderr log");
                assert!(captured.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(process.state(), WprState::Exited(Some(3)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wait_requires_stop() {
        let dir = tempdir().expect("tempdir");
        let mut process = shell("wpr", TRAPPED_LOOP, dir.path());
        assert!(matches!(
            process.wait().await,
            Err(BenchError::ProcessState { .. })
        ));

        process.start().await.expect("started");
        assert!(matches!(
            process.wait().await,
            Err(BenchError::ProcessState { .. })
        ));
        process.kill().await;
        assert_eq!(process.state(), WprState::Exited(None));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wait_times_out_when_interrupt_is_ignored() {
        let dir = tempdir().expect("tempdir");
        let script = format!("trap '' INT; {TRAPPED_LOOP}");
        let mut process = WprProcess::new(
            "wpr stubborn",
            CommandSpec::new("/bin/sh", vec!["-c".into(), script]),
            WprLogPaths::for_run(dir.path(), "site", "run", Some(1)),
            9000,
            9001,
            Duration::from_millis(100),
            Duration::from_millis(300),
        );

        process.start().await.expect("started");
        process.stop().expect("stop");
        let err = process.wait().await.expect_err("timeout");
        assert!(matches!(err, BenchError::ProcessWaitTimeout { .. }));
        process.kill().await;
    }
}

//! Command execution on the local host or on remote hosts over ssh
//!
//! A [`Command`] describes one shell command line together with where it should run, an optional
//! stdin payload and extra environment bindings. Running it attaches exactly one
//! [`CommandResult`]; once attached the result never changes.
//!
//! Remote commands are wrapped in an `ssh` invocation (see [`ssh`]) and retried a bounded number
//! of times when the ssh handshake is rejected by the remote host, which happens regularly when
//! many connections to the same host are opened at once.
//!
//! Many commands can be run concurrently through a [`WorkerPool`].
//!
//! # Fault injection
//!
//! When the `MFR_COMMAND_FAULT_POINT` environment variable is set, any command whose name starts
//! with its value is not executed. It instead yields a synthetic failed and halted result, which
//! lets failure paths be exercised end to end.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

pub mod pool;
pub mod ssh;

pub use pool::WorkerPool;

pub const FAULT_POINT_ENV: &str = "MFR_COMMAND_FAULT_POINT";

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Local,
    Remote(String),
}

impl Target {
    pub fn remote(host: impl Into<String>) -> Self {
        Target::Remote(host.into())
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Target::Local => write!(f, "localhost"),
            Target::Remote(host) => write!(f, "{host}"),
        }
    }
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
    /// False if the process could not be started or communicated with.
    pub completed: bool,
    /// True if the command was stopped before, or while, it ran.
    pub halted: bool,
}

impl CommandResult {
    #[must_use]
    pub fn was_successful(&self) -> bool {
        !self.halted && self.completed && self.rc == 0
    }

    pub(crate) fn halted() -> Self {
        Self {
            rc: -1,
            stdout: String::new(),
            stderr: String::new(),
            completed: false,
            halted: true,
        }
    }

    fn fault_injection() -> Self {
        Self {
            rc: 1,
            stdout: "Fault Injection".to_string(),
            stderr: "Fault Injection".to_string(),
            completed: false,
            halted: true,
        }
    }

    fn not_completed(error: &anyhow::Error) -> Self {
        Self {
            rc: -1,
            stdout: String::new(),
            stderr: format!("{error:#}"),
            completed: false,
            halted: false,
        }
    }

    fn describe(&self) -> String {
        if self.halted {
            "halted".to_string()
        } else if !self.completed {
            format!("did not complete: {}", self.stderr.trim())
        } else {
            format!("rc={}, stderr: {}", self.rc, self.stderr.trim())
        }
    }
}

/// A command that did not succeed, as reported by [`check_results`] and the pool.
#[derive(Debug, thiserror::Error)]
#[error("command '{name}' on {target} failed ({})", .result.describe())]
pub struct ExecutionError {
    pub name: String,
    pub target: Target,
    pub result: CommandResult,
}

#[derive(Debug, Default)]
struct Control {
    interrupted: AtomicBool,
    cancel: tokio_util::sync::CancellationToken,
}

/// Lets other tasks stop a [`Command`] that is owned (and possibly being run) elsewhere.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    control: std::sync::Arc<Control>,
}

impl CommandHandle {
    /// Marks the command as halted. A command that has not started yet will not run.
    pub fn interrupt(&self) {
        self.control.interrupted.store(true, Ordering::Release);
    }

    /// Signals the running process to terminate.
    pub fn cancel(&self) {
        self.control.cancel.cancel();
    }
}

#[derive(Debug)]
pub struct Command {
    name: String,
    cmd_str: String,
    target: Target,
    stdin: Option<String>,
    env: Vec<(String, String)>,
    control: std::sync::Arc<Control>,
    results: Option<CommandResult>,
}

impl Command {
    pub fn new(name: impl Into<String>, cmd_str: impl Into<String>, target: Target) -> Self {
        Self {
            name: name.into(),
            cmd_str: cmd_str.into(),
            target,
            stdin: None,
            env: Vec::new(),
            control: Default::default(),
            results: None,
        }
    }

    #[must_use]
    pub fn with_stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cmd_str(&self) -> &str {
        &self.cmd_str
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn results(&self) -> Option<&CommandResult> {
        self.results.as_ref()
    }

    #[must_use]
    pub fn was_successful(&self) -> bool {
        self.results
            .as_ref()
            .is_some_and(CommandResult::was_successful)
    }

    pub fn handle(&self) -> CommandHandle {
        CommandHandle {
            control: self.control.clone(),
        }
    }

    pub fn interrupt(&self) {
        self.handle().interrupt();
    }

    pub fn cancel(&self) {
        self.handle().cancel();
    }

    /// Returns the command as an error unless it ran successfully.
    pub fn check(&self) -> Result<(), ExecutionError> {
        match &self.results {
            Some(result) if result.was_successful() => Ok(()),
            other => Err(ExecutionError {
                name: self.name.clone(),
                target: self.target.clone(),
                result: other.clone().unwrap_or_else(CommandResult::halted),
            }),
        }
    }

    pub(crate) fn set_halted(&mut self) {
        if self.results.is_none() {
            self.results = Some(CommandResult::halted());
        }
    }

    /// The full command line handed to `bash -c`.
    pub fn command_line(&self) -> String {
        match &self.target {
            Target::Local => self.cmd_str.clone(),
            Target::Remote(host) => {
                ssh::wrap(host, &ssh::with_env_prefix(&self.env, &self.cmd_str))
            }
        }
    }

    /// Runs the command and attaches its result. Running a command that already has a result is
    /// a no-op.
    #[instrument(skip(self), fields(name = %self.name, target = %self.target))]
    pub async fn run(&mut self) -> &CommandResult {
        if self.results.is_none() {
            let result = self.execute().await;
            self.results = Some(result);
        }
        self.results.get_or_insert_with(CommandResult::halted)
    }

    /// Runs the command on its own task, handing it back with the result attached.
    pub fn run_async(mut self) -> tokio::task::JoinHandle<Command> {
        tokio::spawn(async move {
            self.run().await;
            self
        })
    }

    async fn execute(&self) -> CommandResult {
        let fault_point = std::env::var(FAULT_POINT_ENV).unwrap_or_default();
        if !fault_point.is_empty() && self.name.starts_with(&fault_point) {
            tracing::warn!("fault injected into '{}'", self.name);
            return CommandResult::fault_injection();
        }
        let mut attempt = 0;
        loop {
            if self.control.interrupted.load(Ordering::Acquire) {
                return CommandResult::halted();
            }
            let result = match self.spawn_and_wait().await {
                Ok(result) => result,
                Err(error) => {
                    tracing::error!("failed executing '{}': {:#}", self.name, &error);
                    return CommandResult::not_completed(&error);
                }
            };
            let retry = matches!(self.target, Target::Remote(_))
                && attempt < ssh::MAX_RETRY
                && ssh::is_transient_handshake_failure(&result.stderr);
            if !retry {
                return result;
            }
            attempt += 1;
            tracing::info!(
                "ssh handshake rejected by {}, retrying ({}/{})",
                self.target,
                attempt,
                ssh::MAX_RETRY
            );
            tokio::time::sleep(ssh::RETRY_DELAY).await;
        }
    }

    async fn spawn_and_wait(&self) -> anyhow::Result<CommandResult> {
        let command_line = self.command_line();
        tracing::debug!("running: {}", &command_line);
        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c")
            .arg(&command_line)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(if self.stdin.is_some() {
                std::process::Stdio::piped()
            } else {
                std::process::Stdio::null()
            })
            .process_group(0)
            .kill_on_drop(true);
        if self.target == Target::Local {
            cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed spawning '{}'", &self.name))?;
        if let (Some(payload), Some(mut stdin)) = (&self.stdin, child.stdin.take()) {
            stdin
                .write_all(payload.as_bytes())
                .await
                .with_context(|| format!("failed writing stdin of '{}'", &self.name))?;
        }
        let stdout = tokio::spawn(read_to_string(child.stdout.take()));
        let stderr = tokio::spawn(read_to_string(child.stderr.take()));
        let status = tokio::select! {
            status = child.wait() => status,
            _ = self.control.cancel.cancelled() => {
                if let Some(pid) = child.id() {
                    tracing::info!("terminating '{}' (pid {})", &self.name, pid);
                    let pgid = nix::unistd::Pid::from_raw(pid as i32);
                    let signal = nix::sys::signal::Signal::SIGTERM;
                    if let Err(error) = nix::sys::signal::killpg(pgid, signal) {
                        tracing::debug!("failed signaling process group {}: {}", pgid, error);
                    }
                }
                child.wait().await
            }
        }
        .with_context(|| format!("failed waiting for '{}'", &self.name))?;
        let stdout = stdout.await.context("stdout reader panicked")??;
        let stderr = stderr.await.context("stderr reader panicked")??;
        let rc = status.code().unwrap_or_else(|| {
            use std::os::unix::process::ExitStatusExt;
            128 + status.signal().unwrap_or(0)
        });
        Ok(CommandResult {
            rc,
            stdout,
            stderr,
            completed: true,
            halted: self.control.interrupted.load(Ordering::Acquire),
        })
    }
}

async fn read_to_string<R: tokio::io::AsyncRead + Unpin>(
    reader: Option<R>,
) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Fails with the first command that did not succeed.
pub fn check_results<'a>(
    commands: impl IntoIterator<Item = &'a Command>,
) -> Result<(), ExecutionError> {
    commands.into_iter().try_for_each(Command::check)
}

/// Runs one command per host concurrently and fails on the first unsuccessful one.
#[instrument(skip(commands))]
pub async fn run_remote_commands(
    name: &str,
    commands: &std::collections::BTreeMap<String, String>,
) -> anyhow::Result<std::collections::BTreeMap<String, CommandResult>> {
    let pool = WorkerPool::new(commands.len().max(1))?;
    for (host, cmd_str) in commands {
        pool.submit(Command::new(
            format!("{name} on {host}"),
            cmd_str.clone(),
            Target::remote(host.clone()),
        ));
    }
    pool.join(None).await;
    let completed = pool.check_all_succeeded();
    pool.halt_and_join().await;
    let completed = completed?;
    Ok(completed
        .into_iter()
        .filter_map(|cmd| match (cmd.target, cmd.results) {
            (Target::Remote(host), Some(result)) => Some((host, result)),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn captures_output_and_rc() {
        let mut cmd = Command::new("echo", "echo out; echo err >&2; exit 3", Target::Local);
        let result = cmd.run().await.clone();
        assert_eq!(result.rc, 3);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(result.completed);
        assert!(!result.halted);
        assert!(!cmd.was_successful());
        assert!(cmd.check().is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn stdin_and_env_are_passed() {
        let mut cmd = Command::new("cat", "cat; echo $GREETING", Target::Local)
            .with_stdin("payload\n")
            .with_env("GREETING", "hello");
        let result = cmd.run().await.clone();
        assert!(result.was_successful());
        assert_eq!(result.stdout, "payload\nhello\n");
    }

    #[tokio::test]
    #[traced_test]
    async fn result_is_attached_once() {
        let mut cmd = Command::new("date", "date +%s%N", Target::Local);
        let first = cmd.run().await.clone();
        let second = cmd.run().await.clone();
        assert_eq!(first, second);
    }

    #[tokio::test]
    #[traced_test]
    async fn interrupted_command_does_not_run() {
        let mut cmd = Command::new("true", "true", Target::Local);
        cmd.interrupt();
        let result = cmd.run().await;
        assert!(result.halted);
        assert!(!result.completed);
    }

    #[tokio::test]
    #[traced_test]
    async fn check_reports_unrun_and_halted_commands() {
        let unrun = Command::new("never", "true", Target::Local);
        let error = unrun.check().unwrap_err();
        assert_eq!(error.name, "never");
        assert!(error.result.halted);
        assert!(error.to_string().contains("halted"));
        let mut interrupted = Command::new("stopped", "true", Target::remote("dd1"));
        interrupted.interrupt();
        interrupted.run().await;
        let error = interrupted.check().unwrap_err();
        assert_eq!(error.target, Target::remote("dd1"));
        assert_eq!(error.result, CommandResult::halted());
        let mut ok = Command::new("ok", "true", Target::Local);
        ok.run().await;
        assert!(ok.check().is_ok());
    }

    #[tokio::test]
    #[traced_test]
    async fn cancel_terminates_running_process() {
        let cmd = Command::new("sleeper", "exec sleep 30", Target::Local);
        let handle = cmd.handle();
        let start = std::time::Instant::now();
        let running = cmd.run_async();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        handle.interrupt();
        handle.cancel();
        let cmd = running.await.unwrap();
        let result = cmd.results().unwrap();
        assert!(start.elapsed() < std::time::Duration::from_secs(10));
        assert!(result.halted);
        assert_eq!(result.rc, 128 + 15);
    }

    #[test]
    fn remote_command_line_is_wrapped() {
        let cmd = Command::new("ls", "ls \"/data\"", Target::remote("sdw1")).with_env("A", "1");
        assert_eq!(
            cmd.command_line(),
            "ssh -o 'StrictHostKeyChecking no' -o 'ServerAliveInterval 60' sdw1 \"export A=\\\"1\\\" && ls \\\"/data\\\"\""
        );
    }
}

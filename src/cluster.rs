//! Start/stop capability for the backend cluster
//!
//! The lifecycle controller only needs "start" and "stop". Whatever actually
//! orchestrates the cluster (compose, a process manager, a cluster API) plugs
//! in behind [`ClusterControl`].

use crate::error::CommandError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// External start/stop commands for the backend cluster.
///
/// Both operations must be safe to retry: starting an already-running cluster
/// or stopping a stopped one is not an error from the controller's point of view.
pub trait ClusterControl: Send + Sync {
    fn start(&self) -> BoxFuture<'_, Result<(), CommandError>>;
    fn stop(&self) -> BoxFuture<'_, Result<(), CommandError>>;
}

/// Runs configured command lines, e.g. `docker-compose -f cluster.yml up -d`
#[derive(Debug, Clone)]
pub struct ShellCommandControl {
    start_argv: Vec<String>,
    stop_argv: Vec<String>,
}

impl ShellCommandControl {
    pub fn new(start_argv: Vec<String>, stop_argv: Vec<String>) -> Self {
        Self {
            start_argv,
            stop_argv,
        }
    }
}

impl ClusterControl for ShellCommandControl {
    fn start(&self) -> BoxFuture<'_, Result<(), CommandError>> {
        run_command("start", &self.start_argv).boxed()
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), CommandError>> {
        run_command("stop", &self.stop_argv).boxed()
    }
}

/// Run a command to completion; non-zero exit yields its stderr as the error
async fn run_command(action: &'static str, argv: &[String]) -> Result<(), CommandError> {
    let (program, args) = argv.split_first().ok_or(CommandError::Empty)?;

    info!(action, command = %shell_words::join(argv), "Running cluster command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        debug!(action, stdout = %stdout.trim(), "Cluster command output");
    }

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let message = if stderr.trim().is_empty() {
        format!("{} command exited with {}", action, output.status)
    } else {
        stderr.trim().to_string()
    };
    Err(CommandError::Failed(message))
}

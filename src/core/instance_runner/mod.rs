use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::dispatcher::{CoreEvent, EventSink};
use crate::core::error::{CoreError, Result};
use crate::core::LaunchState;

/// How long the supervisor lets the log pumps drain after the process exits.
/// Pipes inherited by leftover child processes may never reach EOF.
const PUMP_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// A spawned game process and the task supervising it.
///
/// Dropping this value does not stop the game; the supervisor keeps
/// streaming output and reports the exit through the event sink.
#[derive(Debug)]
pub struct RunningInstance {
    pub name: String,
    pub pid: Option<u32>,
    supervisor: JoinHandle<Option<i32>>,
}

impl RunningInstance {
    /// Waits for the process to exit and returns its exit code, if any.
    pub async fn wait(self) -> Result<Option<i32>> {
        Ok(self.supervisor.await?)
    }
}

/// Spawns `command` with `working_dir` as its cwd and publishes `Running`.
/// Output lines are sent as `LogLine` events and liveness is polled every
/// `poll`.
pub fn spawn_instance(
    name: &str,
    command: &[String],
    working_dir: &Path,
    poll: Duration,
    sink: EventSink,
) -> Result<RunningInstance> {
    let (program, args) = command.split_first().ok_or_else(|| CoreError::ProcessSpawnFailure {
        executable: String::new(),
        reason: "empty command line".to_string(),
    })?;

    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| CoreError::ProcessSpawnFailure {
            executable: program.clone(),
            reason: error.to_string(),
        })?;

    let pid = child.id();
    info!(instance = name, ?pid, program = %program, "game process started");
    sink.emit(CoreEvent::LaunchState {
        instance: name.to_string(),
        state: LaunchState::Running,
    });

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_lines(stdout, name.to_string(), sink.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_lines(stderr, name.to_string(), sink.clone())));
    }

    let supervisor = tokio::spawn(supervise(child, name.to_string(), poll, pumps, sink));

    Ok(RunningInstance {
        name: name.to_string(),
        pid,
        supervisor,
    })
}

async fn pump_lines<R>(reader: R, instance: String, sink: EventSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                sink.emit(CoreEvent::LogLine {
                    instance: instance.clone(),
                    line: line.trim_end_matches(['\r', '\n']).to_string(),
                });
            }
            Err(error) => {
                debug!(%error, instance = %instance, "log stream closed");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    instance: String,
    poll: Duration,
    pumps: Vec<JoinHandle<()>>,
    sink: EventSink,
) -> Option<i32> {
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => tokio::time::sleep(poll).await,
            Err(error) => {
                warn!(%error, instance = %instance, "lost track of game process");
                break None;
            }
        }
    };

    match tokio::time::timeout(PUMP_DRAIN_GRACE, join_all(pumps)).await {
        Ok(finished) => {
            for error in finished.into_iter().filter_map(|pump| pump.err()) {
                debug!(%error, "log pump ended abnormally");
            }
        }
        Err(_) => debug!(instance = %instance, "output still open after exit, pumps left running"),
    }

    let code = status.and_then(|status| status.code());
    let success = status.is_some_and(|status| status.success());
    info!(instance = %instance, ?code, success, "game process exited");
    sink.emit(CoreEvent::ProcessExited {
        instance: instance.clone(),
        code,
        success,
    });
    sink.emit(CoreEvent::LaunchState {
        instance,
        state: if success {
            LaunchState::Finished
        } else {
            LaunchState::Crashed
        },
    });
    code
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn streams_output_and_reports_clean_exit() {
        let dir = TempDir::new().unwrap();
        let (sink, mut rx) = EventSink::channel();

        let running = spawn_instance(
            "A",
            &sh("echo hello; echo oops 1>&2; pwd"),
            dir.path(),
            Duration::from_millis(20),
            sink,
        )
        .unwrap();
        assert!(running.pid.is_some());
        assert_eq!(running.wait().await.unwrap(), Some(0));

        let mut lines = Vec::new();
        let mut exit = None;
        let mut final_state = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                CoreEvent::LogLine { line, .. } => lines.push(line),
                CoreEvent::ProcessExited { code, success, .. } => exit = Some((code, success)),
                CoreEvent::LaunchState { state, .. } => final_state = Some(state),
                _ => {}
            }
        }
        assert!(lines.contains(&"hello".to_string()));
        assert!(lines.contains(&"oops".to_string()));
        let cwd = dir.path().canonicalize().unwrap();
        assert!(lines.iter().any(|line| Path::new(line) == cwd || Path::new(line) == dir.path()));
        assert_eq!(exit, Some((Some(0), true)));
        assert_eq!(final_state, Some(LaunchState::Finished));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_crash() {
        let dir = TempDir::new().unwrap();
        let (sink, mut rx) = EventSink::channel();

        let running =
            spawn_instance("B", &sh("exit 3"), dir.path(), Duration::from_millis(20), sink).unwrap();
        assert_eq!(running.wait().await.unwrap(), Some(3));

        let states: Vec<LaunchState> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| match event {
                CoreEvent::LaunchState { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![LaunchState::Running, LaunchState::Crashed]);
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_log_stream() {
        let dir = TempDir::new().unwrap();
        let (sink, mut rx) = EventSink::channel();

        let running = spawn_instance(
            "D",
            &sh(r"printf 'before\n\377bad\r\nafter\n'"),
            dir.path(),
            Duration::from_millis(20),
            sink,
        )
        .unwrap();
        assert_eq!(running.wait().await.unwrap(), Some(0));

        let lines: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| match event {
                CoreEvent::LogLine { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["before", "\u{fffd}bad", "after"]);
    }

    #[tokio::test]
    async fn exit_is_reported_while_a_grandchild_keeps_output_open() {
        let dir = TempDir::new().unwrap();
        let (sink, mut rx) = EventSink::channel();

        let running = spawn_instance(
            "E",
            &sh("sleep 5 & echo spawned; exit 0"),
            dir.path(),
            Duration::from_millis(20),
            sink,
        )
        .unwrap();
        let code = tokio::time::timeout(Duration::from_secs(2), running.wait())
            .await
            .expect("exit reported before the grandchild finished")
            .unwrap();
        assert_eq!(code, Some(0));

        let exited = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|event| matches!(event, CoreEvent::ProcessExited { success: true, .. }));
        assert!(exited);
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let (sink, _rx) = EventSink::channel();

        let result = spawn_instance(
            "C",
            &["/definitely/not/a/runtime".to_string()],
            dir.path(),
            Duration::from_millis(20),
            sink,
        );
        assert!(matches!(result, Err(CoreError::ProcessSpawnFailure { .. })));
    }
}

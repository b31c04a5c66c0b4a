use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::types::{CoqError, CoqTopSettings};

/// Build the coqtop command line.
///
/// With a wrapper the wrapper is launched and told where the real binary is
/// via `-coqtopbin`; the channel arguments follow in both cases.
pub fn coqtop_command(
    settings: &CoqTopSettings,
    wrapper: Option<&Path>,
    main_arg: &str,
    control_arg: &str,
) -> Command {
    let mut cmd = match wrapper {
        Some(wrapper) => {
            let mut cmd = Command::new(wrapper);
            cmd.arg("-coqtopbin").arg(settings.coqtop_binary());
            cmd
        }
        None => Command::new(settings.coqtop_binary()),
    };
    cmd.arg("-main-channel")
        .arg(main_arg)
        .arg("-control-channel")
        .arg(control_arg)
        .arg("-ideslave")
        .arg("-async-proofs")
        .arg("on")
        .args(&settings.args);
    cmd
}

/// Spawn `cmd` with its output captured for logging.
///
/// The child is killed if its handle is dropped.
pub fn spawn(mut cmd: Command) -> Result<Child, CoqError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CoqError::Spawn(format!("{program}: {e}")))?;

    tracing::info!(program = %program, pid = ?child.id(), "Spawned coqtop");
    if let Some(stdout) = child.stdout.take() {
        log_lines("stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        log_lines("stderr", stderr);
    }
    Ok(child)
}

fn log_lines(stream: &'static str, pipe: impl AsyncRead + Send + Unpin + 'static) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(stream, "coqtop: {line}");
        }
    });
}

/// Handle to a supervised coqtop process.
///
/// Dropping it (or calling [`ProcessGuard::kill`]) kills the process.
#[derive(Debug)]
pub struct ProcessGuard {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

impl ProcessGuard {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Whether the watcher is still waiting on the process.
    pub fn is_alive(&self) -> bool {
        !self.watcher.is_finished()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Watch `child` until it exits on its own or is killed through the guard.
///
/// `on_exit` runs only for an exit the guard did not ask for.
pub fn supervise(
    mut child: Child,
    on_exit: impl FnOnce(String) + Send + 'static,
) -> ProcessGuard {
    let pid = child.id();
    let (kill, killed) = oneshot::channel::<()>();
    let watcher = tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let reason = match status {
                    Ok(status) => format!("coqtop exited ({status})"),
                    Err(e) => format!("coqtop wait failed: {e}"),
                };
                tracing::info!(?pid, %reason, "coqtop terminated");
                on_exit(reason);
            }
            _ = killed => {
                if let Err(e) = child.kill().await {
                    tracing::debug!(?pid, error = %e, "Kill failed (already exited?)");
                }
                tracing::debug!(?pid, "coqtop killed");
            }
        }
    });
    ProcessGuard {
        pid,
        kill: Some(kill),
        watcher,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::path::PathBuf;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn settings() -> CoqTopSettings {
        CoqTopSettings {
            coq_path: PathBuf::from("/opt/coq/bin"),
            args: vec!["-R".into(), ".".into(), "Top".into()],
            ..CoqTopSettings::default()
        }
    }

    #[test]
    fn direct_command_line() {
        let cmd = coqtop_command(&settings(), None, "127.0.0.1:1000", "127.0.0.1:1001");
        assert_eq!(
            cmd.as_std().get_program(),
            settings().coqtop_binary().as_os_str()
        );
        assert_eq!(
            args(&cmd),
            vec![
                "-main-channel",
                "127.0.0.1:1000",
                "-control-channel",
                "127.0.0.1:1001",
                "-ideslave",
                "-async-proofs",
                "on",
                "-R",
                ".",
                "Top"
            ]
        );
    }

    #[test]
    fn wrapper_command_line() {
        let wrapper = Path::new("/opt/coq/coqtopw");
        let cmd = coqtop_command(&settings(), Some(wrapper), "h:1:2", "h:3:4");
        assert_eq!(cmd.as_std().get_program(), OsStr::new("/opt/coq/coqtopw"));
        let args = args(&cmd);
        assert_eq!(args[0], "-coqtopbin");
        assert_eq!(PathBuf::from(&args[1]), settings().coqtop_binary());
        assert_eq!(&args[2..4], ["-main-channel", "h:1:2"]);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let cmd = Command::new("/definitely/not/here/coqtop");
        let err = spawn(cmd).unwrap_err();
        assert!(matches!(err, CoqError::Spawn(msg) if msg.contains("/definitely/not/here/coqtop")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_is_reported_once() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 3");
        let child = spawn(cmd).unwrap();
        let (tx, rx) = oneshot::channel();
        let _guard = supervise(child, move |reason| {
            let _ = tx.send(reason);
        });
        let reason = rx.await.unwrap();
        assert!(reason.contains('3'), "{reason}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_does_not_report_exit() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let child = spawn(cmd).unwrap();
        let (tx, mut rx) = oneshot::channel::<String>();
        let mut guard = supervise(child, move |reason| {
            let _ = tx.send(reason);
        });
        guard.kill();
        for _ in 0..100 {
            if !guard.is_alive() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!guard.is_alive());
        assert!(rx.try_recv().is_err());
    }
}

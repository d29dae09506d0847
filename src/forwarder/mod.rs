//! External frame forwarder
//!
//! Optionally, every station session spawns a configured child process and
//! mirrors its OCPP traffic to the child's stdin, one frame per line. Lines
//! the child prints on stdout are injected back toward the station as if the
//! server had sent them. A crashed or exited child never takes the session
//! down; forwarding just stops.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Handle to a per-session forwarding child process.
pub struct Forwarder {
    stdin_tx: mpsc::UnboundedSender<String>,
    kill: Arc<Notify>,
}

impl Forwarder {
    /// Spawn `command` (split on whitespace, station id appended as the last
    /// argument) and wire its pipes. Inbound lines from the child are pushed
    /// to `frames`.
    pub fn spawn(
        command: &str,
        station_id: &str,
        frames: mpsc::UnboundedSender<String>,
    ) -> std::io::Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty forwarder command")
        })?;

        let mut child = Command::new(program)
            .args(parts)
            .arg(station_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let kill = Arc::new(Notify::new());
        let kill_task = kill.clone();
        let id = station_id.to_string();

        tokio::spawn(async move {
            let mut stdout_lines = stdout.map(|out| BufReader::new(out).lines());
            let mut stderr_lines = stderr.map(|err| BufReader::new(err).lines());
            loop {
                tokio::select! {
                    _ = kill_task.notified() => {
                        let _ = child.start_kill();
                        break;
                    }
                    status = child.wait() => {
                        debug!(station_id = %id, ?status, "Forwarder process exited");
                        break;
                    }
                    line = async {
                        match stdout_lines.as_mut() {
                            Some(lines) => lines.next_line().await,
                            None => std::future::pending().await,
                        }
                    } => match line {
                        Ok(Some(line)) if !line.trim().is_empty() => {
                            if frames.send(line).is_err() {
                                break;
                            }
                        }
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => stdout_lines = None,
                    },
                    line = async {
                        match stderr_lines.as_mut() {
                            Some(lines) => lines.next_line().await,
                            None => std::future::pending().await,
                        }
                    } => match line {
                        Ok(Some(line)) => {
                            warn!(station_id = %id, line = %line, "forwarder stderr");
                        }
                        Ok(None) | Err(_) => stderr_lines = None,
                    },
                    frame = stdin_rx.recv() => match (frame, stdin.as_mut()) {
                        (Some(frame), Some(pipe)) => {
                            let mut line = frame;
                            line.push('\n');
                            if pipe.write_all(line.as_bytes()).await.is_err() {
                                stdin = None;
                            }
                        }
                        (Some(_), None) => {}
                        (None, _) => {
                            let _ = child.start_kill();
                            break;
                        }
                    },
                }
            }
        });

        Ok(Self { stdin_tx, kill })
    }

    /// Mirror one frame line to the child. Silently a no-op once the child
    /// is gone.
    pub fn forward(&self, line: &str) {
        let _ = self.stdin_tx.send(line.to_string());
    }

    /// Kill the child and stop the pump task.
    pub fn shutdown(&self) {
        self.kill.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn echoes_stdin_lines_back_as_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // the station id is appended as an argument; `sh -c cat` absorbs it
        // as $0 so the child echoes stdin
        let fw = Forwarder::spawn("sh -c cat", "CP1", tx).expect("spawn cat");
        fw.forward("[2,\"a\",\"Heartbeat\",{}]");

        let line = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("line in time")
            .expect("channel open");
        assert_eq!(line, "[2,\"a\",\"Heartbeat\",{}]");
        fw.shutdown();
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_not_a_panic() {
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(Forwarder::spawn("/nonexistent/forwarder-bin", "CP1", tx).is_err());
        assert!(Forwarder::spawn("", "CP1", mpsc::unbounded_channel().0).is_err());
    }

    #[tokio::test]
    async fn shutdown_kills_the_child() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fw = Forwarder::spawn("sh -c cat", "CP1", tx).expect("spawn cat");
        fw.shutdown();
        // after kill the frames channel closes once the pump task exits
        let closed = timeout(Duration::from_secs(5), async {
            loop {
                if rx.recv().await.is_none() {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }
}

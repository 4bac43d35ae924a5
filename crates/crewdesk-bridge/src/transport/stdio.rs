use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use super::{Link, LinkControl, Transport};
use crate::error::{BridgeError, Result};

const KILL_WAIT: Duration = Duration::from_secs(3);

/// Spawns the backend as a child process and exchanges newline-delimited
/// JSON over its stdin/stdout. Stderr lines are drained into the log.
#[derive(Debug, Clone)]
pub struct StdioTransport {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
}

impl StdioTransport {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn envs(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn current_dir(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn describe(&self) -> String {
        format!("stdio:{}", self.program)
    }

    async fn open(&self) -> Result<Link> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            BridgeError::Transport(format!("failed to spawn '{}': {}", self.program, e))
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Transport("backend stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Transport("backend stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        tracing::info!(program = %self.program, pid = ?pid, "spawned backend process");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = outbound_rx.recv().await {
                let mut line = frame.into_bytes();
                line.push(b'\n');
                if stdin.write_all(&line).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        if inbound_tx.send(trimmed.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("backend stdout read failed: {}", e);
                        break;
                    }
                }
            }
            tracing::debug!(pid = ?pid, "backend stdout closed");
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let text = line.trim();
                    if !text.is_empty() {
                        tracing::debug!(target: "crewdesk.backend", pid = ?pid, "{}", text);
                    }
                }
            });
        }

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
            control: Arc::new(ChildControl {
                child: Mutex::new(Some(child)),
            }),
        })
    }
}

struct ChildControl {
    child: Mutex<Option<Child>>,
}

#[async_trait]
impl LinkControl for ChildControl {
    async fn probe(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Err(BridgeError::ConnectionClosed(
                "backend process was shut down".to_string(),
            ));
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(BridgeError::ConnectionLost(format!(
                "backend process exited with {status}"
            ))),
            Err(e) => Err(BridgeError::Transport(format!(
                "failed to query backend process: {e}"
            ))),
        }
    }

    async fn shutdown(&self) {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if let Err(e) = child.start_kill() {
            tracing::warn!("failed to kill backend process: {}", e);
            return;
        }
        match tokio::time::timeout(KILL_WAIT, child.wait()).await {
            Ok(Ok(status)) => tracing::info!(%status, "backend process stopped"),
            Ok(Err(e)) => tracing::warn!("failed to reap backend process: {}", e),
            Err(_) => tracing::warn!("backend process did not exit after kill"),
        }
    }
}

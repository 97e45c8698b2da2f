use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::provider::{CompletionProvider, CompletionRequest};
use crate::{AgentError, Result};

// ─── CommandProvider ──────────────────────────────────────────────────────

/// A local command used as the analysis service.
///
/// The system prompt and the prompt are written to stdin separated by a blank
/// line; the whole of stdout is the completion. Stderr is captured in a
/// background task and surfaced when the process exits with an error.
pub struct CommandProvider {
    argv: Vec<String>,
    label: String,
}

impl CommandProvider {
    pub fn new(argv: Vec<String>) -> Self {
        let label = argv.first().cloned().unwrap_or_default();
        Self { argv, label }
    }

    fn build_command(&self) -> Result<Command> {
        let (exe, args) = self
            .argv
            .split_first()
            .ok_or_else(|| AgentError::Process("empty analysis command".into()))?;
        let mut cmd = Command::new(exe);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl CompletionProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let mut child = self.build_command()?.spawn()?;

        // Drain stderr in the background so a chatty child never blocks on a full pipe.
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if !buf.is_empty() {
                        buf.push('\n');
                    }
                    buf.push_str(&line);
                }
                buf
            })
        });

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Process("stdin not captured".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Process("stdout not captured".into()))?;

        let input = format!("{}\n\n{}\n", request.system, request.prompt);
        let writer = async move {
            stdin.write_all(input.as_bytes()).await?;
            stdin.flush().await?;
            drop(stdin);
            Ok::<_, std::io::Error>(())
        };
        let mut out = String::new();
        let reader = stdout.read_to_string(&mut out);
        let (written, read) = tokio::join!(writer, reader);
        read?;
        if let Err(e) = written {
            // A command that ignores stdin may close it early.
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e.into());
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            let code = status
                .code()
                .map(|c| format!("exited with code {c}"))
                .unwrap_or_else(|| "terminated by signal".to_string());
            let msg = if stderr.is_empty() {
                format!("analysis command {code}")
            } else {
                format!("analysis command {code}\nstderr: {stderr}")
            };
            return Err(AgentError::Process(msg));
        }

        Ok(out.trim().to_string())
    }
}

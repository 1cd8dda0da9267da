//! Local-program backend.
//!
//! Runs a configured command, writes the rendered conversation to its
//! stdin, and treats stdout as the response. Streaming reads stdout line by
//! line.

use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use super::trait_def::Backend;
use super::types::{BackendError, GenerateRequest, Role, TextStream};

/// Characters of stderr kept in error messages.
const STDERR_TAIL_CHARS: usize = 400;

/// Backend that shells out to a local program.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    name: String,
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandBackend {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn spawn(&self, request: &GenerateRequest) -> Result<Child, BackendError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("HERON_MAX_TOKENS", request.max_tokens.to_string())
            .env("HERON_TIMEOUT_SECS", request.timeout.as_secs().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            BackendError::Unavailable(format!("failed to spawn {:?}: {e}", self.program))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let transcript = render_transcript(request);
            let name = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(transcript.as_bytes()).await {
                    debug!(backend = %name, error = %e, "program closed stdin early");
                }
            });
        }

        Ok(child)
    }
}

#[async_trait]
impl Backend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        let child = self.spawn(request)?;
        let output = tokio::time::timeout(request.timeout, child.wait_with_output())
            .await
            .map_err(|_| BackendError::Timeout(request.timeout))?
            .map_err(|e| BackendError::Request(format!("failed to wait for {}: {e}", self.name)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Request(format!(
                "{} exited with {}: {}",
                self.name,
                output.status,
                tail(&stderr)
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn stream_generate(&self, request: &GenerateRequest) -> Result<TextStream, BackendError> {
        let mut child = self.spawn(request)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Unavailable("stdout not captured".to_string()))?;
        let stderr = child.stderr.take().map(|s| tokio::spawn(drain(s)));
        let name = self.name.clone();

        let stream = async_stream::stream! {
            let mut lines = LinesStream::new(BufReader::new(stdout).lines());
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => yield Ok(format!("{line}\n")),
                    Err(e) => {
                        warn!(backend = %name, error = %e, "error reading program stdout");
                        yield Err(BackendError::Stream(format!("stdout read error: {e}")));
                        return;
                    }
                }
            }

            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let stderr = match stderr {
                        Some(handle) => handle.await.unwrap_or_default(),
                        None => String::new(),
                    };
                    yield Err(BackendError::Stream(format!(
                        "{name} exited with {status}: {}",
                        tail(&stderr)
                    )));
                }
                Err(e) => {
                    yield Err(BackendError::Stream(format!("failed to wait for {name}: {e}")));
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

async fn drain(mut stderr: ChildStderr) -> String {
    let mut buf = String::new();
    let _ = stderr.read_to_string(&mut buf).await;
    buf
}

fn tail(text: &str) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return text.to_string();
    }
    text.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

/// Render the request as a plain-text transcript for the program's stdin.
pub fn render_transcript(request: &GenerateRequest) -> String {
    let mut out = String::new();
    if !request.system_prompt.is_empty() {
        push_section(&mut out, Role::System, &request.system_prompt);
    }
    for message in &request.history {
        push_section(&mut out, message.role, &message.content);
    }
    push_section(&mut out, Role::User, &request.user_prompt);
    out
}

fn push_section(out: &mut String, role: Role, content: &str) {
    let heading = match role {
        Role::System => "System",
        Role::User => "User",
        Role::Assistant => "Assistant",
    };
    out.push_str("### ");
    out.push_str(heading);
    out.push('\n');
    out.push_str(content.trim_end());
    out.push_str("\n\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::backend::ChatMessage;

    fn request() -> GenerateRequest {
        GenerateRequest::new("be brief", "say hi")
            .with_history(vec![
                ChatMessage::user("earlier question"),
                ChatMessage::assistant("earlier answer"),
            ])
            .with_timeout(Duration::from_secs(10))
    }

    #[test]
    fn transcript_lists_sections_in_order() {
        let text = render_transcript(&request());
        assert_eq!(
            text,
            "### System\nbe brief\n\n### User\nearlier question\n\n\
             ### Assistant\nearlier answer\n\n### User\nsay hi\n\n"
        );
    }

    #[test]
    fn tail_keeps_the_end() {
        let long = "x".repeat(STDERR_TAIL_CHARS) + "END";
        let t = tail(&long);
        assert_eq!(t.chars().count(), STDERR_TAIL_CHARS);
        assert!(t.ends_with("END"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn generate_returns_program_stdout() {
        let backend = CommandBackend::new("cat", "cat");
        let out = backend.generate(&request()).await.unwrap();
        assert_eq!(out, render_transcript(&request()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn generate_reports_nonzero_exit() {
        let backend =
            CommandBackend::new("failing", "sh").with_args(["-c", "echo nope >&2; exit 3"]);
        let err = backend.generate(&request()).await.unwrap_err();
        match err {
            BackendError::Request(message) => assert!(message.contains("nope"), "{message}"),
            other => panic!("expected Request, got: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn generate_times_out() {
        let backend = CommandBackend::new("slow", "sleep").with_args(["5"]);
        let request = request().with_timeout(Duration::from_millis(100));
        let err = backend.generate(&request).await.unwrap_err();
        assert_eq!(err, BackendError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let backend = CommandBackend::new("ghost", "/nonexistent/heron-backend");
        let err = backend.generate(&request()).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stream_yields_lines() {
        let backend = CommandBackend::new("lines", "sh").with_args(["-c", "echo one; echo two"]);
        let chunks: Vec<_> = backend
            .stream_generate(&request())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks, vec![Ok("one\n".to_string()), Ok("two\n".to_string())]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stream_fails_on_bad_exit() {
        let backend = CommandBackend::new("broken", "sh")
            .with_args(["-c", "echo partial; echo oops >&2; exit 1"]);
        let chunks: Vec<_> = backend
            .stream_generate(&request())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks[0], Ok("partial\n".to_string()));
        match &chunks[1] {
            Err(BackendError::Stream(message)) => assert!(message.contains("oops"), "{message}"),
            other => panic!("expected stream error, got: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn program_sees_request_limits() {
        let backend = CommandBackend::new("env", "sh")
            .with_args(["-c", "printf '%s %s' \"$HERON_MAX_TOKENS\" \"$HERON_TIMEOUT_SECS\""]);
        let out = backend
            .generate(&request().with_max_tokens(256))
            .await
            .unwrap();
        assert_eq!(out, "256 10");
    }
}

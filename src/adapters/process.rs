use std::path::PathBuf;
use std::process::Stdio;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{AdapterError, AdapterResult};

/// Lines of stderr kept in an exit status error.
const STDERR_TAIL_LINES: usize = 5;

/// An external tool invocation whose stdout is one JSON document per line.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    tool: String,
    program: PathBuf,
    args: Vec<String>,
    stdin: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ToolCommand {
    pub fn new(tool: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
            stdin: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Lines fed to the tool's stdin, one input per line.
    pub fn stdin_lines(mut self, lines: Vec<String>) -> Self {
        self.stdin = lines;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Spawn the tool, wait for it and parse its output into a JSON array.
    ///
    /// The child is killed if `cancel` fires or if the returned future is
    /// dropped (e.g. by a timeout).
    pub async fn run_jsonl(self, cancel: &CancellationToken) -> AdapterResult<Value> {
        debug!(
            tool = %self.tool,
            program = %self.program.display(),
            args = ?self.args,
            inputs = self.stdin.len(),
            "launching tool"
        );

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if self.stdin.is_empty() {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| AdapterError::Spawn {
            tool: self.tool.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut input = self.stdin.join("\n");
            input.push('\n');
            let tool = self.tool.clone();
            // Written from a separate task so a chatty tool can't deadlock on a full stdout pipe.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    warn!(tool = %tool, error = %e, "failed to write tool input");
                }
            });
        }

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
        };

        if !output.status.success() {
            return Err(AdapterError::ExitStatus {
                tool: self.tool,
                code: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        parse_jsonl(&self.tool, &output.stdout)
    }
}

/// Parse JSON-lines output. Blank lines are ignored.
pub fn parse_jsonl(tool: &str, stdout: &[u8]) -> AdapterResult<Value> {
    let text = String::from_utf8_lossy(stdout);
    let mut records = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|source| AdapterError::Parse {
            tool: tool.to_string(),
            line: idx + 1,
            source,
        })?;
        records.push(record);
    }

    trace!(tool, records = records.len(), "parsed tool output");
    Ok(Value::Array(records))
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_jsonl() {
        let out = b"{\"host\":\"a.example.com\"}\n\n  {\"host\":\"b.example.com\",\"port\":443}\n";
        let value = parse_jsonl("subfinder", out).unwrap();
        assert_eq!(
            value,
            json!([{"host": "a.example.com"}, {"host": "b.example.com", "port": 443}])
        );
    }

    #[test]
    fn test_parse_jsonl_empty_output() {
        assert_eq!(parse_jsonl("katana", b"").unwrap(), json!([]));
    }

    #[test]
    fn test_parse_jsonl_reports_line() {
        let err = parse_jsonl("httpx", b"{\"ok\":true}\nnot json\n").unwrap_err();
        match err {
            AdapterError::Parse { tool, line, .. } => {
                assert_eq!(tool, "httpx");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_stderr_tail() {
        let stderr = b"one\ntwo\n\nthree\nfour\nfive\nsix\n";
        assert_eq!(stderr_tail(stderr), "two | three | four | five | six");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let cancel = CancellationToken::new();
        let err = ToolCommand::new("naabu", "/nonexistent/reconflow-naabu")
            .run_jsonl(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_shell_tool() {
        let cancel = CancellationToken::new();
        let value = ToolCommand::new("echo", "sh")
            .arg("-c")
            .arg("while read line; do echo \"{\\\"host\\\":\\\"$line\\\"}\"; done")
            .stdin_lines(vec!["a.example.com".into(), "b.example.com".into()])
            .run_jsonl(&cancel)
            .await
            .unwrap();
        assert_eq!(
            value,
            json!([{"host": "a.example.com"}, {"host": "b.example.com"}])
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit() {
        let cancel = CancellationToken::new();
        let err = ToolCommand::new("broken", "sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .run_jsonl(&cancel)
            .await
            .unwrap_err();
        match err {
            AdapterError::ExitStatus { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_tool() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = ToolCommand::new("sleepy", "sh")
            .args(["-c", "sleep 30"])
            .run_jsonl(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Cancelled));
    }
}

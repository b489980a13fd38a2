//! Snippet execution.
//!
//! The snippet runs as a child process in a throwaway directory. Request
//! data reaches it through environment variables and stdin:
//!
//! | variable              | content                   |
//! |-----------------------|---------------------------|
//! | `CODEACTIONS_PARAMS`  | query parameters as JSON  |
//! | `CODEACTIONS_BODY`    | raw request body          |
//! | `CODEACTIONS_HEADERS` | request headers as JSON   |
//! | `CODEACTIONS_RUN_ID`  | id of the run             |
//!
//! The body is also written to stdin. Stdout is the result; any stderr
//! output or a non-zero exit status fails the run.

pub mod languages;

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::code::Language;
use languages::LanguageTable;

/// Everything a snippet run needs.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub code_id: String,
    pub language: Language,
    pub source: String,
    pub params: Map<String, Value>,
    pub body: String,
    pub headers: Map<String, Value>,
    pub timeout: Duration,
}

#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Run the snippet and return its output.
    async fn run_code(&self, ctx: &ExecutionContext) -> Result<String>;
}

pub struct ProcessInterpreter {
    languages: LanguageTable,
}

impl ProcessInterpreter {
    pub fn new(languages: LanguageTable) -> Self {
        Self { languages }
    }
}

#[async_trait]
impl Interpreter for ProcessInterpreter {
    async fn run_code(&self, ctx: &ExecutionContext) -> Result<String> {
        let Some(lang) = self.languages.get(ctx.language.as_str()) else {
            bail!("unsupported language code type: {}", ctx.language.as_str());
        };

        let workdir = tempfile::Builder::new()
            .prefix("code-")
            .tempdir()
            .context("Failed to create run directory")?;
        tokio::fs::write(workdir.path().join(&lang.source_file), &ctx.source)
            .await
            .context("Failed to write source file")?;

        debug!(
            run_id = %ctx.run_id,
            language = ctx.language.as_str(),
            "Running snippet: {:?}",
            lang.run_command
        );

        let mut cmd = Command::new(&lang.run_command[0]);
        cmd.args(&lang.run_command[1..])
            .current_dir(workdir.path())
            .envs(&lang.env)
            .env("CODEACTIONS_PARAMS", serde_json::to_string(&ctx.params)?)
            .env("CODEACTIONS_BODY", &ctx.body)
            .env("CODEACTIONS_HEADERS", serde_json::to_string(&ctx.headers)?)
            .env("CODEACTIONS_RUN_ID", &ctx.run_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", lang.run_command[0]))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(ctx.body.as_bytes()).await {
                // the snippet may exit without reading its input
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e).context("Failed to write stdin");
                }
            }
        }

        let output = match tokio::time::timeout(ctx.timeout, child.wait_with_output()).await {
            Ok(output) => output.context("Failed to wait for snippet")?,
            Err(_) => bail!("process took too long (limit {}s)", ctx.timeout.as_secs()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !stderr.is_empty() {
            bail!("error executing code: {}", stderr.trim_end());
        }
        if !output.status.success() {
            bail!(
                "error executing code: exited with status {}",
                output.status.code().unwrap_or(-1)
            );
        }
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Runs snippets with `sh` under the python entry so tests need no
    /// interpreters installed.
    fn shell_interpreter() -> ProcessInterpreter {
        let table = LanguageTable::parse(
            r#"
[python]
source_file = "main.sh"
run_command = "sh main.sh"
"#,
        )
        .unwrap();
        ProcessInterpreter::new(table)
    }

    fn context(source: &str) -> ExecutionContext {
        ExecutionContext {
            run_id: "run-1".into(),
            code_id: "code-1".into(),
            language: Language::Python,
            source: source.into(),
            params: Map::new(),
            body: String::new(),
            headers: Map::new(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_stdout_is_result() {
        let out = tokio_test::assert_ok!(shell_interpreter().run_code(&context("echo hello")).await);
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn test_request_data_in_env_and_stdin() {
        let mut ctx = context(
            r#"printf '%s|%s|%s|' "$CODEACTIONS_RUN_ID" "$CODEACTIONS_PARAMS" "$CODEACTIONS_BODY"; cat"#,
        );
        ctx.params.insert("name".into(), json!("ana"));
        ctx.body = "payload".into();

        let out = shell_interpreter().run_code(&ctx).await.unwrap();
        assert_eq!(out, r#"run-1|{"name":"ana"}|payload|payload"#);
    }

    #[tokio::test]
    async fn test_stderr_fails() {
        let err = shell_interpreter()
            .run_code(&context("echo boom >&2"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let err = shell_interpreter()
            .run_code(&context("exit 3"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("status 3"));
    }

    #[tokio::test]
    async fn test_timeout_kills() {
        let mut ctx = context("sleep 5");
        ctx.timeout = Duration::from_millis(200);
        let err = shell_interpreter().run_code(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let mut ctx = context("fmt.Println(1)");
        ctx.language = Language::Go;
        let err = tokio_test::assert_err!(shell_interpreter().run_code(&ctx).await);
        assert!(err.to_string().contains("unsupported language"));
    }
}

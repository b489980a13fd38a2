//! Execution orchestrator
//!
//! Admission, dispatch and lifecycle of a single invocation:
//!
//! 1. the code is looked up,
//! 2. the rate limiter is asked for admission (no run exists if denied),
//! 3. a `queued` run is persisted,
//! 4. a task is submitted to the worker pool; the worker moves the run
//!    through `started` into `completed` or `failed`, writing a log entry at
//!    each step.
//!
//! Execution failures are captured in the run, never returned as `Err`.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::code::{Code, CodeService, CodeType};
use crate::codelog::{CodeLogService, LogType};
use crate::coderun::{CodeRun, CodeRunService};
use crate::error::{Error, Result};
use crate::interpreter::{ExecutionContext, Interpreter};
use crate::ratelimiter::RateLimiter;
use crate::telemetry;
use crate::workerpool::{Task, WorkerPool};

/// Request data handed to the snippet.
#[derive(Debug, Clone, Default)]
pub struct InvocationRequest {
    pub params: Map<String, Value>,
    pub body: String,
    pub headers: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// Wait for the run to finish, bounded by the code timeout
    Sync,
    /// Return as soon as the run is queued
    Async,
}

#[derive(Debug)]
pub enum Invocation {
    /// Terminal run, from a sync invocation
    Completed(CodeRun),
    /// Queued run, from an async invocation
    Accepted(CodeRun),
}

impl Invocation {
    pub fn run(&self) -> &CodeRun {
        match self {
            Self::Completed(run) | Self::Accepted(run) => run,
        }
    }
}

#[derive(Clone)]
pub struct CodeRunner {
    codes: CodeService,
    runs: CodeRunService,
    logs: CodeLogService,
    limiter: Arc<RateLimiter>,
    pool: Arc<WorkerPool>,
    interpreter: Arc<dyn Interpreter>,
}

impl CodeRunner {
    pub fn new(
        codes: CodeService,
        runs: CodeRunService,
        logs: CodeLogService,
        limiter: Arc<RateLimiter>,
        pool: Arc<WorkerPool>,
        interpreter: Arc<dyn Interpreter>,
    ) -> Self {
        Self {
            codes,
            runs,
            logs,
            limiter,
            pool,
            interpreter,
        }
    }

    pub async fn invoke(
        &self,
        code_id: &str,
        request: InvocationRequest,
        mode: InvocationMode,
    ) -> Result<Invocation> {
        let code = self.lookup(code_id).await?;
        self.dispatch(code, request, mode).await
    }

    /// [`invoke`](Self::invoke) restricted to codes published as endpoints.
    /// Flow codes are reported as not found.
    ///
    /// Every request that reaches an endpoint is counted and timed per
    /// project and code, whatever its outcome.
    pub async fn invoke_endpoint(
        &self,
        code_id: &str,
        request: InvocationRequest,
        mode: InvocationMode,
    ) -> Result<Invocation> {
        let started = Instant::now();
        let code = self.lookup(code_id).await?;
        if code.code_type != CodeType::Endpoint {
            return Err(Error::not_found(format!("endpoint {}", code_id)));
        }

        let (project_uuid, id) = (code.project_uuid.clone(), code.id.clone());
        let outcome = self.dispatch(code, request, mode).await;
        telemetry::run_finished(&project_uuid, &id, started.elapsed());
        outcome
    }

    async fn lookup(&self, code_id: &str) -> Result<Code> {
        if code_id.trim().is_empty() {
            return Err(Error::validation("valid code_id is required"));
        }
        self.codes.get_by_id(code_id).await
    }

    async fn dispatch(
        &self,
        code: Code,
        request: InvocationRequest,
        mode: InvocationMode,
    ) -> Result<Invocation> {
        if !self.limiter.allow(&code.id).await {
            warn!(code_id = %code.id, "rate limit exceeded");
            return Err(Error::RateLimited(code.id));
        }

        let mut run = CodeRun::new(&code.id);
        run.params = request.params.clone();
        run.body = request.body.clone();
        run.headers = request.headers.clone();
        let run = self.runs.create(run).await?;

        let ctx = ExecutionContext {
            run_id: run.id.clone(),
            code_id: code.id.clone(),
            language: code.language,
            source: code.source.clone(),
            params: request.params,
            body: request.body,
            headers: request.headers,
            timeout: code.timeout(),
        };

        let runs = self.runs.clone();
        let logs = self.logs.clone();
        let interpreter = self.interpreter.clone();
        let queued = run.clone();
        let token = CancellationToken::new();
        let (task, result) = Task::new(token.clone(), move |_| {
            execute(runs, logs, interpreter, queued, ctx)
        });

        if let Err(e) = self.pool.submit(task) {
            if let Err(cleanup) = self.runs.delete(&run.id).await {
                error!(run_id = %run.id, error = %cleanup, "failed to delete rejected run");
            }
            return Err(e.into());
        }

        debug!(run_id = %run.id, code_id = %code.id, ?mode, "run queued");

        match mode {
            InvocationMode::Async => Ok(Invocation::Accepted(run)),
            InvocationMode::Sync => {
                // once the caller stops waiting, a task still in the queue is dropped
                let _abandon = token.drop_guard();
                match tokio::time::timeout(code.timeout(), result).await {
                    Ok(Ok(outcome)) => outcome.map(Invocation::Completed),
                    Ok(Err(_)) => Err(Error::Other(format!(
                        "worker dropped the result of run {}",
                        run.id
                    ))),
                    Err(_) => Err(Error::Timeout(run.id)),
                }
            }
        }
    }
}

/// Worker side of one invocation.
async fn execute(
    runs: CodeRunService,
    logs: CodeLogService,
    interpreter: Arc<dyn Interpreter>,
    mut run: CodeRun,
    ctx: ExecutionContext,
) -> Result<CodeRun> {
    run.start()?;
    let mut run = runs.update(&run).await?;
    logs.emit(&run.id, &run.code_id, LogType::Info, "started").await?;

    let outcome = match tokio::time::timeout(ctx.timeout, interpreter.run_code(&ctx)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(anyhow::anyhow!(
            "process took too long (limit {}s)",
            ctx.timeout.as_secs()
        )),
    };

    match outcome {
        Ok(output) => {
            logs.emit(&run.id, &run.code_id, LogType::Info, "completed")
                .await?;
            run.complete(output)?;
            run.extra.insert("status_code".into(), Value::from(200));
            info!(run_id = %run.id, code_id = %run.code_id, "run completed");
        }
        Err(e) => {
            let message = format!("error on executing code: {:#}", e);
            logs.emit(&run.id, &run.code_id, LogType::Error, message.as_str())
                .await?;
            run.fail(message)?;
            run.extra.insert("status_code".into(), Value::from(500));
            warn!(run_id = %run.id, code_id = %run.code_id, error = %e, "run failed");
        }
    }

    runs.update(&run).await
}

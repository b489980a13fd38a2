mod code;
mod codelog;
mod coderun;
mod coderunner;
mod config;
mod db;
mod error;
mod health;
mod http;
mod ids;
mod interpreter;
mod ratelimiter;
mod redis_manager;
mod storage;
mod sweeper;
mod telemetry;
mod workerpool;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::code::CodeRepository;
use crate::codelog::CodeLogRepository;
use crate::coderun::CodeRunRepository;
use crate::config::{CodeLogBackend, Config, DbBackend};
use crate::health::{HealthChecker, MongoCheck, PostgresCheck, ServiceCheck};
use crate::redis_manager::{keys, RedisManager};
use crate::sweeper::{LocalLock, RetentionSweeper, SweepLock};

struct Repositories {
    codes: Arc<dyn CodeRepository>,
    runs: Arc<dyn CodeRunRepository>,
    logs: Arc<dyn CodeLogRepository>,
    services: Vec<Arc<dyn ServiceCheck>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("codeactions=info".parse()?),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        environment = %config.environment,
        db_backend = ?config.db.backend,
        codelog_backend = ?config.codelog_backend,
        "Starting Code Actions..."
    );

    let metrics = telemetry::install()?;

    let redis = match &config.redis_url {
        Some(url) => Some(RedisManager::connect(url).await?),
        None => {
            warn!("No Redis configured; rate limiting and sweeper locks are process-local");
            None
        }
    };

    let mut repos = connect_repositories(&config).await?;
    if let Some(redis) = &redis {
        repos.services.push(Arc::new(redis.clone()));
    }
    let health = Arc::new(HealthChecker::new(std::mem::take(&mut repos.services)));
    let codes = code::CodeService::new(repos.codes);
    let runs = coderun::CodeRunService::new(repos.runs);
    let logs = codelog::CodeLogService::new(repos.logs);

    let window_store: Box<dyn ratelimiter::WindowStore> = match &redis {
        Some(redis) => Box::new(ratelimiter::RedisWindowStore::new(redis.connection())),
        None => Box::new(ratelimiter::MemoryWindowStore::new()),
    };
    let limiter = Arc::new(ratelimiter::RateLimiter::new(window_store, &config.rate_limiter));

    let pool = Arc::new(workerpool::WorkerPool::new(
        config.worker_pool.workers,
        config.worker_pool.queue_capacity,
    ));

    let languages = interpreter::languages::LanguageTable::builtin()?;
    let interpreter = Arc::new(interpreter::ProcessInterpreter::new(languages));

    let runner = coderunner::CodeRunner::new(
        codes.clone(),
        runs.clone(),
        logs.clone(),
        limiter,
        pool.clone(),
        interpreter,
    );

    let lock: Box<dyn SweepLock> = match &redis {
        Some(redis) => Box::new(redis.clone()),
        None => Box::new(LocalLock),
    };
    let mut sweepers: Vec<(JoinHandle<()>, Arc<Notify>)> = Vec::new();
    sweepers.extend(
        RetentionSweeper::new(
            Arc::new(runs.clone()),
            config.cleaner.clone(),
            keys::CODERUN_CLEANER_LOCK,
        )
        .start(lock.as_ref())
        .await,
    );
    sweepers.extend(
        RetentionSweeper::new(
            Arc::new(logs.clone()),
            config.cleaner.clone(),
            keys::CODELOG_CLEANER_LOCK,
        )
        .start(lock.as_ref())
        .await,
    );

    let router = http::build_router(http::AppState {
        codes,
        runs,
        logs,
        runner,
        pool: pool.clone(),
        health,
        metrics,
    });

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.http_addr))?;
    info!("Listening on {}", config.http_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await
        .context("HTTP server failed")?;

    for (handle, shutdown) in sweepers {
        shutdown.notify_one();
        let _ = handle.await;
    }

    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.shutdown().await,
        Err(_) => warn!("Worker pool still referenced, not draining queue"),
    }

    info!("Code Actions stopped");
    Ok(())
}

async fn connect_repositories(config: &Config) -> Result<Repositories> {
    let mut repos = match config.db.backend {
        DbBackend::MongoDb => {
            let db = db::connect_mongo(&config.db).await?;
            Repositories {
                codes: Arc::new(code::mongo::MongoCodeRepository::new(&db)),
                runs: Arc::new(coderun::mongo::MongoCodeRunRepository::new(&db)),
                logs: Arc::new(codelog::mongo::MongoCodeLogRepository::new(&db)),
                services: vec![Arc::new(MongoCheck(db)) as Arc<dyn ServiceCheck>],
            }
        }
        DbBackend::Postgres => {
            let pool = db::connect_postgres(&config.db).await?;
            Repositories {
                codes: Arc::new(code::pg::PgCodeRepository::new(pool.clone())),
                runs: Arc::new(coderun::pg::PgCodeRunRepository::new(pool.clone())),
                logs: Arc::new(codelog::pg::PgCodeLogRepository::new(pool.clone())),
                services: vec![Arc::new(PostgresCheck(pool)) as Arc<dyn ServiceCheck>],
            }
        }
        DbBackend::Memory => {
            warn!("Using in-memory storage; nothing survives a restart");
            Repositories {
                codes: Arc::new(code::memory::MemoryCodeRepository::new()),
                runs: Arc::new(coderun::memory::MemoryCodeRunRepository::new()),
                logs: Arc::new(codelog::memory::MemoryCodeLogRepository::new()),
                services: Vec::new(),
            }
        }
    };

    if config.codelog_backend == CodeLogBackend::S3 {
        let client = storage::StorageClient::new(&config.s3);
        let bucket = client.bucket().to_string();
        info!(bucket = %bucket, prefix = %config.s3.prefix, "Writing code logs to S3");
        repos.logs = Arc::new(codelog::s3::S3CodeLogRepository::new(
            Arc::new(client),
            bucket,
            config.s3.prefix.clone(),
        ));
    }

    Ok(repos)
}

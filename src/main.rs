mod config;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use quota_throttler::{BoxError, Params, RequestExecutor, ThrottleError, Throttler};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{BurstConfig, Config};

/// Executor that never leaves the process: it echoes the call back
struct DryRunExecutor;

#[async_trait]
impl RequestExecutor<Value> for DryRunExecutor {
    async fn invoke(&self, action: &str, params: &Params) -> Result<Value, BoxError> {
        Ok(json!({
            "action": action,
            "params": params,
            "dry_run": true,
        }))
    }
}

#[derive(Debug, Default)]
struct Tally {
    admitted: usize,
    cancelled: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration from environment variables and CLI arguments
    let config = Config::from_env_and_args()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("quota_throttler={}", config.log_level).parse()?),
        )
        .init();

    let Config {
        limits,
        priorities,
        blocking,
        burst,
        ..
    } = config;

    match limits.get(&burst.action) {
        Some(limit) => tracing::info!(
            "{}: quota_max {}, one request restored every {}s",
            burst.action,
            limit.quota_max,
            limit.restore_rate
        ),
        None => tracing::warn!("{} has no quota limit, calls are unmetered", burst.action),
    }

    let throttler = Arc::new(
        Throttler::<Value>::builder()
            .limits(limits)
            .priorities(priorities)
            .blocking(blocking)
            .executor(DryRunExecutor)
            .build()?,
    );

    // Ctrl-C abandons every call still waiting for quota
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, cancelling waiting calls");
                cancel.cancel();
            }
        });
    }

    let start = Instant::now();
    let next_call = Arc::new(AtomicUsize::new(0));
    let mut callers = JoinSet::new();

    for _ in 0..burst.concurrency {
        let throttler = Arc::clone(&throttler);
        let cancel = cancel.clone();
        let next_call = Arc::clone(&next_call);
        let burst = burst.clone();

        callers.spawn(async move {
            replay(&throttler, &burst, &next_call, &cancel, start).await
        });
    }

    let mut tally = Tally::default();
    while let Some(result) = callers.join_next().await {
        match result {
            Ok(Ok(caller)) => {
                tally.admitted += caller.admitted;
                tally.cancelled += caller.cancelled;
            }
            Ok(Err(e)) => {
                tracing::error!("Caller failed: {}", e);
                return Err(e.into());
            }
            Err(e) => {
                tracing::error!("Caller panicked: {}", e);
                return Err(anyhow!("Caller panicked"));
            }
        }
    }

    println!();
    println!(
        "{} admitted, {} cancelled in {:.2}s",
        tally.admitted,
        tally.cancelled,
        start.elapsed().as_secs_f64()
    );
    if let Some(level) = throttler.level(&burst.action) {
        println!(
            "{} level {}, next call at tier {} waits {:.2}s",
            burst.action,
            level,
            burst.priority,
            throttler
                .wait(&burst.action, burst.priority)
                .as_secs_f64()
        );
    }

    Ok(())
}

/// Issues calls until the burst is used up
async fn replay(
    throttler: &Throttler<Value>,
    burst: &BurstConfig,
    next_call: &AtomicUsize,
    cancel: &CancellationToken,
    start: Instant,
) -> Result<Tally, ThrottleError> {
    let mut tally = Tally::default();

    loop {
        let call = next_call.fetch_add(1, Ordering::Relaxed);
        if call >= burst.calls {
            return Ok(tally);
        }

        let mut params = Params::new();
        params.insert("Call".to_string(), call.to_string());

        let wait = throttler.wait(&burst.action, burst.priority);
        let result = throttler
            .admit_with_cancel(&burst.action, &params, burst.priority, cancel)
            .await;
        let at = start.elapsed().as_secs_f64();

        match result {
            Ok(response) => {
                tally.admitted += 1;
                let response = response.map(|r| r.to_string()).unwrap_or_default();
                if throttler.is_blocking() || wait.is_zero() {
                    println!("[{at:>8.2}s] call {call:>3} admitted {response}");
                } else {
                    println!(
                        "[{at:>8.2}s] call {call:>3} over quota, should have waited {:.2}s {response}",
                        wait.as_secs_f64()
                    );
                }
            }
            Err(ThrottleError::Cancelled { .. }) => {
                tally.cancelled += 1;
                println!("[{at:>8.2}s] call {call:>3} cancelled");
            }
            Err(e) => return Err(e),
        }
    }
}

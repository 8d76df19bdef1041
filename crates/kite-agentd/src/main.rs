use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kite_agentd::{AgentConfig, JobRunner};
use kite_model::{Job, SignalReason};
use kite_observe::logger_init;
use kite_stream::HttpControlPlane;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env()?;
    logger_init(&cfg.logger)?;

    let path = std::env::args()
        .nth(1)
        .context("usage: kite-agentd <job.json>")?;
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let job: Job = serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    info!(target: "kite.agent", job_id = %job.id, endpoint = %cfg.endpoint, "loaded job");

    let api = Arc::new(
        HttpControlPlane::new(&cfg.endpoint, &cfg.token)?.with_agent_name(&cfg.agent_name),
    );
    let shutdown = CancellationToken::new();
    let runner = JobRunner::new(job, cfg, api, shutdown.clone());

    // First Ctrl-C stops the agent gracefully, the next ones force the job down.
    tokio::spawn({
        let runner = Arc::clone(&runner);
        async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if shutdown.is_cancelled() {
                    warn!(target: "kite.agent", "forcing job to stop");
                    runner.cancel(SignalReason::AgentStop);
                } else {
                    info!(target: "kite.agent", "stopping agent");
                    shutdown.cancel();
                }
            }
        }
    });

    let finish = runner.run().await?;
    info!(
        target: "kite.agent",
        exit_status = finish.exit_status,
        signal = finish.signal.as_deref().unwrap_or(""),
        "agent done"
    );
    Ok(())
}

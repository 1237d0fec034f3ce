//! Simulated batch run: ten fake test cases, three at a time, with live
//! progress printed from a subscriber stream.

use async_trait::async_trait;
use autotest::batch::{
    AgentRunner, BatchOptions, BatchOrchestrator, JobId, MemoryBatchStore, Outcome, RunRequest,
};
use autotest::config::OrchestratorConfig;
use autotest::credentials::{CredentialPool, PoolConfig, ProviderConfig, ProviderKind};
use autotest::registry::{ResourceHandle, TaskRegistry};
use autotest::stream::{ChannelSink, ProgressBroadcaster, ServerMessage};
use autotest::{metrics, telemetry};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Pretends to drive a browser: sleeps, then fails every fourth job
struct SimulatedRunner;

#[async_trait]
impl AgentRunner for SimulatedRunner {
    async fn run(
        &self,
        request: RunRequest,
        _resource: Arc<dyn ResourceHandle>,
        cancel: CancellationToken,
    ) -> Outcome {
        let work = Duration::from_millis(100 + 40 * request.job_id.0);
        tokio::select! {
            _ = cancel.cancelled() => Outcome::cancelled(),
            _ = tokio::time::sleep(work) => {
                if request.job_id.0 % 4 == 0 {
                    Outcome::failed("assertion failed: login button not found")
                        .with_duration(work.as_secs_f64())
                } else {
                    Outcome::passed(work.as_secs_f64()).with_summary(format!(
                        "job {} passed on {}",
                        request.job_id, request.credential.provider_id
                    ))
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("autotest=info");
    println!("🚀 Autotest - Simulated Batch\n");

    let pool = CredentialPool::new(PoolConfig::new(vec![
        ProviderConfig::new(
            "deepseek",
            ProviderKind::DeepSeek,
            vec!["sk-demo-aaaa1111".to_string(), "sk-demo-bbbb2222".to_string()],
            2,
        ),
        ProviderConfig::new(
            "openai",
            ProviderKind::OpenAi,
            vec!["sk-demo-cccc3333".to_string()],
            2,
        ),
    ]))?;

    let config = OrchestratorConfig::new()
        .with_max_concurrent(3)
        .with_credential_retry(3, Duration::from_millis(400))
        .with_broadcast_send_timeout(Duration::from_secs(2));
    let broadcaster = Arc::new(ProgressBroadcaster::from_config(&config));
    let orchestrator = BatchOrchestrator::new(
        Arc::new(MemoryBatchStore::new()),
        Arc::new(TaskRegistry::new()),
        Arc::new(pool),
        broadcaster.clone(),
        Arc::new(SimulatedRunner),
    )
    .with_config(config);

    let jobs: Vec<JobId> = (1..=10).map(JobId).collect();
    let batch_id = orchestrator
        .create_batch(&jobs, BatchOptions::named("simulated smoke run"))
        .await?;

    let (sink, mut updates) = ChannelSink::new(64);
    broadcaster.subscribe(batch_id, Arc::new(sink));
    let printer = tokio::spawn(async move {
        while let Some(message) = updates.next().await {
            if let ServerMessage::BatchExecutionUpdate { data, .. } = message {
                let done = data.counts.success_count
                    + data.counts.failed_count
                    + data.counts.cancelled_count;
                println!(
                    "  [{}] {}/{} done, {} running, {} failed",
                    data.status,
                    done,
                    data.counts.total_count,
                    data.counts.running_count,
                    data.counts.failed_count,
                );
                if data.status.is_terminal() {
                    break;
                }
            }
        }
    });

    let snapshot = orchestrator.start_batch(batch_id).await?;
    printer.await?;

    println!("\n✅ Batch {} finished: {}", batch_id, snapshot.status);
    println!("  success:   {}", snapshot.counts.success_count);
    println!("  failed:    {}", snapshot.counts.failed_count);
    println!("  cancelled: {}", snapshot.counts.cancelled_count);
    println!("  duration:  {:.2}s", snapshot.total_duration);

    for item in orchestrator.list_items(batch_id).await? {
        println!(
            "  job {:>2}: {:<9} {}",
            item.job_id,
            item.status,
            item.error_message.as_deref().unwrap_or(""),
        );
    }

    println!("\n📊 Metrics:\n{}", metrics::export_metrics().map_err(|e| anyhow::anyhow!(e))?);
    Ok(())
}

//! Wires the GitLab client, collectors, scheduler, store, and HTTP server
//! into a single orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collectors::{
    self, CodeReviewCollector, Collector, ContributorsCollector, DoraCollector,
    EnvironmentsCollector, JobsCollector, MergeRequestsCollector, PipelinesCollector,
    RepositoryCollector, TestReportsCollector, ValueStreamCollector,
};
use crate::config::Config;
use crate::error::{ExporterError, Result};
use crate::gitlab::{GitLabClient, TierDetector};
use crate::metrics::OperationalMetrics;
use crate::resolver::resolve_projects;
use crate::scheduler::{Scheduler, Task, TaskFn, TaskQueue, TaskQueueWorker};
use crate::server::webhook::{WebhookEvent, WebhookKind, WebhookState};
use crate::server::Server;
use crate::store::{MemoryStore, RedisStore, Store};

/// Maximum time to wait for in-flight HTTP requests during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Fallback collector interval when the configured value is unusable.
const DEFAULT_INTERVAL_SECONDS: u64 = 30;

/// Buffer size of the webhook refresh-hint queue.
const HINT_QUEUE_SIZE: usize = 64;

/// The main application orchestrator.
pub struct Exporter {
    scheduler: Scheduler,
    server: Server,
    store: Arc<dyn Store>,
    queue_worker: Option<TaskQueueWorker>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter").finish_non_exhaustive()
    }
}

impl Exporter {
    /// Creates and initialises the exporter:
    ///  1. Creates the GitLab client.
    ///  2. Creates the store (redis if configured, otherwise in-memory).
    ///  3. Runs tier detection (fatal on connectivity failure).
    ///  4. Resolves projects (fatal when the set is empty).
    ///  5. Creates and registers collectors plus their scheduler tasks.
    ///  6. Creates the HTTP server.
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let metrics = OperationalMetrics::new();

        let client = Arc::new(GitLabClient::new(&config.gitlab, Some(metrics.api.clone()))?);

        let store: Arc<dyn Store> = if config.redis.url.is_empty() {
            info!("using in-memory store");
            Arc::new(MemoryStore::new())
        } else {
            let redis = RedisStore::new(&config.redis.url).await?;
            info!("using redis store");
            Arc::new(redis)
        };

        let features = TierDetector::new(client.as_ref()).detect(&cancel).await?;
        metrics.gitlab_tier.set(features.tier.as_i64());
        client.set_features(features.clone());

        let projects = resolve_projects(client.as_ref(), config.as_ref(), &cancel).await?;
        metrics.projects_tracked.set(projects.len() as i64);
        info!(count = projects.len(), "projects discovered");

        // Tier-gated collectors combine config enablement with the detected
        // capability; they stay registered either way so describe output is
        // stable.
        let mut dora_cfg = config.collectors.dora.clone();
        dora_cfg.enabled = effective_enabled(dora_cfg.enabled, Some(features.has_dora));
        let mut value_stream_cfg = config.collectors.value_stream.clone();
        value_stream_cfg.enabled =
            effective_enabled(value_stream_cfg.enabled, Some(features.has_value_stream));
        let mut code_review_cfg = config.collectors.code_review.clone();
        code_review_cfg.enabled =
            effective_enabled(code_review_cfg.enabled, Some(features.has_code_review));

        let pipelines = Arc::new(PipelinesCollector::new(
            client.clone(),
            config.collectors.pipelines.clone(),
            store.clone(),
            projects.clone(),
        ));
        let merge_requests = Arc::new(MergeRequestsCollector::new(
            client.clone(),
            config.collectors.merge_requests.clone(),
            store.clone(),
            projects.clone(),
        ));

        let defs: Vec<(u64, Arc<dyn Collector>)> = vec![
            (
                config.collectors.pipelines.interval_seconds,
                pipelines.clone(),
            ),
            (
                config.collectors.jobs.interval_seconds,
                Arc::new(JobsCollector::new(
                    client.clone(),
                    config.collectors.jobs.clone(),
                    projects.clone(),
                )),
            ),
            (
                config.collectors.merge_requests.interval_seconds,
                merge_requests.clone(),
            ),
            (
                config.collectors.environments.interval_seconds,
                Arc::new(EnvironmentsCollector::new(
                    client.clone(),
                    config.collectors.environments.clone(),
                    projects.clone(),
                )),
            ),
            (
                config.collectors.test_reports.interval_seconds,
                Arc::new(TestReportsCollector::new(
                    client.clone(),
                    config.collectors.test_reports.clone(),
                    projects.clone(),
                )),
            ),
            (
                config.collectors.dora.interval_seconds,
                Arc::new(DoraCollector::new(client.clone(), dora_cfg, projects.clone())),
            ),
            (
                config.collectors.value_stream.interval_seconds,
                Arc::new(ValueStreamCollector::new(
                    client.clone(),
                    value_stream_cfg,
                    projects.clone(),
                )),
            ),
            (
                config.collectors.code_review.interval_seconds,
                Arc::new(CodeReviewCollector::new(
                    client.clone(),
                    code_review_cfg,
                    projects.clone(),
                )),
            ),
            (
                config.collectors.repository.interval_seconds,
                Arc::new(RepositoryCollector::new(
                    client.clone(),
                    config.collectors.repository.clone(),
                    projects.clone(),
                )),
            ),
            (
                config.collectors.contributors.interval_seconds,
                Arc::new(ContributorsCollector::new(
                    client.clone(),
                    config.collectors.contributors.clone(),
                    projects.clone(),
                )),
            ),
        ];

        let mut registry = collectors::Registry::new();
        let mut scheduler = Scheduler::new();

        for (interval_seconds, collector) in defs {
            let name = collector.name();
            metrics
                .collector_enabled
                .with_label_values(&[name])
                .set(i64::from(collector.enabled()));
            registry.register(collector.clone());

            if !collector.enabled() {
                info!(collector = name, "collector disabled, not scheduling");
                continue;
            }

            let interval = if interval_seconds == 0 {
                DEFAULT_INTERVAL_SECONDS
            } else {
                interval_seconds
            };

            let run_collector = collector.clone();
            let run_fn: TaskFn = Arc::new(move |cancel| {
                let collector = run_collector.clone();
                Box::pin(async move { collector.run(&cancel).await })
            });
            scheduler.add_task(Task::new(name, Duration::from_secs(interval), run_fn));

            info!(collector = name, interval_seconds = interval, "collector scheduled");
        }

        let prom = Arc::new(prometheus::Registry::new());
        metrics.register_on(prom.as_ref())?;
        prom.register(Box::new(registry))
            .map_err(|e| ExporterError::Config(format!("registering collectors: {e}")))?;

        #[cfg(target_os = "linux")]
        {
            use prometheus::process_collector::ProcessCollector;
            if let Err(err) = prom.register(Box::new(ProcessCollector::for_self())) {
                warn!(error = %err, "failed to register process collector");
            }
        }

        let (webhook_state, queue_worker) = if config.server.webhook.enabled {
            let (queue, worker) = TaskQueue::new(HINT_QUEUE_SIZE);
            let hint_cancel = cancel.child_token();
            let hint_pipelines = pipelines.clone();
            let hint_merge_requests = merge_requests.clone();

            let on_event = Arc::new(move |event: WebhookEvent| {
                let collector: Arc<dyn Collector> = match event.kind {
                    WebhookKind::Pipeline => hint_pipelines.clone(),
                    WebhookKind::MergeRequest => hint_merge_requests.clone(),
                };
                info!(
                    project = %event.project,
                    collector = collector.name(),
                    "webhook refresh hint"
                );
                let token = hint_cancel.clone();
                queue.enqueue(Box::pin(async move {
                    if let Err(err) = collector.run(&token).await {
                        warn!(error = %err, "webhook-triggered refresh failed");
                    }
                }));
            });

            (
                Some(WebhookState {
                    secret_token: config.server.webhook.secret_token.clone(),
                    on_event,
                }),
                Some(worker),
            )
        } else {
            (None, None)
        };

        let server = Server::new(config, prom, webhook_state);

        Ok(Self {
            scheduler,
            server,
            store,
            queue_worker,
            cancel,
        })
    }

    /// Starts the scheduler and HTTP server, marks readiness, and blocks
    /// until an OS signal arrives. Then performs the graceful shutdown
    /// sequence: readiness off, server stop, scheduler stop, store close.
    pub async fn run(&mut self) -> Result<()> {
        self.scheduler.start(&self.cancel);
        self.server.start().await?;

        let queue_handle: Option<JoinHandle<()>> = self.queue_worker.take().map(|worker| {
            let token = self.cancel.child_token();
            tokio::spawn(worker.run(token))
        });

        self.server.set_ready(true);
        info!("exporter is ready");

        wait_for_shutdown(&self.cancel).await;
        info!("shutting down exporter");

        self.server.set_ready(false);
        self.server.stop(SHUTDOWN_GRACE).await;
        self.scheduler.stop().await;

        self.cancel.cancel();
        if let Some(handle) = queue_handle {
            let _ = handle.await;
        }

        if let Err(err) = self.store.close().await {
            error!(error = %err, "error closing store");
        }

        info!("exporter stopped");
        Ok(())
    }
}

/// A collector is effectively enabled when its configuration enables it and
/// its capability gate (if any) allows it.
fn effective_enabled(config_enabled: bool, capability: Option<bool>) -> bool {
    config_enabled && capability.unwrap_or(true)
}

async fn wait_for_shutdown(cancel: &CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received interrupt"),
                    _ = cancel.cancelled() => {}
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received interrupt"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = cancel.cancelled() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = cancel.cancelled() => {}
    }
}

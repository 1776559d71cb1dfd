//! Background delivery services: worker pool, recovery sweeper and, when an
//! Insight Source is configured, the poller. Used by the notifier binary and
//! by the API when workers run embedded.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use herald_common::config::AppConfig;
use herald_engine::Pipeline;
use herald_engine::source::InsightPoller;

use crate::channel::ChannelClient;
use crate::worker::WorkerPool;

pub struct DeliveryRuntime {
    shutdown: watch::Sender<bool>,
    pool: WorkerPool,
    tasks: Vec<JoinHandle<()>>,
}

impl DeliveryRuntime {
    pub fn start(
        pipeline: &Pipeline,
        client: Arc<dyn ChannelClient>,
        config: &AppConfig,
    ) -> anyhow::Result<Self> {
        let (shutdown, rx) = watch::channel(false);
        let pool = WorkerPool::spawn(pipeline, client, config, &rx);
        let mut tasks = Vec::new();

        let sweeper = pipeline.sweeper(config);
        let sweeper_rx = rx.clone();
        tasks.push(tokio::spawn(async move { sweeper.run(sweeper_rx).await }));

        let ingress = Arc::new(pipeline.ingress(config));
        if let Some(poller) = InsightPoller::from_config(&config.source, ingress)? {
            let poller_rx = rx.clone();
            tasks.push(tokio::spawn(async move { poller.run(poller_rx).await }));
        }

        Ok(Self {
            shutdown,
            pool,
            tasks,
        })
    }

    /// Signal every task to stop and wait for in-flight sends to finish.
    pub async fn shutdown(self) {
        // Every receiver is owned by a task, so a send error only means they
        // have all exited already.
        let _ = self.shutdown.send(true);
        self.pool.join().await;
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
        tracing::info!("Delivery runtime stopped");
    }
}

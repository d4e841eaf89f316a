use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::config::RegistryConfig;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let reconciler_task = self.spawn_reconciler_task(app);
        self.tasks.push(reconciler_task);

        let pod_watcher_task = self.spawn_pod_watcher_task(app);
        self.tasks.push(pod_watcher_task);

        let registry_watcher_task = self.spawn_registry_watcher_task(app);
        self.tasks.push(registry_watcher_task);

        if let Some(config_watcher_task) = self.spawn_config_watcher_task(app) {
            self.tasks.push(config_watcher_task);
        }

        let api_server_task = self.spawn_api_server_task(app);
        self.tasks.push(api_server_task);

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_reconciler_task(&self, app: &Application) -> JoinHandle<()> {
        let reconciler = app.services().reconciler.clone();
        let workers = RegistryConfig::from(app.server_args()).reconcile_workers;
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting pod reconciler task with {workers} workers");
            reconciler.run(workers, token).await;
            tracing::info!("Pod reconciler task completed");
        })
    }

    fn spawn_pod_watcher_task(&self, app: &Application) -> JoinHandle<()> {
        let pod_watcher = app.services().pod_watcher.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting Kubernetes pod watcher task");
            if let Err(e) = pod_watcher.run(token).await {
                tracing::error!("Kubernetes pod watcher failed: {e:?}");
            } else {
                tracing::info!("Kubernetes pod watcher completed");
            }
        })
    }

    fn spawn_registry_watcher_task(&self, app: &Application) -> JoinHandle<()> {
        let registry_watcher = app.services().registry_watcher.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting registry ConfigMap watcher task");
            if let Err(e) = registry_watcher.run(token).await {
                tracing::error!("Registry ConfigMap watcher failed: {e:?}");
            } else {
                tracing::info!("Registry ConfigMap watcher completed");
            }
        })
    }

    fn spawn_config_watcher_task(&self, app: &Application) -> Option<JoinHandle<()>> {
        let config_watcher = app.services().config_watcher.clone()?;
        let token = self.cancellation_token.clone();

        Some(tokio::spawn(async move {
            tracing::info!("Starting ConfigMap watcher task");
            if let Err(e) = config_watcher.run(token).await {
                tracing::error!("ConfigMap watcher failed: {e:?}");
            } else {
                tracing::info!("ConfigMap watcher completed");
            }
        }))
    }

    fn spawn_api_server_task(&self, app: &Application) -> JoinHandle<()> {
        let api_server = app.services().api_server.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            if let Err(e) = api_server.run(token).await {
                tracing::error!("API server failed: {e:?}");
            } else {
                tracing::info!("API server completed");
            }
        })
    }
}

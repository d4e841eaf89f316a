use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::ServerArgs;

/// Application core structure with explicit dependencies
pub struct Application {
    services: ApplicationServices,
    server_args: ServerArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, server_args: ServerArgs) -> Self {
        Self {
            services,
            server_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn server_args(&self) -> &ServerArgs {
        &self.server_args
    }

    /// Restores persisted registrations, then runs every task until shutdown.
    pub async fn run(&self) -> Result<()> {
        let summary = self
            .services
            .registration
            .init_from_config_map()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to recover custom registrations: {e:?}"))?;
        tracing::info!(
            "Recovered {} custom registrations, dropped {} stale entries",
            summary.restored,
            summary.removed
        );

        tracing::info!("Starting all application tasks...");
        let mut tasks = Tasks::new();

        if let Err(e) = tasks.spawn_all_tasks(self) {
            tracing::error!("Failed to spawn application tasks: {}", e);
            return Err(e);
        }

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {}", e);
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }
}

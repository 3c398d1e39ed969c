//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::controller::{AgentController, Collaborators};
use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::StopFlag;
use crate::deploy::docker::DockerLifecycle;
use crate::deploy::policy::VersionSource;
use crate::errors::AgentError;
use crate::http::backend::{Backend, BackendClient};
use crate::http::client::HttpClient;
use crate::http::registry::{BackendVersionSource, RegistryVersionSource};
use crate::mqtt::client::MqttClient;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::storage::settings::UpdateSource;
use crate::telemetry::{SystemMonitor, Thresholds};
use crate::workers::commands::{self, MqttStatusPublisher};
use crate::workers::scheduler;

/// Run the agent until a shutdown signal arrives or a `restart` command
/// requests a stop
pub async fn run(
    agent_version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing IoT agent...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());
    let stop = Arc::new(StopFlag::new());

    if let Err(e) = init(
        agent_version,
        &options,
        stop.clone(),
        shutdown_tx.clone(),
        &mut shutdown_manager,
    )
    .await
    {
        error!("Failed to start agent: {}", e);
        stop.request();
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    tokio::select! {
        _ = shutdown_signal => {
            info!("Shutdown signal received, shutting down...");
        }
        _ = stop.wait() => {
            info!("Stop requested, shutting down...");
        }
    }

    // The scheduler watches the stop flag, the other workers the broadcast
    stop.request();
    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

/// Backend client for the configured device
pub fn backend_client(options: &AppOptions) -> Result<BackendClient, AgentError> {
    let http = HttpClient::new(
        &options.identity.backend_url,
        options.backend.timeout,
        options.backend.retry,
    )?;
    Ok(BackendClient::new(
        http,
        &options.identity.device_name,
        options.identity.device_id,
    ))
}

/// Where the latest tag comes from
pub fn version_source(
    options: &AppOptions,
    backend: Arc<dyn Backend>,
) -> Result<Arc<dyn VersionSource>, AgentError> {
    let source: Arc<dyn VersionSource> = match options.update.source {
        UpdateSource::Registry => Arc::new(RegistryVersionSource::new(
            &options.update.registry_url,
            options.update.lookup_timeout,
        )?),
        UpdateSource::Backend => Arc::new(BackendVersionSource::new(backend)),
    };
    Ok(source)
}

// =============================== INITIALIZATION ================================== //

async fn init(
    agent_version: String,
    options: &AppOptions,
    stop: Arc<StopFlag>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), AgentError> {
    let controller = init_controller(agent_version, options, stop)?;

    init_scheduler(options.scheduler.clone(), controller.clone(), shutdown_manager)?;

    if options.enable_commands {
        // The broker being down at startup is not fatal; the agent still
        // updates on schedule
        if let Err(e) = init_command_workers(
            options.commands.clone(),
            controller.clone(),
            shutdown_manager,
            &shutdown_tx,
        ) {
            error!("Command channel disabled: {}", e);
        }
    }

    if options.enable_server {
        init_server(options, controller, shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(())
}

fn init_controller(
    agent_version: String,
    options: &AppOptions,
    stop: Arc<StopFlag>,
) -> Result<Arc<AgentController>, AgentError> {
    let backend: Arc<dyn Backend> = Arc::new(backend_client(options)?);
    let versions = version_source(options, backend.clone())?;
    let lifecycle = Arc::new(DockerLifecycle::new(options.docker.clone(), &options.identity));
    let health = Arc::new(SystemMonitor::new(Thresholds::default()));

    info!(
        "Managing container {} ({}), versions from {:?}",
        options.identity.container_name, options.identity.image, options.update.source
    );

    Ok(Arc::new(AgentController::new(
        options.identity.clone(),
        agent_version,
        Collaborators {
            lifecycle,
            backend,
            health,
            versions,
        },
        options.orchestrator.clone(),
        stop,
    )))
}

fn init_scheduler(
    options: scheduler::Options,
    controller: Arc<AgentController>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), AgentError> {
    info!("Initializing scheduler...");

    let handle = tokio::spawn(async move {
        scheduler::run(&options, controller.as_ref(), tokio::time::sleep).await;
    });

    shutdown_manager.with_scheduler_handle(handle)
}

fn init_command_workers(
    options: commands::Options,
    controller: Arc<AgentController>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<(), AgentError> {
    info!("Initializing command workers...");

    let client = MqttClient::new(
        &options.broker_address,
        &options.client_id,
        options.credentials.as_ref(),
    )?;
    let publisher = MqttStatusPublisher::new(client.publisher(), &options.status_topic);
    let (outbox, inbox) = mpsc::channel(options.channel_capacity);

    let mut transport_shutdown_rx = shutdown_tx.subscribe();
    let transport_handle = tokio::spawn(async move {
        commands::run_transport(
            &options,
            client,
            outbox,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = transport_shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    let mut consumer_shutdown_rx = shutdown_tx.subscribe();
    let consumer_handle = tokio::spawn(async move {
        commands::run_consumer(
            controller.as_ref(),
            &publisher,
            inbox,
            Box::pin(async move {
                let _ = consumer_shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_command_handles(transport_handle, consumer_handle)
}

async fn init_server(
    options: &AppOptions,
    controller: Arc<AgentController>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    info!("Initializing local HTTP server...");

    let server_handle = serve(
        &options.server,
        Arc::new(ServerState::new(controller)),
        async move {
            let _ = shutdown_rx.recv().await;
        },
    )
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    scheduler_handle: Option<JoinHandle<()>>,
    transport_handle: Option<JoinHandle<()>>,
    consumer_handle: Option<JoinHandle<()>>,
    server_handle: Option<JoinHandle<Result<(), AgentError>>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            scheduler_handle: None,
            transport_handle: None,
            consumer_handle: None,
            server_handle: None,
        }
    }

    pub fn with_scheduler_handle(&mut self, handle: JoinHandle<()>) -> Result<(), AgentError> {
        if self.scheduler_handle.is_some() {
            return Err(AgentError::ShutdownError("scheduler_handle already set".to_string()));
        }
        self.scheduler_handle = Some(handle);
        Ok(())
    }

    pub fn with_command_handles(
        &mut self,
        transport: JoinHandle<()>,
        consumer: JoinHandle<()>,
    ) -> Result<(), AgentError> {
        if self.transport_handle.is_some() || self.consumer_handle.is_some() {
            return Err(AgentError::ShutdownError("command handles already set".to_string()));
        }
        self.transport_handle = Some(transport);
        self.consumer_handle = Some(consumer);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), AgentError>>,
    ) -> Result<(), AgentError> {
        if self.server_handle.is_some() {
            return Err(AgentError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), AgentError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), AgentError> {
        info!("Shutting down IoT agent...");

        // 1. Command consumer (finishes any update it is running)
        if let Some(handle) = self.consumer_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))?;
        }

        // 2. Scheduler (finishes the current task)
        if let Some(handle) = self.scheduler_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))?;
        }

        // 3. MQTT transport
        if let Some(handle) = self.transport_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))?;
        }

        // 4. HTTP server
        if let Some(handle) = self.server_handle.take() {
            match handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))? {
                Ok(()) => {}
                Err(e) => warn!("HTTP server exited with error: {}", e),
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

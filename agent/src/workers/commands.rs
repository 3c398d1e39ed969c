//! Remote command channel
//!
//! Two tasks: the transport polls the MQTT event loop and forwards command
//! publishes over a channel, and the consumer decodes them and dispatches to
//! the controller.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::controller::AgentController;
use crate::errors::AgentError;
use crate::models::command::Command;
use crate::mqtt::client::{InboundMessage, MqttAddress, MqttClient, MqttCredentials, MqttEvent, MqttPublisher};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Announcement published on the status topic after the first connect
pub const ONLINE_MESSAGE: &str = "Agent is online and ready to receive commands";

/// Command worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// MQTT broker address
    pub broker_address: MqttAddress,

    pub credentials: Option<MqttCredentials>,

    pub client_id: String,

    pub command_topic: String,

    pub status_topic: String,

    /// Inbound messages buffered between transport and consumer
    pub channel_capacity: usize,

    /// Backoff after poll errors
    pub reconnect: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            broker_address: MqttAddress::default(),
            credentials: None,
            client_id: "iotagent-1".to_string(),
            command_topic: "agent/1/cmd".to_string(),
            status_topic: "agent/1/status".to_string(),
            channel_capacity: 32,
            reconnect: CooldownOptions {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
            },
        }
    }
}

/// Where replies to `status` go
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish_status(&self, payload: &str) -> Result<(), AgentError>;
}

/// Publishes replies on the MQTT status topic
pub struct MqttStatusPublisher {
    publisher: MqttPublisher,
    topic: String,
}

impl MqttStatusPublisher {
    pub fn new(publisher: MqttPublisher, topic: &str) -> Self {
        Self {
            publisher,
            topic: topic.to_string(),
        }
    }
}

#[async_trait]
impl StatusPublisher for MqttStatusPublisher {
    async fn publish_status(&self, payload: &str) -> Result<(), AgentError> {
        self.publisher
            .publish(&self.topic, payload.as_bytes().to_vec())
            .await
    }
}

/// Run the transport until shutdown. Poll errors back off and never end the
/// worker.
pub async fn run_transport<S, F>(
    options: &Options,
    mut client: MqttClient,
    outbox: mpsc::Sender<InboundMessage>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!(
        "Command transport starting, broker {}:{}",
        options.broker_address.host, options.broker_address.port
    );

    let publisher = client.publisher();
    let mut failures: u32 = 0;
    let mut announced = false;

    loop {
        let event = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Command transport shutting down...");
                if let Err(e) = client.disconnect().await {
                    debug!("MQTT disconnect failed: {}", e);
                }
                return;
            }
            event = client.poll() => event,
        };

        match event {
            Ok(MqttEvent::Connected) => {
                failures = 0;
                // Sessions are clean, so every (re)connect needs a fresh subscription
                if let Err(e) = client.subscribe(&options.command_topic).await {
                    error!("Failed to subscribe to {}: {}", options.command_topic, e);
                }
                if !announced {
                    match publisher
                        .publish(&options.status_topic, ONLINE_MESSAGE.as_bytes().to_vec())
                        .await
                    {
                        Ok(()) => announced = true,
                        Err(e) => warn!("Failed to publish online message: {}", e),
                    }
                }
            }
            Ok(MqttEvent::Message(message)) => {
                if message.topic != options.command_topic {
                    debug!("Ignoring message on topic: {}", message.topic);
                    continue;
                }
                if outbox.send(message).await.is_err() {
                    warn!("Command consumer is gone, stopping transport");
                    return;
                }
            }
            Ok(MqttEvent::Other) => {}
            Err(e) => {
                let delay = calc_exp_backoff(&options.reconnect, failures);
                failures = failures.saturating_add(1);
                warn!("MQTT connection error: {}, retrying in {:?}", e, delay);
                tokio::select! {
                    _ = &mut shutdown_signal => {
                        info!("Command transport shutting down...");
                        return;
                    }
                    _ = sleep_fn(delay) => {}
                }
            }
        }
    }
}

/// Consume commands until shutdown or until the transport goes away
pub async fn run_consumer<P>(
    controller: &AgentController,
    publisher: &P,
    mut inbox: mpsc::Receiver<InboundMessage>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    P: StatusPublisher + ?Sized,
{
    info!("Command consumer starting...");

    loop {
        let message = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Command consumer shutting down...");
                return;
            }
            message = inbox.recv() => message,
        };

        match message {
            Some(message) => handle_message(controller, publisher, &message).await,
            None => {
                info!("Command channel closed, consumer exiting");
                return;
            }
        }
    }
}

/// Decode and dispatch a single inbound message
pub async fn handle_message<P>(controller: &AgentController, publisher: &P, message: &InboundMessage)
where
    P: StatusPublisher + ?Sized,
{
    let payload = message.text();
    info!("Received command: {} on topic: {}", payload.trim(), message.topic);

    let command = Command::parse(&payload);
    if let Some(reply) = controller.handle_command(command).await {
        if let Err(e) = publisher.publish_status(&reply).await {
            error!("Failed to publish status reply: {}", e);
        }
    }
}

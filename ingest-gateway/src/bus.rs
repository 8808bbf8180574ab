//! Message-bus consumer.
//!
//! Devices publish over MQTT. Two transports reach that traffic:
//!
//! * `mqtt`: a plain MQTT client with a unique client id, subscribed at
//!   QoS 1 to every configured topic pattern.
//! * `amqp`: a RabbitMQ broker whose MQTT plugin republishes every message
//!   onto a topic exchange, with `/` in the topic turned into `.` in the
//!   routing key. An exclusive, auto-delete queue is bound per pattern.
//!   The plugin maps `.` in a topic to `/`, so topics that contain dots
//!   do not survive this transport; use `mqtt` for those.
//!
//! Either way every message goes to the [`IngestGateway`]. Connection loss
//! is never fatal: the consumer reconnects with exponential backoff and
//! subscribes again each time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BusSettings, BusTransport, MqttSettings};
use crate::error::GatewayError;
use crate::gateway::{IngestGateway, IngestOutcome, RawMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
}

/// MQTT subscription pattern -> AMQP topic binding key.
pub fn binding_key(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|seg| if seg == "+" { "*" } else { seg })
        .collect::<Vec<_>>()
        .join(".")
}

/// AMQP routing key -> MQTT topic.
pub fn topic_from_routing_key(key: &str) -> String {
    key.replace('.', "/")
}

/// Unique per process so a second instance never kicks the first off the
/// broker. Doubles as the MQTT client id.
pub fn connection_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("wastewatcher-ingest-{}", &id[..8])
}

pub fn mqtt_options(settings: &MqttSettings, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
    options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    options.set_clean_session(settings.clean_session);
    if let Some(username) = &settings.username {
        options.set_credentials(username.clone(), settings.password.clone().unwrap_or_default());
    }
    options
}

// ------------------------------------------------------------------ //
//  Backoff                                                            //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the delay to wait now and doubles the next one, capped.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ------------------------------------------------------------------ //
//  Consumer                                                           //
// ------------------------------------------------------------------ //

pub struct BusConsumer {
    settings: BusSettings,
    gateway: Arc<IngestGateway>,
    connection_name: String,
    state_tx: watch::Sender<ConnectionState>,
}

impl BusConsumer {
    pub fn new(settings: BusSettings, gateway: Arc<IngestGateway>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            settings,
            gateway,
            connection_name: connection_name(),
            state_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Runs until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(
            Duration::from_secs(self.settings.reconnect_initial_secs),
            Duration::from_secs(self.settings.reconnect_max_secs),
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let session = async {
                match self.settings.transport {
                    BusTransport::Mqtt => self.consume_mqtt(&mut backoff).await,
                    BusTransport::Amqp => self.consume_amqp(&mut backoff).await,
                }
            };
            let result = tokio::select! {
                r = session => r,
                _ = shutdown.changed() => break,
            };
            self.set_state(ConnectionState::Disconnected);

            match result {
                Ok(()) => warn!("bus consumer stream ended"),
                Err(e) => warn!(error = %e, "bus connection lost"),
            }

            let delay = backoff.next_delay();
            info!(delay_secs = delay.as_secs(), "reconnecting to bus");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("bus consumer stopped");
    }

    async fn dispatch(&self, topic: String, body: Vec<u8>) {
        let msg = RawMessage {
            topic: topic.clone(),
            body,
            received_at: Utc::now(),
        };
        let outcome = self.gateway.handle_message(msg).await;
        if let IngestOutcome::Readings(ref r) = outcome {
            debug!(
                topic = %topic,
                readings = r.len(),
                processed = outcome.processed(),
                "message handled"
            );
        }
    }

    async fn consume_mqtt(&self, backoff: &mut Backoff) -> Result<(), GatewayError> {
        let mqtt = &self.settings.mqtt;
        let (client, mut eventloop) = AsyncClient::new(
            mqtt_options(mqtt, &self.connection_name),
            mqtt.channel_capacity,
        );

        let timeout = self.settings.connect_timeout();
        tokio::time::timeout(timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| GatewayError::ConnectTimeout(timeout))??;
        info!(
            client_id = %self.connection_name,
            host = %mqtt.host,
            port = mqtt.port,
            "connected to MQTT broker"
        );

        for pattern in &self.settings.topics {
            client.subscribe(pattern.as_str(), QoS::AtLeastOnce).await?;
            info!(pattern = %pattern, "subscribed");
        }

        self.set_state(ConnectionState::Subscribed);
        backoff.reset();

        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::Publish(p)) => {
                    self.dispatch(p.topic.clone(), p.payload.to_vec()).await;
                }
                Event::Incoming(Packet::Disconnect) => {
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    async fn consume_amqp(&self, backoff: &mut Backoff) -> Result<(), GatewayError> {
        let amqp = &self.settings.amqp;
        let timeout = self.settings.connect_timeout();
        let props = ConnectionProperties::default()
            .with_connection_name(self.connection_name.clone().into());
        let conn = tokio::time::timeout(timeout, Connection::connect(&amqp.url, props))
            .await
            .map_err(|_| GatewayError::ConnectTimeout(timeout))??;
        info!(connection_name = %self.connection_name, "connected to AMQP broker");

        let channel = conn.create_channel().await?;
        channel.basic_qos(amqp.prefetch, BasicQosOptions::default()).await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        for pattern in &self.settings.topics {
            let key = binding_key(pattern);
            channel
                .queue_bind(
                    queue.name().as_str(),
                    &amqp.exchange,
                    &key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            info!(pattern = %pattern, binding_key = %key, "subscribed");
        }

        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                &self.connection_name,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        self.set_state(ConnectionState::Subscribed);
        backoff.reset();

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery?;
            let topic = topic_from_routing_key(delivery.routing_key.as_str());
            self.dispatch(topic.clone(), delivery.data.clone()).await;

            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                warn!(error = %e, topic = %topic, "ack failed");
            }
        }

        Ok(())
    }
}

/// Drives the event loop until the broker accepts the session. A refused
/// connection surfaces as an error from `poll`.
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), GatewayError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

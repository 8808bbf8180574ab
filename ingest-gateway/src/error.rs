use std::time::Duration;

use thiserror::Error;

use crate::codec::DecodeError;

/// Failures of the persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("persist queue closed")]
    PersistClosed,
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("MQTT connection error: {0}")]
    Mqtt(#[from] rumqttc::ConnectionError),
    #[error("MQTT client error: {0}")]
    MqttClient(#[from] rumqttc::ClientError),
    #[error("bus connect timed out after {0:?}")]
    ConnectTimeout(Duration),
}

//! MQTT broker sink.

use std::fmt::{self, Debug, Formatter};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use paho_mqtt::async_client::AsyncClient as MqttClient;
use paho_mqtt::{ConnectOptions, ConnectOptionsBuilder, MessageBuilder as MqttMessageBuilder};
use rand::Rng;

use crate::config::{BrokerConfig, BrokerTopics};
use crate::connection::{ConnectionMonitor, ConnectionState};
use crate::observation::{format_reading, Observation};
use crate::sink::{Outcome, Sink, SinkError};

/// Bounds of the automatic reconnect back-off.
const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// A long-lived connection to the broker.
pub trait BrokerLink: Send {
    fn is_connected(&self) -> bool;

    /// Ask for a new connection without waiting for it.
    fn request_reconnect(&self);

    /// Publish one message at QoS 0, not retained.
    fn publish(&self, topic: &str, payload: &str) -> Result<(), Error>;

    fn close(&mut self);
}

/// [`BrokerLink`] over the paho MQTT client.
///
/// paho runs the network I/O, keep-alive and reconnects on its own thread;
/// its callbacks only update the [`ConnectionMonitor`].
pub struct PahoLink {
    client: MqttClient,
    client_id: String,
    connect_options: ConnectOptions,
    monitor: ConnectionMonitor,
    connect_timeout: Duration,
    publish_timeout: Duration,
    gate: ReconnectGate,
}

impl PahoLink {
    pub fn new(config: &BrokerConfig, monitor: ConnectionMonitor) -> Result<PahoLink, Error> {
        let client_id = random_client_id(&config.client_id_prefix);
        let client = MqttClient::new(
            paho_mqtt::CreateOptionsBuilder::new()
                .server_uri(config.server_uri())
                .client_id(client_id.as_str())
                .finalize(),
        )?;

        let connect_options = ConnectOptionsBuilder::new()
            .keep_alive_interval(config.keep_alive)
            .clean_session(true)
            .automatic_reconnect(RECONNECT_MIN, RECONNECT_MAX)
            .finalize();

        let on_connected = monitor.clone();
        let server_uri = config.server_uri();
        client.set_connected_callback(move |_| {
            on_connected.set(ConnectionState::Connected);
            tracing::info!(%server_uri, "connected to the MQTT broker");
        });

        let on_lost = monitor.clone();
        client.set_connection_lost_callback(move |_| {
            on_lost.set(ConnectionState::Reconnecting);
            tracing::warn!("unexpected disconnect, will auto-reconnect");
        });

        Ok(PahoLink {
            client,
            client_id,
            connect_options,
            monitor,
            connect_timeout: config.connect_timeout,
            publish_timeout: config.publish_timeout,
            gate: ReconnectGate::new(config.connect_timeout),
        })
    }

    /// Connect to the MQTT broker.
    ///
    /// A failure here is not fatal: the link stays `Disconnected` and the
    /// sink asks for a reconnect the next time it finds it down.
    #[tracing::instrument(skip(self), fields(client_id = %self.client_id), err)]
    pub async fn connect(&self) -> Result<(), Error> {
        tracing::info!("connect to the MQTT broker");
        self.monitor.set(ConnectionState::Connecting);

        let token = self.client.connect(self.connect_options.clone());
        let connection_info = match tokio::time::timeout(self.connect_timeout, token).await {
            Ok(result) => result,
            Err(_) => {
                self.monitor.set(ConnectionState::Disconnected);
                self.gate.record(Instant::now());
                return Err(Error::ConnectTimeout(self.connect_timeout));
            }
        };

        match connection_info {
            Ok(info) => {
                self.monitor.set(ConnectionState::Connected);
                tracing::info!(info = ?info, "connected to the MQTT broker");
                Ok(())
            }
            Err(e) => {
                self.monitor.set(ConnectionState::Disconnected);
                self.gate.record(Instant::now());
                tracing::error!(error = ?e, "failed to connect to the MQTT broker");
                Err(e.into())
            }
        }
    }
}

impl BrokerLink for PahoLink {
    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    fn request_reconnect(&self) {
        let state = self.monitor.state();
        if self.gate.try_begin(state, Instant::now()) {
            if state == ConnectionState::Connecting {
                tracing::warn!("previous connect attempt did not complete");
            }
            tracing::info!("requesting a reconnect");
            self.monitor.set(ConnectionState::Connecting);
            drop(self.client.reconnect());
        }
    }

    fn publish(&self, topic: &str, payload: &str) -> Result<(), Error> {
        if !self.client.is_connected() {
            return Err(Error::NotConnected);
        }

        let message = MqttMessageBuilder::new()
            .topic(topic)
            .payload(payload)
            .qos(0)
            .retained(false)
            .finalize();

        tracing::debug!(topic, payload, "publishing");
        self.client.publish(message).wait_for(self.publish_timeout)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(client_id = %self.client_id))]
    fn close(&mut self) {
        let was = self.monitor.set(ConnectionState::Closed);
        if was == ConnectionState::Closed {
            return;
        }

        // Also stops paho's background reconnect loop when the link is down.
        match self.client.disconnect(None).wait_for(self.connect_timeout) {
            Ok(_) => tracing::info!("disconnected from the MQTT broker"),
            Err(e) => tracing::debug!(error = %e, previous = %was, "disconnect returned an error"),
        }
    }
}

impl Debug for PahoLink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PahoLink")
            .field("client_id", &self.client_id)
            .field("state", &self.monitor.state())
            .finish()
    }
}

/// Decides when a link that is down gets another manual connect attempt.
///
/// paho only retries on its own after a connection that once succeeded, and
/// a failed manual reconnect reports nothing back. So a link that is not
/// connected, and not being retried by paho, is retried again once `min_gap`
/// has passed since the last attempt, whatever the outcome of that attempt.
#[derive(Debug)]
pub struct ReconnectGate {
    min_gap: Duration,
    last_attempt: Mutex<Option<Instant>>,
}

impl ReconnectGate {
    pub fn new(min_gap: Duration) -> Self {
        ReconnectGate {
            min_gap,
            last_attempt: Mutex::new(None),
        }
    }

    /// Note a failed attempt made outside the gate.
    pub fn record(&self, at: Instant) {
        *self.last_attempt.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    /// Whether to start a reconnect at `now`. Records the attempt when it is.
    pub fn try_begin(&self, state: ConnectionState, now: Instant) -> bool {
        match state {
            ConnectionState::Connected | ConnectionState::Reconnecting | ConnectionState::Closed => {
                false
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                let mut last = self.last_attempt.lock().unwrap_or_else(PoisonError::into_inner);
                let due = last.map_or(true, |at| now.saturating_duration_since(at) >= self.min_gap);
                if due {
                    *last = Some(now);
                }
                due
            }
        }
    }
}

/// `<prefix>-NNNN` with a fresh four digit suffix.
pub fn random_client_id(prefix: &str) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(1000..=9999);
    format!("{prefix}-{suffix}")
}

/// Publishes every observation field to its own topic.
pub struct BrokerSink<L> {
    link: L,
    topics: BrokerTopics,
}

impl<L: BrokerLink> BrokerSink<L> {
    pub fn new(link: L, config: &BrokerConfig) -> Self {
        BrokerSink {
            link,
            topics: config.topics.clone(),
        }
    }

    /// Topic and payload of the five messages of one observation.
    pub fn messages(&self, observation: &Observation) -> [(&str, String); 5] {
        [
            (self.topics.temperature.as_str(), format_reading(observation.temperature)),
            (self.topics.humidity.as_str(), format_reading(observation.humidity)),
            (self.topics.insolation.as_str(), format_reading(observation.insolation)),
            (self.topics.rain.as_str(), observation.rain.to_string()),
            (self.topics.alert.as_str(), observation.alert.to_string()),
        ]
    }

    fn deliver(&self, observation: &Observation) -> Result<(), SinkError> {
        if !self.link.is_connected() {
            tracing::warn!("broker link is down");
            self.link.request_reconnect();
            return Err(SinkError::Disconnected);
        }

        let messages = self.messages(observation);
        let total = messages.len();
        let mut delivered = 0;
        let mut last_error = None;

        for (topic, payload) in &messages {
            match self.link.publish(topic, payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(topic, error = %e, "publish failed");
                    last_error = Some(e);
                }
            }
        }

        match (delivered, last_error) {
            (_, None) => {
                tracing::info!(topics = total, "all topics published");
                Ok(())
            }
            (0, Some(e)) => Err(e.into()),
            (_, Some(_)) => Err(SinkError::PartialDelivery { delivered, total }),
        }
    }
}

impl<L: BrokerLink> Sink for BrokerSink<L> {
    fn name(&self) -> &str {
        "mqtt"
    }

    #[tracing::instrument(name = "mqtt_publish", skip_all)]
    fn publish(&mut self, observation: &Observation) -> Outcome {
        self.deliver(observation).into()
    }

    fn close(&mut self) {
        self.link.close();
    }
}

impl<L: Debug> Debug for BrokerSink<L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSink")
            .field("link", &self.link)
            .field("topics", &self.topics)
            .finish()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("mqtt: {0}")]
    Mqtt(#[from] paho_mqtt::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("not connected to the broker")]
    NotConnected,
}

impl From<Error> for SinkError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotConnected => SinkError::Disconnected,
            Error::ConnectTimeout(_) => SinkError::NetworkTimeout,
            Error::Mqtt(e) => SinkError::Internal(e.to_string()),
        }
    }
}

//! ThingSpeak channel update.

use std::fmt::{self, Debug, Formatter};

use serde::Serialize;

use crate::config::TelemetryConfig;
use crate::http::{HttpClient, HttpRequest};
use crate::observation::{format_reading, Observation};
use crate::sink::{truncate_body, Outcome, Sink, SinkError};

/// Body of a ThingSpeak `update.json` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryPayload {
    pub api_key: String,
    pub field1: String,
    pub field2: String,
    pub field3: String,
}

impl TelemetryPayload {
    pub fn new(api_key: &str, observation: &Observation) -> Self {
        TelemetryPayload {
            api_key: api_key.to_string(),
            field1: format_reading(observation.temperature),
            field2: format_reading(observation.humidity),
            field3: format_reading(observation.insolation),
        }
    }
}

/// Posts temperature, humidity and insolation to a ThingSpeak channel.
pub struct TelemetrySink<C> {
    client: C,
    config: TelemetryConfig,
}

impl<C: HttpClient> TelemetrySink<C> {
    pub fn new(client: C, config: &TelemetryConfig) -> Self {
        TelemetrySink {
            client,
            config: config.clone(),
        }
    }

    fn request_for(&self, observation: &Observation) -> Result<HttpRequest, SinkError> {
        let payload = TelemetryPayload::new(&self.config.write_api_key, observation);
        let body = serde_json::to_string(&payload).map_err(|e| SinkError::Internal(e.to_string()))?;

        Ok(HttpRequest::post_json(
            self.config.endpoint.as_str(),
            body,
            self.config.timeout,
        ))
    }

    fn deliver(&self, observation: &Observation) -> Result<(), SinkError> {
        let request = self.request_for(observation)?;
        let response = self.client.send(&request)?;

        if response.is_ok() {
            tracing::info!("channel updated");
            Ok(())
        } else {
            tracing::warn!(status = response.status, body = %response.body, "update rejected");
            Err(SinkError::ServerRejected {
                status: response.status,
                body: truncate_body(&response.body),
            })
        }
    }
}

impl<C: HttpClient> Sink for TelemetrySink<C> {
    fn name(&self) -> &str {
        "thingspeak"
    }

    #[tracing::instrument(name = "thingspeak_publish", skip_all)]
    fn publish(&mut self, observation: &Observation) -> Outcome {
        self.deliver(observation).into()
    }
}

impl<C> Debug for TelemetrySink<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetrySink")
            .field("config", &self.config)
            .finish()
    }
}

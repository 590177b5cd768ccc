//! Blynk dashboard, one virtual pin per observation field.

use std::fmt::{self, Debug, Formatter};

use crate::config::DashboardConfig;
use crate::http::{HttpClient, HttpRequest};
use crate::observation::{format_reading, Observation};
use crate::sink::{truncate_body, Outcome, Sink, SinkError};

/// What the startup connection check learned about the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// The check has not run yet.
    Unknown,
    Available,
    Unavailable,
}

/// Writes every observation field to its own Blynk virtual pin.
pub struct DashboardSink<C> {
    client: C,
    config: DashboardConfig,
    availability: Availability,
}

impl<C: HttpClient> DashboardSink<C> {
    pub fn new(client: C, config: &DashboardConfig) -> Self {
        DashboardSink {
            client,
            config: config.clone(),
            availability: Availability::Unknown,
        }
    }

    pub fn availability(&self) -> Availability {
        self.availability
    }

    /// Check the API once by reading back the first pin.
    ///
    /// When the check fails, every later [`Sink::publish`] is skipped
    /// without touching the network.
    #[tracing::instrument(name = "blynk_check", skip(self))]
    pub fn test_connection(&mut self) -> bool {
        let request = HttpRequest::get(
            format!("{}/get", self.config.base_url),
            self.config.check_timeout,
        )
        .query("token", self.config.auth_token.as_str())
        .query(self.config.pins.temperature.as_str(), "");

        let available = match self.client.send(&request) {
            Ok(response) => match response.status {
                200 => {
                    tracing::info!("dashboard reachable");
                    true
                }
                400 => {
                    tracing::warn!("token accepted but the request parameters were rejected");
                    false
                }
                401 => {
                    tracing::error!("token invalid or expired");
                    false
                }
                status => {
                    tracing::error!(status, "dashboard check failed");
                    false
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "dashboard check failed");
                false
            }
        };

        self.availability = if available {
            Availability::Available
        } else {
            Availability::Unavailable
        };
        available
    }

    /// Pin and value of each channel, in pin order.
    pub fn channels(&self, observation: &Observation) -> [(String, String); 5] {
        let pins = &self.config.pins;
        [
            (pins.temperature.clone(), format_reading(observation.temperature)),
            (pins.humidity.clone(), format_reading(observation.humidity)),
            (pins.insolation.clone(), format_reading(observation.insolation)),
            (pins.rain.clone(), observation.rain.as_flag().to_string()),
            (pins.alert.clone(), observation.alert.as_flag().to_string()),
        ]
    }

    /// Update one pin; logs and returns whether it took.
    fn update_channel(&self, pin: &str, value: &str) -> Result<(), SinkError> {
        let request = HttpRequest::get(
            format!("{}/update", self.config.base_url),
            self.config.timeout,
        )
        .query("token", self.config.auth_token.as_str())
        .query(pin, value)
        .header("User-Agent", self.config.user_agent.as_str())
        .header("Accept", "application/json");

        let response = self.client.send(&request).map_err(|e| {
            tracing::warn!(pin, value, error = %e, "pin update failed");
            SinkError::from(e)
        })?;

        if response.is_ok() {
            tracing::debug!(pin, value, "pin updated");
            Ok(())
        } else {
            let body = truncate_body(&response.body);
            tracing::warn!(pin, value, status = response.status, %body, "pin update rejected");
            Err(SinkError::ServerRejected {
                status: response.status,
                body,
            })
        }
    }

    fn deliver(&self, observation: &Observation) -> Result<(), SinkError> {
        let channels = self.channels(observation);
        let total = channels.len();

        let mut delivered = 0;
        let mut last_error = None;
        for (pin, value) in &channels {
            match self.update_channel(pin, value) {
                Ok(()) => delivered += 1,
                Err(e) => last_error = Some(e),
            }
        }

        match (delivered, last_error) {
            (_, None) => {
                tracing::info!(delivered, total, "all pins updated");
                Ok(())
            }
            // Nothing went through; report the cause instead of a count.
            (0, Some(e)) => Err(e),
            (_, Some(_)) => {
                tracing::warn!(delivered, total, "partial update");
                Err(SinkError::PartialDelivery { delivered, total })
            }
        }
    }
}

impl<C: HttpClient> Sink for DashboardSink<C> {
    fn name(&self) -> &str {
        "blynk"
    }

    #[tracing::instrument(name = "blynk_publish", skip_all)]
    fn publish(&mut self, observation: &Observation) -> Outcome {
        if self.availability == Availability::Unavailable {
            tracing::info!("dashboard unavailable, skipping");
            return Outcome::Skipped;
        }

        self.deliver(observation).into()
    }
}

impl<C> Debug for DashboardSink<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DashboardSink")
            .field("config", &self.config)
            .field("availability", &self.availability)
            .finish()
    }
}

use std::time::Duration;

use anyhow::Context;
use tokio::sync::oneshot;

use weather_station_sim::config::{mask_secret, StationConfig};
use weather_station_sim::connection::ConnectionMonitor;
use weather_station_sim::driver::{CycleDriver, TerminationReason};
use weather_station_sim::http::UreqClient;
use weather_station_sim::logging::{self, LogFormat};
use weather_station_sim::observation::ReadingGenerator;
use weather_station_sim::sinks::{BrokerSink, DashboardSink, PahoLink, TelemetrySink};

fn main() -> anyhow::Result<()> {
    logging::init(LogFormat::from_env()?, "info")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let result = runtime.block_on(run());
    // A sink call left behind at shutdown must not keep the process alive.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run() -> anyhow::Result<()> {
    let config = StationConfig::from_env().context("load station configuration")?;
    print_banner(&config);

    let monitor = ConnectionMonitor::default();
    let link = PahoLink::new(&config.broker, monitor.clone()).context("create MQTT client")?;
    if let Err(e) = link.connect().await {
        tracing::warn!(error = %e, "continuing without the broker for now");
    }

    let http = UreqClient::new();
    let mut dashboard = DashboardSink::new(http.clone(), &config.dashboard);
    if !tokio::task::block_in_place(|| dashboard.test_connection()) {
        tracing::warn!("continuing without the dashboard");
    }

    let mut driver = CycleDriver::new(ReadingGenerator::from_entropy(), config.cycle_interval)
        .with_sink(TelemetrySink::new(http, &config.telemetry))
        .with_sink(dashboard)
        .with_sink(BrokerSink::new(link, &config.broker))
        .with_broker_monitor(monitor);

    let reason = driver.run(shutdown_signal()).await;
    tracing::info!(%reason, "simulator finished");
    Ok(())
}

fn print_banner(config: &StationConfig) {
    tracing::info!("weather station simulator");
    tracing::info!(
        endpoint = %config.telemetry.endpoint,
        key = %mask_secret(&config.telemetry.write_api_key),
        "thingspeak"
    );
    tracing::info!(
        template = %config.dashboard.template_id,
        name = %config.dashboard.template_name,
        token = %mask_secret(&config.dashboard.auth_token),
        "blynk"
    );
    tracing::info!(broker = %config.broker.server_uri(), "mqtt");
    tracing::info!(interval = ?config.cycle_interval, "sending data every cycle");
}

/// Resolves on Ctrl+C or SIGTERM.
///
/// The handlers are installed right away on a separate task, so a signal that
/// arrives while a cycle is running is not lost.
fn shutdown_signal() -> impl std::future::Future<Output = TerminationReason> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let reason = match wait_for_signal().await {
            Ok(()) => TerminationReason::Interrupted,
            Err(e) => TerminationReason::Fault(format!("install signal handler: {e}")),
        };
        let _ = tx.send(reason);
    });

    async move {
        rx.await
            .unwrap_or_else(|_| TerminationReason::Fault("signal task ended".to_string()))
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

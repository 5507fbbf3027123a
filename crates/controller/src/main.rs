mod actuator;
mod button;
mod camera;
mod config;
mod convert;
mod indicator;
mod mqtt;
mod relay;
mod router;
mod sink;
mod telemetry;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, ConnectionError, Event, MqttOptions, Packet, QoS};
use std::{env, future::Future, pin::Pin, time::Duration};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::Actuator;
use button::ManualButton;
use indicator::StatusLed;
use relay::RelayPin;
use router::ControllerContext;
use telemetry::{SnapshotWorker, TelemetryPublisher};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal(mut sigterm: Signal) -> &'static str {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

/// Drive `work` unless `stop` resolves first.  `stop` is polled first, so a
/// pending shutdown always wins.
async fn until<S, W>(stop: Pin<&mut S>, work: W) -> Result<W::Output, S::Output>
where
    S: Future,
    W: Future,
{
    tokio::select! {
        biased;
        out = stop => Err(out),
        out = work => Ok(out),
    }
}

async fn handle_event(
    event: Result<Event, ConnectionError>,
    ctx: &mut ControllerContext,
    client: &AsyncClient,
    topic: &str,
    qos: QoS,
) {
    match event {
        Ok(Event::Incoming(Packet::Publish(p))) => {
            ctx.handle_message(&p.topic, &p.payload).await;
        }
        Ok(Event::Incoming(Packet::ConnAck(_))) => {
            // Re-subscribe on every (re)connect.
            match client.subscribe(topic, qos).await {
                Ok(()) => info!(topic, "mqtt connected, subscribed"),
                Err(e) => error!(topic, "mqtt subscribe failed: {e}"),
            }
        }
        Ok(Event::Incoming(Packet::Disconnect)) => {
            warn!("mqtt disconnected");
        }
        Ok(_) => {}
        Err(e) => {
            warn!("mqtt error: {e}. reconnecting...");
            sleep(RECONNECT_BACKOFF).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load_or_default(&config_path)?;
    if let Ok(host) = env::var("MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.mqtt.port = port;
    }

    // ── Drivers (any failure here is fatal) ─────────────────────────
    let relay = RelayPin::new(cfg.gpio.relay_pin, cfg.gpio.relay_active_low)
        .with_context(|| format!("failed to acquire relay on gpio {}", cfg.gpio.relay_pin))?;
    let led = StatusLed::new(&cfg.gpio).context("failed to acquire status led")?;

    let (manual_tx, mut manual_rx) = mpsc::channel(8);
    let button = ManualButton::new(
        cfg.gpio.button_pin,
        Duration::from_millis(cfg.gpio.button_debounce_ms),
        manual_tx,
    )
    .with_context(|| format!("failed to acquire button on gpio {}", cfg.gpio.button_pin))?;

    let actuator = Actuator::new(Box::new(relay), Box::new(led), cfg.control.burst_duration());

    // ── Telemetry ───────────────────────────────────────────────────
    let sink = sink::from_config(&cfg.sink)?;
    let camera = camera::from_config(&cfg.camera);
    let (snapshots, _worker) = SnapshotWorker::spawn(sink.clone(), camera, cfg.camera.queue_depth);
    let publisher = TelemetryPublisher::new(sink, cfg.control.cooldown_interval(), snapshots);

    let mut ctx = ControllerContext::new(&cfg, actuator, publisher);

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);
    let qos = mqtt::qos_from_level(cfg.mqtt.qos);

    let sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let shutdown = shutdown_signal(sigterm);
    tokio::pin!(shutdown);

    info!(
        broker = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        topic = %cfg.mqtt.topic,
        threshold = cfg.control.soil_on_threshold,
        "controller started"
    );

    loop {
        tokio::select! {
            biased;
            sig = &mut shutdown => {
                info!("{sig} received");
                break;
            }
            event = eventloop.poll() => {
                let work = handle_event(event, &mut ctx, &client, &cfg.mqtt.topic, qos);
                if let Err(sig) = until(shutdown.as_mut(), work).await {
                    info!("{sig} received");
                    break;
                }
            }
            Some(_press) = manual_rx.recv() => {
                ctx.handle_manual_trigger();
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    if ctx.actuator().is_energized() {
        info!("cutting running burst short");
    }
    ctx.actuator().shutdown();
    drop(button);
    info!("controller stopped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

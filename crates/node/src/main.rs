mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{FieldSim, Sample, Scenario};

const TOPIC_PREFIX: &str = "esp32/sensor";

/// `(payload key / topic suffix, value)` pairs for one tick, in the order the
/// board publishes them.
fn readings(s: &Sample) -> [(&'static str, Value); 4] {
    [
        ("temperature", Value::from(s.temperature)),
        ("humidity", Value::from(s.humidity)),
        ("soilMoisture", Value::from(s.soil_moisture)),
        ("waterLevel", Value::from(s.water_level)),
    ]
}

/// Single-key JSON object, e.g. `{"soilMoisture":2710}`.
fn payload(key: &str, value: Value) -> Result<Vec<u8>> {
    let mut obj = Map::new();
    obj.insert(key.to_string(), value);
    Ok(serde_json::to_vec(&Value::Object(obj))?)
}

fn topic(key: &str) -> String {
    format!("{TOPIC_PREFIX}/{key}")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "esp32".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let mut mqttoptions = MqttOptions::new(format!("irrigation-node-{node_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // Publish-only, but the event loop still has to be driven.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("node connected to mqtt"),
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(%node_id, %scenario, every_s = sample_every_s, "publishing to {TOPIC_PREFIX}/#");
    let mut sim = FieldSim::new(scenario);

    loop {
        let sample = sim.sample();
        for (key, value) in readings(&sample) {
            // The board skips failed DHT reads rather than sending NaN.
            if value.is_null() {
                warn!(key, "sensor read failed, skipping");
                continue;
            }
            let body = payload(key, value)?;
            if let Err(e) = client.publish(topic(key), QoS::AtLeastOnce, false, body).await {
                warn!(key, "publish error: {e}");
            }
        }
        debug!(?sample, "published");

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

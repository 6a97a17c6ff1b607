mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{Sample, Scenario, TankSim};

/// Telemetry message as the hub's MQTT intake expects it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryMsg<'a> {
    api_key: &'a str,
    water_level: f64,
    temperature: f64,
    vibration: bool,
    float_switches: Vec<bool>,
}

impl<'a> TelemetryMsg<'a> {
    fn new(api_key: &'a str, s: Sample) -> Self {
        Self {
            api_key,
            water_level: s.water_level,
            temperature: s.temperature,
            vibration: s.vibration,
            float_switches: s.float_switches,
        }
    }
}

fn reading_topic(label: &str) -> String {
    format!("tank/{label}/reading")
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let label = env::var("UNIT_LABEL").unwrap_or_else(|_| "tank-a".to_string());
    let api_key = env::var("UNIT_API_KEY").context("UNIT_API_KEY must be set")?;
    let sensors: usize = env_or("SENSORS", 4);
    let sample_every_s: u64 = env_or("SAMPLE_EVERY_S", 30);
    let diurnal_period_s: f64 = env_or("SIM_DAY_S", 86_400.0);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let client_id = format!("tank-node-{label}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // We only publish, but the event loop must run to keep the connection up.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("node connected to mqtt"),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error, retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = reading_topic(&label);
    let mut tank = TankSim::new(scenario, sensors, diurnal_period_s);
    info!(
        %topic,
        %scenario,
        sensors = tank.switch_count(),
        every_s = sample_every_s,
        "simulating tank"
    );

    loop {
        let sample = tank.sample();
        let msg = TelemetryMsg::new(&api_key, sample);
        let payload = serde_json::to_vec(&msg).context("failed to encode telemetry")?;

        match client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(()) => debug!(
                level = msg.water_level,
                temp = msg.temperature,
                vibration = msg.vibration,
                "published reading"
            ),
            Err(e) => warn!(error = %e, "publish failed"),
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! MQTT ingestion transport. Devices publish JSON telemetry to
//! `tank/<label>/reading` with their api key in the payload; each message
//! goes through the same ingestion path as the HTTP endpoint.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttSettings;
use crate::error::IngestError;
use crate::ingest::Ingestor;
use crate::model::UnitStatus;
use crate::payload;
use crate::state::SharedState;

pub const READING_FILTER: &str = "tank/+/reading";

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DISCONNECT_WAIT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract the device label from "tank/<label>/reading".
pub(crate) fn extract_unit_label(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tank" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Parse a device message and pull the credential out of it. Accepts
/// `apiKey` or `api_key`.
pub(crate) fn split_credentials(raw: &[u8]) -> Result<(Option<String>, Value), IngestError> {
    let mut value = payload::parse_body(raw)?;
    let key = value.as_object_mut().and_then(|obj| {
        let v = obj.remove("apiKey").or_else(|| obj.remove("api_key"))?;
        v.as_str().map(str::to_string)
    });
    Ok((key, value))
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Consume device telemetry until `cancel` fires. Broker errors are logged
/// and retried; they never stop the hub.
pub async fn run(
    settings: MqttSettings,
    ingestor: Arc<Ingestor>,
    shared: SharedState,
    cancel: CancellationToken,
) {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(options, 20);

    info!(
        host = %settings.host,
        port = settings.port,
        filter = READING_FILTER,
        "mqtt ingestion starting"
    );

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                handle_publish(&ingestor, &shared, &p.topic, &p.payload).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Subscriptions do not survive a clean-session reconnect.
                if let Err(e) = client.subscribe(READING_FILTER, QoS::AtLeastOnce).await {
                    warn!(error = %e, "mqtt subscribe failed");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error, reconnecting");
                {
                    let mut st = shared.write().await;
                    if st.mqtt_connected {
                        st.record_error(format!("mqtt error: {e}"));
                    }
                    st.mqtt_connected = false;
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    let connected = std::mem::replace(&mut shared.write().await.mqtt_connected, false);
    if connected {
        disconnect(&client, &mut eventloop).await;
    }
    info!("mqtt ingestion stopped");
}

/// Send DISCONNECT to the broker. The request only leaves once the event
/// loop is polled, so drive it until the packet is out or the wait expires.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        debug!(error = %e, "mqtt disconnect request not queued");
        return;
    }
    let flush = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "mqtt connection closed during disconnect");
                    break;
                }
            }
        }
    };
    if timeout(DISCONNECT_WAIT, flush).await.is_err() {
        debug!("mqtt disconnect not confirmed before timeout");
    }
}

async fn handle_publish(ingestor: &Ingestor, shared: &SharedState, topic: &str, raw: &[u8]) {
    let Some(label) = extract_unit_label(topic) else {
        debug!(topic, "mqtt: unhandled topic");
        return;
    };

    let result = match split_credentials(raw) {
        Ok((key, value)) => ingestor.submit(key.as_deref(), &value).await,
        Err(e) => Err(e),
    };

    let mut st = shared.write().await;
    match result {
        Ok(ack) => {
            if ack.came_online {
                st.record_presence(ack.unit_id, UnitStatus::Online);
            }
            st.record_reading(&ack.reading);
        }
        Err(e) => {
            warn!(label, kind = e.kind(), error = %e, "mqtt: telemetry rejected");
            st.record_rejected(format!("mqtt {label}: {}", e.public_message()));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

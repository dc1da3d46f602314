//! MQTT surface: command topics in, broadcasts out.
//!
//! Inbound: `<prefix>/cmd/{mode,light,toggle,telemetry,reboot,poweroff}`.
//! Outbound: every bus broadcast as JSON on `<prefix>/telemetry`, and the
//! confirmed light state (retained) on `<prefix>/light/state` whenever it
//! changes.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::control::{LightState, Mode};
use crate::events::Broadcast;
use crate::scheduler::Command;
use crate::state::{EventKind, SharedState};

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract the command name from "<prefix>/cmd/<name>".
pub(crate) fn extract_command<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let name = topic.strip_prefix(prefix)?.strip_prefix("/cmd/")?;
    if name.is_empty() || name.contains('/') {
        None
    } else {
        Some(name)
    }
}

/// Parse an "ON"/"OFF" payload (case-insensitive, trims whitespace).
pub(crate) fn parse_light_command(payload: &[u8]) -> Result<LightState, String> {
    String::from_utf8_lossy(payload).parse()
}

pub(crate) fn parse_mode_command(payload: &[u8]) -> Result<Mode, String> {
    String::from_utf8_lossy(payload).parse()
}

/// Turn one command topic + payload into a [`Command`]. Payloads of the
/// argument-less commands are ignored.
pub(crate) fn parse_command(name: &str, payload: &[u8]) -> Result<Command, String> {
    match name {
        "mode" => parse_mode_command(payload).map(Command::SetMode),
        "light" => parse_light_command(payload).map(Command::SetLight),
        "toggle" => Ok(Command::Toggle),
        "telemetry" => Ok(Command::RequestTelemetry),
        "reboot" => Ok(Command::Reboot),
        "poweroff" => Ok(Command::Poweroff),
        other => Err(format!("unknown command '{other}'")),
    }
}

/// One message to publish.
#[derive(Debug, PartialEq)]
pub(crate) struct Outgoing {
    pub(crate) topic: String,
    pub(crate) retain: bool,
    pub(crate) payload: Vec<u8>,
}

/// Messages for one broadcast. `last_light` is the state last published on
/// the retained topic and is updated in place.
pub(crate) fn outgoing(
    prefix: &str,
    msg: &Broadcast,
    last_light: &mut Option<LightState>,
) -> Result<Vec<Outgoing>, serde_json::Error> {
    let mut out = vec![Outgoing {
        topic: format!("{prefix}/telemetry"),
        retain: false,
        payload: serde_json::to_vec(msg)?,
    }];

    let light = msg.settings.light_state;
    if *last_light != Some(light) {
        *last_light = Some(light);
        out.push(Outgoing {
            topic: format!("{prefix}/light/state"),
            retain: true,
            payload: light.to_string().into_bytes(),
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Run the MQTT client until `shutdown` fires. Connection errors are logged
/// and retried; they never end the loop.
pub async fn run(
    cfg: MqttConfig,
    commands: mpsc::Sender<Command>,
    broadcasts: broadcast::Receiver<Broadcast>,
    shared: SharedState,
    shutdown: CancellationToken,
) {
    let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(options, 20);
    let prefix = cfg.topic_prefix.trim_end_matches('/').to_string();
    let filter = format!("{prefix}/cmd/+");

    let publisher = tokio::spawn(publish_loop(
        client.clone(),
        prefix.clone(),
        broadcasts,
        shutdown.clone(),
    ));

    info!(host = %cfg.host, port = cfg.port, %filter, "mqtt client starting");

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            ev = eventloop.poll() => ev,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(name) = extract_command(&prefix, &p.topic) else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                match parse_command(name, &p.payload) {
                    Ok(cmd) => {
                        if commands.send(cmd).await.is_err() {
                            warn!(?cmd, "command queue closed, dropping");
                        }
                    }
                    Err(msg) => {
                        warn!(topic = %p.topic, "bad command: {msg}");
                        shared
                            .write()
                            .await
                            .record(EventKind::Error, format!("mqtt {}: {msg}", p.topic));
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Clean session: subscriptions are lost on every reconnect.
                if let Err(e) = client.try_subscribe(&filter, QoS::AtLeastOnce) {
                    error!("mqtt subscribe failed: {e}");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record(EventKind::System, "mqtt connected");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record(EventKind::System, "mqtt disconnected");
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    if st.mqtt_connected {
                        st.record(EventKind::Error, format!("mqtt error: {e}"));
                    }
                    st.mqtt_connected = false;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                }
            }
        }
    }

    let _ = client.try_disconnect();
    let _ = publisher.await;
    info!("mqtt client stopped");
}

async fn publish_loop(
    client: AsyncClient,
    prefix: String,
    mut broadcasts: broadcast::Receiver<Broadcast>,
    shutdown: CancellationToken,
) {
    let mut last_light = None;
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = broadcasts.recv() => match msg {
                Ok(m) => m,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "mqtt publisher lagging behind the bus");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let batch = match outgoing(&prefix, &msg, &mut last_light) {
            Ok(b) => b,
            Err(e) => {
                error!("broadcast serialisation failed: {e}");
                continue;
            }
        };
        for o in batch {
            if let Err(e) = client
                .publish(&o.topic, QoS::AtLeastOnce, o.retain, o.payload)
                .await
            {
                warn!(topic = %o.topic, "mqtt publish failed: {e}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

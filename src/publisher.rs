// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

use chrono::{SecondsFormat, Utc};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::MqttConfig;
use crate::instruments::ChannelSnapshot;

/// Payload schema revision carried in every message.
const PAYLOAD_REV: u32 = 1;

/// Which historic dump a payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoricKind {
    MinMax,
    Average,
}

impl HistoricKind {
    fn topic_leaf(self) -> &'static str {
        match self {
            HistoricKind::MinMax => "minmax",
            HistoricKind::Average => "average",
        }
    }
}

/// Which sink a state document is being built for; selects the per-channel
/// publish policy flags.
#[derive(Debug, Clone, Copy)]
enum Sink {
    Mqtt,
    Html,
}

/// Plain sink for the reading vector and historic payloads: MQTT topics
/// under `EMA/<channel>/...` plus an optional latest-state JSON file for the
/// external HTML renderer.
///
/// While the broker is disconnected, publishes are dropped rather than
/// queued unbounded.
#[derive(Clone)]
pub struct Publisher {
    client: Option<Client>,
    connected: Arc<AtomicBool>,
    who: String,
    channel: String,
    html_path: Option<PathBuf>,
}

impl Publisher {
    /// Build the publisher; when a broker is configured, spawns the
    /// connection-draining thread that keeps the connected flag honest.
    pub fn connect(
        who: String,
        channel: String,
        mqtt: Option<&MqttConfig>,
        html_path: Option<PathBuf>,
    ) -> Publisher {
        let connected = Arc::new(AtomicBool::new(false));
        let client = mqtt.map(|cfg| {
            let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
            options.set_keep_alive(Duration::from_secs(30));
            if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
                options.set_credentials(user.clone(), pass.clone());
            }
            let (client, mut connection) = Client::new(options, 20);
            let flag = connected.clone();
            std::thread::spawn(move || {
                for event in connection.iter() {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("broker connected");
                            flag.store(true, Ordering::SeqCst);
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            warn!("broker sent disconnect");
                            flag.store(false, Ordering::SeqCst);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if flag.swap(false, Ordering::SeqCst) {
                                warn!("broker connection lost: {}", e);
                            }
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
            });
            client
        });
        Publisher {
            client,
            connected,
            who,
            channel,
            html_path,
        }
    }

    fn envelope(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("rev".to_string(), json!(PAYLOAD_REV));
        map.insert("who".to_string(), json!(self.who));
        map.insert(
            "tstamp".to_string(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        map
    }

    fn topic(&self, leaf: &str) -> String {
        format!("EMA/{}/{}", self.channel, leaf)
    }

    fn publish(&self, topic: String, payload: Value) {
        let client = match &self.client {
            Some(client) => client,
            None => return,
        };
        if !self.connected.load(Ordering::SeqCst) {
            debug!("broker disconnected, dropping publish to {}", topic);
            return;
        }
        let body = payload.to_string();
        if let Err(e) = client.publish(topic.as_str(), QoS::AtLeastOnce, false, body.into_bytes()) {
            warn!("publish to {} failed: {}", topic, e);
        }
    }

    /// Full device parameter inventory, sent once at startup.
    pub fn publish_register(&self, inventory: Value) {
        let mut payload = self.envelope();
        payload.insert("parameters".to_string(), inventory);
        self.publish("EMA/register".to_string(), Value::Object(payload));
    }

    /// User-visible event (level, message) on the events topic.
    pub fn publish_event(&self, level: &str, message: &str) {
        let mut payload = self.envelope();
        payload.insert("level".to_string(), json!(level));
        payload.insert("message".to_string(), json!(message));
        self.publish(self.topic("events"), Value::Object(payload));
    }

    /// Per-upload-period state: currents and averages per publish policy,
    /// to the broker and to the HTML sink.
    pub fn publish_state(&self, snapshots: &[ChannelSnapshot], relays: (char, char)) {
        let mut payload = self.envelope();
        payload.insert(
            "readings".to_string(),
            state_readings(snapshots, Sink::Mqtt),
        );
        payload.insert("roof_relay".to_string(), json!(relays.0.to_string()));
        payload.insert("aux_relay".to_string(), json!(relays.1.to_string()));
        self.publish(self.topic("current/state"), Value::Object(payload));

        if let Some(path) = &self.html_path {
            let mut document = self.envelope();
            document.insert(
                "readings".to_string(),
                state_readings(snapshots, Sink::Html),
            );
            document.insert("roof_relay".to_string(), json!(relays.0.to_string()));
            document.insert("aux_relay".to_string(), json!(relays.1.to_string()));
            if let Err(e) = std::fs::write(path, Value::Object(document).to_string()) {
                warn!("could not write html state file {}: {}", path.display(), e);
            }
        }
    }

    /// Historic dump lines, published verbatim in device order.
    pub fn publish_historic(&self, kind: HistoricKind, lines: &[String]) {
        let mut payload = self.envelope();
        payload.insert("entries".to_string(), json!(lines));
        self.publish(
            self.topic(&format!("historic/{}", kind.topic_leaf())),
            Value::Object(payload),
        );
    }
}

fn state_readings(snapshots: &[ChannelSnapshot], sink: Sink) -> Value {
    let mut instruments: Map<String, Value> = Map::new();
    for snap in snapshots {
        let wanted = match sink {
            Sink::Mqtt => snap.policy.mqtt,
            Sink::Html => snap.policy.html,
        };
        if !wanted {
            continue;
        }
        let entry = instruments
            .entry(snap.instrument.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(channels) = entry {
            let mut value = Map::new();
            if snap.policy.current {
                value.insert("current".to_string(), json!(snap.current));
            }
            if snap.policy.average {
                value.insert("average".to_string(), json!(snap.average));
            }
            channels.insert(snap.channel.to_string(), Value::Object(value));
        }
    }
    Value::Object(instruments)
}

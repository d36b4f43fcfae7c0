use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::{BrokerConfig, SwitchConfig},
    hal::{LastWill, MqttTransport, QoS, SessionOptions},
    topics::{
        PAYLOAD_OFFLINE, PAYLOAD_ONLINE, TOPIC_AVAILABILITY, TOPIC_CMD_SWITCH, TOPIC_HEARTBEAT,
        TOPIC_SWITCH_STATE,
    },
    types::{state_token, HeartbeatPayload, MqttSessionState, SwitchCommand, SwitchStatePayload},
};

pub const MAX_PAYLOAD_BYTES: usize = 512;
pub const MAX_INBOUND_PER_TICK: usize = 8;

/// Why an inbound message caused no actuation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("unexpected topic {0}")]
    TopicMismatch(String),
    #[error("payload of {0} bytes is too large")]
    Oversized(usize),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("field {0} has the wrong type")]
    WrongType(&'static str),
    #[error("command for switch {0}")]
    WrongSwitch(i64),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
}

/// Validates a message from the command topic.
pub fn decode_command(topic: &str, payload: &[u8], switch_id: u32) -> Result<SwitchCommand, Rejection> {
    if topic != TOPIC_CMD_SWITCH {
        return Err(Rejection::TopicMismatch(topic.to_string()));
    }
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(Rejection::Oversized(payload.len()));
    }

    let doc: Value =
        serde_json::from_slice(payload).map_err(|err| Rejection::Malformed(err.to_string()))?;
    let Some(doc) = doc.as_object() else {
        return Err(Rejection::Malformed("expected an object".to_string()));
    };

    let switch = doc
        .get("switch")
        .ok_or(Rejection::MissingField("switch"))?
        .as_i64()
        .ok_or(Rejection::WrongType("switch"))?;
    if switch != i64::from(switch_id) {
        return Err(Rejection::WrongSwitch(switch));
    }

    let command = doc
        .get("command")
        .ok_or(Rejection::MissingField("command"))?
        .as_str()
        .ok_or(Rejection::WrongType("command"))?;

    SwitchCommand::from_token(command).ok_or_else(|| Rejection::UnknownCommand(command.to_string()))
}

/// Broker session lifecycle: connect with a last will, birth message,
/// command subscription, state and heartbeat publication, and reconnect
/// backoff.
pub struct MqttSession {
    client_id: String,
    broker: BrokerConfig,
    switch_id: u32,
    reconnect_ms: u64,
    reconnect_max_ms: u64,
    connect_timeout_ms: u64,
    heartbeat_interval_ms: u64,

    state: MqttSessionState,
    failures: u32,
    last_attempt_ms: Option<u64>,
    last_heartbeat_ms: Option<u64>,
}

impl MqttSession {
    pub fn new(client_id: String, broker: BrokerConfig, config: &SwitchConfig) -> Self {
        Self {
            client_id,
            broker,
            switch_id: config.switch_id,
            reconnect_ms: config.mqtt_reconnect_ms,
            reconnect_max_ms: config.mqtt_reconnect_max_ms,
            connect_timeout_ms: config.mqtt_connect_timeout_ms,
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            state: MqttSessionState::Disconnected,
            failures: 0,
            last_attempt_ms: None,
            last_heartbeat_ms: None,
        }
    }

    pub fn state(&self) -> MqttSessionState {
        self.state
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Advances the session and returns the commands received this tick.
    pub fn tick<T: MqttTransport>(
        &mut self,
        transport: &mut T,
        station_up: bool,
        relay_on: bool,
        now_ms: u64,
    ) -> Vec<SwitchCommand> {
        if !station_up {
            if self.state != MqttSessionState::Disconnected {
                info!("Station down, dropping MQTT session");
                transport.disconnect();
                self.state = MqttSessionState::Disconnected;
            }
            return Vec::new();
        }

        match self.state {
            MqttSessionState::Disconnected => {
                if self.attempt_due(now_ms) {
                    self.attempt(transport, relay_on, now_ms);
                }
                Vec::new()
            }
            MqttSessionState::Connecting => {
                if transport.is_connected() {
                    self.on_connected(transport, relay_on, now_ms);
                } else if self
                    .last_attempt_ms
                    .is_some_and(|at| now_ms.saturating_sub(at) >= self.connect_timeout_ms)
                {
                    warn!("MQTT connect not acknowledged, abandoning attempt");
                    transport.disconnect();
                    self.fail();
                }
                Vec::new()
            }
            MqttSessionState::Connected => {
                if !transport.is_connected() {
                    warn!("MQTT connection lost");
                    transport.disconnect();
                    self.state = MqttSessionState::Disconnected;
                    return Vec::new();
                }

                let commands = self.drain(transport);
                if self
                    .last_heartbeat_ms
                    .map_or(true, |at| now_ms.saturating_sub(at) >= self.heartbeat_interval_ms)
                {
                    self.publish_heartbeat(transport, now_ms);
                }
                commands
            }
        }
    }

    /// Publishes the retained state document. A no-op while disconnected.
    pub fn publish_state<T: MqttTransport>(&mut self, transport: &mut T, relay_on: bool, now_ms: u64) {
        if self.state != MqttSessionState::Connected {
            return;
        }
        let payload = SwitchStatePayload {
            switch: self.switch_id,
            state: state_token(relay_on),
            uptime: now_ms / 1000,
        };
        self.publish_json(transport, TOPIC_SWITCH_STATE, &payload);
    }

    fn attempt<T: MqttTransport>(&mut self, transport: &mut T, relay_on: bool, now_ms: u64) {
        self.last_attempt_ms = Some(now_ms);
        let options = SessionOptions {
            client_id: &self.client_id,
            host: &self.broker.host,
            port: self.broker.port,
            keep_alive_secs: self.broker.keep_alive_secs,
            will: LastWill {
                topic: TOPIC_AVAILABILITY,
                payload: PAYLOAD_OFFLINE.as_bytes(),
                qos: QoS::AtLeastOnce,
                retain: true,
            },
        };

        info!(
            "Connecting to MQTT broker {}:{} as {}",
            self.broker.host, self.broker.port, self.client_id
        );
        match transport.connect(&options) {
            Ok(()) => {
                self.state = MqttSessionState::Connecting;
                if transport.is_connected() {
                    self.on_connected(transport, relay_on, now_ms);
                }
            }
            Err(err) => {
                warn!("MQTT connect failed: {err}");
                self.fail();
            }
        }
    }

    fn on_connected<T: MqttTransport>(&mut self, transport: &mut T, relay_on: bool, now_ms: u64) {
        self.state = MqttSessionState::Connected;
        self.failures = 0;
        info!("MQTT connected");

        if let Err(err) = transport.publish(
            TOPIC_AVAILABILITY,
            QoS::AtLeastOnce,
            true,
            PAYLOAD_ONLINE.as_bytes(),
        ) {
            warn!("Birth message failed: {err}");
        }

        if let Err(err) = transport.subscribe(TOPIC_CMD_SWITCH, QoS::AtLeastOnce) {
            warn!("Subscribe to {TOPIC_CMD_SWITCH} failed: {err}");
            transport.disconnect();
            self.fail();
            return;
        }

        self.publish_state(transport, relay_on, now_ms);
        self.publish_heartbeat(transport, now_ms);
    }

    fn drain<T: MqttTransport>(&mut self, transport: &mut T) -> Vec<SwitchCommand> {
        let mut commands = Vec::new();
        for _ in 0..MAX_INBOUND_PER_TICK {
            let Some(message) = transport.poll_message() else {
                break;
            };
            match decode_command(&message.topic, &message.payload, self.switch_id) {
                Ok(command) => commands.push(command),
                Err(rejection) => debug!("Dropped MQTT message: {rejection}"),
            }
        }
        commands
    }

    fn publish_heartbeat<T: MqttTransport>(&mut self, transport: &mut T, now_ms: u64) {
        let payload = HeartbeatPayload {
            id: self.client_id.clone(),
            uptime: now_ms / 1000,
        };
        self.publish_json(transport, TOPIC_HEARTBEAT, &payload);
        self.last_heartbeat_ms = Some(now_ms);
    }

    fn publish_json<T: MqttTransport, P: Serialize>(&self, transport: &mut T, topic: &str, payload: &P) {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(err) => {
                warn!("Failed to encode {topic} payload: {err}");
                return;
            }
        };
        if let Err(err) = transport.publish(topic, QoS::AtLeastOnce, true, &body) {
            warn!("Publish to {topic} failed: {err}");
        }
    }

    fn fail(&mut self) {
        self.state = MqttSessionState::Disconnected;
        self.failures = self.failures.saturating_add(1);
        debug!("MQTT retry in {} ms", self.backoff_ms());
    }

    fn attempt_due(&self, now_ms: u64) -> bool {
        self.last_attempt_ms
            .map_or(true, |at| now_ms.saturating_sub(at) >= self.backoff_ms())
    }

    /// Base delay, doubled per consecutive failure and capped.
    fn backoff_ms(&self) -> u64 {
        let doublings = self.failures.saturating_sub(1).min(16);
        self.reconnect_ms
            .saturating_mul(1_u64 << doublings)
            .min(self.reconnect_max_ms)
    }
}

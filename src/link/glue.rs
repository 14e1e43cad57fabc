//! Connectivity glue: WiFi and MQTT events in, self-healing session out

use rumqttc::QoS;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{LinkError, LinkEvent, MqttSession, ReconnectTimer, WifiLink};
use crate::config::NodeConfig;
use crate::mqtt::command::CommandDecoder;
use crate::mqtt::message_manager::{ChunkAssembler, InboundMessage};
use crate::mqtt::topic::{self, NodeTopics, TopicError};

/// Commands are subscribed exactly-once on every connect
pub const COMMAND_QOS: QoS = QoS::ExactlyOnce;

#[derive(Clone, Debug, PartialEq)]
pub struct GlueSettings {
    pub publish_qos: QoS,
    pub publish_retain: bool,
    pub mqtt_retry: Duration,
    pub wifi_settle: Duration,
    pub max_payload_len: usize,
}

impl GlueSettings {
    pub fn from_config(config: &NodeConfig) -> color_eyre::Result<Self> {
        Ok(GlueSettings {
            publish_qos: config.publish_qos()?,
            publish_retain: config.publish.retain,
            mqtt_retry: config.reconnect.mqtt_retry(),
            wifi_settle: config.reconnect.wifi_settle(),
            max_payload_len: config.max_payload_len,
        })
    }
}

pub struct ConnectivityGlue<M, W, T, D> {
    session: M,
    wifi: W,
    retry_timer: T,
    decoder: D,
    topics: NodeTopics,
    settings: GlueSettings,
    assembler: ChunkAssembler,
}

impl<M, W, T, D> ConnectivityGlue<M, W, T, D>
where
    M: MqttSession,
    W: WifiLink,
    T: ReconnectTimer,
    D: CommandDecoder,
{
    pub fn new(
        session: M,
        wifi: W,
        retry_timer: T,
        decoder: D,
        topics: NodeTopics,
        settings: GlueSettings,
    ) -> Self {
        let assembler = ChunkAssembler::new(settings.max_payload_len);
        ConnectivityGlue {
            session,
            wifi,
            retry_timer,
            decoder,
            topics,
            settings,
            assembler,
        }
    }

    pub fn topics(&self) -> &NodeTopics {
        &self.topics
    }

    pub fn session(&self) -> &M {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut M {
        &mut self.session
    }

    pub fn wifi(&self) -> &W {
        &self.wifi
    }

    pub fn retry_timer(&self) -> &T {
        &self.retry_timer
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn connect_to_broker(&mut self) {
        debug!("[mqtt] Connecting to MQTT...");
        self.session.connect();
    }

    pub fn on_wifi_connected(&mut self) {
        info!("[wifi] Connected to Wi-Fi");
        self.connect_to_broker();
    }

    /// Blocks the event loop for the settle delay before touching the link.
    pub async fn on_wifi_disconnected(&mut self) {
        info!("[wifi] Disconnected from Wi-Fi");
        if !self.settings.wifi_settle.is_zero() {
            tokio::time::sleep(self.settings.wifi_settle).await;
        }
        // the broker comes back through on_wifi_connected
        self.retry_timer.cancel();
        self.wifi.reconnect();
    }

    pub fn build_topic(&self, node_id: u8, template: &str) -> Result<String, TopicError> {
        topic::build_topic(&self.topics.root, node_id, template, self.topics.max_len)
    }

    /// Publishes with the node-wide QoS and retain flag.
    ///
    /// When the session is down, one inline reconnect is attempted. If the
    /// session still is not connected the payload is dropped and
    /// [`LinkError::NotConnected`] is returned.
    pub fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<u16, LinkError> {
        debug!(
            "[mqtt] publish {} qos:{:?} payload:{}",
            topic,
            self.settings.publish_qos,
            String::from_utf8_lossy(payload)
        );

        if !self.session.is_connected() {
            self.wifi.reconnect();
            self.session.connect();
        }

        if !self.session.is_connected() {
            warn!("[mqtt] MQTT not connected, {} not published", topic);
            return Err(LinkError::NotConnected);
        }

        self.session.publish(
            topic,
            self.settings.publish_qos,
            self.settings.publish_retain,
            payload,
        )
    }

    pub fn publish_status(&mut self, payload: &[u8]) -> Result<u16, LinkError> {
        let topic = self.topics.status()?;
        self.publish(&topic, payload)
    }

    pub fn publish_debug(&mut self, payload: &[u8]) -> Result<u16, LinkError> {
        let topic = self.topics.debug()?;
        self.publish(&topic, payload)
    }

    /// The broker's answer arrives later as [`LinkEvent::Subscribed`].
    pub fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        debug!("[mqtt] subscribe {} qos:{:?}", topic, qos);
        self.session.subscribe(topic, qos)
    }

    pub fn on_mqtt_connected(&mut self, session_present: bool) {
        info!("[mqtt] Connected to MQTT, session present: {}", session_present);

        let topic = match self.topics.command() {
            Ok(topic) => topic,
            Err(e) => {
                error!("[mqtt] Cannot build command topic: {}", e);
                return;
            }
        };
        if let Err(e) = self.subscribe(&topic, COMMAND_QOS) {
            error!("[mqtt] Failed to subscribe to {}: {}", topic, e);
        }
    }

    pub fn on_mqtt_disconnected(&mut self, reason: &str) {
        info!("[mqtt] Disconnected from MQTT: {}", reason);

        if self.wifi.is_connected() {
            self.retry_timer.arm(self.settings.mqtt_retry);
        }
    }

    pub fn on_retry_timer_fired(&mut self, ticket: u64) {
        if self.retry_timer.acknowledge(ticket) {
            self.connect_to_broker();
        }
    }

    pub fn on_mqtt_subscribed(&mut self, pkid: u16, granted: &[Option<QoS>]) {
        debug!("[mqtt] Subscribe acknowledged, packetId: {}", pkid);
        for qos in granted {
            match qos {
                Some(qos) => debug!("[mqtt]   qos: {:?}", qos),
                None => warn!("[mqtt] Broker refused subscription {}", pkid),
            }
        }
    }

    pub fn on_mqtt_unsubscribed(&mut self, pkid: u16) {
        debug!("[mqtt] Unsubscribe acknowledged, packetId: {}", pkid);
    }

    pub fn on_mqtt_published(&mut self, pkid: u16) {
        debug!("[mqtt] Publish acknowledged, packetId: {}", pkid);
    }

    pub fn on_mqtt_message(&mut self, message: InboundMessage) {
        debug!(
            "[mqtt msg] topic: {} len: {} index: {} total: {}",
            message.topic,
            message.payload.len(),
            message.index,
            message.total
        );

        let Some(message) = self.assembler.push(message) else {
            return;
        };

        let Some(parsed) = topic::parse_node_topic(&message.topic) else {
            debug!("[mqtt msg] No node id in {}, ignored", message.topic);
            return;
        };
        if parsed.node_id != self.topics.node_id {
            debug!("[mqtt msg] Message for node {}, ignored", parsed.node_id);
            return;
        }

        let is_command = parsed.segment == self.topics.command_segment()
            || message.topic.contains(&self.topics.command_subtopic());
        if !is_command {
            debug!("[mqtt msg] {} is not a command topic", message.topic);
            return;
        }

        info!("[mqtt msg] Command received on {}", message.topic);
        if let Err(e) = self.decoder.decode(&message.topic, &message.payload) {
            debug!("[mqtt msg] Command not decoded: {}", e);
        }
    }

    /// Dispatches one event from the link, session or timer.
    pub async fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::WifiConnected => self.on_wifi_connected(),
            LinkEvent::WifiDisconnected => self.on_wifi_disconnected().await,
            LinkEvent::MqttConnected { session_present } => self.on_mqtt_connected(session_present),
            LinkEvent::MqttDisconnected { reason } => self.on_mqtt_disconnected(&reason),
            LinkEvent::Subscribed { pkid, granted } => self.on_mqtt_subscribed(pkid, &granted),
            LinkEvent::Unsubscribed { pkid } => self.on_mqtt_unsubscribed(pkid),
            LinkEvent::Message(message) => self.on_mqtt_message(message),
            LinkEvent::Published { pkid } => self.on_mqtt_published(pkid),
            LinkEvent::RetryTimerFired { ticket } => self.on_retry_timer_fired(ticket),
        }
    }

    pub fn shutdown(&mut self) {
        info!("Shutting down WiFi and MQTT");
        self.wifi.detach();
        self.retry_timer.cancel();
        self.wifi.disconnect();
        self.session.disconnect();
    }
}

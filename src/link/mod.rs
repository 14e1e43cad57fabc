//! # Link Module
//!
//! Keeps the node's broker connection alive across WiFi link flaps.
//!
//! The [`glue::ConnectivityGlue`] owns four capabilities and reacts to
//! [`LinkEvent`]s produced by them:
//!
//! ```text
//! WifiLink ──────────┐
//! MqttSession ───────┼─► LinkEvent ─► runtime task ─► ConnectivityGlue
//! ReconnectTimer ────┘
//! ```
//!
//! Every handler runs on the single runtime task, so the glue needs no locks.
//! MQTT connects are only attempted while WiFi is up; losing WiFi cancels any
//! pending MQTT retry and leaves reconnection to the WiFi path.

pub mod error;
pub mod glue;
pub mod runtime;
pub mod timer;
pub mod wifi;


use rumqttc::QoS;
use std::time::Duration;

use crate::mqtt::message_manager::InboundMessage;
pub use error::LinkError;

/// Everything the runtime task reacts to
#[derive(Debug, Clone)]
pub enum LinkEvent {
    WifiConnected,
    WifiDisconnected,
    MqttConnected {
        session_present: bool,
    },
    MqttDisconnected {
        reason: String,
    },
    /// Subscribe acknowledgment, `None` marks a refused filter
    Subscribed {
        pkid: u16,
        granted: Vec<Option<QoS>>,
    },
    Unsubscribed {
        pkid: u16,
    },
    Message(InboundMessage),
    Published {
        pkid: u16,
    },
    RetryTimerFired {
        ticket: u64,
    },
}

/// Broker session as seen by the glue
pub trait MqttSession {
    /// Starts a connection attempt; no-op while connecting or connected
    fn connect(&mut self);

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Hands a publish to the client and returns its packet id (0 for QoS 0)
    fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<u16, LinkError>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError>;
}

/// Link-layer capability, one implementation per platform
pub trait WifiLink {
    fn is_connected(&self) -> bool;

    /// Fire-and-forget; success shows up later as [`LinkEvent::WifiConnected`]
    fn reconnect(&mut self);

    fn disconnect(&mut self);

    /// Stops emitting link events
    fn detach(&mut self);
}

/// One-shot timer with at most one pending fire
pub trait ReconnectTimer {
    /// Arms the timer, replacing any pending fire, and returns its ticket
    fn arm(&mut self, delay: Duration) -> u64;

    fn cancel(&mut self);

    fn is_armed(&self) -> bool;

    /// Disarms and returns `true` when `ticket` is the pending fire
    fn acknowledge(&mut self, ticket: u64) -> bool;
}

impl<W: WifiLink + ?Sized> WifiLink for Box<W> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn reconnect(&mut self) {
        (**self).reconnect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn detach(&mut self) {
        (**self).detach()
    }
}

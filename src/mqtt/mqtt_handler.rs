use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message_manager::InboundMessage;
use crate::config::BrokerConfig;
use crate::link::{LinkError, LinkEvent, MqttSession};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// State shared between the session and its event loop driver
struct SessionShared {
    state: AtomicU8,
    wake: Notify,
}

impl SessionShared {
    fn state(&self) -> ConnectionState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// MQTT session over `rumqttc`
///
/// The [`EventLoop`] lives in a driver task that only polls after
/// [`MqttSession::connect`]. When a poll fails the driver reports
/// [`LinkEvent::MqttDisconnected`] and parks until the next connect request,
/// so reconnect timing stays with the glue instead of rumqttc.
pub struct BrokerSession {
    client: AsyncClient,
    shared: Arc<SessionShared>,
    last_packet_id: u16,
    max_inflight: u16,
    closing: bool,
    driver: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl BrokerSession {
    pub fn options(config: &BrokerConfig, client_id: &str) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(client_id, config.host.clone(), config.port);
        mqtt_options
            .set_keep_alive(Duration::from_secs(config.keep_alive_secs))
            .set_clean_session(config.clean_session);

        if let Some(user) = &config.username {
            mqtt_options.set_credentials(user.clone(), config.password.clone().unwrap_or_default());
        }
        mqtt_options
    }

    pub fn spawn(
        config: &BrokerConfig,
        client_id: &str,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        info!(
            "Setting up MQTT session '{}' for {}:{}",
            client_id, config.host, config.port
        );
        let options = Self::options(config, client_id);
        let max_inflight = options.inflight();
        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);

        let shared = Arc::new(SessionShared {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            wake: Notify::new(),
        });
        let cancel = CancellationToken::new();

        let driver = tokio::spawn(drive_eventloop(
            eventloop,
            shared.clone(),
            events,
            cancel.clone(),
        ));

        BrokerSession {
            client,
            shared,
            last_packet_id: 0,
            max_inflight,
            closing: false,
            driver: Some(driver),
            cancel,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Next packet identifier, in step with the one the event loop assigns.
    ///
    /// rumqttc hands out `1..=inflight` and starts over at 1 once it has used
    /// `inflight`, so ids repeat long before `u16::MAX`.
    fn next_packet_id(&mut self) -> u16 {
        let next = self.last_packet_id.wrapping_add(1);
        self.last_packet_id = if next >= self.max_inflight { 0 } else { next };
        next
    }

    /// Waits for the driver to flush a requested DISCONNECT, at most `grace`.
    ///
    /// Without a pending disconnect the driver is stopped right away.
    pub async fn closed(&mut self, grace: Duration) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        if !self.closing {
            self.cancel.cancel();
            return;
        }

        match tokio::time::timeout(grace, driver).await {
            Ok(Ok(())) => debug!("[mqtt] Session closed"),
            Ok(Err(e)) => error!("[mqtt] Event loop driver failed: {}", e),
            Err(_) => {
                warn!("[mqtt] DISCONNECT not flushed within {:?}", grace);
                self.cancel.cancel();
            }
        }
    }
}

impl MqttSession for BrokerSession {
    fn connect(&mut self) {
        let started = self.shared.state.compare_exchange(
            ConnectionState::Disconnected as u8,
            ConnectionState::Connecting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        match started {
            Ok(_) => {
                info!("[mqtt] Connecting to MQTT...");
                self.shared.wake.notify_one();
            }
            Err(state) => debug!(
                "[mqtt] Connect requested while {:?}, ignoring",
                ConnectionState::from(state)
            ),
        }
    }

    fn disconnect(&mut self) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        match self.client.try_disconnect() {
            Ok(()) => self.closing = true,
            Err(e) => warn!("[mqtt] Failed to request disconnect: {}", e),
        }
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<u16, LinkError> {
        self.client
            .try_publish(topic, qos, retain, payload.to_vec())
            .map_err(|e| LinkError::Client(e.to_string()))?;

        Ok(match qos {
            QoS::AtMostOnce => 0,
            _ => self.next_packet_id(),
        })
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        self.client
            .try_subscribe(topic, qos)
            .map_err(|e| LinkError::Client(e.to_string()))?;
        self.next_packet_id();
        Ok(())
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Maps an incoming packet to the event the glue cares about
fn translate(packet: Packet, shared: &SessionShared) -> Option<LinkEvent> {
    match packet {
        Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
            shared.set_state(ConnectionState::Connected);
            Some(LinkEvent::MqttConnected {
                session_present: ack.session_present,
            })
        }
        Packet::ConnAck(ack) => {
            warn!("[mqtt] Broker refused connection: {:?}", ack.code);
            None
        }
        Packet::SubAck(ack) => Some(LinkEvent::Subscribed {
            pkid: ack.pkid,
            granted: ack
                .return_codes
                .into_iter()
                .map(|code| match code {
                    SubscribeReasonCode::Success(qos) => Some(qos),
                    SubscribeReasonCode::Failure => None,
                })
                .collect(),
        }),
        Packet::UnsubAck(ack) => Some(LinkEvent::Unsubscribed { pkid: ack.pkid }),
        Packet::Publish(publish) => Some(LinkEvent::Message(InboundMessage::from(publish))),
        Packet::PubAck(ack) => Some(LinkEvent::Published { pkid: ack.pkid }),
        Packet::PubComp(comp) => Some(LinkEvent::Published { pkid: comp.pkid }),
        Packet::Disconnect => {
            info!("[mqtt] Broker sent disconnect");
            None
        }
        _ => None,
    }
}

async fn drive_eventloop(
    mut eventloop: EventLoop,
    shared: Arc<SessionShared>,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.wake.notified() => {}
        }

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => return,
                polled = eventloop.poll() => polled,
            };

            let event = match polled {
                Ok(Event::Incoming(packet)) => translate(packet, &shared),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("[mqtt] Disconnect sent");
                    shared.set_state(ConnectionState::Disconnected);
                    return;
                }
                Ok(Event::Outgoing(_)) => None,
                Err(e) => {
                    shared.set_state(ConnectionState::Disconnected);
                    if events
                        .send(LinkEvent::MqttDisconnected {
                            reason: e.to_string(),
                        })
                        .await
                        .is_err()
                    {
                        error!("[mqtt] Event channel closed, stopping driver");
                        return;
                    }
                    break;
                }
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    error!("[mqtt] Event channel closed, stopping driver");
                    return;
                }
            }
        }
    }
    debug!("[mqtt] Event loop driver cancelled");
}

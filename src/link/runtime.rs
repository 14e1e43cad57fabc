//! Runtime task driving the connectivity glue
//!
//! All link events and caller requests are funnelled into one task that owns
//! the glue, so handlers never run concurrently:
//!
//! ```text
//! LinkEvent ───┐
//!              ├─► NodeLink<Running>::run ─► ConnectivityGlue
//! GlueRequest ─┘
//! ```

use std::time::Duration;

use rumqttc::QoS;
use statum::{machine, state};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::glue::ConnectivityGlue;
use super::timer::TokioRetryTimer;
use super::{LinkError, LinkEvent, WifiLink};
use crate::mqtt::command::JsonCommandDecoder;
use crate::mqtt::mqtt_handler::BrokerSession;

/// How long shutdown waits for the broker session to flush its DISCONNECT
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

pub type NodeGlue =
    ConnectivityGlue<BrokerSession, Box<dyn WifiLink + Send>, TokioRetryTimer, JsonCommandDecoder>;

/// Where an outbound message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundTopic {
    Status,
    Debug,
    Topic(String),
}

#[derive(Debug)]
pub enum GlueRequest {
    Publish {
        topic: OutboundTopic,
        payload: Vec<u8>,
        response_tx: oneshot::Sender<Result<u16, LinkError>>,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        response_tx: oneshot::Sender<Result<(), LinkError>>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

#[state]
#[derive(Debug, Clone)]
pub enum RuntimeState {
    Configured,
    Running,
}

#[machine]
pub struct NodeLink<S: RuntimeState> {
    glue: NodeGlue,
    events: mpsc::Receiver<LinkEvent>,
    requests: mpsc::Receiver<GlueRequest>,
}

impl NodeLink<Configured> {
    pub fn create(
        glue: NodeGlue,
        events: mpsc::Receiver<LinkEvent>,
        request_capacity: usize,
    ) -> (Self, GlueHandle) {
        let (requests_tx, requests) = mpsc::channel(request_capacity);
        (
            Self::new(glue, events, requests),
            GlueHandle {
                requests: requests_tx,
            },
        )
    }

    pub fn start(self) -> NodeLink<Running> {
        info!(
            "Starting link runtime for node {}",
            self.glue.topics().node_id
        );
        self.transition()
    }
}

impl NodeLink<Running> {
    /// Handles events and requests until a shutdown request arrives or every
    /// sender is gone.
    pub async fn run(mut self) {
        let mut acknowledge = None;
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.glue.handle_event(event).await,
                    None => {
                        error!("Link event channel closed");
                        break;
                    }
                },
                request = self.requests.recv() => match request {
                    Some(request) => {
                        acknowledge = handle_request(&mut self.glue, request);
                        if acknowledge.is_some() {
                            break;
                        }
                    }
                    None => {
                        debug!("All handles dropped");
                        break;
                    }
                },
            }
        }
        self.glue.shutdown();
        self.glue.session_mut().closed(DISCONNECT_GRACE).await;

        if let Some(response_tx) = acknowledge {
            let _ = response_tx.send(());
        }
        info!("Link runtime stopped");
    }
}

/// Returns the shutdown acknowledgement once the runtime should stop
fn handle_request(glue: &mut NodeGlue, request: GlueRequest) -> Option<oneshot::Sender<()>> {
    match request {
        GlueRequest::Publish {
            topic,
            payload,
            response_tx,
        } => {
            let result = match topic {
                OutboundTopic::Status => glue.publish_status(&payload),
                OutboundTopic::Debug => glue.publish_debug(&payload),
                OutboundTopic::Topic(topic) => glue.publish(&topic, &payload),
            };
            if response_tx.send(result).is_err() {
                debug!("Publish caller went away");
            }
            None
        }
        GlueRequest::Subscribe {
            topic,
            qos,
            response_tx,
        } => {
            if response_tx.send(glue.subscribe(&topic, qos)).is_err() {
                debug!("Subscribe caller went away");
            }
            None
        }
        GlueRequest::Shutdown { response_tx } => Some(response_tx),
    }
}

/// Cloneable handle for talking to the runtime task
#[derive(Clone, Debug)]
pub struct GlueHandle {
    requests: mpsc::Sender<GlueRequest>,
}

impl GlueHandle {
    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> GlueRequest,
    ) -> Result<R, LinkError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.requests
            .send(build(response_tx))
            .await
            .map_err(|e| LinkError::ChannelError(e.to_string()))?;
        response_rx
            .await
            .map_err(|e| LinkError::ChannelError(e.to_string()))
    }

    pub async fn publish(
        &self,
        topic: OutboundTopic,
        payload: impl Into<Vec<u8>>,
    ) -> Result<u16, LinkError> {
        let payload = payload.into();
        self.request(|response_tx| GlueRequest::Publish {
            topic,
            payload,
            response_tx,
        })
        .await?
    }

    pub async fn publish_status(&self, payload: impl Into<Vec<u8>>) -> Result<u16, LinkError> {
        self.publish(OutboundTopic::Status, payload).await
    }

    pub async fn publish_debug(&self, payload: impl Into<Vec<u8>>) -> Result<u16, LinkError> {
        self.publish(OutboundTopic::Debug, payload).await
    }

    pub async fn subscribe(&self, topic: impl Into<String>, qos: QoS) -> Result<(), LinkError> {
        let topic = topic.into();
        self.request(|response_tx| GlueRequest::Subscribe {
            topic,
            qos,
            response_tx,
        })
        .await?
    }

    pub async fn shutdown(&self) -> Result<(), LinkError> {
        self.request(|response_tx| GlueRequest::Shutdown { response_tx })
            .await
    }
}

//! MQTT-backed broker transport.
//!
//! One client and one event loop per transport instance. The event loop
//! routes incoming publishes by topic: pull requests to the registered
//! handler, pull responses to the in-flight request waiting on that key,
//! and push updates to the per-key subscription channels.

use crate::{BrokerTransport, RequestHandler, TransportError};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use twinsync_core::TwinKey;
use twinsync_proto::{MessageType, TopicScheme, TwinRequest, TwinResponse, TwinUpdate};
use url::Url;
use uuid::Uuid;

/// Per-key buffer for pushes racing ahead of the consumer.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Configuration for the MQTT transport.
#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    /// MQTT broker URL (e.g., <tcp://localhost:1883>)
    pub broker_url: String,
    /// Client ID for the MQTT connection
    pub client_id: String,
    /// Session identifier used for pull-response addressing
    pub session_id: Uuid,
    /// Topic scheme
    pub scheme: TopicScheme,
    /// Keep-alive interval
    pub keep_alive: Duration,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        let session_id = Uuid::new_v4();
        Self {
            broker_url: "tcp://localhost:1883".to_string(),
            client_id: format!("twinsync-{session_id}"),
            session_id,
            scheme: TopicScheme::default(),
            keep_alive: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct Router {
    /// In-flight pull per key, resolved by the response topic
    pending: Mutex<HashMap<TwinKey, oneshot::Sender<TwinResponse>>>,
    /// Open push subscriptions
    updates: Mutex<HashMap<TwinKey, mpsc::Sender<TwinUpdate>>>,
    /// Publisher-side pull handler
    handler: Mutex<Option<RequestHandler>>,
}

/// MQTT implementation of [`BrokerTransport`].
pub struct MqttTransport {
    client: AsyncClient,
    scheme: TopicScheme,
    session_id: Uuid,
    router: Arc<Router>,
}

impl MqttTransport {
    /// Connect to the broker and start the routing event loop.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid or the response
    /// subscription cannot be queued.
    pub async fn connect(config: MqttTransportConfig) -> Result<Self, TransportError> {
        let (host, port) = parse_mqtt_url(&config.broker_url)?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(config.keep_alive);

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let router = Arc::new(Router::default());

        // Pull responses for this session arrive on a per-session topic.
        client
            .subscribe(
                config.scheme.response_wildcard(config.session_id),
                QoS::AtLeastOnce,
            )
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let transport = Self {
            client: client.clone(),
            scheme: config.scheme.clone(),
            session_id: config.session_id,
            router: Arc::clone(&router),
        };

        tokio::spawn(route_loop(
            eventloop,
            router,
            client,
            config.scheme,
            config.session_id,
        ));

        Ok(transport)
    }

    /// The session identifier pull responses are addressed to. Requests
    /// issued through this transport must carry the same session.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn request(
        &self,
        request: TwinRequest,
        timeout: Duration,
    ) -> Result<TwinResponse, TransportError> {
        let key = request.key.clone();
        let (tx, rx) = oneshot::channel();
        self.router
            .pending
            .lock()
            .expect("pending lock")
            .insert(key.clone(), tx);

        let payload = request
            .to_cbor()
            .map_err(|e| TransportError::Codec(e.to_string()))?;

        let topic = self.scheme.request(&key);
        tracing::debug!(topic, key = %key, last_known_version = request.last_known_version, "Publishing pull request");

        if let Err(e) = self
            .client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            self.router.pending.lock().expect("pending lock").remove(&key);
            return Err(TransportError::Publish(e.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Unavailable(
                "pull superseded by a newer request".to_string(),
            )),
            Err(_) => {
                self.router.pending.lock().expect("pending lock").remove(&key);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn publish_update(&self, update: &TwinUpdate) -> Result<(), TransportError> {
        let payload = update
            .to_cbor()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        let topic = self.scheme.update(update.key());

        tracing::debug!(topic, payload_len = payload.len(), "Publishing twin update");

        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe_updates(
        &self,
        key: &TwinKey,
    ) -> Result<mpsc::Receiver<TwinUpdate>, TransportError> {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        self.router
            .updates
            .lock()
            .expect("updates lock")
            .insert(key.clone(), tx);

        let topic = self.scheme.update(key);
        tracing::info!(topic, "Subscribing to twin updates");

        self.client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        Ok(rx)
    }

    async fn unsubscribe_updates(&self, key: &TwinKey) -> Result<(), TransportError> {
        self.router.updates.lock().expect("updates lock").remove(key);

        self.client
            .unsubscribe(self.scheme.update(key))
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn serve(&self, handler: RequestHandler) -> Result<(), TransportError> {
        *self.router.handler.lock().expect("handler lock") = Some(handler);

        self.client
            .subscribe(self.scheme.request_wildcard(), QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }
}

/// Event loop driving the MQTT connection and routing inbound publishes.
async fn route_loop(
    mut eventloop: EventLoop,
    router: Arc<Router>,
    client: AsyncClient,
    scheme: TopicScheme,
    session_id: Uuid,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                route_publish(&publish.topic, &publish.payload, &router, &client, &scheme, session_id);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("Connected to MQTT broker");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "MQTT error");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

fn route_publish(
    topic: &str,
    payload: &[u8],
    router: &Arc<Router>,
    client: &AsyncClient,
    scheme: &TopicScheme,
    session_id: Uuid,
) {
    let Some((key, msg_type)) = scheme.parse(topic) else {
        tracing::debug!(topic, "Ignoring message on foreign topic");
        return;
    };

    match msg_type {
        MessageType::Request => {
            let handler = router.handler.lock().expect("handler lock").clone();
            let Some(handler) = handler else {
                return;
            };

            let request = match TwinRequest::from_cbor(payload) {
                Ok(request) => request,
                Err(err) => {
                    tracing::warn!(error = %err, topic, "Failed to decode TwinRequest");
                    return;
                }
            };

            let response_topic = scheme.response(&request.key, request.session_id);
            let response = handler(request);
            let client = client.clone();

            tokio::spawn(async move {
                let payload = match response.to_cbor() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "Failed to encode TwinResponse");
                        return;
                    }
                };
                if let Err(err) = client
                    .publish(&response_topic, QoS::AtLeastOnce, false, payload)
                    .await
                {
                    tracing::warn!(error = %err, topic = response_topic, "Failed to publish TwinResponse");
                }
            });
        }
        MessageType::Response(response_session) => {
            if response_session != session_id {
                return;
            }

            let response = match TwinResponse::from_cbor(payload) {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(error = %err, topic, "Failed to decode TwinResponse");
                    return;
                }
            };

            let waiter = router
                .pending
                .lock()
                .expect("pending lock")
                .remove(response.key());
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => {
                    tracing::debug!(key = %key, "Dropping response with no pull in flight");
                }
            }
        }
        MessageType::Update => {
            let update = match TwinUpdate::from_cbor(payload) {
                Ok(update) => update,
                Err(err) => {
                    tracing::warn!(error = %err, topic, "Failed to decode TwinUpdate");
                    return;
                }
            };

            let mut updates = router.updates.lock().expect("updates lock");
            if let Some(tx) = updates.get(&key) {
                match tx.try_send(update) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(key = %key, "Update buffer full, dropping push");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        updates.remove(&key);
                    }
                }
            }
        }
    }
}

/// Parse an MQTT URL into host and port.
fn parse_mqtt_url(input: &str) -> Result<(String, u16), TransportError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| TransportError::Unavailable(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(TransportError::Unavailable(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::Unavailable(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TransportError::Unavailable(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port.parse().map_err(|_| {
            TransportError::Unavailable(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(TransportError::Unavailable(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

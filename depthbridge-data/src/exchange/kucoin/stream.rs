use super::{
    model::{KucoinControlFrame, KucoinWsRequest},
    sync::KucoinSyncApi,
};
use crate::{
    config::KucoinConfig,
    exchange::{
        RawEvent, RawSubscription, SUBSCRIPTION_CHANNEL_CAPACITY, SubscriptionEntry,
        SubscriptionGuard, TopicRelease, request_id,
    },
};
use depthbridge_integration::{
    backoff::{ReconnectionBackoffPolicy, ReconnectionState},
    error::SocketError,
    protocol::websocket::{self, WebSocket, WsMessage, WsPayload},
};
use fnv::FnvHashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Deadline on the `welcome` control that must open every Kucoin connection.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-advertised keep-alive cadence of one Kucoin instance server.
#[derive(Debug, Copy, Clone)]
struct KeepAlive {
    interval: Duration,
    timeout: Duration,
}

/// Persistent multiplexed WebSocket to the Kucoin market-data stream.
///
/// The connection URL is parameterized with a token acquired through the sync API's
/// bullet-public endpoint, and the first inbound frame must be a `welcome` control.
/// Subscriptions are reference-counted per topic; a new topic's SUBSCRIBE must be
/// acknowledged (`ack` keyed by request id) within the configured deadline. Keep-alive
/// pings follow the cadence advertised by the instance server.
#[derive(Debug, Clone)]
pub struct KucoinStreamClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    subscriptions: Mutex<FnvHashMap<SmolStr, SubscriptionEntry>>,
    pending_acks: Mutex<FnvHashMap<SmolStr, oneshot::Sender<Result<(), String>>>>,
    ws_tx: mpsc::UnboundedSender<WsMessage>,
    ack_timeout: Duration,
}

impl KucoinStreamClient {
    /// Acquire a connection token, dial an instance server, and spawn the connection driver.
    pub async fn connect(
        sync_api: Arc<KucoinSyncApi>,
        config: &KucoinConfig,
    ) -> Result<Self, SocketError> {
        let (websocket, keep_alive) = dial(&sync_api).await?;

        let (ws_tx, ws_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            subscriptions: Mutex::new(FnvHashMap::default()),
            pending_acks: Mutex::new(FnvHashMap::default()),
            ws_tx,
            ack_timeout: config.ack_timeout,
        });

        tokio::spawn(run_connection_driver(
            Arc::clone(&inner),
            websocket,
            ws_rx,
            sync_api,
            keep_alive,
        ));

        Ok(Self { inner })
    }

    /// Subscribe to the provided stream topic.
    ///
    /// An existing entry only gains a reference. A new entry sends SUBSCRIBE and waits for
    /// the venue's matching `ack`; no ack within the deadline fails the subscription.
    pub(crate) async fn subscribe(&self, topic: &str) -> Result<RawSubscription, SocketError> {
        let topic = SmolStr::new(topic);

        let (rx, pending_ack) = {
            let mut subscriptions = self.inner.subscriptions.lock();
            match subscriptions.get_mut(&topic) {
                Some(entry) => {
                    entry.subscriber_count += 1;
                    (entry.tx.subscribe(), None)
                }
                None => {
                    let (tx, rx) = broadcast::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
                    subscriptions.insert(
                        topic.clone(),
                        SubscriptionEntry {
                            tx,
                            subscriber_count: 1,
                        },
                    );

                    let (request_id, ack_rx) = self.inner.register_ack();
                    debug!(%topic, %request_id, "subscribing to Kucoin stream topic");
                    let request = KucoinWsRequest::subscribe(
                        request_id.to_string(),
                        topic.to_string(),
                    );
                    if let Err(error) = send_request(&self.inner.ws_tx, &request) {
                        subscriptions.remove(&topic);
                        self.inner.pending_acks.lock().remove(&request_id);
                        return Err(error);
                    }
                    (rx, Some((request_id, ack_rx)))
                }
            }
        };

        // Await the venue acknowledgement outside the lock.
        if let Some((request_id, ack_rx)) = pending_ack {
            match tokio::time::timeout(self.inner.ack_timeout, ack_rx).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(message))) => {
                    self.inner.release(&topic);
                    return Err(SocketError::Subscribe(message));
                }
                Ok(Err(_)) => {
                    self.inner.release(&topic);
                    return Err(SocketError::Terminated(String::from(
                        "connection lost awaiting Kucoin subscribe ack",
                    )));
                }
                Err(_) => {
                    self.inner.pending_acks.lock().remove(&request_id);
                    self.inner.release(&topic);
                    return Err(SocketError::ResponseTimeout {
                        entity: "Kucoin subscribe ack",
                    });
                }
            }
        }

        Ok(RawSubscription {
            topic: topic.clone(),
            rx,
            guard: SubscriptionGuard::new(topic, Arc::clone(&self.inner) as Arc<dyn TopicRelease>),
        })
    }
}

impl ClientInner {
    /// Register an in-flight subscribe awaiting its `ack`, keyed by a collision-free
    /// request id.
    fn register_ack(&self) -> (SmolStr, oneshot::Receiver<Result<(), String>>) {
        let mut pending = self.pending_acks.lock();
        let mut id = SmolStr::new(request_id().to_string());
        while pending.contains_key(&id) {
            id = SmolStr::new(request_id().to_string());
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(id.clone(), tx);
        (id, rx)
    }

    /// Fail every in-flight subscribe - the connection that would have acknowledged them is
    /// gone.
    fn fail_pending_acks(&self) {
        self.pending_acks.lock().clear();
    }
}

impl TopicRelease for ClientInner {
    fn release(&self, topic: &str) {
        let mut subscriptions = self.subscriptions.lock();
        let Some(entry) = subscriptions.get_mut(topic) else {
            return;
        };

        if entry.subscriber_count > 1 {
            entry.subscriber_count -= 1;
            return;
        }

        subscriptions.remove(topic);
        drop(subscriptions);

        debug!(%topic, "unsubscribing from Kucoin stream topic");
        let request =
            KucoinWsRequest::unsubscribe(request_id().to_string(), topic.to_string());
        if let Err(error) = send_request(&self.ws_tx, &request) {
            warn!(%topic, %error, "failed to send Kucoin unsubscribe frame");
        }
    }
}

fn send_request(
    ws_tx: &mpsc::UnboundedSender<WsMessage>,
    request: &KucoinWsRequest,
) -> Result<(), SocketError> {
    let payload = serde_json::to_string(request).map_err(SocketError::Serialise)?;
    ws_tx
        .send(WsMessage::text(payload))
        .map_err(|_| SocketError::Sink)
}

/// Acquire a fresh token, dial the first advertised instance server, and wait for the
/// gating `welcome` control. An `error` control before `welcome` fails the connect.
async fn dial(sync_api: &KucoinSyncApi) -> Result<(WebSocket, KeepAlive), SocketError> {
    let options = sync_api.ws_connection_options().await?;
    let server = options.instance_servers.first().ok_or_else(|| {
        SocketError::Exchange(String::from("bullet-public returned no instance servers"))
    })?;

    let url = format!(
        "{}?token={}&connectId={}",
        server.endpoint,
        options.token,
        request_id()
    );
    let mut websocket = websocket::connect(url.as_str()).await?;

    let welcome = tokio::time::timeout(WELCOME_TIMEOUT, websocket.next())
        .await
        .map_err(|_| SocketError::ResponseTimeout {
            entity: "Kucoin welcome",
        })?;

    match welcome {
        Some(Ok(WsMessage::Text(payload))) => {
            let frame = serde_json::from_str::<KucoinControlFrame>(&payload).map_err(|error| {
                SocketError::Deserialise {
                    error,
                    payload: payload.to_string(),
                }
            })?;
            match frame.kind.as_str() {
                "welcome" => {}
                "error" => return Err(SocketError::Exchange(frame.error_message())),
                other => {
                    return Err(SocketError::Exchange(format!(
                        "expected welcome control, received: {other}"
                    )));
                }
            }
        }
        Some(Ok(message)) => {
            return Err(SocketError::Exchange(format!(
                "expected welcome control, received: {message:?}"
            )));
        }
        Some(Err(error)) => return Err(SocketError::WebSocket(Box::new(error))),
        None => {
            return Err(SocketError::Terminated(String::from(
                "stream ended before welcome",
            )));
        }
    }

    info!(endpoint = %server.endpoint, "connected to Kucoin market-data stream");
    Ok((
        websocket,
        KeepAlive {
            interval: Duration::from_millis(server.ping_interval_ms),
            timeout: Duration::from_millis(server.ping_timeout_ms),
        },
    ))
}

async fn run_connection_driver(
    inner: Arc<ClientInner>,
    mut websocket: WebSocket,
    mut ws_rx: mpsc::UnboundedReceiver<WsMessage>,
    sync_api: Arc<KucoinSyncApi>,
    mut keep_alive: KeepAlive,
) {
    let mut backoff = ReconnectionState::from(ReconnectionBackoffPolicy::default());

    loop {
        let error = drive_connection(&inner, websocket, &mut ws_rx, keep_alive).await;
        warn!(%error, "Kucoin stream connection lost");
        inner.fail_pending_acks();

        (websocket, keep_alive) = loop {
            tokio::time::sleep(backoff.next_delay()).await;
            match dial(&sync_api).await {
                Ok(connection) => break connection,
                Err(error) => warn!(%error, "failed to re-establish Kucoin stream"),
            }
        };
        backoff.reset();

        resubscribe_all(&inner);
        fan_out_reconnected(&inner);
    }
}

async fn drive_connection(
    inner: &Arc<ClientInner>,
    websocket: WebSocket,
    ws_rx: &mut mpsc::UnboundedReceiver<WsMessage>,
    keep_alive: KeepAlive,
) -> SocketError {
    let (mut ws_sink, mut ws_stream) = websocket.split();
    let mut ping_interval = tokio::time::interval(keep_alive.interval);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            Some(message) = ws_rx.recv() => {
                if let Err(error) = ws_sink.send(message).await {
                    return SocketError::WebSocket(Box::new(error));
                }
            }
            frame = ws_stream.next() => match frame {
                Some(Ok(WsMessage::Text(payload))) => {
                    if route_frame(inner, payload) {
                        last_pong = Instant::now();
                    }
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    if let Err(error) = ws_sink.send(WsMessage::Pong(payload)).await {
                        return SocketError::WebSocket(Box::new(error));
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    return SocketError::Terminated(format!("{frame:?}"));
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return SocketError::WebSocket(Box::new(error)),
                None => return SocketError::Terminated(String::from("stream ended")),
            },
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > keep_alive.interval + keep_alive.timeout {
                    return SocketError::ResponseTimeout { entity: "Kucoin keep-alive pong" };
                }
                let ping = KucoinWsRequest::ping(request_id().to_string());
                if let Err(error) = send_request(&inner.ws_tx, &ping) {
                    return error;
                }
            }
        }
    }
}

/// Discover an inbound frame's kind and dispatch it. Returns whether the frame counts as
/// keep-alive liveness (`pong`).
///
/// Unknown topics & malformed frames are logged and discarded - never fatal.
fn route_frame(inner: &Arc<ClientInner>, payload: WsPayload) -> bool {
    let frame = match serde_json::from_str::<KucoinControlFrame>(&payload) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(?error, payload = &*payload, "malformed Kucoin stream frame dropped");
            return false;
        }
    };

    match frame.kind.as_str() {
        "message" => {
            let Some(topic) = frame.topic else {
                debug!("Kucoin message frame without topic discarded");
                return false;
            };

            // Forward outside the subscriptions lock to avoid head-of-line blocking.
            let tx = inner
                .subscriptions
                .lock()
                .get(topic.as_str())
                .map(|entry| entry.tx.clone());

            match tx {
                Some(tx) => {
                    let _ = tx.send(RawEvent::Payload(payload));
                }
                None => debug!(%topic, "Kucoin data frame for unknown topic discarded"),
            }
            false
        }
        "pong" => true,
        "ack" => {
            let Some(id) = frame.id else {
                debug!("Kucoin ack without id discarded");
                return false;
            };
            match inner.pending_acks.lock().remove(id.as_str()) {
                Some(tx) => {
                    let _ = tx.send(Ok(()));
                }
                None => debug!(%id, "Kucoin ack matches no in-flight request"),
            }
            false
        }
        "error" => {
            let message = frame.error_message();
            match frame
                .id
                .and_then(|id| inner.pending_acks.lock().remove(id.as_str()))
            {
                Some(tx) => {
                    let _ = tx.send(Err(message));
                }
                None => warn!(%message, "Kucoin stream reported error"),
            }
            false
        }
        "welcome" => {
            debug!("Kucoin welcome control received");
            false
        }
        other => {
            debug!(kind = %other, "unhandled Kucoin control frame discarded");
            false
        }
    }
}

/// Re-issue a SUBSCRIBE for every live topic after a reconnect. Acknowledgements are logged
/// by the read loop rather than awaited - there is no subscriber to fail.
fn resubscribe_all(inner: &Arc<ClientInner>) {
    let topics = inner
        .subscriptions
        .lock()
        .keys()
        .cloned()
        .collect::<Vec<_>>();

    for topic in topics {
        debug!(%topic, "re-issuing Kucoin subscription after reconnect");
        let request = KucoinWsRequest::subscribe(request_id().to_string(), topic.to_string());
        if let Err(error) = send_request(&inner.ws_tx, &request) {
            warn!(%topic, %error, "failed to re-issue Kucoin subscription");
        }
    }
}

/// Tell every subscriber the connection was re-established and frames may have been lost.
fn fan_out_reconnected(inner: &Arc<ClientInner>) {
    for entry in inner.subscriptions.lock().values() {
        let _ = entry.tx.send(RawEvent::Reconnected);
    }
}

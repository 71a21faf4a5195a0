use super::model::{BinanceRoutingFrame, BinanceSubResponse, BinanceWsRequest};
use crate::{
    config::BinanceConfig,
    exchange::{
        RawEvent, RawSubscription, SUBSCRIPTION_CHANNEL_CAPACITY, SubscriptionEntry,
        SubscriptionGuard, TopicRelease, request_id,
    },
};
use depthbridge_integration::{
    Validator,
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
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Interval between application keep-alive pings sent to Binance.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(180);

/// Inbound silence tolerated before the connection is considered dead and torn down.
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(600);

/// Persistent multiplexed WebSocket to the Binance market-data stream.
///
/// A single upstream connection is fanned out to many topic subscribers with a
/// reference-counted subscription lifecycle: N subscribers to the same topic cause exactly
/// one SUBSCRIBE wire frame, and the N-th released reference emits exactly one UNSUBSCRIBE.
/// Connection loss is repaired with bounded backoff, live subscriptions are re-issued, and
/// a [`RawEvent::Reconnected`] marker is fanned out so consumers can observe the gap.
#[derive(Debug, Clone)]
pub struct BinanceStreamClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    subscriptions: Mutex<FnvHashMap<SmolStr, SubscriptionEntry>>,
    ws_tx: mpsc::UnboundedSender<WsMessage>,
}

impl BinanceStreamClient {
    /// Dial the multiplexed stream endpoint and spawn the connection driver.
    pub async fn connect(config: &BinanceConfig) -> Result<Self, SocketError> {
        let websocket = websocket::connect(config.stream_url.as_str()).await?;
        info!(url = %config.stream_url, "connected to Binance market-data stream");

        let (ws_tx, ws_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            subscriptions: Mutex::new(FnvHashMap::default()),
            ws_tx,
        });

        tokio::spawn(run_connection_driver(
            Arc::clone(&inner),
            websocket,
            ws_rx,
            config.stream_url.clone(),
        ));

        Ok(Self { inner })
    }

    /// Subscribe to the provided stream topic.
    ///
    /// An existing entry only gains a reference - no SUBSCRIBE frame is re-sent.
    pub(crate) fn subscribe(&self, topic: &str) -> Result<RawSubscription, SocketError> {
        let topic = SmolStr::new(topic);
        let mut subscriptions = self.inner.subscriptions.lock();

        let rx = match subscriptions.get_mut(&topic) {
            Some(entry) => {
                entry.subscriber_count += 1;
                entry.tx.subscribe()
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

                debug!(%topic, "subscribing to Binance stream topic");
                if let Err(error) = send_control(&self.inner.ws_tx, "SUBSCRIBE", vec![topic.to_string()]) {
                    subscriptions.remove(&topic);
                    return Err(error);
                }
                rx
            }
        };
        drop(subscriptions);

        Ok(RawSubscription {
            topic: topic.clone(),
            rx,
            guard: SubscriptionGuard::new(topic, Arc::clone(&self.inner) as Arc<dyn TopicRelease>),
        })
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

        // Last reference: dropping the entry closes the fan-out channel.
        subscriptions.remove(topic);
        drop(subscriptions);

        debug!(%topic, "unsubscribing from Binance stream topic");
        if let Err(error) = send_control(&self.ws_tx, "UNSUBSCRIBE", vec![topic.to_string()]) {
            // Unsubscribe failure is not surfaced: the venue stops mattering once the local
            // entry is gone, and a reconnect will not re-issue it.
            warn!(%topic, %error, "failed to send UNSUBSCRIBE frame");
        }
    }
}

fn send_control(
    ws_tx: &mpsc::UnboundedSender<WsMessage>,
    method: &'static str,
    params: Vec<String>,
) -> Result<(), SocketError> {
    let request = BinanceWsRequest {
        id: request_id(),
        method,
        params,
    };
    let payload = serde_json::to_string(&request).map_err(SocketError::Serialise)?;
    ws_tx
        .send(WsMessage::text(payload))
        .map_err(|_| SocketError::Sink)
}

/// Own the connection for its whole lifetime: drive one socket until it fails, then repair
/// it with bounded backoff, re-issue every live subscription, and tell subscribers.
async fn run_connection_driver(
    inner: Arc<ClientInner>,
    mut websocket: WebSocket,
    mut ws_rx: mpsc::UnboundedReceiver<WsMessage>,
    url: String,
) {
    let mut backoff = ReconnectionState::from(ReconnectionBackoffPolicy::default());

    loop {
        let error = drive_connection(&inner, websocket, &mut ws_rx).await;
        warn!(%url, %error, "Binance stream connection lost");

        websocket = loop {
            tokio::time::sleep(backoff.next_delay()).await;
            match websocket::connect(url.as_str()).await {
                Ok(websocket) => break websocket,
                Err(error) => warn!(%url, %error, "failed to re-establish Binance stream"),
            }
        };
        backoff.reset();
        info!(%url, "re-established Binance stream connection");

        resubscribe_all(&inner);
        fan_out_reconnected(&inner);
    }
}

/// Pump one established socket: serialize outbound control frames, demultiplex inbound
/// frames by topic, and keep the connection alive. Returns once the socket is unusable.
async fn drive_connection(
    inner: &Arc<ClientInner>,
    websocket: WebSocket,
    ws_rx: &mut mpsc::UnboundedReceiver<WsMessage>,
) -> SocketError {
    let (mut ws_sink, mut ws_stream) = websocket.split();
    let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            Some(message) = ws_rx.recv() => {
                if let Err(error) = ws_sink.send(message).await {
                    return SocketError::WebSocket(Box::new(error));
                }
            }
            frame = ws_stream.next() => match frame {
                Some(Ok(WsMessage::Text(payload))) => {
                    last_inbound = Instant::now();
                    route_frame(inner, payload);
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    last_inbound = Instant::now();
                    if let Err(error) = ws_sink.send(WsMessage::Pong(payload)).await {
                        return SocketError::WebSocket(Box::new(error));
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    last_inbound = Instant::now();
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    return SocketError::Terminated(format!("{frame:?}"));
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return SocketError::WebSocket(Box::new(error)),
                None => return SocketError::Terminated(String::from("stream ended")),
            },
            _ = keep_alive.tick() => {
                if last_inbound.elapsed() > KEEP_ALIVE_TIMEOUT {
                    return SocketError::ResponseTimeout { entity: "Binance keep-alive pong" };
                }
                if let Err(error) = ws_sink.send(WsMessage::Ping(Default::default())).await {
                    return SocketError::WebSocket(Box::new(error));
                }
            }
        }
    }
}

/// Discover an inbound frame's kind and dispatch it.
///
/// Unknown topics & malformed frames are logged and discarded - never fatal.
fn route_frame(inner: &Arc<ClientInner>, payload: WsPayload) {
    let frame = match serde_json::from_str::<BinanceRoutingFrame>(&payload) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(?error, payload = &*payload, "malformed Binance stream frame dropped");
            return;
        }
    };

    if let Some(topic) = frame.stream {
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
            None => debug!(%topic, "Binance data frame for unknown topic discarded"),
        }
        return;
    }

    if frame.id.is_some() {
        match serde_json::from_str::<BinanceSubResponse>(&payload)
            .map_err(|error| SocketError::Deserialise {
                error,
                payload: payload.to_string(),
            })
            .and_then(BinanceSubResponse::validate)
        {
            Ok(response) => debug!(id = response.id, "Binance subscription acknowledged"),
            Err(error) => warn!(%error, "Binance control request rejected"),
        }
        return;
    }

    debug!(payload = &*payload, "unrecognised Binance stream frame discarded");
}

/// Re-issue one SUBSCRIBE covering every live topic after a reconnect.
fn resubscribe_all(inner: &Arc<ClientInner>) {
    let topics = inner
        .subscriptions
        .lock()
        .keys()
        .map(|topic| topic.to_string())
        .collect::<Vec<_>>();

    if topics.is_empty() {
        return;
    }

    debug!(?topics, "re-issuing Binance subscriptions after reconnect");
    if let Err(error) = send_control(&inner.ws_tx, "SUBSCRIBE", topics) {
        warn!(%error, "failed to re-issue Binance subscriptions");
    }
}

/// Tell every subscriber the connection was re-established and frames may have been lost.
fn fan_out_reconnected(inner: &Arc<ClientInner>) {
    for entry in inner.subscriptions.lock().values() {
        let _ = entry.tx.send(RawEvent::Reconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (BinanceStreamClient, mpsc::UnboundedReceiver<WsMessage>) {
        let (ws_tx, ws_rx) = mpsc::unbounded_channel();
        let client = BinanceStreamClient {
            inner: Arc::new(ClientInner {
                subscriptions: Mutex::new(FnvHashMap::default()),
                ws_tx,
            }),
        };
        (client, ws_rx)
    }

    fn assert_frame_method(frame: &WsMessage, method: &str) {
        let payload = frame.to_text().unwrap();
        assert!(
            payload.contains(method),
            "expected {method} frame, got: {payload}"
        );
    }

    #[test]
    fn test_subscribe_is_reference_counted() {
        let (client, mut ws_rx) = client();
        let topic = "btcusdt@depth";

        let mut first = client.subscribe(topic).unwrap();
        let mut second = client.subscribe(topic).unwrap();

        // Two logical subscribers cause exactly one SUBSCRIBE wire frame.
        assert_frame_method(&ws_rx.try_recv().unwrap(), "SUBSCRIBE");
        assert!(ws_rx.try_recv().is_err());

        // Both subscribers observe every delivered message.
        let tx = client
            .inner
            .subscriptions
            .lock()
            .get(topic)
            .map(|entry| entry.tx.clone())
            .unwrap();
        tx.send(RawEvent::Payload(WsPayload::from_static(
            r#"{"stream":"btcusdt@depth","data":{}}"#,
        )))
        .unwrap();

        assert!(matches!(first.rx.try_recv(), Ok(RawEvent::Payload(_))));
        assert!(matches!(second.rx.try_recv(), Ok(RawEvent::Payload(_))));

        // Dropping one handle leaves the other subscribed, with no wire frame.
        drop(second);
        assert!(ws_rx.try_recv().is_err());
        assert_eq!(
            client
                .inner
                .subscriptions
                .lock()
                .get(topic)
                .unwrap()
                .subscriber_count,
            1
        );

        // Dropping the last handle emits exactly one UNSUBSCRIBE and removes the entry.
        drop(first);
        assert_frame_method(&ws_rx.try_recv().unwrap(), "UNSUBSCRIBE");
        assert!(ws_rx.try_recv().is_err());
        assert!(client.inner.subscriptions.lock().is_empty());
    }

    #[test]
    fn test_resubscribe_covers_every_live_topic() {
        let (client, mut ws_rx) = client();

        let _btc = client.subscribe("btcusdt@depth").unwrap();
        let _eth = client.subscribe("ethusdt@depth").unwrap();
        let _ = ws_rx.try_recv().unwrap();
        let _ = ws_rx.try_recv().unwrap();

        resubscribe_all(&client.inner);

        // One batched SUBSCRIBE frame naming both topics.
        let frame = ws_rx.try_recv().unwrap();
        let payload = frame.to_text().unwrap();
        assert!(payload.contains("SUBSCRIBE"));
        assert!(payload.contains("btcusdt@depth"));
        assert!(payload.contains("ethusdt@depth"));
        assert!(ws_rx.try_recv().is_err());
    }

    #[test]
    fn test_reconnected_marker_reaches_subscribers() {
        let (client, _ws_rx) = client();
        let mut subscription = client.subscribe("btcusdt@depth").unwrap();

        fan_out_reconnected(&client.inner);

        assert!(matches!(
            subscription.rx.try_recv(),
            Ok(RawEvent::Reconnected)
        ));
    }
}

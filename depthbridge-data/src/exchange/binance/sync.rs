use super::model::{
    BinanceApiResponse, BinanceDepthRequest, BinanceDepthSnapshot, BinanceRoutingFrame,
};
use crate::{
    SyncApi,
    books::OrderBookSnapshot,
    config::BinanceConfig,
    error::DataError,
    exchange::request_id,
    symbol::MarketSymbol,
};
use async_trait::async_trait;
use depthbridge_integration::{
    backoff::{ReconnectionBackoffPolicy, ReconnectionState},
    error::SocketError,
    protocol::websocket::{self, WebSocket, WsMessage, WsPayload},
};
use fnv::FnvHashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Deepest book Binance will return from a `depth` request.
const MAX_VENUE_DEPTH: usize = 5000;

/// Binance request/response facility returning sequence-numbered full depth snapshots over a
/// dedicated WebSocket API connection. Responses are matched to requests by id.
#[derive(Debug)]
pub struct BinanceSyncApi {
    inner: Arc<SyncInner>,
    snapshot_timeout: Duration,
}

#[derive(Debug)]
struct SyncInner {
    pending: Mutex<FnvHashMap<u64, oneshot::Sender<WsPayload>>>,
    ws_tx: mpsc::UnboundedSender<WsMessage>,
}

impl BinanceSyncApi {
    /// Dial the WebSocket API endpoint and spawn the response listener.
    pub async fn connect(config: &BinanceConfig) -> Result<Self, SocketError> {
        let websocket = websocket::connect(config.ws_api_url.as_str()).await?;
        info!(url = %config.ws_api_url, "connected to Binance WebSocket API");

        let (ws_tx, ws_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SyncInner {
            pending: Mutex::new(FnvHashMap::default()),
            ws_tx,
        });

        tokio::spawn(run_connection_driver(
            Arc::clone(&inner),
            websocket,
            ws_rx,
            config.ws_api_url.clone(),
        ));

        Ok(Self {
            inner,
            snapshot_timeout: config.snapshot_timeout,
        })
    }

    async fn request_snapshot(
        &self,
        symbol: &MarketSymbol,
        limit: usize,
    ) -> Result<OrderBookSnapshot, SocketError> {
        let venue_limit = match limit {
            0 => MAX_VENUE_DEPTH,
            limit => limit.min(MAX_VENUE_DEPTH),
        };

        let (id, rx) = {
            let mut pending = self.inner.pending.lock();
            let mut id = request_id();
            while pending.contains_key(&id) {
                id = request_id();
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(id, tx);
            (id, rx)
        };

        let request =
            BinanceDepthRequest::new(id, symbol.join("").to_uppercase(), venue_limit);
        let payload = serde_json::to_string(&request).map_err(SocketError::Serialise)?;
        if self.inner.ws_tx.send(WsMessage::text(payload)).is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(SocketError::Sink);
        }

        let payload = match tokio::time::timeout(self.snapshot_timeout, rx).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(_)) => {
                return Err(SocketError::Terminated(String::from(
                    "Binance WebSocket API connection lost",
                )));
            }
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                return Err(SocketError::ResponseTimeout {
                    entity: "Binance depth snapshot",
                });
            }
        };

        let response = serde_json::from_str::<BinanceApiResponse<BinanceDepthSnapshot>>(&payload)
            .map_err(|error| SocketError::Deserialise {
                error,
                payload: payload.to_string(),
            })?;

        // Truncation to the requested depth is this client's responsibility.
        let mut snapshot = OrderBookSnapshot::from(response.result);
        if limit > 0 {
            snapshot.bids.truncate(limit);
            snapshot.asks.truncate(limit);
        }

        Ok(snapshot)
    }
}

#[async_trait]
impl SyncApi for BinanceSyncApi {
    async fn snapshot(
        &self,
        symbol: &MarketSymbol,
        limit: usize,
    ) -> Result<OrderBookSnapshot, DataError> {
        match self.request_snapshot(symbol, limit).await {
            Ok(snapshot) => Ok(snapshot),
            Err(error @ SocketError::ResponseTimeout { .. }) => Err(DataError::from(error)),
            Err(error) => {
                // Transient transport failure: one retry before surfacing.
                warn!(%symbol, %error, "Binance snapshot request failed, retrying once");
                self.request_snapshot(symbol, limit)
                    .await
                    .map_err(DataError::from)
            }
        }
    }
}

async fn run_connection_driver(
    inner: Arc<SyncInner>,
    mut websocket: WebSocket,
    mut ws_rx: mpsc::UnboundedReceiver<WsMessage>,
    url: String,
) {
    let mut backoff = ReconnectionState::from(ReconnectionBackoffPolicy::default());

    loop {
        let error = drive_connection(&inner, websocket, &mut ws_rx).await;
        warn!(%url, %error, "Binance WebSocket API connection lost");

        // In-flight requests cannot be answered by the next connection.
        inner.pending.lock().clear();

        websocket = loop {
            tokio::time::sleep(backoff.next_delay()).await;
            match websocket::connect(url.as_str()).await {
                Ok(websocket) => break websocket,
                Err(error) => warn!(%url, %error, "failed to re-establish Binance WebSocket API"),
            }
        };
        backoff.reset();
        info!(%url, "re-established Binance WebSocket API connection");
    }
}

async fn drive_connection(
    inner: &Arc<SyncInner>,
    websocket: WebSocket,
    ws_rx: &mut mpsc::UnboundedReceiver<WsMessage>,
) -> SocketError {
    let (mut ws_sink, mut ws_stream) = websocket.split();

    loop {
        tokio::select! {
            Some(message) = ws_rx.recv() => {
                if let Err(error) = ws_sink.send(message).await {
                    return SocketError::WebSocket(Box::new(error));
                }
            }
            frame = ws_stream.next() => match frame {
                Some(Ok(WsMessage::Text(payload))) => route_response(inner, payload),
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
        }
    }
}

/// Hand a response frame to the request awaiting it. Frames matching no in-flight request
/// are logged and dropped.
fn route_response(inner: &Arc<SyncInner>, payload: WsPayload) {
    let frame = match serde_json::from_str::<BinanceRoutingFrame>(&payload) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(?error, payload = &*payload, "malformed Binance API frame dropped");
            return;
        }
    };

    let Some(id) = frame.id else {
        debug!(payload = &*payload, "Binance API frame without id discarded");
        return;
    };

    match inner.pending.lock().remove(&id) {
        Some(tx) => {
            let _ = tx.send(payload);
        }
        None => debug!(id, "Binance API response matches no in-flight request"),
    }
}

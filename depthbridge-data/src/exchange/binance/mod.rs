use crate::{
    DepthDiffStream, DiffEvent, StreamApi,
    books::OrderBookUpdate,
    error::DataError,
    exchange::RawEvent,
    symbol::MarketSymbol,
};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Binance wire models: stream envelope, depth diff, control frames & depth snapshot.
pub mod model;

/// Multiplexed Binance market-data stream client.
pub mod stream;

/// Binance request/response WebSocket API client used for depth snapshots.
pub mod sync;

pub use stream::BinanceStreamClient;
pub use sync::BinanceSyncApi;

/// Binance depth-diff stream topic for the provided market (eg/ "btcusdt@depth").
///
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#diff-depth-stream>
pub(crate) fn depth_topic(symbol: &MarketSymbol) -> String {
    format!("{}@depth", symbol.join(""))
}

/// [`StreamApi`] implementation translating the raw multiplexed Binance stream into
/// normalised [`DiffEvent`]s.
#[derive(Debug)]
pub struct BinanceStreamApi {
    client: BinanceStreamClient,
}

impl BinanceStreamApi {
    pub fn new(client: BinanceStreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StreamApi for BinanceStreamApi {
    async fn depth_diff_stream(&self, symbol: &MarketSymbol) -> Result<DepthDiffStream, DataError> {
        let subscription = self.client.subscribe(&depth_topic(symbol))?;
        let topic = subscription.topic.clone();
        let mut raw_rx = subscription.rx;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let event = match raw_rx.recv().await {
                    Ok(RawEvent::Payload(payload)) => {
                        match serde_json::from_str::<
                            model::BinanceStreamMessage<model::BinanceDepthUpdate>,
                        >(&payload)
                        {
                            Ok(message) => DiffEvent::Update(OrderBookUpdate::from(message.data)),
                            Err(error) => {
                                warn!(
                                    ?error,
                                    payload = &*payload,
                                    "failed to deserialize Binance depth diff frame"
                                );
                                continue;
                            }
                        }
                    }
                    Ok(RawEvent::Reconnected) => DiffEvent::Reconnected,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Lost frames are indistinguishable from a gap to the consumer.
                        warn!(skipped, "Binance depth diff subscriber lagged fan-out");
                        DiffEvent::Reconnected
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(DepthDiffStream::new(topic, rx, Some(subscription.guard)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_depth_topic() {
        let symbol = MarketSymbol::from_str("btc_usdt").unwrap();
        assert_eq!(depth_topic(&symbol), "btcusdt@depth");
    }
}

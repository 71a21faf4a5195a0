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

/// Kucoin wire models: bullet-public connection options, control frames, depth diff &
/// level2 snapshot.
pub mod model;

/// Multiplexed Kucoin market-data stream client.
pub mod stream;

/// Kucoin REST client used for connection tokens & depth snapshots.
pub mod sync;

pub use stream::KucoinStreamClient;
pub use sync::KucoinSyncApi;

/// Kucoin level2 depth-diff stream topic for the provided market
/// (eg/ "/market/level2:BTC-USDT").
///
/// See docs: <https://www.kucoin.com/docs/websocket/spot-trading/public-channels/level2-market-data>
pub(crate) fn depth_topic(symbol: &MarketSymbol) -> String {
    format!("/market/level2:{}", symbol.join("-").to_uppercase())
}

/// [`StreamApi`] implementation translating the raw multiplexed Kucoin stream into
/// normalised [`DiffEvent`]s.
#[derive(Debug)]
pub struct KucoinStreamApi {
    client: KucoinStreamClient,
}

impl KucoinStreamApi {
    pub fn new(client: KucoinStreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StreamApi for KucoinStreamApi {
    async fn depth_diff_stream(&self, symbol: &MarketSymbol) -> Result<DepthDiffStream, DataError> {
        let subscription = self.client.subscribe(&depth_topic(symbol)).await?;
        let topic = subscription.topic.clone();
        let mut raw_rx = subscription.rx;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let event = match raw_rx.recv().await {
                    Ok(RawEvent::Payload(payload)) => {
                        match serde_json::from_str::<
                            model::KucoinStreamMessage<model::KucoinDepthUpdate>,
                        >(&payload)
                        {
                            Ok(message) => DiffEvent::Update(OrderBookUpdate::from(message.data)),
                            Err(error) => {
                                warn!(
                                    ?error,
                                    payload = &*payload,
                                    "failed to deserialize Kucoin depth diff frame"
                                );
                                continue;
                            }
                        }
                    }
                    Ok(RawEvent::Reconnected) => DiffEvent::Reconnected,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Lost frames are indistinguishable from a gap to the consumer.
                        warn!(skipped, "Kucoin depth diff subscriber lagged fan-out");
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
        assert_eq!(depth_topic(&symbol), "/market/level2:BTC-USDT");
    }
}

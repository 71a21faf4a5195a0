use crate::{
    StreamApi, SyncApi,
    books::validator::{BinanceDiffValidator, DiffValidator, KucoinDiffValidator},
    config::Config,
    error::DataError,
};
use depthbridge_integration::protocol::websocket::WsPayload;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{fmt, str::FromStr, sync::Arc};
use tokio::sync::broadcast;

/// `Binance` stream & sync client implementations.
pub mod binance;

/// `Kucoin` stream & sync client implementations.
pub mod kucoin;

/// Unique identifier for a market venue served by the bridge.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    Binance,
    Kucoin,
}

impl Venue {
    /// Return the &str representation of this [`Venue`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Binance => "binance",
            Venue::Kucoin => "kucoin",
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Venue {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binance" => Ok(Venue::Binance),
            "kucoin" => Ok(Venue::Kucoin),
            other => Err(DataError::UnknownVenue(other.to_string())),
        }
    }
}

/// Event fanned out to every subscriber of one stream-client topic.
#[derive(Debug, Clone)]
pub(crate) enum RawEvent {
    /// Raw text payload of a data frame delivered for the topic, in wire order.
    Payload(WsPayload),
    /// The underlying connection was re-established; frames may have been lost.
    Reconnected,
}

/// Fan-out state for one subscribed topic inside a stream client.
///
/// `subscriber_count >= 1` while the entry exists; the entry (and its channel) is removed
/// when the count reaches zero.
#[derive(Debug)]
pub(crate) struct SubscriptionEntry {
    pub tx: broadcast::Sender<RawEvent>,
    pub subscriber_count: usize,
}

/// Capacity of each topic's fan-out channel. A subscriber lagging this far behind wire
/// order observes a `Lagged` error rather than stalling the read loop.
pub(crate) const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 2048;

/// Allocate a request id for a venue control frame.
///
/// Ids are drawn from a bounded pseudo-random range; callers that key in-flight state by id
/// must re-draw on collision.
pub(crate) fn request_id() -> u64 {
    use rand::Rng;
    rand::rng().random_range(10_000..10_000_000)
}

/// Implemented by stream clients so a dropped [`SubscriptionGuard`] can release one topic
/// reference without knowing the concrete client.
pub(crate) trait TopicRelease
where
    Self: Send + Sync,
{
    fn release(&self, topic: &str);
}

/// One reference on a stream-client topic subscription.
///
/// Dropping the guard decrements the topic's subscriber count; the client unsubscribes from
/// the venue once the count reaches zero.
pub struct SubscriptionGuard {
    topic: SmolStr,
    client: Arc<dyn TopicRelease>,
}

impl SubscriptionGuard {
    pub(crate) fn new(topic: SmolStr, client: Arc<dyn TopicRelease>) -> Self {
        Self { topic, client }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.client.release(&self.topic);
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("topic", &self.topic)
            .finish()
    }
}

/// Raw (unparsed) subscription to one stream-client topic.
#[derive(Debug)]
pub(crate) struct RawSubscription {
    pub topic: SmolStr,
    pub rx: broadcast::Receiver<RawEvent>,
    pub guard: SubscriptionGuard,
}

/// The per-venue API triple the engine dispatches over.
#[derive(Debug, Clone)]
pub struct VenueApis {
    pub stream: Arc<dyn StreamApi>,
    pub sync: Arc<dyn SyncApi>,
    pub validator: Arc<dyn DiffValidator>,
}

/// Static dispatch table keyed by [`Venue`].
///
/// Only venues on the configured allow-list are dialled; resolving any other venue is a
/// hard failure surfaced to the RPC boundary.
#[derive(Debug)]
pub struct VenueResolver {
    apis: FnvHashMap<Venue, VenueApis>,
}

impl VenueResolver {
    /// Dial every venue on the configured allow-list and assemble the dispatch table.
    pub async fn connect(config: &Config) -> Result<Self, DataError> {
        let mut apis = FnvHashMap::default();

        for venue in &config.venues {
            let venue_apis = match venue {
                Venue::Binance => {
                    let stream_client = binance::BinanceStreamClient::connect(&config.binance)
                        .await?;
                    let sync_api =
                        Arc::new(binance::BinanceSyncApi::connect(&config.binance).await?);
                    VenueApis {
                        stream: Arc::new(binance::BinanceStreamApi::new(stream_client)),
                        sync: sync_api,
                        validator: Arc::new(BinanceDiffValidator),
                    }
                }
                Venue::Kucoin => {
                    let sync_api = Arc::new(kucoin::KucoinSyncApi::new(&config.kucoin)?);
                    let stream_client =
                        kucoin::KucoinStreamClient::connect(Arc::clone(&sync_api), &config.kucoin)
                            .await?;
                    VenueApis {
                        stream: Arc::new(kucoin::KucoinStreamApi::new(stream_client)),
                        sync: sync_api,
                        validator: Arc::new(KucoinDiffValidator),
                    }
                }
            };

            apis.insert(*venue, venue_apis);
        }

        Ok(Self { apis })
    }

    /// Assemble a resolver from pre-built venue APIs.
    pub fn from_parts<Iter>(apis: Iter) -> Self
    where
        Iter: IntoIterator<Item = (Venue, VenueApis)>,
    {
        Self {
            apis: apis.into_iter().collect(),
        }
    }

    pub fn stream_api(&self, venue: Venue) -> Result<Arc<dyn StreamApi>, DataError> {
        self.apis
            .get(&venue)
            .map(|apis| Arc::clone(&apis.stream))
            .ok_or_else(|| DataError::UnknownVenue(venue.to_string()))
    }

    pub fn sync_api(&self, venue: Venue) -> Result<Arc<dyn SyncApi>, DataError> {
        self.apis
            .get(&venue)
            .map(|apis| Arc::clone(&apis.sync))
            .ok_or_else(|| DataError::UnknownVenue(venue.to_string()))
    }

    pub fn validator(&self, venue: Venue) -> Result<Arc<dyn DiffValidator>, DataError> {
        self.apis
            .get(&venue)
            .map(|apis| Arc::clone(&apis.validator))
            .ok_or_else(|| DataError::UnknownVenue(venue.to_string()))
    }
}

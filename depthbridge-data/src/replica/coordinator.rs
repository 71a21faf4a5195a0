use crate::{
    books::OrderBookSnapshot,
    config::{Config, ReplicationSettings},
    error::DataError,
    exchange::{Venue, VenueResolver},
    replica::{Registry, Replicator},
    symbol::MarketSymbol,
};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Serves point-in-time order book snapshots to RPC callers.
///
/// Requests are answered from a live [`Book`](crate::books::Book) replica when one exists.
/// A registry miss lazily starts replication in the background and answers from the venue's
/// snapshot facility in the foreground, so callers are never blocked on replica warm-up.
/// The warming set guarantees at most one replicator per `(venue, symbol)` at a time.
#[derive(Debug)]
pub struct SnapshotCoordinator {
    resolver: Arc<VenueResolver>,
    registry: Arc<Registry>,
    warming: Arc<DashMap<(Venue, MarketSymbol), ()>>,
    settings: ReplicationSettings,
    _sweeper: tokio::task::JoinHandle<()>,
}

impl SnapshotCoordinator {
    /// Assemble the coordinator and spawn the registry's eviction sweeper.
    pub fn new(resolver: Arc<VenueResolver>, registry: Arc<Registry>, config: &Config) -> Self {
        let sweeper = Arc::clone(&registry).spawn_sweeper(config.sweeper_interval);

        Self {
            resolver,
            registry,
            warming: Arc::new(DashMap::new()),
            settings: config.replication,
            _sweeper: sweeper,
        }
    }

    /// Serve a snapshot for the provided market, truncated to the top `limit` levels per
    /// side (`limit == 0` means unlimited).
    pub async fn snapshot(
        &self,
        venue: Venue,
        symbol: &MarketSymbol,
        limit: usize,
    ) -> Result<OrderBookSnapshot, DataError> {
        // A replica is already warming: answer from the venue, never start a second one.
        if self.warming.contains_key(&(venue, symbol.clone())) {
            debug!(%venue, %symbol, "replica warming, serving venue snapshot");
            return self.resolver.sync_api(venue)?.snapshot(symbol, limit).await;
        }

        match self.registry.get(venue, symbol) {
            Ok(book) => Ok(book.snapshot(limit)),
            Err(DataError::NotFound { .. }) => {
                self.start_replication(venue, symbol);
                self.resolver.sync_api(venue)?.snapshot(symbol, limit).await
            }
            Err(error) => Err(error),
        }
    }

    /// Mark the key as warming and spawn background replication for it. The first inserter
    /// wins; concurrent callers for the same key spawn nothing.
    fn start_replication(&self, venue: Venue, symbol: &MarketSymbol) {
        let key = (venue, symbol.clone());
        if self.warming.insert(key.clone(), ()).is_some() {
            return;
        }

        let apis = match (
            self.resolver.stream_api(venue),
            self.resolver.sync_api(venue),
            self.resolver.validator(venue),
        ) {
            (Ok(stream_api), Ok(sync_api), Ok(validator)) => (stream_api, sync_api, validator),
            _ => {
                self.warming.remove(&key);
                return;
            }
        };

        let registry = Arc::clone(&self.registry);
        let warming = Arc::clone(&self.warming);
        let settings = self.settings;
        let symbol = symbol.clone();

        tokio::spawn(async move {
            let (stream_api, sync_api, validator) = apis;
            let replicator =
                Replicator::new(venue, symbol.clone(), stream_api, sync_api, validator, settings);

            match replicator.start().await {
                Ok(handle) => {
                    registry.add(Arc::clone(handle.book()));
                    info!(%venue, %symbol, "order book replica published to registry");
                }
                Err(error) => {
                    warn!(%venue, %symbol, %error, "failed to start order book replication");
                }
            }

            warming.remove(&key);
        });
    }
}

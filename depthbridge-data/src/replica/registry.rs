use crate::{
    books::{Book, BookStatus},
    error::DataError,
    exchange::Venue,
    symbol::MarketSymbol,
};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use tracing::info;

/// Process-wide mapping `(venue, symbol) -> Book`, read-heavy, with at most one entry per
/// key at any time.
#[derive(Debug, Default)]
pub struct Registry {
    storage: RwLock<FnvHashMap<(Venue, MarketSymbol), Arc<Book>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert: a successful re-replication supersedes a retired entry for the
    /// same key.
    pub fn add(&self, book: Arc<Book>) {
        let venue = book.venue();
        let key = (venue, book.symbol().clone());
        self.storage.write().insert(key, book);
        self.update_gauge(venue);
    }

    pub fn get(&self, venue: Venue, symbol: &MarketSymbol) -> Result<Arc<Book>, DataError> {
        self.storage
            .read()
            .get(&(venue, symbol.clone()))
            .cloned()
            .ok_or_else(|| DataError::NotFound {
                venue,
                symbol: symbol.clone(),
            })
    }

    /// Idempotent removal.
    pub fn remove(&self, venue: Venue, symbol: &MarketSymbol) {
        let removed = self.storage.write().remove(&(venue, symbol.clone()));
        if removed.is_some() {
            self.update_gauge(venue);
        }
    }

    /// Number of live replicas for the provided venue.
    pub fn book_count(&self, venue: Venue) -> usize {
        self.storage
            .read()
            .keys()
            .filter(|(entry_venue, _)| *entry_venue == venue)
            .count()
    }

    fn update_gauge(&self, venue: Venue) {
        metrics::gauge!("depthbridge_open_order_books", "venue" => venue.as_str())
            .set(self.book_count(venue) as f64);
    }

    /// Keys whose book has transitioned to [`Outdated`](BookStatus::Outdated), collected
    /// under read access only.
    fn outdated_keys(&self) -> Vec<(Venue, MarketSymbol)> {
        self.storage
            .read()
            .iter()
            .filter(|(_, book)| book.status() == BookStatus::Outdated)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Spawn the background sweeper: wake every `interval`, collect outdated keys under the
    /// read lock, then remove each one.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                for (venue, symbol) in self.outdated_keys() {
                    info!(%venue, %symbol, "sweeping outdated order book replica");
                    self.remove(venue, &symbol);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::books::{OrderBookSnapshot, SnapshotSource};
    use std::str::FromStr;

    fn book(venue: Venue, symbol: &str) -> Arc<Book> {
        Arc::new(Book::from_snapshot(
            venue,
            MarketSymbol::from_str(symbol).unwrap(),
            &OrderBookSnapshot {
                source: SnapshotSource::Venue,
                last_sequence: 1,
                bids: vec![],
                asks: vec![],
            },
        ))
    }

    #[test]
    fn test_add_get_remove() {
        let registry = Registry::new();
        let symbol = MarketSymbol::from_str("btc_usdt").unwrap();

        assert!(matches!(
            registry.get(Venue::Binance, &symbol),
            Err(DataError::NotFound { .. })
        ));

        registry.add(book(Venue::Binance, "btc_usdt"));
        assert!(registry.get(Venue::Binance, &symbol).is_ok());
        assert_eq!(registry.book_count(Venue::Binance), 1);
        assert_eq!(registry.book_count(Venue::Kucoin), 0);

        // Same key on another venue is independent.
        registry.add(book(Venue::Kucoin, "btc_usdt"));
        assert_eq!(registry.book_count(Venue::Kucoin), 1);

        registry.remove(Venue::Binance, &symbol);
        assert!(registry.get(Venue::Binance, &symbol).is_err());

        // Removal is idempotent.
        registry.remove(Venue::Binance, &symbol);
        assert_eq!(registry.book_count(Venue::Binance), 0);
    }

    #[test]
    fn test_add_overwrites_prior_entry() {
        let registry = Registry::new();
        let symbol = MarketSymbol::from_str("btc_usdt").unwrap();

        let retired = book(Venue::Binance, "btc_usdt");
        retired.mark_outdated();
        registry.add(Arc::clone(&retired));

        let replacement = book(Venue::Binance, "btc_usdt");
        registry.add(Arc::clone(&replacement));

        let resolved = registry.get(Venue::Binance, &symbol).unwrap();
        assert!(Arc::ptr_eq(&resolved, &replacement));
        assert_eq!(registry.book_count(Venue::Binance), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_outdated_books() {
        let registry = Arc::new(Registry::new());
        let symbol = MarketSymbol::from_str("btc_usdt").unwrap();
        let eth = MarketSymbol::from_str("eth_usdt").unwrap();

        let outdated = book(Venue::Binance, "btc_usdt");
        outdated.mark_outdated();
        registry.add(outdated);
        registry.add(book(Venue::Binance, "eth_usdt"));

        let sweeper = Arc::clone(&registry).spawn_sweeper(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(registry.get(Venue::Binance, &symbol).is_err());
        assert!(registry.get(Venue::Binance, &eth).is_ok());
        sweeper.abort();
    }
}

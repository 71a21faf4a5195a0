use crate::{exchange::Venue, symbol::MarketSymbol};
use chrono::{DateTime, Utc};
use derive_more::Constructor;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, marker::PhantomData};
use tracing::debug;

/// Per-venue sequence validators classifying incoming depth diffs.
pub mod validator;

/// Normalised depthbridge order book [`Level`].
///
/// Prices & amounts are exact decimals, serialized as decimal strings preserving the venue's
/// precision.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct Level {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

impl Level {
    pub fn new<T>(price: T, amount: T) -> Self
    where
        T: Into<Decimal>,
    {
        Self {
            price: price.into(),
            amount: amount.into(),
        }
    }
}

impl<T> From<(T, T)> for Level
where
    T: Into<Decimal>,
{
    fn from((price, amount): (T, T)) -> Self {
        Self::new(price, amount)
    }
}

/// One sparse per-price replacement row of an [`OrderBookUpdate`].
///
/// `amount == 0` means the price level is deleted. Kucoin rows additionally carry their own
/// sequence number, used to filter the first diff spliced after a snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DiffLevel {
    pub price: Decimal,
    pub amount: Decimal,
    pub sequence: Option<u64>,
}

impl DiffLevel {
    pub fn new<T>(price: T, amount: T) -> Self
    where
        T: Into<Decimal>,
    {
        Self {
            price: price.into(),
            amount: amount.into(),
            sequence: None,
        }
    }

    pub fn with_sequence<T>(price: T, amount: T, sequence: u64) -> Self
    where
        T: Into<Decimal>,
    {
        Self {
            price: price.into(),
            amount: amount.into(),
            sequence: Some(sequence),
        }
    }
}

impl From<DiffLevel> for Level {
    fn from(level: DiffLevel) -> Self {
        Self {
            price: level.price,
            amount: level.amount,
        }
    }
}

/// Incremental depth diff carrying an inclusive sequence range.
///
/// `sequence_start == sequence_end` for venues publishing single-sequence diffs.
#[derive(Debug, Clone, PartialEq, Constructor)]
pub struct OrderBookUpdate {
    pub sequence_start: u64,
    pub sequence_end: u64,
    pub bids: Vec<DiffLevel>,
    pub asks: Vec<DiffLevel>,
}

/// Origin of an [`OrderBookSnapshot`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum SnapshotSource {
    Unknown,
    /// Produced by the venue's snapshot facility directly.
    Venue,
    /// Taken from a live local [`Book`] replica.
    LocalReplica,
}

/// Full book delivery with a single anchoring sequence.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrderBookSnapshot {
    pub source: SnapshotSource,
    pub last_sequence: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// Health of a [`Book`] replica.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum BookStatus {
    Healthy,
    /// Terminal: the replica diverged from the venue sequence and is no longer mutated.
    Outdated,
}

/// Ordering discipline of one side of a [`Book`].
///
/// [`Side::rank`] orders two prices so that levels nearer the top of the side sort first:
/// descending for bids, ascending for asks. The ladder code is written once against this
/// trait instead of per side.
pub trait Side
where
    Self: std::fmt::Debug + Copy + Send + Sync,
{
    const NAME: &'static str;

    fn rank(a: Decimal, b: Decimal) -> Ordering;
}

/// Marker for the bid side (buyers): the best price is the highest.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bids;

impl Side for Bids {
    const NAME: &'static str = "bids";

    fn rank(a: Decimal, b: Decimal) -> Ordering {
        b.cmp(&a)
    }
}

/// Marker for the ask side (sellers): the best price is the lowest.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Asks;

impl Side for Asks {
    const NAME: &'static str = "asks";

    fn rank(a: Decimal, b: Decimal) -> Ordering {
        a.cmp(&b)
    }
}

/// One side of the ladder: [`Level`]s kept sorted best-first with no duplicate prices and
/// no zero-quantity levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookSide<S> {
    levels: Vec<Level>,
    side: PhantomData<S>,
}

impl<S> OrderBookSide<S>
where
    S: Side,
{
    /// Build a sorted side from levels in any order.
    pub fn new<Iter, L>(levels: Iter) -> Self
    where
        Iter: IntoIterator<Item = L>,
        L: Into<Level>,
    {
        let mut levels = levels.into_iter().map(L::into).collect::<Vec<_>>();
        levels.sort_unstable_by(|a, b| S::rank(a.price, b.price));

        Self {
            levels,
            side: PhantomData,
        }
    }

    /// Levels sorted best-first.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    fn position(&self, price: Decimal) -> Result<usize, usize> {
        self.levels
            .binary_search_by(|probe| S::rank(probe.price, price))
    }

    /// Fold one sparse replacement row into the side.
    ///
    /// Venues publish absolute per-price quantities, not deltas: a row overwrites whatever
    /// quantity its price currently has, a zero quantity deletes the price level, and an
    /// unknown price is inserted at its rank.
    pub fn replace(&mut self, row: DiffLevel) {
        match (self.position(row.price), row.amount.is_zero()) {
            (Ok(at), true) => {
                self.levels.remove(at);
            }
            (Ok(at), false) => self.levels[at].amount = row.amount,
            (Err(at), false) => self.levels.insert(at, Level::from(row)),
            (Err(_), true) => {
                // Deleting a price the replica never held is normal on a fresh anchor.
                debug!(side = S::NAME, price = %row.price, "delete for absent price level");
            }
        }
    }

    /// Fold every row of one diff side into the ladder, in wire order.
    pub fn replace_all(&mut self, rows: &[DiffLevel]) {
        for row in rows {
            self.replace(*row);
        }
    }
}

#[derive(Debug)]
struct BookState {
    last_sequence: u64,
    last_applied: DateTime<Utc>,
    status: BookStatus,
    bids: OrderBookSide<Bids>,
    asks: OrderBookSide<Asks>,
}

/// Live order book replica for one market on one venue.
///
/// Mutated only by its owning [`Replicator`](crate::replica::Replicator); read concurrently
/// via [`Book::snapshot`]. A reader-writer lock around the ladder state guarantees a reader
/// never observes a half-applied update.
#[derive(Debug)]
pub struct Book {
    venue: Venue,
    symbol: MarketSymbol,
    state: RwLock<BookState>,
}

impl Book {
    /// Construct a [`Book`] anchored to the provided venue snapshot.
    pub fn from_snapshot(
        venue: Venue,
        symbol: MarketSymbol,
        snapshot: &OrderBookSnapshot,
    ) -> Self {
        Self {
            venue,
            symbol,
            state: RwLock::new(BookState {
                last_sequence: snapshot.last_sequence,
                last_applied: Utc::now(),
                status: BookStatus::Healthy,
                bids: OrderBookSide::new(snapshot.bids.iter().copied()),
                asks: OrderBookSide::new(snapshot.asks.iter().copied()),
            }),
        }
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    pub fn symbol(&self) -> &MarketSymbol {
        &self.symbol
    }

    pub fn status(&self) -> BookStatus {
        self.state.read().status
    }

    pub fn last_sequence(&self) -> u64 {
        self.state.read().last_sequence
    }

    /// Wall-clock time of the most recent successful [`Book::apply`].
    pub fn last_applied(&self) -> DateTime<Utc> {
        self.state.read().last_applied
    }

    /// Apply an incremental depth diff to the replica.
    ///
    /// An update whose `sequence_end` does not advance `last_sequence` is rejected silently,
    /// making replays of outdated diffs idempotent. Once the book is
    /// [`Outdated`](BookStatus::Outdated) no further mutation occurs.
    pub fn apply(&self, update: &OrderBookUpdate) {
        let mut state = self.state.write();

        if state.status == BookStatus::Outdated {
            return;
        }

        if update.sequence_end <= state.last_sequence {
            return;
        }

        state.last_sequence = update.sequence_end;
        state.last_applied = Utc::now();
        state.bids.replace_all(&update.bids);
        state.asks.replace_all(&update.asks);
    }

    /// Generate a point-in-time [`OrderBookSnapshot`] truncated to the top `limit` levels per
    /// side (`limit == 0` means unlimited), tagged [`SnapshotSource::LocalReplica`].
    ///
    /// The ladder is copied under the read lock; truncation happens outside it.
    pub fn snapshot(&self, limit: usize) -> OrderBookSnapshot {
        let (last_sequence, mut bids, mut asks) = {
            let state = self.state.read();
            (
                state.last_sequence,
                state.bids.levels().to_vec(),
                state.asks.levels().to_vec(),
            )
        };

        if limit > 0 {
            bids.truncate(limit);
            asks.truncate(limit);
        }

        OrderBookSnapshot {
            source: SnapshotSource::LocalReplica,
            last_sequence,
            bids,
            asks,
        }
    }

    /// Transition the replica to [`Outdated`](BookStatus::Outdated). Terminal.
    pub fn mark_outdated(&self) {
        self.state.write().status = BookStatus::Outdated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    fn book(last_sequence: u64, bids: Vec<Level>, asks: Vec<Level>) -> Book {
        Book::from_snapshot(
            Venue::Binance,
            MarketSymbol::from_str("btc_usdt").unwrap(),
            &OrderBookSnapshot {
                source: SnapshotSource::Venue,
                last_sequence,
                bids,
                asks,
            },
        )
    }

    #[test]
    fn test_side_replace_keeps_rank_order() {
        let mut bids = OrderBookSide::<Bids>::new(vec![Level::new(90, 1), Level::new(100, 1)]);
        bids.replace(DiffLevel::new(95, 2));
        bids.replace(DiffLevel::new(100, 0));
        // Deleting an absent price changes nothing.
        bids.replace(DiffLevel::new(85, 0));
        assert_eq!(bids.levels(), &[Level::new(95, 2), Level::new(90, 1)]);

        let mut asks = OrderBookSide::<Asks>::new(vec![Level::new(110, 1), Level::new(105, 1)]);
        asks.replace(DiffLevel::new(107, 3));
        asks.replace(DiffLevel::new(105, 5));
        assert_eq!(
            asks.levels(),
            &[
                Level::new(105, 5),
                Level::new(107, 3),
                Level::new(110, 1),
            ]
        );
    }

    #[test]
    fn test_apply_replaces_and_deletes_levels() {
        // Anchoring snapshot per the deletion scenario:
        // asks=[(10100, 1.5), (10200, 2.5)], bids=[(10000, 1), (9900, 2)], last=123
        let book = book(
            123,
            vec![Level::new(10000, 1), Level::new(9900, 2)],
            vec![
                Level::new(dec!(10100), dec!(1.5)),
                Level::new(dec!(10200), dec!(2.5)),
            ],
        );

        book.apply(&OrderBookUpdate::new(
            124,
            124,
            vec![DiffLevel::new(9800, 3)],
            vec![DiffLevel::new(10300, 2), DiffLevel::new(10100, 0)],
        ));

        assert_eq!(book.last_sequence(), 124);
        let snapshot = book.snapshot(0);
        assert_eq!(
            snapshot.asks,
            vec![
                Level::new(dec!(10200), dec!(2.5)),
                Level::new(dec!(10300), dec!(2)),
            ]
        );
        assert_eq!(
            snapshot.bids,
            vec![
                Level::new(10000, 1),
                Level::new(9900, 2),
                Level::new(9800, 3),
            ]
        );
    }

    #[test]
    fn test_apply_outdated_update_is_noop() {
        struct TestCase {
            update: OrderBookUpdate,
            expected_last_sequence: u64,
            expected_bid_count: usize,
        }

        let tests = vec![
            TestCase {
                // TC0: sequence_end == last_sequence => no-op
                update: OrderBookUpdate::new(99, 100, vec![DiffLevel::new(50, 9)], vec![]),
                expected_last_sequence: 100,
                expected_bid_count: 1,
            },
            TestCase {
                // TC1: sequence_end < last_sequence => no-op
                update: OrderBookUpdate::new(90, 95, vec![DiffLevel::new(50, 9)], vec![]),
                expected_last_sequence: 100,
                expected_bid_count: 1,
            },
            TestCase {
                // TC2: sequence_end > last_sequence => applied
                update: OrderBookUpdate::new(101, 105, vec![DiffLevel::new(50, 9)], vec![]),
                expected_last_sequence: 105,
                expected_bid_count: 2,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let book = book(100, vec![Level::new(100, 1)], vec![Level::new(110, 1)]);
            book.apply(&test.update);
            assert_eq!(
                book.last_sequence(),
                test.expected_last_sequence,
                "TC{index} failed"
            );
            assert_eq!(
                book.snapshot(0).bids.len(),
                test.expected_bid_count,
                "TC{index} failed"
            );
        }
    }

    #[test]
    fn test_apply_after_mark_outdated_is_noop() {
        let book = book(100, vec![Level::new(100, 1)], vec![Level::new(110, 1)]);
        book.mark_outdated();
        book.apply(&OrderBookUpdate::new(
            101,
            105,
            vec![DiffLevel::new(50, 9)],
            vec![],
        ));

        assert_eq!(book.status(), BookStatus::Outdated);
        assert_eq!(book.last_sequence(), 100);
        assert_eq!(book.snapshot(0).bids, vec![Level::new(100, 1)]);
    }

    #[test]
    fn test_snapshot_truncates_to_top_levels() {
        // Preloaded replica per the hot-path scenario.
        let book = book(
            100,
            vec![Level::new(10000, 1), Level::new(9900, 2)],
            vec![
                Level::new(dec!(10100), dec!(1.5)),
                Level::new(dec!(10200), dec!(2.5)),
            ],
        );

        struct TestCase {
            limit: usize,
            expected_bids: usize,
            expected_asks: usize,
        }

        let tests = vec![
            TestCase {
                // TC0: limit 0 => unlimited
                limit: 0,
                expected_bids: 2,
                expected_asks: 2,
            },
            TestCase {
                // TC1: limit below depth truncates
                limit: 1,
                expected_bids: 1,
                expected_asks: 1,
            },
            TestCase {
                // TC2: limit above depth returns everything
                limit: 5,
                expected_bids: 2,
                expected_asks: 2,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let snapshot = book.snapshot(test.limit);
            assert_eq!(snapshot.source, SnapshotSource::LocalReplica, "TC{index}");
            assert_eq!(snapshot.last_sequence, 100, "TC{index} failed");
            assert_eq!(snapshot.bids.len(), test.expected_bids, "TC{index} failed");
            assert_eq!(snapshot.asks.len(), test.expected_asks, "TC{index} failed");
            // Top-of-book first in both directions
            assert_eq!(snapshot.bids[0], Level::new(10000, 1), "TC{index} failed");
            assert_eq!(
                snapshot.asks[0],
                Level::new(dec!(10100), dec!(1.5)),
                "TC{index} failed"
            );
        }
    }

    #[test]
    fn test_book_invariants_hold_after_apply_sequence() {
        let book = book(
            0,
            vec![Level::new(100, 1), Level::new(90, 1)],
            vec![Level::new(110, 1), Level::new(120, 1)],
        );

        // Interleave inserts, replacements and deletions across both sides.
        let updates = vec![
            OrderBookUpdate::new(1, 1, vec![DiffLevel::new(95, 2)], vec![DiffLevel::new(115, 2)]),
            OrderBookUpdate::new(2, 2, vec![DiffLevel::new(100, 0)], vec![DiffLevel::new(120, 5)]),
            OrderBookUpdate::new(3, 3, vec![DiffLevel::new(105, 1)], vec![DiffLevel::new(110, 0)]),
            // Replay of an already-applied sequence must change nothing.
            OrderBookUpdate::new(2, 2, vec![DiffLevel::new(1, 1)], vec![]),
        ];

        let mut prev_sequence = 0;
        for update in &updates {
            book.apply(update);
            assert!(book.last_sequence() >= prev_sequence);
            prev_sequence = book.last_sequence();

            let snapshot = book.snapshot(0);
            assert!(
                snapshot
                    .bids
                    .windows(2)
                    .all(|pair| pair[0].price > pair[1].price),
                "bids not strictly descending"
            );
            assert!(
                snapshot
                    .asks
                    .windows(2)
                    .all(|pair| pair[0].price < pair[1].price),
                "asks not strictly ascending"
            );
            assert!(
                snapshot
                    .bids
                    .iter()
                    .chain(snapshot.asks.iter())
                    .all(|level| level.amount > Decimal::ZERO),
                "zero-quantity level retained"
            );
        }

        assert_eq!(book.last_sequence(), 3);
    }

    #[test]
    fn test_concurrent_snapshot_never_observes_torn_state() {
        // Every apply rewrites the single bid's amount to the update sequence, so any
        // snapshot must observe amount == last_sequence.
        let book = std::sync::Arc::new(book(0, vec![Level::new(100, 1)], vec![]));

        let writer = {
            let book = std::sync::Arc::clone(&book);
            std::thread::spawn(move || {
                for sequence in 1..=1000u64 {
                    book.apply(&OrderBookUpdate::new(
                        sequence,
                        sequence,
                        vec![DiffLevel::new(
                            Decimal::from(100),
                            Decimal::from(sequence),
                        )],
                        vec![],
                    ));
                }
            })
        };

        let reader = {
            let book = std::sync::Arc::clone(&book);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let snapshot = book.snapshot(0);
                    if snapshot.last_sequence == 0 {
                        continue;
                    }
                    assert_eq!(
                        snapshot.bids[0].amount,
                        Decimal::from(snapshot.last_sequence),
                        "snapshot ladder does not correspond to its sequence"
                    );
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
    }
}

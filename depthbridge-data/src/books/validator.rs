use crate::books::OrderBookUpdate;

/// Verdict of a [`DiffValidator`] for one incoming depth diff against a book's current
/// `last_sequence`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DiffClassification {
    /// In sequence - apply to the book.
    Apply,
    /// Entirely before the book's `last_sequence` - skip silently.
    Outdated,
    /// Leaves a gap after the book's `last_sequence` - counts towards divergence.
    OutOfSequence,
}

/// Per-venue predicate classifying an incoming depth diff.
///
/// Venues disagree on how a diff's sequence range relates to the replica's `last_sequence`,
/// so each venue dialect gets its own implementation. The classification drives the
/// [`Replicator`](crate::replica::Replicator)'s divergence counter.
pub trait DiffValidator
where
    Self: Send + Sync + std::fmt::Debug,
{
    /// Classify `update` against the book's `last_sequence`. `first_applied` communicates
    /// whether a diff has already been spliced onto the anchoring snapshot.
    fn classify(
        &self,
        update: &OrderBookUpdate,
        last_sequence: u64,
        first_applied: bool,
    ) -> DiffClassification;

    /// Venue-specific preparation of the first diff spliced after a snapshot. Defaults to
    /// the identity.
    fn filter_first(&self, update: OrderBookUpdate, _last_sequence: u64) -> OrderBookUpdate {
        update
    }
}

/// Binance dialect: diffs carry `U = sequence_start`, `u = sequence_end`.
///
/// Binance: How To Manage A Local OrderBook Correctly
/// 1. Drop any event where `u` is <= `lastUpdateId` in the snapshot.
/// 2. The first processed event should have `U <= lastUpdateId+1` AND `u >= lastUpdateId+1`.
/// 3. While listening to the stream, each new event's `U` should be equal to the previous
///    event's `u+1`.
///
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#how-to-manage-a-local-order-book-correctly>
#[derive(Debug, Copy, Clone, Default)]
pub struct BinanceDiffValidator;

impl DiffValidator for BinanceDiffValidator {
    fn classify(
        &self,
        update: &OrderBookUpdate,
        last_sequence: u64,
        first_applied: bool,
    ) -> DiffClassification {
        if update.sequence_end <= last_sequence {
            return DiffClassification::Outdated;
        }

        let expected_next = last_sequence + 1;
        let valid = if first_applied {
            update.sequence_start == expected_next
        } else {
            update.sequence_start <= expected_next && expected_next <= update.sequence_end
        };

        if valid {
            DiffClassification::Apply
        } else {
            DiffClassification::OutOfSequence
        }
    }
}

/// Kucoin dialect: diffs carry `sequenceStart`/`sequenceEnd`, and each changed row carries
/// its own sequence number.
///
/// A diff is applicable whenever its range straddles `last_sequence + 1`. The first diff
/// spliced after a snapshot additionally drops rows already covered by the snapshot (row
/// sequence <= the snapshot sequence).
///
/// See docs: <https://www.kucoin.com/docs/websocket/spot-trading/public-channels/level2-market-data>
#[derive(Debug, Copy, Clone, Default)]
pub struct KucoinDiffValidator;

impl DiffValidator for KucoinDiffValidator {
    fn classify(
        &self,
        update: &OrderBookUpdate,
        last_sequence: u64,
        _first_applied: bool,
    ) -> DiffClassification {
        if update.sequence_end <= last_sequence {
            return DiffClassification::Outdated;
        }

        let expected_next = last_sequence + 1;
        if update.sequence_start <= expected_next && expected_next <= update.sequence_end {
            DiffClassification::Apply
        } else {
            DiffClassification::OutOfSequence
        }
    }

    fn filter_first(&self, mut update: OrderBookUpdate, last_sequence: u64) -> OrderBookUpdate {
        let newer_than_snapshot =
            |sequence: &Option<u64>| sequence.is_none_or(|sequence| sequence > last_sequence);

        update.bids.retain(|row| newer_than_snapshot(&row.sequence));
        update.asks.retain(|row| newer_than_snapshot(&row.sequence));
        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::books::DiffLevel;

    fn update(sequence_start: u64, sequence_end: u64) -> OrderBookUpdate {
        OrderBookUpdate::new(sequence_start, sequence_end, vec![], vec![])
    }

    #[test]
    fn test_binance_classify_first_update() {
        struct TestCase {
            input: OrderBookUpdate,
            last_sequence: u64,
            expected: DiffClassification,
        }

        let tests = vec![
            TestCase {
                // TC0: valid first update straddling last_sequence + 1
                input: update(100, 110),
                last_sequence: 100,
                expected: DiffClassification::Apply,
            },
            TestCase {
                // TC1: u <= last_sequence => outdated
                input: update(90, 100),
                last_sequence: 100,
                expected: DiffClassification::Outdated,
            },
            TestCase {
                // TC2: U > last_sequence + 1 => gap
                input: update(102, 110),
                last_sequence: 100,
                expected: DiffClassification::OutOfSequence,
            },
            TestCase {
                // TC3: exact single-sequence continuation
                input: update(101, 101),
                last_sequence: 100,
                expected: DiffClassification::Apply,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = BinanceDiffValidator.classify(&test.input, test.last_sequence, false);
            assert_eq!(actual, test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_binance_classify_next_update() {
        struct TestCase {
            input: OrderBookUpdate,
            last_sequence: u64,
            expected: DiffClassification,
        }

        let tests = vec![
            TestCase {
                // TC0: U == last_sequence + 1 => apply
                input: update(101, 110),
                last_sequence: 100,
                expected: DiffClassification::Apply,
            },
            TestCase {
                // TC1: straddling no longer acceptable once anchored
                input: update(100, 110),
                last_sequence: 100,
                expected: DiffClassification::OutOfSequence,
            },
            TestCase {
                // TC2: gap => out of sequence
                input: update(120, 130),
                last_sequence: 100,
                expected: DiffClassification::OutOfSequence,
            },
            TestCase {
                // TC3: replay => outdated
                input: update(95, 100),
                last_sequence: 100,
                expected: DiffClassification::Outdated,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = BinanceDiffValidator.classify(&test.input, test.last_sequence, true);
            assert_eq!(actual, test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_binance_splice_sequence() {
        // Stream emits (100,102), (103,105), (106,108) and the snapshot anchors at 104:
        // (100,102) is outdated, (103,105) is the valid first diff, (106,108) follows on.
        let validator = BinanceDiffValidator;

        assert_eq!(
            validator.classify(&update(100, 102), 104, false),
            DiffClassification::Outdated
        );
        assert_eq!(
            validator.classify(&update(103, 105), 104, false),
            DiffClassification::Apply
        );
        assert_eq!(
            validator.classify(&update(106, 108), 105, true),
            DiffClassification::Apply
        );
    }

    #[test]
    fn test_kucoin_classify() {
        struct TestCase {
            input: OrderBookUpdate,
            last_sequence: u64,
            expected: DiffClassification,
        }

        let tests = vec![
            TestCase {
                // TC0: range straddles last_sequence + 1
                input: update(95, 105),
                last_sequence: 100,
                expected: DiffClassification::Apply,
            },
            TestCase {
                // TC1: entirely behind the replica
                input: update(95, 100),
                last_sequence: 100,
                expected: DiffClassification::Outdated,
            },
            TestCase {
                // TC2: starts past the next expected sequence
                input: update(102, 110),
                last_sequence: 100,
                expected: DiffClassification::OutOfSequence,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = KucoinDiffValidator.classify(&test.input, test.last_sequence, true);
            assert_eq!(actual, test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_kucoin_filter_first_drops_rows_covered_by_snapshot() {
        let input = OrderBookUpdate::new(
            98,
            103,
            vec![
                DiffLevel::with_sequence(50, 1, 99),
                DiffLevel::with_sequence(51, 1, 101),
            ],
            vec![
                DiffLevel::with_sequence(60, 1, 100),
                DiffLevel::with_sequence(61, 1, 103),
            ],
        );

        let filtered = KucoinDiffValidator.filter_first(input, 100);

        assert_eq!(filtered.bids, vec![DiffLevel::with_sequence(51, 1, 101)]);
        assert_eq!(filtered.asks, vec![DiffLevel::with_sequence(61, 1, 103)]);
    }
}

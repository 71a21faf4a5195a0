use crate::{
    DepthDiffStream, DiffEvent, StreamApi, SyncApi,
    books::{
        Book,
        validator::{DiffClassification, DiffValidator},
    },
    config::ReplicationSettings,
    error::DataError,
    exchange::Venue,
    symbol::MarketSymbol,
};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Handle on a running replica.
///
/// The replica runs detached; dropping the handle does not stop it. [`ReplicaHandle::shutdown`]
/// retires the replica explicitly: the book transitions to `Outdated`, both tasks return,
/// and the stream subscription reference is released.
#[derive(Debug)]
pub struct ReplicaHandle {
    book: Arc<Book>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ReplicaHandle {
    pub fn book(&self) -> &Arc<Book> {
        &self.book
    }

    /// Retire the replica.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Per-`(venue, symbol)` state machine maintaining one [`Book`] replica.
///
/// Lifecycle: subscribe to the diff stream and buffer diffs (*warming*), fetch an anchoring
/// snapshot (*anchoring*), drain the buffer discarding pre-snapshot diffs and apply the
/// first valid one under the venue's sequence rules (*splicing*), then apply diffs as they
/// arrive (*applying*) until divergence or shutdown retires the replica (*retired*).
#[derive(Debug)]
pub struct Replicator {
    venue: Venue,
    symbol: MarketSymbol,
    stream_api: Arc<dyn StreamApi>,
    sync_api: Arc<dyn SyncApi>,
    validator: Arc<dyn DiffValidator>,
    settings: ReplicationSettings,
}

impl Replicator {
    pub fn new(
        venue: Venue,
        symbol: MarketSymbol,
        stream_api: Arc<dyn StreamApi>,
        sync_api: Arc<dyn SyncApi>,
        validator: Arc<dyn DiffValidator>,
        settings: ReplicationSettings,
    ) -> Self {
        Self {
            venue,
            symbol,
            stream_api,
            sync_api,
            validator,
            settings,
        }
    }

    /// Warm up and publish the replica: subscribe, buffer the first diffs, anchor to a venue
    /// snapshot, then hand the steady state to the apply loop.
    ///
    /// Returns once the anchored [`Book`] exists; failure to subscribe or to fetch the
    /// anchoring snapshot is returned to the caller and the replicator stops.
    pub async fn start(self) -> Result<ReplicaHandle, DataError> {
        let stream = self.stream_api.depth_diff_stream(&self.symbol).await?;
        debug!(
            venue = %self.venue,
            symbol = %self.symbol,
            topic = stream.topic(),
            "subscribed to depth diff stream"
        );

        let buffer = Arc::new(Mutex::new(VecDeque::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let (first_diff_tx, first_diff_rx) = oneshot::channel();

        tokio::spawn(buffer_stream(
            stream,
            Arc::clone(&buffer),
            first_diff_tx,
            shutdown_rx.clone(),
        ));

        // The anchoring snapshot must not be requested before the stream is live, so wait
        // for both the first buffered diff and the warm-up floor - whichever is later.
        let (first_diff, _) = tokio::join!(
            first_diff_rx,
            tokio::time::sleep(self.settings.stream_warmup_floor)
        );
        if first_diff.is_err() {
            let _ = shutdown_tx.send(true);
            return Err(DataError::Socket(String::from(
                "depth diff stream ended during warm-up",
            )));
        }

        let snapshot = match self
            .sync_api
            .snapshot(&self.symbol, self.settings.anchor_depth)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(error) => {
                let _ = shutdown_tx.send(true);
                return Err(error);
            }
        };

        let book = Arc::new(Book::from_snapshot(
            self.venue,
            self.symbol.clone(),
            &snapshot,
        ));
        info!(
            venue = %self.venue,
            symbol = %self.symbol,
            last_sequence = snapshot.last_sequence,
            "anchored order book replica"
        );

        tokio::spawn(apply_loop(
            Arc::clone(&book),
            buffer,
            Arc::clone(&self.validator),
            self.settings,
            shutdown_rx,
            Arc::clone(&shutdown_tx),
        ));

        Ok(ReplicaHandle {
            book,
            shutdown: shutdown_tx,
        })
    }
}

/// Sole producer into the diff buffer: push every received event in wire order, signalling
/// once the first diff has been buffered.
async fn buffer_stream(
    mut stream: DepthDiffStream,
    buffer: Arc<Mutex<VecDeque<DiffEvent>>>,
    first_diff_tx: oneshot::Sender<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut first_diff_tx = Some(first_diff_tx);

    loop {
        tokio::select! {
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
            event = stream.recv() => match event {
                Some(event) => {
                    buffer.lock().push_back(event);
                    if let Some(tx) = first_diff_tx.take() {
                        let _ = tx.send(());
                    }
                }
                // Stream client dropped the topic.
                None => return,
            }
        }
    }
}

/// Sole consumer of the diff buffer: validate & apply diffs in FIFO order, retiring the
/// replica once the out-of-sequence count reaches the configured threshold.
async fn apply_loop(
    book: Arc<Book>,
    buffer: Arc<Mutex<VecDeque<DiffEvent>>>,
    validator: Arc<dyn DiffValidator>,
    settings: ReplicationSettings,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) {
    let venue = book.venue();
    let symbol = book.symbol().clone();
    let mut first_applied = false;
    let mut out_of_sequence_count: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let next = buffer.lock().pop_front();
        let Some(event) = next else {
            tokio::select! {
                _ = tokio::time::sleep(settings.buffer_poll_interval) => {}
                result = shutdown_rx.changed() => {
                    if result.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        let update = match event {
            DiffEvent::Update(update) => update,
            DiffEvent::Reconnected => {
                // Diffs spanning the reconnect gap are unverifiable; the next snapshot
                // request re-replicates from a fresh anchor.
                warn!(%venue, %symbol, "stream reconnected under live replica, retiring");
                break;
            }
        };

        match validator.classify(&update, book.last_sequence(), first_applied) {
            DiffClassification::Outdated => continue,
            DiffClassification::Apply => {
                let update = if first_applied {
                    update
                } else {
                    validator.filter_first(update, book.last_sequence())
                };
                book.apply(&update);
                first_applied = true;
            }
            DiffClassification::OutOfSequence => {
                out_of_sequence_count += 1;
                warn!(
                    %venue,
                    %symbol,
                    sequence_start = update.sequence_start,
                    sequence_end = update.sequence_end,
                    last_sequence = book.last_sequence(),
                    count = out_of_sequence_count,
                    "dropped out-of-sequence depth diff"
                );
                if out_of_sequence_count >= settings.out_of_sequence_threshold {
                    warn!(%venue, %symbol, "out-of-sequence threshold reached, retiring replica");
                    break;
                }
            }
        }
    }

    // Retired: the book is never mutated again, the reader returns, the subscription
    // reference is released, and the registry sweeper reclaims the entry.
    book.mark_outdated();
    let _ = shutdown_tx.send(true);
    debug!(%venue, %symbol, "replica retired");
}

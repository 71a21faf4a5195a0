#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity)]

//! # Depthbridge-Data
//! Order-book replication engine maintaining live, sequence-consistent limit-order-book
//! replicas for trading pairs on multiple cryptocurrency venues. It:
//! * **Composes** each venue's incremental depth-diff stream with its full snapshot facility
//!   into a continuously maintained in-memory [`Book`](books::Book).
//! * **Multiplexes** one persistent WebSocket per venue across many topic subscribers with a
//!   reference-counted subscription lifecycle.
//! * **Detects** replicas that have fallen out of sequence and retires them, re-replicating
//!   lazily on the next snapshot request.
//!
//! ## User API
//! - [`SnapshotCoordinator`](replica::SnapshotCoordinator) serves point-in-time
//!   [`OrderBookSnapshot`](books::OrderBookSnapshot)s, answering from the venue while a
//!   replica is warming up.
//! - [`VenueResolver`](exchange::VenueResolver) dials the configured venues and dispatches
//!   by [`Venue`](exchange::Venue).

use crate::{
    books::{OrderBookSnapshot, OrderBookUpdate},
    error::DataError,
    symbol::MarketSymbol,
};
use async_trait::async_trait;
use smol_str::SmolStr;
use tokio::sync::mpsc;

/// All [`Error`](std::error::Error)s generated in Depthbridge-Data.
pub mod error;

/// Normalized trading-pair identifier with venue-specific serialization.
pub mod symbol;

/// The ordered ask/bid ladder with its update & snapshot operations, and the per-venue
/// sequence validators that gate which depth diffs may be applied to it.
pub mod books;

/// Venue integrations: the [`Venue`](exchange::Venue) dispatch table, and per-venue stream
/// (depth diffs) & sync (full snapshot) clients.
pub mod exchange;

/// Replica lifecycle: the per-book [`Replicator`](replica::Replicator) state machine, the
/// process-wide [`Registry`](replica::Registry) with its eviction sweeper, and the
/// [`SnapshotCoordinator`](replica::SnapshotCoordinator) use case.
pub mod replica;

/// Engine tunables & venue endpoints consumed as data.
pub mod config;

/// Event yielded by a [`DepthDiffStream`].
///
/// `Reconnected` marks the point at which the underlying venue connection was re-established:
/// diffs spanning the marker may have been lost, so a consumer anchored to a sequence must
/// not splice across it.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffEvent {
    Update(OrderBookUpdate),
    Reconnected,
}

/// Stream of [`DiffEvent`]s for one market topic, normalized from the venue wire form.
///
/// Holds one reference on the venue stream client's underlying topic subscription - dropping
/// this stream releases it.
#[derive(Debug)]
pub struct DepthDiffStream {
    topic: SmolStr,
    rx: mpsc::UnboundedReceiver<DiffEvent>,
    _subscription: Option<exchange::SubscriptionGuard>,
}

impl DepthDiffStream {
    pub fn new(
        topic: SmolStr,
        rx: mpsc::UnboundedReceiver<DiffEvent>,
        subscription: Option<exchange::SubscriptionGuard>,
    ) -> Self {
        Self {
            topic,
            rx,
            _subscription: subscription,
        }
    }

    /// Receive the next [`DiffEvent`], or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<DiffEvent> {
        self.rx.recv().await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Venue capability: subscribe to the stream of incremental depth diffs for a market.
#[async_trait]
pub trait StreamApi
where
    Self: Send + Sync + std::fmt::Debug,
{
    async fn depth_diff_stream(&self, symbol: &MarketSymbol) -> Result<DepthDiffStream, DataError>;
}

/// Venue capability: fetch a full, sequence-numbered depth snapshot for a market.
///
/// `limit` truncates each side to the top `limit` levels; `0` means unlimited.
#[async_trait]
pub trait SyncApi
where
    Self: Send + Sync + std::fmt::Debug,
{
    async fn snapshot(
        &self,
        symbol: &MarketSymbol,
        limit: usize,
    ) -> Result<OrderBookSnapshot, DataError>;
}

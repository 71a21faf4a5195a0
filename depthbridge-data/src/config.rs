use crate::exchange::Venue;
use std::time::Duration;

/// Default maximum depth served per book side.
pub const DEFAULT_MAX_ORDERBOOK_DEPTH: usize = 1000;

/// Default number of out-of-sequence diffs tolerated before a replica is retired.
pub const DEFAULT_OUT_OF_SEQUENCE_THRESHOLD: u32 = 10;

/// Default period of the registry's outdated-replica sweeper.
pub const DEFAULT_SWEEPER_INTERVAL: Duration = Duration::from_secs(10);

/// Engine configuration.
///
/// Set once at startup before any task starts and read-only thereafter. Flag & environment
/// parsing live with the process entrypoint; the engine consumes the parsed values only.
#[derive(Debug, Clone)]
pub struct Config {
    /// Venue allow-list: only listed venues are dialled & resolvable.
    pub venues: Vec<Venue>,
    /// Maximum levels per side served to callers.
    pub max_orderbook_depth: usize,
    /// Period of the registry's outdated-replica sweeper.
    pub sweeper_interval: Duration,
    pub replication: ReplicationSettings,
    pub binance: BinanceConfig,
    pub kucoin: KucoinConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            venues: vec![Venue::Binance, Venue::Kucoin],
            max_orderbook_depth: DEFAULT_MAX_ORDERBOOK_DEPTH,
            sweeper_interval: DEFAULT_SWEEPER_INTERVAL,
            replication: ReplicationSettings::default(),
            binance: BinanceConfig::default(),
            kucoin: KucoinConfig::default(),
        }
    }
}

/// Tunables of the per-replica [`Replicator`](crate::replica::Replicator) state machine.
#[derive(Debug, Copy, Clone)]
pub struct ReplicationSettings {
    /// Out-of-sequence diffs tolerated before the replica is retired.
    pub out_of_sequence_threshold: u32,
    /// Depth requested for the anchoring snapshot.
    pub anchor_depth: usize,
    /// How long the apply loop sleeps when the diff buffer is empty.
    pub buffer_poll_interval: Duration,
    /// Floor on the warm-up wait: the anchoring snapshot is not requested before both the
    /// first diff has been buffered and this duration has elapsed.
    pub stream_warmup_floor: Duration,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            out_of_sequence_threshold: DEFAULT_OUT_OF_SEQUENCE_THRESHOLD,
            anchor_depth: DEFAULT_MAX_ORDERBOOK_DEPTH,
            buffer_poll_interval: Duration::from_millis(100),
            stream_warmup_floor: Duration::from_secs(1),
        }
    }
}

/// Binance endpoints & deadlines.
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    /// Multiplexed market-data stream URL.
    pub stream_url: String,
    /// Dedicated request/response WebSocket API URL used for depth snapshots
    /// (the `BINANCE_WS_API_ENDPOINT` contract).
    pub ws_api_url: String,
    /// Deadline on one snapshot request/response round trip.
    pub snapshot_timeout: Duration,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            stream_url: String::from("wss://stream.binance.com:9443/stream"),
            ws_api_url: String::from("wss://ws-api.binance.com:443/ws-api/v3"),
            snapshot_timeout: Duration::from_secs(10),
        }
    }
}

/// Kucoin endpoints, credentials & deadlines.
#[derive(Debug, Clone)]
pub struct KucoinConfig {
    /// REST base URL (the `KUCOIN_BASE_URL` contract).
    pub base_url: String,
    /// API credentials for authenticated REST calls (the `KUCOIN_API_KEY` /
    /// `KUCOIN_SECRET_KEY` / `KUCOIN_PASSPHRASE` contracts).
    pub credentials: Option<KucoinCredentials>,
    /// Deadline on a subscribe acknowledgement arriving over the stream.
    pub ack_timeout: Duration,
    /// Deadline on one snapshot request.
    pub snapshot_timeout: Duration,
}

impl Default for KucoinConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://api.kucoin.com"),
            credentials: None,
            ack_timeout: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(10),
        }
    }
}

/// Kucoin API key triple.
#[derive(Clone)]
pub struct KucoinCredentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

impl std::fmt::Debug for KucoinCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KucoinCredentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"***")
            .field("passphrase", &"***")
            .finish()
    }
}

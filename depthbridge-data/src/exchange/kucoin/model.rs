use crate::books::{DiffLevel, Level, OrderBookSnapshot, OrderBookUpdate, SnapshotSource};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, de};
use std::str::FromStr;

/// Envelope of every Kucoin REST response.
///
/// ### Raw Payload Examples
/// ```json
/// {"code":"200000","data":{...}}
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct KucoinRestResponse<T> {
    pub code: String,
    pub data: T,
}

/// Connection parameters returned by the Kucoin bullet-public endpoint: the token the
/// WebSocket URL is parameterized with, and the instance servers to dial.
///
/// See docs: <https://www.kucoin.com/docs/websocket/basic-info/apply-connect-token/public-token-no-authentication-required->
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct KucoinWsConnectionOptions {
    pub token: String,
    #[serde(rename = "instanceServers")]
    pub instance_servers: Vec<KucoinInstanceServer>,
}

/// One Kucoin WebSocket instance server, advertising its own keep-alive cadence.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct KucoinInstanceServer {
    pub endpoint: String,
    pub protocol: String,
    pub encrypt: bool,
    /// Milliseconds between application-level pings the client is expected to send.
    #[serde(rename = "pingInterval")]
    pub ping_interval_ms: u64,
    /// Milliseconds after which an unanswered ping means the connection is dead.
    #[serde(rename = "pingTimeout")]
    pub ping_timeout_ms: u64,
}

/// Minimal frame used by the stream client's read loop to discover a frame's kind
/// (welcome/ping/pong/ack/error/message/notice/command) before dispatching it.
///
/// ### Raw Payload Examples
/// ```json
/// {"id":"hQvf8jkno","type":"welcome"}
/// {"id":"1545910660739","type":"ack"}
/// {"id":"1545910660740","type":"error","code":404,"data":"topic /xxx is not found"}
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct KucoinControlFrame {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl KucoinControlFrame {
    /// Human-readable rendering of an `error` frame.
    pub fn error_message(&self) -> String {
        format!(
            "code={} {}",
            self.code.unwrap_or_default(),
            self.data
                .as_ref()
                .map(|data| data.to_string())
                .unwrap_or_default()
        )
    }
}

/// Typed `message` frame delivered for a subscribed topic.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct KucoinStreamMessage<T> {
    pub topic: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub data: T,
}

/// One changed row of a Kucoin level2 diff: price, size, and the row's own sequence.
///
/// ### Raw Payload Examples
/// ```json
/// ["50088.9","0.0001","8795"]
/// ```
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct KucoinLevel {
    pub price: Decimal,
    pub amount: Decimal,
    pub sequence: u64,
}

impl<'de> Deserialize<'de> for KucoinLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let (price, amount, sequence) = <(String, String, String)>::deserialize(deserializer)?;
        Ok(Self {
            price: Decimal::from_str(&price).map_err(de::Error::custom)?,
            amount: Decimal::from_str(&amount).map_err(de::Error::custom)?,
            sequence: sequence.parse().map_err(de::Error::custom)?,
        })
    }
}

impl From<KucoinLevel> for DiffLevel {
    fn from(level: KucoinLevel) -> Self {
        Self {
            price: level.price,
            amount: level.amount,
            sequence: Some(level.sequence),
        }
    }
}

/// Kucoin level2 depth diff WebSocket message.
///
/// ### Raw Payload Examples
/// See docs: <https://www.kucoin.com/docs/websocket/spot-trading/public-channels/level2-market-data>
/// ```json
/// {
///     "changes":{
///         "asks":[["18906","0.00331","14103845"]],
///         "bids":[["18905.5","0.52061","14103844"]]
///     },
///     "sequenceEnd":14103845,
///     "sequenceStart":14103844,
///     "symbol":"BTC-USDT",
///     "time":1663747970273
/// }
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct KucoinDepthUpdate {
    #[serde(rename = "sequenceStart")]
    pub sequence_start: u64,
    #[serde(rename = "sequenceEnd")]
    pub sequence_end: u64,
    pub symbol: String,
    pub changes: KucoinDepthChanges,
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct KucoinDepthChanges {
    pub bids: Vec<KucoinLevel>,
    pub asks: Vec<KucoinLevel>,
}

impl From<KucoinDepthUpdate> for OrderBookUpdate {
    fn from(update: KucoinDepthUpdate) -> Self {
        Self {
            sequence_start: update.sequence_start,
            sequence_end: update.sequence_end,
            bids: update
                .changes
                .bids
                .into_iter()
                .map(DiffLevel::from)
                .collect(),
            asks: update
                .changes
                .asks
                .into_iter()
                .map(DiffLevel::from)
                .collect(),
        }
    }
}

/// Control request sent to the Kucoin stream (subscribe/unsubscribe/ping).
///
/// See docs: <https://www.kucoin.com/docs/websocket/basic-info/subscribe/introduction>
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct KucoinWsRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(rename = "privateChannel", skip_serializing_if = "Option::is_none")]
    pub private_channel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<bool>,
}

impl KucoinWsRequest {
    pub fn subscribe(id: String, topic: String) -> Self {
        Self {
            id,
            kind: "subscribe",
            topic: Some(topic),
            private_channel: Some(false),
            response: Some(true),
        }
    }

    pub fn unsubscribe(id: String, topic: String) -> Self {
        Self {
            id,
            kind: "unsubscribe",
            topic: Some(topic),
            private_channel: Some(false),
            response: Some(true),
        }
    }

    pub fn ping(id: String) -> Self {
        Self {
            id,
            kind: "ping",
            topic: None,
            private_channel: None,
            response: None,
        }
    }
}

/// One row of a Kucoin level2 snapshot: price & size only.
///
/// ### Raw Payload Examples
/// ```json
/// ["6500.12","0.45054140"]
/// ```
#[derive(Clone, Copy, PartialEq, Debug, Deserialize)]
pub struct KucoinSnapshotLevel {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

impl From<KucoinSnapshotLevel> for Level {
    fn from(level: KucoinSnapshotLevel) -> Self {
        Self {
            price: level.price,
            amount: level.amount,
        }
    }
}

/// Full aggregated Kucoin level2 book. The anchoring sequence arrives as a decimal string.
///
/// See docs: <https://www.kucoin.com/docs/rest/spot-trading/market-data/get-full-order-book-aggregated->
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct KucoinLevel2Snapshot {
    #[serde(deserialize_with = "de_u64_from_str")]
    pub sequence: u64,
    #[serde(default)]
    pub time: i64,
    pub bids: Vec<KucoinSnapshotLevel>,
    pub asks: Vec<KucoinSnapshotLevel>,
}

impl From<KucoinLevel2Snapshot> for OrderBookSnapshot {
    fn from(snapshot: KucoinLevel2Snapshot) -> Self {
        Self {
            source: SnapshotSource::Venue,
            last_sequence: snapshot.sequence,
            bids: snapshot.bids.into_iter().map(Level::from).collect(),
            asks: snapshot.asks.into_iter().map(Level::from).collect(),
        }
    }
}

/// Deserialize a `u64` represented on the wire as a decimal string.
fn de_u64_from_str<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: de::Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    value.parse().map_err(de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    mod de {
        use super::*;
        use rust_decimal_macros::dec;

        #[test]
        fn test_kucoin_depth_update() {
            let input = r#"
            {
                "changes":{
                    "asks":[["18906","0.00331","14103845"]],
                    "bids":[["18905.5","0.52061","14103844"]]
                },
                "sequenceEnd":14103845,
                "sequenceStart":14103844,
                "symbol":"BTC-USDT",
                "time":1663747970273
            }
            "#;

            assert_eq!(
                serde_json::from_str::<KucoinDepthUpdate>(input).unwrap(),
                KucoinDepthUpdate {
                    sequence_start: 14103844,
                    sequence_end: 14103845,
                    symbol: "BTC-USDT".to_string(),
                    changes: KucoinDepthChanges {
                        bids: vec![KucoinLevel {
                            price: dec!(18905.5),
                            amount: dec!(0.52061),
                            sequence: 14103844,
                        }],
                        asks: vec![KucoinLevel {
                            price: dec!(18906),
                            amount: dec!(0.00331),
                            sequence: 14103845,
                        }],
                    },
                }
            );
        }

        #[test]
        fn test_kucoin_level2_snapshot() {
            let input = r#"
            {
                "time":1663743870371,
                "sequence":"3262786978",
                "bids":[["6500.12","0.45054140"],["6500.11","0.45054140"]],
                "asks":[["6500.16","0.57753524"]]
            }
            "#;

            assert_eq!(
                serde_json::from_str::<KucoinLevel2Snapshot>(input).unwrap(),
                KucoinLevel2Snapshot {
                    sequence: 3262786978,
                    time: 1663743870371,
                    bids: vec![
                        KucoinSnapshotLevel {
                            price: dec!(6500.12),
                            amount: dec!(0.45054140),
                        },
                        KucoinSnapshotLevel {
                            price: dec!(6500.11),
                            amount: dec!(0.45054140),
                        },
                    ],
                    asks: vec![KucoinSnapshotLevel {
                        price: dec!(6500.16),
                        amount: dec!(0.57753524),
                    }],
                }
            );
        }

        #[test]
        fn test_kucoin_control_frames() {
            struct TestCase {
                input: &'static str,
                expected_kind: &'static str,
                expected_id: Option<&'static str>,
            }

            let tests = vec![
                TestCase {
                    // TC0: welcome on connect
                    input: r#"{"id":"hQvf8jkno","type":"welcome"}"#,
                    expected_kind: "welcome",
                    expected_id: Some("hQvf8jkno"),
                },
                TestCase {
                    // TC1: subscribe acknowledgement
                    input: r#"{"id":"1545910660739","type":"ack"}"#,
                    expected_kind: "ack",
                    expected_id: Some("1545910660739"),
                },
                TestCase {
                    // TC2: error with code & data
                    input: r#"{"id":"1545910660740","type":"error","code":404,"data":"topic /xxx is not found"}"#,
                    expected_kind: "error",
                    expected_id: Some("1545910660740"),
                },
                TestCase {
                    // TC3: data message
                    input: r#"{"type":"message","topic":"/market/level2:BTC-USDT","subject":"trade.l2update","data":{}}"#,
                    expected_kind: "message",
                    expected_id: None,
                },
            ];

            for (index, test) in tests.into_iter().enumerate() {
                let actual = serde_json::from_str::<KucoinControlFrame>(test.input).unwrap();
                assert_eq!(actual.kind, test.expected_kind, "TC{index} failed");
                assert_eq!(
                    actual.id.as_deref(),
                    test.expected_id,
                    "TC{index} failed"
                );
            }
        }
    }

    #[test]
    fn test_kucoin_ws_request_serialization() {
        let request = KucoinWsRequest::subscribe(
            String::from("1545910660739"),
            String::from("/market/level2:BTC-USDT"),
        );
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"id":"1545910660739","type":"subscribe","topic":"/market/level2:BTC-USDT","privateChannel":false,"response":true}"#
        );

        let ping = KucoinWsRequest::ping(String::from("1545910590801"));
        assert_eq!(
            serde_json::to_string(&ping).unwrap(),
            r#"{"id":"1545910590801","type":"ping"}"#
        );
    }
}

use crate::books::{DiffLevel, Level, OrderBookSnapshot, OrderBookUpdate, SnapshotSource};
use chrono::{DateTime, Utc};
use depthbridge_integration::{Validator, error::SocketError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Envelope of every data frame on the multiplexed Binance stream.
///
/// ### Raw Payload Examples
/// ```json
/// {"stream":"btcusdt@depth","data":{...}}
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct BinanceStreamMessage<T> {
    pub stream: String,
    pub data: T,
}

/// Minimal frame used by the stream client's read loop to discover a frame's kind before
/// dispatching it: data frames carry `stream`, request acknowledgements echo `id`.
#[derive(Clone, PartialEq, Debug, Default, Deserialize)]
pub struct BinanceRoutingFrame {
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub id: Option<u64>,
}

/// [`Binance`](super) OrderBook level.
///
/// ### Raw Payload Examples
/// ```json
/// ["4.00000200", "12.00000000"]
/// ```
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct BinanceLevel {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

impl From<BinanceLevel> for Level {
    fn from(level: BinanceLevel) -> Self {
        Self {
            price: level.price,
            amount: level.amount,
        }
    }
}

impl From<BinanceLevel> for DiffLevel {
    fn from(level: BinanceLevel) -> Self {
        Self {
            price: level.price,
            amount: level.amount,
            sequence: None,
        }
    }
}

/// [`Binance`](super) OrderBook Level2 deltas WebSocket message.
///
/// ### Raw Payload Examples
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#diff-depth-stream>
/// ```json
/// {
///     "e":"depthUpdate",
///     "E":1671656397761,
///     "s":"ETHUSDT",
///     "U":22611425143,
///     "u":22611425151,
///     "b":[
///         ["1209.67000000","85.48210000"]
///     ],
///     "a":[]
/// }
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct BinanceDepthUpdate {
    #[serde(alias = "E", with = "chrono::serde::ts_milliseconds")]
    pub time_exchange: DateTime<Utc>,
    #[serde(alias = "s")]
    pub symbol: String,
    #[serde(alias = "U")]
    pub first_update_id: u64,
    #[serde(alias = "u")]
    pub last_update_id: u64,
    #[serde(alias = "b")]
    pub bids: Vec<BinanceLevel>,
    #[serde(alias = "a")]
    pub asks: Vec<BinanceLevel>,
}

impl From<BinanceDepthUpdate> for OrderBookUpdate {
    fn from(update: BinanceDepthUpdate) -> Self {
        Self {
            sequence_start: update.first_update_id,
            sequence_end: update.last_update_id,
            bids: update.bids.into_iter().map(DiffLevel::from).collect(),
            asks: update.asks.into_iter().map(DiffLevel::from).collect(),
        }
    }
}

/// Control request sent to the multiplexed Binance stream.
///
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#live-subscribing-unsubscribing-to-streams>
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct BinanceWsRequest {
    pub id: u64,
    pub method: &'static str,
    pub params: Vec<String>,
}

/// [`Binance`](super) subscription response message.
///
/// ### Raw Payload Examples
/// #### Subscription Success
/// ```json
/// {"id":1,"result":null}
/// ```
///
/// #### Subscription Failure
/// ```json
/// {"id":1,"result":[]}
/// ```
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub struct BinanceSubResponse {
    pub result: Option<Vec<String>>,
    pub id: u64,
}

impl Validator for BinanceSubResponse {
    fn validate(self) -> Result<Self, SocketError>
    where
        Self: Sized,
    {
        if self.result.is_none() {
            Ok(self)
        } else {
            Err(SocketError::Subscribe(
                "received failure subscription response".to_owned(),
            ))
        }
    }
}

/// Request sent over the dedicated Binance WebSocket API to fetch a depth snapshot.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct BinanceDepthRequest {
    pub id: u64,
    pub method: &'static str,
    pub params: BinanceDepthParams,
}

#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct BinanceDepthParams {
    pub symbol: String,
    pub limit: usize,
}

impl BinanceDepthRequest {
    pub fn new(id: u64, symbol: String, limit: usize) -> Self {
        Self {
            id,
            method: "depth",
            params: BinanceDepthParams { symbol, limit },
        }
    }
}

/// Envelope of a Binance WebSocket API response, matched to its request by `id`.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct BinanceApiResponse<T> {
    pub id: u64,
    #[serde(default)]
    pub status: Option<u16>,
    pub result: T,
}

/// [`Binance`](super) OrderBook Level2 snapshot message.
///
/// Used as the anchoring book before Level2 delta WebSocket updates are applied.
///
/// ### Raw Payload Examples
/// See docs: <https://binance-docs.github.io/apidocs/spot/en/#order-book>
/// ```json
/// {
///     "lastUpdateId": 1027024,
///     "bids": [
///         ["4.00000000", "431.00000000"]
///     ],
///     "asks": [
///         ["4.00000200", "12.00000000"]
///     ]
/// }
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct BinanceDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<BinanceLevel>,
    pub asks: Vec<BinanceLevel>,
}

impl From<BinanceDepthSnapshot> for OrderBookSnapshot {
    fn from(snapshot: BinanceDepthSnapshot) -> Self {
        Self {
            source: SnapshotSource::Venue,
            last_sequence: snapshot.last_update_id,
            bids: snapshot.bids.into_iter().map(Level::from).collect(),
            asks: snapshot.asks.into_iter().map(Level::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod de {
        use super::*;
        use rust_decimal_macros::dec;

        #[test]
        fn test_binance_depth_update() {
            let input = r#"
            {
                "e":"depthUpdate",
                "E":1671656397761,
                "s":"ETHUSDT",
                "U":22611425143,
                "u":22611425151,
                "b":[
                    ["1209.67000000","85.48210000"],
                    ["1209.66000000","20.68790000"]
                ],
                "a":[]
            }
            "#;

            assert_eq!(
                serde_json::from_str::<BinanceDepthUpdate>(input).unwrap(),
                BinanceDepthUpdate {
                    time_exchange: DateTime::from_timestamp_millis(1671656397761).unwrap(),
                    symbol: "ETHUSDT".to_string(),
                    first_update_id: 22611425143,
                    last_update_id: 22611425151,
                    bids: vec![
                        BinanceLevel {
                            price: dec!(1209.67000000),
                            amount: dec!(85.48210000)
                        },
                        BinanceLevel {
                            price: dec!(1209.66000000),
                            amount: dec!(20.68790000)
                        },
                    ],
                    asks: vec![]
                }
            );
        }

        #[test]
        fn test_binance_depth_snapshot() {
            let input = r#"
            {
                "lastUpdateId": 1027024,
                "bids": [
                    ["4.00000000", "431.00000000"]
                ],
                "asks": [
                    ["4.00000200", "12.00000000"]
                ]
            }
            "#;

            assert_eq!(
                serde_json::from_str::<BinanceDepthSnapshot>(input).unwrap(),
                BinanceDepthSnapshot {
                    last_update_id: 1027024,
                    bids: vec![BinanceLevel {
                        price: dec!(4.00000000),
                        amount: dec!(431.00000000),
                    }],
                    asks: vec![BinanceLevel {
                        price: dec!(4.00000200),
                        amount: dec!(12.00000000),
                    }],
                }
            );
        }

        #[test]
        fn test_binance_routing_frame() {
            struct TestCase {
                input: &'static str,
                expected: BinanceRoutingFrame,
            }

            let tests = vec![
                TestCase {
                    // TC0: data frame routed by stream name
                    input: r#"{"stream":"btcusdt@depth","data":{}}"#,
                    expected: BinanceRoutingFrame {
                        stream: Some("btcusdt@depth".to_string()),
                        id: None,
                    },
                },
                TestCase {
                    // TC1: subscription acknowledgement routed by id
                    input: r#"{"result":null,"id":3271974}"#,
                    expected: BinanceRoutingFrame {
                        stream: None,
                        id: Some(3271974),
                    },
                },
            ];

            for (index, test) in tests.into_iter().enumerate() {
                let actual = serde_json::from_str::<BinanceRoutingFrame>(test.input).unwrap();
                assert_eq!(actual, test.expected, "TC{index} failed");
            }
        }
    }

    #[test]
    fn test_validate_binance_sub_response() {
        struct TestCase {
            input_response: BinanceSubResponse,
            is_valid: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: input response is successful subscription
                input_response: BinanceSubResponse {
                    result: None,
                    id: 1,
                },
                is_valid: true,
            },
            TestCase {
                // TC1: input response is failed subscription
                input_response: BinanceSubResponse {
                    result: Some(vec![]),
                    id: 1,
                },
                is_valid: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input_response.validate().is_ok();
            assert_eq!(actual, test.is_valid, "TC{index} failed");
        }
    }
}

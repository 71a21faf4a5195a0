use crate::{exchange::Venue, symbol::MarketSymbol};
use depthbridge_integration::error::SocketError;
use thiserror::Error;

/// All errors generated in `depthbridge-data`.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DataError {
    #[error("venue is not supported: {0}")]
    UnknownVenue(String),

    #[error("invalid market symbol: {0}")]
    InvalidSymbol(String),

    #[error("no order book replica for {symbol} on {venue}")]
    NotFound { venue: Venue, symbol: MarketSymbol },

    #[error("SocketError: {0}")]
    Socket(String),
}

impl From<SocketError> for DataError {
    fn from(value: SocketError) -> Self {
        Self::Socket(value.to_string())
    }
}

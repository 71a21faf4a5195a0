use crate::error::DataError;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{fmt, str::FromStr};

/// Normalized trading-pair identifier: a pair of non-empty, distinct, lowercased asset codes.
///
/// The canonical wire form uses `_` as the asset separator (eg/ "btc_usdt"); venues produce
/// their own forms via [`MarketSymbol::join`] (eg/ "btcusdt", "BTC-USDT").
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub struct MarketSymbol {
    base: SmolStr,
    quote: SmolStr,
}

impl MarketSymbol {
    /// Construct a validated [`MarketSymbol`], lowercasing both asset codes.
    pub fn new(base: &str, quote: &str) -> Result<Self, DataError> {
        if base.is_empty() || quote.is_empty() {
            return Err(DataError::InvalidSymbol(String::from(
                "base and quote must not be empty",
            )));
        }

        let base = base.to_lowercase();
        let quote = quote.to_lowercase();
        if base == quote {
            return Err(DataError::InvalidSymbol(String::from(
                "base and quote must be different",
            )));
        }

        Ok(Self {
            base: SmolStr::from(base),
            quote: SmolStr::from(quote),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Serialize with the provided separator (eg/ `join("-")` => "btc-usdt").
    pub fn join(&self, separator: &str) -> String {
        format!("{}{}{}", self.base, separator, self.quote)
    }
}

impl FromStr for MarketSymbol {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('_').collect::<Vec<_>>().as_slice() {
            [base, quote] => Self::new(base, quote),
            _ => Err(DataError::InvalidSymbol(format!(
                "expected base_quote, got: {s}"
            ))),
        }
    }
}

impl fmt::Display for MarketSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.base, self.quote)
    }
}

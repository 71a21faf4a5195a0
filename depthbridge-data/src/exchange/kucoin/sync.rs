use super::model::{KucoinLevel2Snapshot, KucoinRestResponse, KucoinWsConnectionOptions};
use crate::{
    SyncApi,
    books::OrderBookSnapshot,
    config::{KucoinConfig, KucoinCredentials},
    error::DataError,
    symbol::MarketSymbol,
};
use async_trait::async_trait;
use chrono::Utc;
use depthbridge_integration::{
    error::SocketError,
    protocol::http::{Base64Encoder, Encoder, hmac_sha256},
};
use tracing::warn;

/// Kucoin request/response facility: WebSocket connection options via bullet-public, and
/// sequence-numbered full depth snapshots via the aggregated level2 REST endpoint.
#[derive(Debug)]
pub struct KucoinSyncApi {
    http_client: reqwest::Client,
    base_url: String,
    credentials: Option<KucoinCredentials>,
}

impl KucoinSyncApi {
    pub fn new(config: &KucoinConfig) -> Result<Self, SocketError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.snapshot_timeout)
            .build()
            .map_err(SocketError::from)?;

        Ok(Self {
            http_client,
            base_url: config.base_url.clone(),
            credentials: config.credentials.clone(),
        })
    }

    /// Fetch the token & instance-server list the Kucoin stream client dials with.
    pub async fn ws_connection_options(&self) -> Result<KucoinWsConnectionOptions, SocketError> {
        let url = format!("{}/api/v1/bullet-public", self.base_url);
        let response = self.http_client.post(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SocketError::HttpResponse(
                status,
                response.text().await.unwrap_or_default(),
            ));
        }

        let body = response
            .json::<KucoinRestResponse<KucoinWsConnectionOptions>>()
            .await?;
        Ok(body.data)
    }

    async fn fetch_snapshot(
        &self,
        symbol: &MarketSymbol,
    ) -> Result<KucoinLevel2Snapshot, SocketError> {
        let path = format!(
            "/api/v3/market/orderbook/level2?symbol={}",
            symbol.join("-").to_uppercase()
        );

        let mut request = self.http_client.get(format!("{}{}", self.base_url, path));
        if let Some(credentials) = &self.credentials {
            request = sign_request(request, credentials, "GET", &path);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SocketError::HttpResponse(
                status,
                response.text().await.unwrap_or_default(),
            ));
        }

        let body = response
            .json::<KucoinRestResponse<KucoinLevel2Snapshot>>()
            .await?;
        Ok(body.data)
    }
}

/// Attach the Kucoin API-key headers: the request signature and encrypted passphrase are
/// HMAC-SHA256 digests encoded as base64.
///
/// See docs: <https://www.kucoin.com/docs/basic-info/connection-method/authentication/signing-a-message>
fn sign_request(
    request: reqwest::RequestBuilder,
    credentials: &KucoinCredentials,
    method: &str,
    path: &str,
) -> reqwest::RequestBuilder {
    let timestamp = Utc::now().timestamp_millis().to_string();
    let signature =
        Base64Encoder.encode(hmac_sha256(
            &credentials.secret_key,
            &format!("{timestamp}{method}{path}"),
        ));
    let passphrase =
        Base64Encoder.encode(hmac_sha256(&credentials.secret_key, &credentials.passphrase));

    request
        .header("KC-API-KEY", &credentials.api_key)
        .header("KC-API-SIGN", signature)
        .header("KC-API-TIMESTAMP", timestamp)
        .header("KC-API-PASSPHRASE", passphrase)
        .header("KC-API-KEY-VERSION", "2")
}

#[async_trait]
impl SyncApi for KucoinSyncApi {
    async fn snapshot(
        &self,
        symbol: &MarketSymbol,
        limit: usize,
    ) -> Result<OrderBookSnapshot, DataError> {
        let snapshot = match self.fetch_snapshot(symbol).await {
            Ok(snapshot) => snapshot,
            Err(error @ SocketError::HttpTimeout(_)) => return Err(DataError::from(error)),
            Err(error) => {
                // Transient transport failure: one retry before surfacing.
                warn!(%symbol, %error, "Kucoin snapshot request failed, retrying once");
                self.fetch_snapshot(symbol).await.map_err(DataError::from)?
            }
        };

        // The aggregated endpoint always returns the full book; truncation to the requested
        // depth is this client's responsibility.
        let mut snapshot = OrderBookSnapshot::from(snapshot);
        if limit > 0 {
            snapshot.bids.truncate(limit);
            snapshot.asks.truncate(limit);
        }

        Ok(snapshot)
    }
}

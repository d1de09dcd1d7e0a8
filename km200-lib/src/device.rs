use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::constants::{DEFAULT_RETRIES, FIRMWARE_PATH};
use crate::crypto::{Codec, derive_key};
use crate::error::KM200Error;
use crate::http::{
    Http, ReqwestHttp, Request, RetryHttp, SerializedHttp, retryable_for_query,
    retryable_for_update,
};

/// Client for one KM200 gateway.
///
/// Owns the derived session key and the layered transport. Queries and
/// updates go through separate retry policies over one shared
/// serialization lock, so no two exchanges of this instance are ever in
/// flight concurrently, no matter how many tasks call into it.
pub struct KM200 {
    codec: Codec,
    query_http: Arc<dyn Http>,
    update_http: Arc<dyn Http>,
    cancel: CancellationToken,
}

impl KM200 {
    /// Connect with the default retry budget.
    pub async fn connect(
        uri: &str,
        timeout: Duration,
        gateway_password: &str,
        private_password: &str,
        salt: &str,
    ) -> Result<Self, KM200Error> {
        Self::connect_with_retries(
            uri,
            DEFAULT_RETRIES,
            timeout,
            gateway_password,
            private_password,
            salt,
        )
        .await
    }

    /// Connect, allowing `retries` additional attempts after retryable
    /// failures. [`crate::constants::RETRY_DISABLED`] turns retrying off.
    ///
    /// Probes `/system` once so that a wrong URI, wrong credentials or an
    /// unreachable device fail here instead of on the first real query.
    pub async fn connect_with_retries(
        uri: &str,
        retries: u32,
        timeout: Duration,
        gateway_password: &str,
        private_password: &str,
        salt: &str,
    ) -> Result<Self, KM200Error> {
        let base: Arc<dyn Http> = Arc::new(ReqwestHttp::new(uri, timeout)?);
        let km200 = Self::assemble(base, retries, gateway_password, private_password, salt)?;
        km200.query("/system").await?;
        info!("Connected to the KM200 on {uri}");
        Ok(km200)
    }

    /// Build the decorator chain around an arbitrary base transport.
    pub(crate) fn assemble(
        base: Arc<dyn Http>,
        retries: u32,
        gateway_password: &str,
        private_password: &str,
        salt: &str,
    ) -> Result<Self, KM200Error> {
        let key = derive_key(&gateway_password.replace('-', ""), private_password, salt)?;
        let cancel = CancellationToken::new();

        let serialized: Arc<dyn Http> = Arc::new(SerializedHttp::new(base, cancel.clone()));
        let query_http = Arc::new(RetryHttp::new(
            serialized.clone(),
            retries,
            retryable_for_query,
            cancel.clone(),
        ));
        let update_http = Arc::new(RetryHttp::new(
            serialized,
            retries,
            retryable_for_update,
            cancel.clone(),
        ));

        Ok(Self {
            codec: Codec::new(&key),
            query_http,
            update_http,
            cancel,
        })
    }

    /// Token aborting operations of this client that wait on the
    /// serialization lock or on a retry backoff.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Query a path and return the decrypted JSON text.
    ///
    /// The firmware blob is the only path whose body is returned verbatim.
    /// Every other body must be a JSON object, anything else means the
    /// decryption produced garbage and is rejected instead of returned.
    pub async fn query(&self, path: &str) -> Result<String, KM200Error> {
        assert_path(path)?;
        let response = self.query_http.exchange(&Request::get(path)).await?;
        let decoded = self.codec.decode(&response.body)?;
        if path != FIRMWARE_PATH && !decoded.starts_with('{') {
            return Err(KM200Error::Crypto(format!("Could not decrypt query {path}")));
        }
        Ok(decoded)
    }

    /// Send a raw JSON payload to a path.
    pub async fn update(&self, path: &str, json: &str) -> Result<(), KM200Error> {
        assert_path(path)?;
        let body = Bytes::from(self.codec.encode(json));
        self.update_http.exchange(&Request::post(path, body)).await?;
        Ok(())
    }

    /// Write `{"value": ...}` built from any serializable value.
    pub async fn update_value<T: Serialize>(
        &self,
        path: &str,
        value: T,
    ) -> Result<(), KM200Error> {
        #[derive(Serialize)]
        struct Update<T> {
            value: T,
        }

        let json = serde_json::to_string(&Update { value })?;
        self.update(path, &json).await
    }

    /// Read the `value` field of a path as text.
    pub async fn query_string(&self, path: &str) -> Result<String, KM200Error> {
        let value = self.value_field(path).await?;
        Ok(match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
    }

    /// Read the `value` field of a path as a float.
    pub async fn query_f64(&self, path: &str) -> Result<f64, KM200Error> {
        let value = self.value_field(path).await?;
        value
            .as_f64()
            .ok_or_else(|| KM200Error::Protocol(format!("Value of {path} is not a number: {value}")))
    }

    /// Read the `value` field of a path as an exact JSON number.
    pub async fn query_number(&self, path: &str) -> Result<serde_json::Number, KM200Error> {
        match self.value_field(path).await? {
            serde_json::Value::Number(number) => Ok(number),
            other => Err(KM200Error::Protocol(format!(
                "Value of {path} is not a number: {other}"
            ))),
        }
    }

    async fn value_field(&self, path: &str) -> Result<serde_json::Value, KM200Error> {
        let body = self.query(path).await?;
        let mut document: serde_json::Value = serde_json::from_str(&body)?;
        match document.get_mut("value") {
            Some(value) => Ok(value.take()),
            None => Err(KM200Error::Protocol(format!("{path} has no value field"))),
        }
    }
}

fn assert_path(path: &str) -> Result<(), KM200Error> {
    if path.is_empty() {
        return Err(KM200Error::Configuration("Path must not be empty".to_string()));
    }
    if !path.starts_with('/') {
        return Err(KM200Error::Configuration(format!("Path {path} must start with /")));
    }
    if path.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(KM200Error::Configuration(format!(
            "Path {path:?} contains invalid characters"
        )));
    }
    Ok(())
}

//! The HTTP layer: one unary POST/GET primitive and one streaming-open
//! primitive, cookie + SAPISIDHASH header injection, proxy support.
//!
//! Built on one shared `reqwest::Client` per [`HttpClient`] instance
//! (`Client::builder().timeout(..).build()`, a fixed set of default headers).

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use bytes::Bytes;
use futures_util::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::auth::AuthState;
use crate::config::{STREAM_OPEN_TIMEOUT, TachyonConfig};
use crate::error::{Result, TachyonError};
use crate::pblite::WireCodec;

/// One shared `reqwest::Client`, configured from a [`TachyonConfig`] profile.
pub struct HttpClient {
    client: reqwest::Client,
    config: TachyonConfig,
}

impl HttpClient {
    pub fn new(config: TachyonConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .cookie_store(false); // cookies are owned by AuthState, not reqwest

        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        let client = builder.build()?;
        Ok(Self { client, config })
    }

    fn browser_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::USER_AGENT, HeaderValue::from_str(&self.config.user_agent)?);
        headers.insert(
            HeaderName::from_static("sec-ch-ua"),
            HeaderValue::from_str(&self.config.sec_ch_ua)?,
        );
        headers.insert(
            HeaderName::from_static("sec-ch-ua-platform"),
            HeaderValue::from_str(&self.config.sec_ch_ua_platform)?,
        );
        headers.insert(
            HeaderName::from_static("x-goog-api-key"),
            HeaderValue::from_str(&self.config.x_goog_api_key)?,
        );
        headers.insert(reqwest::header::REFERER, HeaderValue::from_str(&self.config.referrer)?);
        headers.insert(reqwest::header::ORIGIN, HeaderValue::from_str(&self.config.origin)?);
        Ok(headers)
    }

    /// Read the AuthState cookie map and assemble the `cookie:` +
    /// (conditionally) `authorization: SAPISIDHASH ...` headers.
    async fn auth_headers(&self, auth: &AuthState) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = auth.cookie_header().await {
            headers.insert(reqwest::header::COOKIE, HeaderValue::from_str(&cookie)?);
        }
        if let Some(sapisid) = auth.sapisid().await {
            let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
            let hash = sapisidhash(ts, &sapisid, &self.config.origin);
            headers.insert(
                reqwest::header::AUTHORIZATION,
                HeaderValue::from_str(&format!("SAPISIDHASH {ts}_{hash}"))?,
            );
        }
        Ok(headers)
    }

    /// Merge `Set-Cookie` response headers back into the AuthState cookie map.
    async fn absorb_set_cookie(&self, auth: &AuthState, headers: &HeaderMap) {
        let pairs = headers
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|raw| {
                let kv = raw.split(';').next()?;
                let (name, value) = kv.split_once('=')?;
                Some((name.trim().to_owned(), value.trim().to_owned()))
            })
            .collect::<Vec<_>>();
        if !pairs.is_empty() {
            auth.merge_cookies(pairs).await;
        }
    }

    /// POST or GET `url`, optionally with a body, selecting the pblite or
    /// raw-protobuf content type. Returns the response body bytes and the
    /// content-type header (so the caller can pick its decode codec,
    /// trying protobuf first and falling back to pblite).
    pub async fn request(
        &self,
        auth: &AuthState,
        method: reqwest::Method,
        url: &str,
        body: Option<(&[u8], WireCodec)>,
    ) -> Result<(Vec<u8>, Option<String>)> {
        let mut req = self.client.request(method, url).headers(self.browser_headers()?).headers(self.auth_headers(auth).await?);

        if let Some((bytes, codec)) = body {
            let content_type = match codec {
                WireCodec::Protobuf => "application/x-protobuf",
                WireCodec::Pblite => "application/json+protobuf",
            };
            req = req.header(reqwest::header::CONTENT_TYPE, content_type).body(bytes.to_vec());
        }

        debug!(url, "tachyon: sending request");
        let resp = req.send().await?;
        let status = resp.status();
        self.absorb_set_cookie(auth, resp.headers()).await;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, "tachyon: request failed");
            return Err(TachyonError::HttpStatus { status: status.as_u16(), body });
        }

        Ok((resp.bytes().await?.to_vec(), content_type))
    }

    /// Open a POST whose response body is returned as a byte stream. Any
    /// non-2xx is fatal for this attempt.
    pub async fn open_stream(
        &self,
        auth: &AuthState,
        url: &str,
        body: &[u8],
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>>> {
        let req = self
            .client
            .post(url)
            .timeout(STREAM_OPEN_TIMEOUT)
            .headers(self.browser_headers()?)
            .headers(self.auth_headers(auth).await?)
            .header(reqwest::header::CONTENT_TYPE, "application/json+protobuf")
            .body(body.to_vec());

        let resp = req.send().await?;
        let status = resp.status();
        self.absorb_set_cookie(auth, resp.headers()).await;
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TachyonError::HttpStatus { status: status.as_u16(), body });
        }
        Ok(resp.bytes_stream())
    }
}

/// `SAPISIDHASH <ts>_<sha1(ts + " " + sapisid + " " + origin)>`.
fn sapisidhash(ts: u64, sapisid: &str, origin: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{ts} {sapisid} {origin}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Standard-alphabet base64, used by callers composing the QR URL fragment.
pub fn b64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// The inverse of [`b64`], used by callers decoding base64 fields out of
/// RPC response bodies (e.g. a refreshed tachyon token).
pub fn b64_decode(s: &str) -> Result<Vec<u8>> {
    B64.decode(s).map_err(TachyonError::Base64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sapisidhash_matches_known_vector() {
        // Matches the documented construction: sha1(ts + " " + sapisid + " " + origin).
        let hash = sapisidhash(1_000, "mysapisid", "https://messages.google.com");
        let mut hasher = Sha1::new();
        hasher.update(b"1000 mysapisid https://messages.google.com");
        assert_eq!(hash, hex::encode(hasher.finalize()));
    }
}

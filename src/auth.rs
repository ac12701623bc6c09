//! AuthState: the mutable session/credential record.
//!
//! Guarded by a single `tokio::sync::RwLock` — callers never see a raw
//! guard, only async getter/setter methods that serialize mutation.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{DEFAULT_TTL, TOKEN_REFRESH_WINDOW};
use crate::crypto::keys::RefreshKey;
use crate::crypto::request::RequestCryptoKeys;
use crate::wire::Device;

/// `{endpoint-url, p256dh, auth}` web-push registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushKeys {
    pub endpoint: String,
    #[serde(with = "b64_bytes")]
    pub p256dh: Vec<u8>,
    #[serde(with = "b64_bytes")]
    pub auth: Vec<u8>,
}

/// The network identifier used in pairing/auth for a Gaia (Google-account)
/// session. QR-mode sessions use the empty string instead.
pub const GAIA_NETWORK: &str = "Gaia";

/// The full persisted session record. Every field round-trips through
/// `serde_json` so the serialize/restore contract is a plain
/// `to_vec`/`from_slice` call — the on-disk layout is the embedder's concern.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthStateData {
    pub request_crypto: Option<RequestCryptoKeysData>,
    pub refresh_key: Option<RefreshKeyData>,
    pub browser_device: Option<Device>,
    pub mobile_device: Option<Device>,
    #[serde(with = "b64_bytes_opt", default)]
    pub tachyon_token: Option<Vec<u8>>,
    pub tachyon_expiry: Option<chrono::DateTime<chrono::Utc>>,
    pub tachyon_ttl_micros: Option<i64>,
    pub session_id: Option<Uuid>,
    pub dest_reg_id: Option<Uuid>,
    pub pairing_id: Option<Uuid>,
    pub cookies: HashMap<String, String>,
    #[serde(with = "b64_bytes_opt", default)]
    pub web_encryption_key: Option<Vec<u8>>,
    pub push_keys: Option<PushKeys>,
    /// Whether this session was paired via a Google account (Gaia) rather
    /// than the plain QR flow; drives `should_use_google_host` (which is
    /// false only when this is set and the cookie map is still empty).
    pub is_gaia_session: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCryptoKeysData {
    #[serde(with = "b64_bytes")]
    pub aes_key: Vec<u8>,
    #[serde(with = "b64_bytes")]
    pub hmac_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshKeyData {
    #[serde(with = "b64_bytes")]
    pub scalar: Vec<u8>,
}

mod b64_bytes {
    use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        B64.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        B64.decode(&s).map_err(serde::de::Error::custom)
    }
}

mod b64_bytes_opt {
    use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        bytes.as_ref().map(|b| B64.encode(b)).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        s.map(|s| B64.decode(&s).map_err(serde::de::Error::custom)).transpose()
    }
}

/// The live, in-memory counterpart of [`AuthStateData`] with materialized
/// crypto key types, guarded by a single `RwLock` since this is the only
/// shared mutable structure callers hold a reference to.
pub struct AuthState {
    inner: RwLock<Inner>,
}

struct Inner {
    request_crypto: Option<RequestCryptoKeys>,
    refresh_key: Option<RefreshKey>,
    browser_device: Option<Device>,
    mobile_device: Option<Device>,
    tachyon_token: Option<Vec<u8>>,
    tachyon_expiry: Option<SystemTime>,
    tachyon_ttl: Duration,
    session_id: Uuid,
    dest_reg_id: Option<Uuid>,
    pairing_id: Option<Uuid>,
    cookies: HashMap<String, String>,
    web_encryption_key: Option<Vec<u8>>,
    push_keys: Option<PushKeys>,
    is_gaia_session: bool,
}

impl AuthState {
    /// A fresh, empty state for first pairing: generates request-crypto keys,
    /// a refresh key, and a session id.
    pub fn new_for_pairing(is_gaia_session: bool) -> Self {
        Self {
            inner: RwLock::new(Inner {
                request_crypto: Some(RequestCryptoKeys::generate()),
                refresh_key: Some(RefreshKey::generate()),
                browser_device: None,
                mobile_device: None,
                tachyon_token: None,
                tachyon_expiry: None,
                tachyon_ttl: DEFAULT_TTL,
                session_id: Uuid::new_v4(),
                dest_reg_id: None,
                pairing_id: None,
                cookies: HashMap::new(),
                web_encryption_key: None,
                push_keys: None,
                is_gaia_session,
            }),
        }
    }

    /// Rehydrate from a persisted [`AuthStateData`].
    pub fn from_data(data: AuthStateData) -> crate::error::Result<Self> {
        let request_crypto = data
            .request_crypto
            .map(|d| RequestCryptoKeys::from_bytes(&d.aes_key, &d.hmac_key))
            .transpose()?;
        let refresh_key = data.refresh_key.map(|d| RefreshKey::from_bytes(&d.scalar)).transpose()?;
        let tachyon_expiry = data.tachyon_expiry.map(Into::into);
        let tachyon_ttl = match data.tachyon_ttl_micros {
            Some(0) | None => DEFAULT_TTL,
            Some(us) => Duration::from_micros(us as u64),
        };
        Ok(Self {
            inner: RwLock::new(Inner {
                request_crypto,
                refresh_key,
                browser_device: data.browser_device,
                mobile_device: data.mobile_device,
                tachyon_token: data.tachyon_token,
                tachyon_expiry,
                tachyon_ttl,
                session_id: data.session_id.unwrap_or_else(Uuid::new_v4),
                dest_reg_id: data.dest_reg_id,
                pairing_id: data.pairing_id,
                cookies: data.cookies,
                web_encryption_key: data.web_encryption_key,
                push_keys: data.push_keys,
                is_gaia_session: data.is_gaia_session,
            }),
        })
    }

    /// Serialize the full state for external persistence.
    pub async fn to_data(&self) -> AuthStateData {
        let g = self.inner.read().await;
        AuthStateData {
            request_crypto: g.request_crypto.as_ref().map(|k| RequestCryptoKeysData {
                aes_key: k.aes_key.to_vec(),
                hmac_key: k.hmac_key.to_vec(),
            }),
            refresh_key: g.refresh_key.as_ref().map(|k| RefreshKeyData { scalar: k.to_bytes() }),
            browser_device: g.browser_device.clone(),
            mobile_device: g.mobile_device.clone(),
            tachyon_token: g.tachyon_token.clone(),
            tachyon_expiry: g.tachyon_expiry.map(Into::into),
            tachyon_ttl_micros: Some(g.tachyon_ttl.as_micros() as i64),
            session_id: Some(g.session_id),
            dest_reg_id: g.dest_reg_id,
            pairing_id: g.pairing_id,
            cookies: g.cookies.clone(),
            web_encryption_key: g.web_encryption_key.clone(),
            push_keys: g.push_keys.clone(),
            is_gaia_session: g.is_gaia_session,
        }
    }

    // ── Predicates ────────────────────────────────────────────────────────

    /// "Not logged in" iff either the token or the browser device is absent.
    pub async fn is_logged_in(&self) -> bool {
        let g = self.inner.read().await;
        g.tachyon_token.is_some() && g.browser_device.is_some()
    }

    /// Required once expiry is absent or within [`TOKEN_REFRESH_WINDOW`].
    pub async fn needs_token_refresh(&self) -> bool {
        let g = self.inner.read().await;
        match g.tachyon_expiry {
            None => true,
            Some(expiry) => expiry
                .duration_since(SystemTime::now())
                .map(|remaining| remaining < TOKEN_REFRESH_WINDOW)
                .unwrap_or(true),
        }
    }

    /// "Google-hosted" iff this is *not* a Gaia session OR the cookie map is
    /// non-empty — chooses between the two hostname variants.
    pub async fn should_use_google_host(&self) -> bool {
        let g = self.inner.read().await;
        !g.is_gaia_session || !g.cookies.is_empty()
    }

    /// Empty string for QR sessions, the fixed Gaia identifier otherwise.
    pub async fn auth_network(&self) -> &'static str {
        if self.inner.read().await.is_gaia_session { GAIA_NETWORK } else { "" }
    }

    pub async fn session_id(&self) -> Uuid {
        self.inner.read().await.session_id
    }

    pub async fn browser_device(&self) -> Option<Device> {
        self.inner.read().await.browser_device.clone()
    }

    pub async fn mobile_device(&self) -> Option<Device> {
        self.inner.read().await.mobile_device.clone()
    }

    pub async fn tachyon_token(&self) -> Option<Vec<u8>> {
        self.inner.read().await.tachyon_token.clone()
    }

    pub async fn tachyon_ttl_micros(&self) -> i64 {
        self.inner.read().await.tachyon_ttl.as_micros() as i64
    }

    pub async fn request_crypto(&self) -> Option<RequestCryptoKeys> {
        self.inner.read().await.request_crypto.clone()
    }

    pub async fn refresh_key(&self) -> Option<RefreshKey> {
        self.inner.read().await.refresh_key.clone()
    }

    pub async fn dest_reg_id(&self) -> Option<Uuid> {
        self.inner.read().await.dest_reg_id
    }

    pub async fn pairing_id(&self) -> Option<Uuid> {
        self.inner.read().await.pairing_id
    }

    pub async fn push_keys(&self) -> Option<PushKeys> {
        self.inner.read().await.push_keys.clone()
    }

    pub async fn cookie_header(&self) -> Option<String> {
        let g = self.inner.read().await;
        if g.cookies.is_empty() {
            return None;
        }
        Some(g.cookies.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("; "))
    }

    pub async fn sapisid(&self) -> Option<String> {
        let g = self.inner.read().await;
        g.cookies
            .get("SAPISID")
            .or_else(|| g.cookies.get("__Secure-1PAPISID"))
            .cloned()
    }

    // ── Mutators ──────────────────────────────────────────────────────────

    /// Applied on a `paired` pair-event: sets devices + token, and clears
    /// any outstanding `pairing_id`.
    pub async fn set_paired(
        &self,
        browser: Option<Device>,
        mobile: Option<Device>,
        token: Vec<u8>,
    ) {
        let mut g = self.inner.write().await;
        if browser.is_some() {
            g.browser_device = browser;
        }
        g.mobile_device = mobile;
        g.tachyon_token = Some(token);
        g.pairing_id = None;
    }

    /// Applied after a successful token refresh: updates token + expiry
    /// (+ ttl when provided). `ttl_micros` of 0 is treated as [`DEFAULT_TTL`].
    pub async fn set_token(&self, token: Vec<u8>, ttl_micros: Option<i64>) {
        let mut g = self.inner.write().await;
        let ttl = match ttl_micros {
            Some(0) | None => DEFAULT_TTL,
            Some(us) => Duration::from_micros(us as u64),
        };
        g.tachyon_token = Some(token);
        g.tachyon_expiry = Some(SystemTime::now() + ttl);
        g.tachyon_ttl = ttl;
    }

    pub async fn set_browser(&self, device: Device) {
        self.inner.write().await.browser_device = Some(device);
    }

    pub async fn set_mobile(&self, device: Device) {
        self.inner.write().await.mobile_device = Some(device);
    }

    pub async fn set_dest_reg_id(&self, id: Uuid) {
        self.inner.write().await.dest_reg_id = Some(id);
    }

    pub async fn set_pairing_id(&self, id: Uuid) {
        self.inner.write().await.pairing_id = Some(id);
    }

    pub async fn set_push_keys(&self, keys: PushKeys) {
        self.inner.write().await.push_keys = Some(keys);
    }

    pub async fn set_web_encryption_key(&self, key: Vec<u8>) {
        self.inner.write().await.web_encryption_key = Some(key);
    }

    /// Rotate the session id, as done once a fresh stream connection settles.
    pub async fn rotate_session_id(&self) -> Uuid {
        let mut g = self.inner.write().await;
        let new_id = Uuid::new_v4();
        g.session_id = new_id;
        new_id
    }

    /// Merge `Set-Cookie` directives from an HTTP response into the cookie
    /// map. Each entry is `name=value` with attributes already stripped by
    /// the caller.
    pub async fn merge_cookies(&self, pairs: impl IntoIterator<Item = (String, String)>) {
        let mut g = self.inner.write().await;
        for (name, value) in pairs {
            g.cookies.insert(name, value);
        }
    }

    pub async fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.write().await.cookies.insert(name.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn not_logged_in_without_token_or_browser() {
        let auth = AuthState::new_for_pairing(false);
        assert!(!auth.is_logged_in().await);
        auth.set_browser(Device { user_id: "u".into(), source_id: "s".into(), network: "n".into() }).await;
        assert!(!auth.is_logged_in().await, "token still missing");
        auth.set_token(vec![1, 2, 3], None).await;
        assert!(auth.is_logged_in().await);
    }

    #[tokio::test]
    async fn zero_ttl_is_treated_as_24h() {
        let auth = AuthState::new_for_pairing(false);
        auth.set_token(vec![1], Some(0)).await;
        assert_eq!(auth.tachyon_ttl_micros().await, DEFAULT_TTL.as_micros() as i64);
    }

    #[tokio::test]
    async fn needs_refresh_when_expiry_absent_or_close() {
        let auth = AuthState::new_for_pairing(false);
        assert!(auth.needs_token_refresh().await, "no token yet => needs refresh");
        auth.set_token(vec![1], Some(Duration::from_secs(30 * 60).as_micros() as i64)).await;
        assert!(auth.needs_token_refresh().await, "30 min left is within the 1h window");
        auth.set_token(vec![1], Some(Duration::from_secs(2 * 3600).as_micros() as i64)).await;
        assert!(!auth.needs_token_refresh().await);
    }

    #[tokio::test]
    async fn google_host_iff_not_gaia_or_cookies_present() {
        let qr = AuthState::new_for_pairing(false);
        assert!(qr.should_use_google_host().await, "QR session with no cookies still uses the Google host");

        let gaia = AuthState::new_for_pairing(true);
        assert!(!gaia.should_use_google_host().await, "Gaia session with no cookies does not");
        gaia.set_cookie("SAPISID", "abc").await;
        assert!(gaia.should_use_google_host().await, "cookies present flips it regardless of session kind");
    }

    #[tokio::test]
    async fn sapisid_header_checks_both_cookie_names() {
        let auth = AuthState::new_for_pairing(false);
        assert_eq!(auth.sapisid().await, None);
        auth.set_cookie("__Secure-1PAPISID", "xyz").await;
        assert_eq!(auth.sapisid().await, Some("xyz".to_owned()));
    }

    #[tokio::test]
    async fn round_trips_through_data_form() {
        let auth = AuthState::new_for_pairing(true);
        auth.set_browser(Device { user_id: "u".into(), source_id: "s".into(), network: "n".into() }).await;
        auth.set_token(vec![9, 9, 9], Some(500_000)).await;
        auth.set_cookie("SID", "v").await;

        let data = auth.to_data().await;
        let json = serde_json::to_vec(&data).unwrap();
        let restored_data: AuthStateData = serde_json::from_slice(&json).unwrap();
        let restored = AuthState::from_data(restored_data).unwrap();

        assert_eq!(restored.tachyon_token().await, Some(vec![9, 9, 9]));
        assert!(restored.is_logged_in().await);
        assert_eq!(restored.cookie_header().await, Some("SID=v".to_owned()));
    }
}

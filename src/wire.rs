//! Concrete message shapes carried over the wire, built on top of the
//! generic [`crate::pblite`] tree.
//!
//! This core has no compiled `.proto` schema — generated protobuf stubs are
//! an external concern — so each message below is a thin, hand-rolled shape
//! over [`PbMessage`]/[`PbValue`] covering exactly the fields the
//! session-RPC and long-poll engines read or write. Domain payload bodies
//! (conversation/message/contact content) are forwarded to callers as
//! opaque [`serde_json::Value`]; high-level RPC methods over that content
//! are left to the embedding application.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TachyonError};
use crate::pblite::{decode, encode, FieldKind, PbMessage, PbValue};

// ─── Enums carried in every envelope: Bugle route / action / message-type ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BugleRoute {
    PairEvent,
    DataEvent,
    GaiaEvent,
}

impl BugleRoute {
    fn as_i64(self) -> i64 {
        match self {
            BugleRoute::PairEvent => 1,
            BugleRoute::DataEvent => 2,
            BugleRoute::GaiaEvent => 3,
        }
    }

    fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(BugleRoute::PairEvent),
            2 => Some(BugleRoute::DataEvent),
            3 => Some(BugleRoute::GaiaEvent),
            _ => None,
        }
    }
}

/// Message-type overrides follow observed rules: the first conversation
/// fetch uses `BUGLE_ANNOTATION`, all Gaia pairing uses `GAIA2` except
/// `clientFinished` which uses `BUGLE_MESSAGE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    BugleMessage,
    BugleAnnotation,
    Gaia2,
}

impl MessageType {
    fn as_i64(self) -> i64 {
        match self {
            MessageType::BugleMessage => 1,
            MessageType::BugleAnnotation => 2,
            MessageType::Gaia2 => 6,
        }
    }
}

/// The action selector carried in the inner payload of every RPC envelope.
/// Only the actions this core actually issues or special-cases are named;
/// unrecognized wire values round-trip as [`Action::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    GetUpdates,
    SendMessage,
    AckMessages,
    RegisterPhoneRelay,
    RefreshPhoneRelay,
    GetWebEncryptionKey,
    RevokeRelayPairing,
    SignInGaia,
    RegisterRefresh,
    NotifyDittoActivity,
    IsBugleDefault,
    GaiaPairingInit,
    GaiaClientFinished,
    Unknown(i64),
}

impl Action {
    fn as_i64(self) -> i64 {
        match self {
            Action::GetUpdates => 1,
            Action::SendMessage => 2,
            Action::AckMessages => 3,
            Action::RegisterPhoneRelay => 4,
            Action::RefreshPhoneRelay => 5,
            Action::GetWebEncryptionKey => 6,
            Action::RevokeRelayPairing => 7,
            Action::SignInGaia => 8,
            Action::RegisterRefresh => 9,
            Action::NotifyDittoActivity => 10,
            Action::IsBugleDefault => 11,
            Action::GaiaPairingInit => 12,
            Action::GaiaClientFinished => 13,
            Action::Unknown(v) => v,
        }
    }

    fn from_i64(v: i64) -> Self {
        match v {
            1 => Action::GetUpdates,
            2 => Action::SendMessage,
            3 => Action::AckMessages,
            4 => Action::RegisterPhoneRelay,
            5 => Action::RefreshPhoneRelay,
            6 => Action::GetWebEncryptionKey,
            7 => Action::RevokeRelayPairing,
            8 => Action::SignInGaia,
            9 => Action::RegisterRefresh,
            10 => Action::NotifyDittoActivity,
            11 => Action::IsBugleDefault,
            12 => Action::GaiaPairingInit,
            13 => Action::GaiaClientFinished,
            other => Action::Unknown(other),
        }
    }

    /// Both Gaia pairing actions are treated as the "Gaia pairing action"
    /// exception in the phantom-response filter.
    pub fn is_gaia_pairing(self) -> bool {
        matches!(self, Action::GaiaPairingInit | Action::GaiaClientFinished)
    }
}

// ─── Device triple: AuthState browser-device / mobile-device ────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub user_id: String,
    pub source_id: String,
    pub network: String,
}

fn encode_device(device: &Device) -> PbMessage {
    PbMessage::new("messaging.Device")
        .set(1, PbValue::Str(device.user_id.clone()))
        .set(2, PbValue::Str(device.source_id.clone()))
        .set(3, PbValue::Str(device.network.clone()))
}

fn device_schema() -> Vec<(u32, FieldKind)> {
    vec![(1, FieldKind::Str), (2, FieldKind::Str), (3, FieldKind::Str)]
}

fn decode_device(msg: &PbMessage) -> Option<Device> {
    let PbValue::Str(user_id) = msg.get(1)?.clone() else { return None };
    let PbValue::Str(source_id) = msg.get(2)?.clone() else { return None };
    let PbValue::Str(network) = msg.get(3)?.clone() else { return None };
    Some(Device { user_id, source_id, network })
}

// ─── Outgoing RPC envelope ───────────────────────────────────────────────────

/// One outgoing RPC payload, built by the session-RPC engine and handed to
/// the HTTP layer for posting.
pub struct OutgoingEnvelope {
    pub mobile: Option<Device>,
    pub request_id: String,
    pub message_type: MessageType,
    pub action: Action,
    pub session_id: String,
    /// Exactly one of these is populated — enforced by the caller, not the
    /// wire shape.
    pub encrypted_proto_data: Option<Vec<u8>>,
    pub unencrypted_proto_data: Option<Vec<u8>>,
    pub auth_request_id: String,
    pub token: Vec<u8>,
    pub destination_registration_ids: Vec<String>,
    /// Microseconds; `None` when the caller passed `omit_ttl`.
    pub ttl_micros: Option<i64>,
}

impl OutgoingEnvelope {
    pub fn encode(&self) -> Value {
        let inner = PbMessage::new("rpc.InnerPayload")
            .set(1, PbValue::Str(self.request_id.clone()))
            .set(2, PbValue::Int(self.action.as_i64()))
            .set(3, PbValue::Str(self.session_id.clone()))
            .set_opt(4, self.encrypted_proto_data.clone().map(PbValue::Bytes))
            .set_opt(5, self.unencrypted_proto_data.clone().map(PbValue::Bytes));

        let data = PbMessage::new("rpc.OutgoingRPCMessage.Data")
            .set(1, PbValue::Str(self.request_id.clone()))
            .set(2, PbValue::Int(BugleRoute::DataEvent.as_i64()))
            .set(3, PbValue::Int(self.message_type.as_i64()))
            .set(4, PbValue::Message(inner));

        let config_version = PbMessage::new("rpc.ConfigVersion")
            .set(1, PbValue::Int(crate::config::CONFIG_VERSION.year as i64))
            .set(2, PbValue::Int(crate::config::CONFIG_VERSION.month as i64))
            .set(3, PbValue::Int(crate::config::CONFIG_VERSION.day as i64))
            .set(4, PbValue::Int(crate::config::CONFIG_VERSION.v1 as i64))
            .set(5, PbValue::Int(crate::config::CONFIG_VERSION.v2 as i64));

        let auth = PbMessage::new("rpc.OutgoingRPCMessage.Auth")
            .set(1, PbValue::Str(self.auth_request_id.clone()))
            .set(2, PbValue::Bytes(self.token.clone()))
            .set(3, PbValue::Message(config_version));

        let dest_reg_ids = self
            .destination_registration_ids
            .iter()
            .cloned()
            .map(PbValue::Str)
            .collect::<Vec<_>>();

        let envelope = PbMessage::new("rpc.OutgoingRPCMessage")
            .set_opt(1, self.mobile.as_ref().map(|d| PbValue::Message(encode_device(d))))
            .set(2, PbValue::Message(data))
            .set(3, PbValue::Message(auth))
            .set_opt(
                4,
                (!dest_reg_ids.is_empty()).then_some(PbValue::Repeated(dest_reg_ids)),
            )
            .set_opt(5, self.ttl_micros.map(PbValue::Int));
            // field 9 is this message's binary-override entry; this core
            // has never observed it populated and does not set it.

        encode(&envelope)
    }
}

// ─── ReceiveMessagesRequest ──────────────────────────────────────────────────

pub fn encode_receive_messages_request(request_id: &str, auth_request_id: &str, token: &[u8]) -> Value {
    let auth = PbMessage::new("rpc.ReceiveMessagesRequest.Auth")
        .set(1, PbValue::Str(auth_request_id.to_owned()))
        .set(2, PbValue::Bytes(token.to_vec()));
    let msg = PbMessage::new("rpc.ReceiveMessagesRequest")
        .set(1, PbValue::Message(auth))
        .set(2, PbValue::Str(request_id.to_owned()));
    encode(&msg)
}

// ─── URLData: QR URL format ──────────────────────────────────────────────────

pub struct UrlData {
    pub pairing_key: Vec<u8>,
    pub aes_key: Vec<u8>,
    pub hmac_key: Vec<u8>,
}

pub fn encode_url_data(data: &UrlData) -> Vec<u8> {
    let msg = PbMessage::new("authentication.URLData")
        .set(1, PbValue::Bytes(data.pairing_key.clone()))
        .set(2, PbValue::Bytes(data.aes_key.clone()))
        .set(3, PbValue::Bytes(data.hmac_key.clone()));
    crate::pblite::wire::encode_message(&msg)
}

pub fn decode_url_data(bytes: &[u8]) -> Result<UrlData> {
    let schema = vec![(1, FieldKind::Bytes), (2, FieldKind::Bytes), (3, FieldKind::Bytes)];
    let msg = crate::pblite::wire::decode_message("authentication.URLData", bytes, &schema)?;
    let pairing_key = match msg.get(1) {
        Some(PbValue::Bytes(b)) => b.clone(),
        _ => Vec::new(),
    };
    let aes_key = match msg.get(2) {
        Some(PbValue::Bytes(b)) => b.clone(),
        _ => Vec::new(),
    };
    let hmac_key = match msg.get(3) {
        Some(PbValue::Bytes(b)) => b.clone(),
        _ => Vec::new(),
    };
    Ok(UrlData { pairing_key, aes_key, hmac_key })
}

// ─── RegisterPhoneRelay ───────────────────────────────────────────────────────
//
// Pairing RPCs are raw protobuf, not pblite, so these go through
// `pblite::wire`'s minimal standard codec rather than the JSON-array
// `encode`/`decode` pair the rest of this module uses.

/// The request that hands the server this browser's refresh-key public key
/// so the phone can later authenticate it. The response, if it carries a
/// token at all, lets the caller skip straight to an authenticated first
/// connection instead of waiting on the pair event alone.
pub fn encode_register_phone_relay_request(e2ee_public_key: &[u8]) -> Vec<u8> {
    let msg = PbMessage::new("pairing.RegisterPhoneRelayRequest").set(1, PbValue::Bytes(e2ee_public_key.to_vec()));
    crate::pblite::wire::encode_message(&msg)
}

pub fn decode_register_phone_relay_response(bytes: &[u8]) -> Result<Option<Vec<u8>>> {
    let schema = vec![(1, FieldKind::Bytes)];
    let msg = crate::pblite::wire::decode_message("pairing.RegisterPhoneRelayResponse", bytes, &schema)?;
    Ok(match msg.get(1) {
        Some(PbValue::Bytes(b)) => Some(b.clone()),
        _ => None,
    })
}

// ─── GetWebEncryptionKey / RevokeRelayPairing ────────────────────────────────
//
// Thin pass-throughs sharing RegisterPhoneRelay's envelope-building and
// protobuf path: these ride the same wire shape as registration/refresh and
// cost nothing extra to expose on the client facade.

/// `GetWebEncryptionKey` carries no request fields beyond the browser
/// identity, which the pairing service already knows from the call's
/// authentication context.
pub fn encode_get_web_encryption_key_request() -> Vec<u8> {
    crate::pblite::wire::encode_message(&PbMessage::new("pairing.GetWebEncryptionKeyRequest"))
}

pub fn decode_get_web_encryption_key_response(bytes: &[u8]) -> Result<Vec<u8>> {
    let schema = vec![(1, FieldKind::Bytes)];
    let msg = crate::pblite::wire::decode_message("pairing.GetWebEncryptionKeyResponse", bytes, &schema)?;
    Ok(match msg.get(1) {
        Some(PbValue::Bytes(b)) => b.clone(),
        _ => Vec::new(),
    })
}

/// `RevokeRelayPairing` identifies the pairing to revoke by the browser
/// device triple; the response carries no payload this core reads.
pub fn encode_revoke_relay_pairing_request(browser: &Device) -> Vec<u8> {
    let msg = PbMessage::new("pairing.RevokeRelayPairingRequest").set(1, PbValue::Message(encode_device(browser)));
    crate::pblite::wire::encode_message(&msg)
}

// ─── Pair event (pair-event route) ───────────────────────────────────────────

pub enum PairEvent {
    Paired { phone_id: String, token: Vec<u8>, browser: Option<Device>, mobile: Option<Device> },
    Revoked,
}

fn pair_event_schema() -> Vec<(u32, FieldKind)> {
    vec![
        (
            1,
            FieldKind::Message(
                "authentication.PairEvent.Paired",
                vec![
                    (1, FieldKind::Str),
                    (2, FieldKind::Bytes),
                    (3, FieldKind::Message("messaging.Device", device_schema())),
                    (4, FieldKind::Message("messaging.Device", device_schema())),
                ],
            ),
        ),
        (2, FieldKind::Bool),
    ]
}

pub fn decode_pair_event(value: &Value) -> Result<PairEvent> {
    let msg = decode("authentication.PairEvent", value, &pair_event_schema())?;
    if let Some(PbValue::Message(paired)) = msg.get(1) {
        let phone_id = match paired.get(1) {
            Some(PbValue::Str(s)) => s.clone(),
            _ => String::new(),
        };
        let token = match paired.get(2) {
            Some(PbValue::Bytes(b)) => b.clone(),
            _ => Vec::new(),
        };
        let browser = match paired.get(3) {
            Some(PbValue::Message(m)) => decode_device(m),
            _ => None,
        };
        let mobile = match paired.get(4) {
            Some(PbValue::Message(m)) => decode_device(m),
            _ => None,
        };
        return Ok(PairEvent::Paired { phone_id, token, browser, mobile });
    }
    Ok(PairEvent::Revoked)
}

// ─── Long-poll stream element ────────────────────────────────────────────────

pub enum LongPollPayload {
    Data(IncomingEnvelope),
    Ack { count: i64 },
    Other,
}

pub struct IncomingEnvelope {
    pub bugle_route: BugleRoute,
    pub response_id: String,
    pub session_id: String,
    pub action: Action,
    pub encrypted_data: Option<Vec<u8>>,
    pub encrypted_data2: Option<Vec<u8>>,
    pub unencrypted_data: Option<Vec<u8>>,
}

fn incoming_inner_schema() -> Vec<(u32, FieldKind)> {
    vec![
        (1, FieldKind::Str),
        (2, FieldKind::Int),
        (3, FieldKind::Bytes),
        (4, FieldKind::Bytes),
        (5, FieldKind::Bytes),
    ]
}

fn long_poll_payload_schema() -> Vec<(u32, FieldKind)> {
    vec![
        (
            1,
            FieldKind::Message(
                "rpc.IncomingRPCMessage",
                vec![
                    (1, FieldKind::Int),
                    (2, FieldKind::Str),
                    (3, FieldKind::Message("rpc.IncomingInnerPayload", incoming_inner_schema())),
                ],
            ),
        ),
        (2, FieldKind::Message("rpc.AckPayload", vec![(1, FieldKind::Int)])),
    ]
}

/// Parse one decoded element of the `[[...]]` stream body. Any shape other
/// than `data`/`ack` — startRead, heartbeat, unrecognized — is ignored.
pub fn parse_long_poll_payload(value: &Value) -> Result<LongPollPayload> {
    let msg = decode("rpc.LongPollPayload", value, &long_poll_payload_schema())?;

    if let Some(PbValue::Message(ack)) = msg.get(2) {
        let count = match ack.get(1) {
            Some(PbValue::Int(n)) => *n,
            _ => 0,
        };
        return Ok(LongPollPayload::Ack { count });
    }

    if let Some(PbValue::Message(data)) = msg.get(1) {
        let bugle_route = match data.get(1) {
            Some(PbValue::Int(v)) => BugleRoute::from_i64(*v).unwrap_or(BugleRoute::GaiaEvent),
            _ => BugleRoute::GaiaEvent,
        };
        let response_id = match data.get(2) {
            Some(PbValue::Str(s)) => s.clone(),
            _ => String::new(),
        };
        let (session_id, action, encrypted_data, encrypted_data2, unencrypted_data) = match data.get(3) {
            Some(PbValue::Message(inner)) => {
                let session_id = match inner.get(1) {
                    Some(PbValue::Str(s)) => s.clone(),
                    _ => String::new(),
                };
                let action = match inner.get(2) {
                    Some(PbValue::Int(v)) => Action::from_i64(*v),
                    _ => Action::Unknown(0),
                };
                let enc = match inner.get(3) {
                    Some(PbValue::Bytes(b)) => Some(b.clone()),
                    _ => None,
                };
                let enc2 = match inner.get(4) {
                    Some(PbValue::Bytes(b)) => Some(b.clone()),
                    _ => None,
                };
                let unenc = match inner.get(5) {
                    Some(PbValue::Bytes(b)) => Some(b.clone()),
                    _ => None,
                };
                (session_id, action, enc, enc2, unenc)
            }
            _ => (String::new(), Action::Unknown(0), None, None, None),
        };
        return Ok(LongPollPayload::Data(IncomingEnvelope {
            bugle_route,
            response_id,
            session_id,
            action,
            encrypted_data,
            encrypted_data2,
            unencrypted_data,
        }));
    }

    Ok(LongPollPayload::Other)
}

// ─── Update envelope (updates handler) ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Conversation,
    Message,
    Typing,
    UserAlert,
    Settings,
    AccountChange,
    BrowserPresenceCheck,
    Unknown,
}

/// One item inside a decoded update envelope. The body is kept opaque —
/// domain "conversation/message/contact" shapes are left to the embedding
/// application — except for the handful of fields dispatch logic inspects
/// directly.
pub struct UpdateItem {
    pub kind: UpdateKind,
    pub update_id: Option<String>,
    /// Populated only for `AccountChange`; used by the account-change
    /// heuristic to detect a Gaia account string.
    pub account: Option<String>,
    pub raw: Value,
}

/// Parse the decrypted payload of a `GET_UPDATES`-routed envelope into its
/// constituent items, preserving the original array shape for each item in
/// `raw` since deep per-kind decoding of conversation/message/contact bodies
/// is left to the embedding application — only presence and, for
/// account-change, the account string are inspected.
pub fn parse_update_envelope(value: &Value) -> Result<Vec<UpdateItem>> {
    let raw_array = value
        .as_array()
        .ok_or_else(|| TachyonError::Codec("update envelope: expected a JSON array".into()))?;

    let update_id = raw_array.first().and_then(|v| v.as_str()).map(str::to_owned);

    let mut items = Vec::new();
    let mut push_opaque = |field: usize, kind: UpdateKind| {
        if let Some(raw) = raw_array.get(field - 1) {
            if !raw.is_null() {
                items.push(UpdateItem { kind, update_id: update_id.clone(), account: None, raw: raw.clone() });
            }
        }
    };

    push_opaque(2, UpdateKind::Conversation);
    push_opaque(3, UpdateKind::Message);
    push_opaque(4, UpdateKind::Typing);
    push_opaque(5, UpdateKind::UserAlert);
    push_opaque(6, UpdateKind::Settings);
    push_opaque(8, UpdateKind::BrowserPresenceCheck);

    if let Some(raw) = raw_array.get(6).filter(|v| !v.is_null()) {
        let account_schema = vec![(1, FieldKind::Str)];
        let account = decode("messaging.AccountChange", raw, &account_schema)
            .ok()
            .and_then(|m| match m.get(1) {
                Some(PbValue::Str(s)) => Some(s.clone()),
                _ => None,
            });
        items.push(UpdateItem {
            kind: UpdateKind::AccountChange,
            update_id: update_id.clone(),
            account,
            raw: raw.clone(),
        });
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_envelope_encodes_as_pblite_array() {
        let envelope = OutgoingEnvelope {
            mobile: Some(Device { user_id: "u".into(), source_id: "s".into(), network: "n".into() }),
            request_id: "req-1".into(),
            message_type: MessageType::BugleMessage,
            action: Action::GetUpdates,
            session_id: "sess-1".into(),
            encrypted_proto_data: Some(vec![1, 2, 3]),
            unencrypted_proto_data: None,
            auth_request_id: "req-1".into(),
            token: vec![9, 9],
            destination_registration_ids: Vec::new(),
            ttl_micros: Some(1_000_000),
        };
        let encoded = envelope.encode();
        assert!(encoded.is_array());
    }

    #[test]
    fn url_data_round_trips() {
        let data = UrlData { pairing_key: vec![1, 2], aes_key: vec![3; 32], hmac_key: vec![4; 32] };
        let bytes = encode_url_data(&data);
        let decoded = decode_url_data(&bytes).unwrap();
        assert_eq!(decoded.aes_key, data.aes_key);
        assert_eq!(decoded.hmac_key, data.hmac_key);
        assert_eq!(decoded.pairing_key, data.pairing_key);
    }

    #[test]
    fn ack_payload_parses_count() {
        let value = serde_json::json!([null, [3]]);
        match parse_long_poll_payload(&value).unwrap() {
            LongPollPayload::Ack { count } => assert_eq!(count, 3),
            _ => panic!("expected ack"),
        }
    }

    #[test]
    fn gaia_pairing_actions_are_recognized() {
        assert!(Action::GaiaPairingInit.is_gaia_pairing());
        assert!(Action::GaiaClientFinished.is_gaia_pairing());
        assert!(!Action::GetUpdates.is_gaia_pairing());
    }

    #[test]
    fn web_encryption_key_response_round_trips() {
        let msg = PbMessage::new("pairing.GetWebEncryptionKeyResponse").set(1, PbValue::Bytes(vec![1, 2, 3, 4]));
        let bytes = crate::pblite::wire::encode_message(&msg);
        assert_eq!(decode_get_web_encryption_key_response(&bytes).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn revoke_relay_pairing_request_encodes_browser_device() {
        let browser = Device { user_id: "u".into(), source_id: "s".into(), network: "n".into() };
        let bytes = encode_revoke_relay_pairing_request(&browser);
        assert!(!bytes.is_empty());
    }
}

//! Invite & Signaling Envelope (C3).
//!
//! Packs and unpacks the invite/answer/bootstrap/nostr codes peers exchange
//! out-of-band to establish a data channel (§4.3). Every envelope but the
//! legacy short code shares the same shape: canonical JSON payload, gzip,
//! an 8-byte HMAC-SHA256 tag under the group key, base64url without padding,
//! behind a scheme-specific prefix.

use crate::error::{EnvelopeError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::io::Read;
use weftmesh_core::crypto::{mac, verify_mac};
use weftmesh_core::types::{InviteKind, InvitePayload};

/// Tag length for modern envelopes (§3, §4.3).
const ENVELOPE_TAG_LEN: usize = 8;
/// Tag length for the legacy short code (§4.3, §9 open question).
const LEGACY_TAG_LEN: usize = 4;

const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn scheme_prefix(kind: InviteKind) -> &'static str {
    match kind {
        InviteKind::Offer => "syncshell://",
        InviteKind::Answer => "answer://",
        InviteKind::Bootstrap => "BOOTSTRAP:",
        InviteKind::Nostr => "NOSTR:",
        InviteKind::Legacy => "",
    }
}

/// Pack an invite payload into its textual wire form.
///
/// `payload.kind` must not be [`InviteKind::Legacy`] — the legacy short code
/// has its own fixed binary layout and is produced by
/// [`generate_legacy`]/[`decode_legacy`] instead.
pub fn generate(payload: &InvitePayload, group_key: &[u8]) -> Result<String> {
    if payload.kind == InviteKind::Legacy {
        return Err(EnvelopeError::InvalidPayload(
            "legacy invites use generate_legacy, not generate".into(),
        ));
    }

    let json = weftmesh_core::canonical::canonical_json_bytes(payload)?;

    let mut gz = GzEncoder::new(&json[..], Compression::default());
    let mut compressed = Vec::new();
    gz.read_to_end(&mut compressed)
        .map_err(|e| EnvelopeError::InvalidPayload(e.to_string()))?;

    let tag = mac(group_key, &compressed, ENVELOPE_TAG_LEN);
    let mut body = compressed;
    body.extend_from_slice(&tag);

    let encoded = URL_SAFE_NO_PAD.encode(body);
    Ok(format!("{}{}", scheme_prefix(payload.kind), encoded))
}

/// Unpack and verify an invite/signaling code against the group key.
///
/// Accepts base64url with or without padding, tolerating `-`/`_` substituted
/// for `+`/`/` per §6 — `URL_SAFE_NO_PAD` already only ever produces the
/// former, but we decode leniently in case a peer's client normalized
/// differently before sending.
pub fn decode(text: &str, group_key: &[u8]) -> Result<InvitePayload> {
    let (kind, encoded) = split_scheme(text)?;

    let body = decode_base64url_lenient(encoded)
        .ok_or_else(|| EnvelopeError::InvalidFormat("not valid base64url".into()))?;

    if body.len() < ENVELOPE_TAG_LEN {
        return Err(EnvelopeError::InvalidFormat("envelope too short".into()));
    }
    let (compressed, tag) = body.split_at(body.len() - ENVELOPE_TAG_LEN);
    if !verify_mac(group_key, compressed, tag) {
        return Err(EnvelopeError::InvalidSignature);
    }

    let mut gz = GzDecoder::new(compressed);
    let mut json = Vec::new();
    gz.read_to_end(&mut json)
        .map_err(|e| EnvelopeError::InvalidPayload(e.to_string()))?;

    let payload: InvitePayload = serde_json::from_slice(&json).map_err(weftmesh_core::Error::from)?;
    if payload.kind != kind {
        return Err(EnvelopeError::InvalidPayload(format!(
            "scheme prefix claimed {:?} but payload carries {:?}",
            kind, payload.kind
        )));
    }
    Ok(payload)
}

fn split_scheme(text: &str) -> Result<(InviteKind, &str)> {
    for (kind, prefix) in [
        (InviteKind::Offer, scheme_prefix(InviteKind::Offer)),
        (InviteKind::Answer, scheme_prefix(InviteKind::Answer)),
        (InviteKind::Bootstrap, scheme_prefix(InviteKind::Bootstrap)),
        (InviteKind::Nostr, scheme_prefix(InviteKind::Nostr)),
    ] {
        if let Some(rest) = text.strip_prefix(prefix) {
            return Ok((kind, rest));
        }
    }
    Err(EnvelopeError::InvalidFormat(
        "no recognized invite scheme prefix".into(),
    ))
}

fn decode_base64url_lenient(s: &str) -> Option<Vec<u8>> {
    let normalized: String = s.chars().map(|c| match c {
        '-' => '+',
        '_' => '/',
        other => other,
    }).collect();
    if let Ok(bytes) = URL_SAFE_NO_PAD.decode(s) {
        return Some(bytes);
    }
    base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(normalized.trim_end_matches('='))
        .ok()
}

/// Legacy short code: base-36 over
/// `{ipv4[4] | port_le[2] | counter_le[8] | hmac4}` (§4.3, §6).
///
/// The HMAC here is truncated to 4 bytes (~16 bits of forgery resistance).
/// §9 flags this as weak but does not direct retiring it, so it remains
/// accepted for backward compatibility (see DESIGN.md).
pub fn generate_legacy(ipv4: [u8; 4], port: u16, counter: u64, group_key: &[u8]) -> String {
    let mut buf = Vec::with_capacity(18);
    buf.extend_from_slice(&ipv4);
    buf.extend_from_slice(&port.to_le_bytes());
    buf.extend_from_slice(&counter.to_le_bytes());
    let tag = mac(group_key, &buf, LEGACY_TAG_LEN);
    buf.extend_from_slice(&tag);
    base36_encode(&buf)
}

/// Decode and verify a legacy short code, returning `(ipv4, port, counter)`.
pub fn decode_legacy(text: &str, group_key: &[u8]) -> Result<([u8; 4], u16, u64)> {
    let buf = base36_decode(text)
        .ok_or_else(|| EnvelopeError::InvalidFormat("not valid base-36".into()))?;
    if buf.len() != 4 + 2 + 8 + LEGACY_TAG_LEN {
        return Err(EnvelopeError::InvalidFormat("legacy code wrong length".into()));
    }
    let (body, tag) = buf.split_at(buf.len() - LEGACY_TAG_LEN);
    if !verify_mac(group_key, body, tag) {
        return Err(EnvelopeError::InvalidSignature);
    }
    let ipv4 = [body[0], body[1], body[2], body[3]];
    let port = u16::from_le_bytes([body[4], body[5]]);
    let counter = u64::from_le_bytes(body[6..14].try_into().unwrap());
    Ok((ipv4, port, counter))
}

/// Encode bytes as a base-36 string (big-endian big-number encoding, no
/// fixed width — leading zero bytes collapse the same way leading zero
/// digits do in any positional numeral system).
fn base36_encode(bytes: &[u8]) -> String {
    let mut digits: Vec<u8> = bytes.to_vec();
    let mut out = Vec::new();
    while digits.iter().any(|&b| b != 0) {
        let mut remainder: u32 = 0;
        for d in digits.iter_mut() {
            let acc = (remainder << 8) | *d as u32;
            *d = (acc / 36) as u8;
            remainder = acc % 36;
        }
        out.push(BASE36_ALPHABET[remainder as usize]);
    }
    if out.is_empty() {
        out.push(b'0');
    }
    out.reverse();
    String::from_utf8(out).expect("base36 alphabet is ASCII")
}

fn base36_decode(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() {
        return None;
    }
    let mut value: Vec<u8> = vec![0];
    for c in s.chars() {
        let digit = BASE36_ALPHABET
            .iter()
            .position(|&b| b.eq_ignore_ascii_case(&(c as u8)))? as u32;
        let mut carry = digit;
        for byte in value.iter_mut().rev() {
            let acc = (*byte as u32) * 36 + carry;
            *byte = (acc & 0xFF) as u8;
            carry = acc >> 8;
        }
        while carry > 0 {
            value.insert(0, (carry & 0xFF) as u8);
            carry >>= 8;
        }
    }
    // Pad to the fixed 18-byte legacy layout.
    while value.len() < 18 {
        value.insert(0, 0);
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weftmesh_core::types::GroupId;

    fn payload(kind: InviteKind) -> InvitePayload {
        InvitePayload {
            group_id: GroupId("deadbeef".into()),
            kind,
            sdp: Some("v=0...".into()),
            answer_channel: None,
            bootstrap_hint: None,
            relay: None,
            uuid: None,
        }
    }

    #[test]
    fn roundtrip_offer() {
        let key = b"group-key-material";
        let p = payload(InviteKind::Offer);
        let code = generate(&p, key).unwrap();
        assert!(code.starts_with("syncshell://"));
        let decoded = decode(&code, key).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn wrong_key_fails() {
        let p = payload(InviteKind::Answer);
        let code = generate(&p, b"right-key").unwrap();
        assert!(matches!(
            decode(&code, b"wrong-key"),
            Err(EnvelopeError::InvalidSignature)
        ));
    }

    #[test]
    fn legacy_roundtrip() {
        let key = b"legacy-key";
        let code = generate_legacy([192, 168, 1, 42], 7777, 99, key);
        let (ip, port, counter) = decode_legacy(&code, key).unwrap();
        assert_eq!(ip, [192, 168, 1, 42]);
        assert_eq!(port, 7777);
        assert_eq!(counter, 99);
    }

    #[test]
    fn legacy_wrong_key_fails() {
        let code = generate_legacy([1, 2, 3, 4], 1, 1, b"a");
        assert!(decode_legacy(&code, b"b").is_err());
    }

    #[test]
    fn base36_roundtrip_small_values() {
        let bytes = [0u8; 18];
        let encoded = base36_encode(&bytes);
        let decoded = base36_decode(&encoded).unwrap();
        assert_eq!(decoded, bytes);
    }
}

//! TSIG transaction signatures for inbound verification and outbound signing
//!
//! A single shared key is configured at startup as `name:base64secret`. When
//! a key is present, replies are signed with hmac-sha256 and a 300 second
//! fudge window; inbound messages carrying a TSIG record are verified against
//! the key table. Without a key both paths are no-ops.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use derive_more::{Display, Error, From};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::protocol::{DnsPacket, DnsRecord, CLASS_ANY};

#[derive(Debug, Display, From, Error)]
pub enum TsigError {
    Buffer(crate::dns::buffer::BufferError),
    Protocol(crate::dns::protocol::ProtocolError),
    Base64(base64::DecodeError),
    #[display(fmt = "key spec must look like name:base64secret")]
    MalformedKeySpec,
    #[display(fmt = "invalid key material")]
    BadKey,
    #[display(fmt = "message is not signed")]
    Unsigned,
    #[display(fmt = "unknown key")]
    UnknownKey,
    #[display(fmt = "unsupported algorithm")]
    UnsupportedAlgorithm,
    #[display(fmt = "bad signature")]
    BadSignature,
    #[display(fmt = "signature time outside fudge window")]
    BadTime,
}

type Result<T> = std::result::Result<T, TsigError>;

type HmacSha256 = Hmac<Sha256>;

/// The one MAC algorithm this server speaks
pub const ALGORITHM_NAME: &str = "hmac-sha256";

/// Seconds of clock skew tolerated around the signing timestamp
pub const DEFAULT_FUDGE: u16 = 300;

/// Seconds since the unix epoch, as used in the time signed field
pub fn unix_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs(),
        Err(_) => 0,
    }
}

/// Key names are compared in the parsed qname form: lowercase, no trailing
/// dot. Everybody forgets to qualify the key name, so do it for them.
fn normalize_key_name(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

/// Shared secrets by key name, built once at startup and read-only afterward
#[derive(Default)]
pub struct TsigKeyTable {
    keys: HashMap<String, Vec<u8>>,
}

impl TsigKeyTable {
    pub fn new() -> TsigKeyTable {
        TsigKeyTable::default()
    }

    /// Parse a `name:base64secret` command line spec into a one key table
    pub fn from_spec(spec: &str) -> Result<TsigKeyTable> {
        let (name, secret) = spec.split_once(':').ok_or(TsigError::MalformedKeySpec)?;
        if name.is_empty() {
            return Err(TsigError::MalformedKeySpec);
        }

        let mut table = TsigKeyTable::new();
        table.add(name, base64::decode(secret)?);

        Ok(table)
    }

    pub fn add(&mut self, name: &str, secret: Vec<u8>) {
        self.keys.insert(normalize_key_name(name), secret);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.keys.get(&normalize_key_name(name)).map(|x| &x[..])
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The signing key. With the single `name:secret` startup configuration
    /// there is at most one entry.
    pub fn signing_key(&self) -> Option<(&str, &[u8])> {
        self.keys.iter().next().map(|(k, v)| (k.as_str(), &v[..]))
    }
}

/// Canonical byte form of a packet for MAC purposes: no compression, no size
/// ceiling. The packet is cloned since writing fixes up the header counts.
fn serialize_unsigned(packet: &DnsPacket) -> Result<Vec<u8>> {
    let mut copy = packet.clone();
    let mut buffer = VectorPacketBuffer::without_compression();
    copy.write(&mut buffer, usize::MAX)?;

    Ok(buffer.buffer)
}

/// MAC state over the message bytes followed by the TSIG variables in wire
/// form; the caller either finalizes it (signing) or verifies against it
fn compute_mac(
    secret: &[u8],
    message: &[u8],
    key_name: &str,
    time_signed: u64,
    fudge: u16,
    error: u16,
    other: &[u8],
) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TsigError::BadKey)?;
    mac.update(message);

    let mut vars = VectorPacketBuffer::without_compression();
    vars.write_qname(key_name)?;
    vars.write_u16(CLASS_ANY)?;
    vars.write_u32(0)?; // ttl
    vars.write_qname(ALGORITHM_NAME)?;
    vars.write_u16((time_signed >> 32) as u16)?;
    vars.write_u32((time_signed & 0xFFFF_FFFF) as u32)?;
    vars.write_u16(fudge)?;
    vars.write_u16(error)?;
    vars.write_u16(other.len() as u16)?;
    for b in other {
        vars.write_u8(*b)?;
    }
    mac.update(&vars.buffer);

    Ok(mac)
}

/// Sign `packet` by appending a TSIG record to its additional section
pub fn sign_packet(
    packet: &mut DnsPacket,
    key_name: &str,
    secret: &[u8],
    now: u64,
) -> Result<()> {
    let key_name = normalize_key_name(key_name);
    let message = serialize_unsigned(packet)?;
    let mac = compute_mac(secret, &message, &key_name, now, DEFAULT_FUDGE, 0, &[])?
        .finalize()
        .into_bytes()
        .to_vec();

    packet.resources.push(DnsRecord::Tsig {
        domain: key_name,
        algorithm: ALGORITHM_NAME.to_string(),
        time_signed: now,
        fudge: DEFAULT_FUDGE,
        mac,
        original_id: packet.header.id,
        error: 0,
        other: Vec::new(),
    });

    Ok(())
}

/// Verify the TSIG record of an inbound message against the key table
///
/// The MAC is recomputed over the message with the TSIG record stripped and
/// the original id restored, then compared in constant time. The signing
/// timestamp must lie within the fudge window around `now`.
pub fn verify_packet(packet: &DnsPacket, keys: &TsigKeyTable, now: u64) -> Result<()> {
    let (key_name, algorithm, time_signed, fudge, mac, original_id, error, other) =
        match packet.tsig_record() {
            Some(DnsRecord::Tsig {
                domain,
                algorithm,
                time_signed,
                fudge,
                mac,
                original_id,
                error,
                other,
            }) => (
                domain.clone(),
                algorithm.clone(),
                *time_signed,
                *fudge,
                mac.clone(),
                *original_id,
                *error,
                other.clone(),
            ),
            _ => return Err(TsigError::Unsigned),
        };

    if algorithm != ALGORITHM_NAME {
        return Err(TsigError::UnsupportedAlgorithm);
    }

    let secret = keys.get(&key_name).ok_or(TsigError::UnknownKey)?;

    let mut stripped = packet.clone();
    stripped.resources.pop();
    stripped.header.id = original_id;
    let message = serialize_unsigned(&stripped)?;

    compute_mac(
        secret,
        &message,
        &normalize_key_name(&key_name),
        time_signed,
        fudge,
        error,
        &other,
    )?
    .verify_slice(&mac)
    .map_err(|_| TsigError::BadSignature)?;

    let skew = if now > time_signed {
        now - time_signed
    } else {
        time_signed - now
    };
    if skew > fudge as u64 {
        return Err(TsigError::BadTime);
    }

    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::protocol::{DnsQuestion, QueryType, TransientTtl};

    fn signed_packet(table: &TsigKeyTable, now: u64) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = 4242;
        packet
            .questions
            .push(DnsQuestion::new("whoami.example.org".to_string(), QueryType::A));
        packet.answers.push(DnsRecord::A {
            domain: "whoami.example.org".to_string(),
            addr: "203.0.113.7".parse().unwrap(),
            ttl: TransientTtl(0),
        });

        let (name, secret) = table.signing_key().unwrap();
        let (name, secret) = (name.to_string(), secret.to_vec());
        sign_packet(&mut packet, &name, &secret, now).unwrap();

        packet
    }

    fn test_table() -> TsigKeyTable {
        TsigKeyTable::from_spec(&format!("testkey.example.org:{}", base64::encode(b"sekrit")))
            .unwrap()
    }

    #[test]
    fn test_sign_then_verify() {
        let table = test_table();
        let packet = signed_packet(&table, 1_700_000_000);

        assert!(packet.tsig_record().is_some());
        verify_packet(&packet, &table, 1_700_000_000).unwrap();

        // still fine at the edge of the fudge window
        verify_packet(&packet, &table, 1_700_000_000 + DEFAULT_FUDGE as u64).unwrap();
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let table = test_table();
        let packet = signed_packet(&table, 1_700_000_000);

        let mut other_table = TsigKeyTable::new();
        other_table.add("testkey.example.org", b"wrong".to_vec());

        match verify_packet(&packet, &other_table, 1_700_000_000) {
            Err(TsigError::BadSignature) => {}
            other => panic!("expected BadSignature, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_verify_rejects_unknown_key() {
        let table = test_table();
        let packet = signed_packet(&table, 1_700_000_000);

        match verify_packet(&packet, &TsigKeyTable::new(), 1_700_000_000) {
            Err(TsigError::UnknownKey) => {}
            other => panic!("expected UnknownKey, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_verify_rejects_stale_signature() {
        let table = test_table();
        let packet = signed_packet(&table, 1_700_000_000);

        match verify_packet(&packet, &table, 1_700_000_000 + DEFAULT_FUDGE as u64 + 1) {
            Err(TsigError::BadTime) => {}
            other => panic!("expected BadTime, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_verify_rejects_tampered_answer() {
        let table = test_table();
        let mut packet = signed_packet(&table, 1_700_000_000);
        packet.answers[0] = DnsRecord::A {
            domain: "whoami.example.org".to_string(),
            addr: "203.0.113.8".parse().unwrap(),
            ttl: TransientTtl(0),
        };

        assert!(verify_packet(&packet, &table, 1_700_000_000).is_err());
    }

    #[test]
    fn test_key_spec_parsing() {
        // trailing dot and case are normalized away
        let table =
            TsigKeyTable::from_spec(&format!("TestKey.Example.Org.:{}", base64::encode(b"s")))
                .unwrap();
        assert!(table.get("testkey.example.org").is_some());
        assert!(table.get("testkey.example.org.").is_some());

        assert!(TsigKeyTable::from_spec("no-colon-here").is_err());
        assert!(TsigKeyTable::from_spec(":secret").is_err());
        assert!(TsigKeyTable::from_spec("key:not base64!!").is_err());
    }

    #[test]
    fn test_unsigned_packet() {
        let packet = DnsPacket::new();
        match verify_packet(&packet, &test_table(), 0) {
            Err(TsigError::Unsigned) => {}
            other => panic!("expected Unsigned, got {:?}", other.map(|_| ())),
        }
    }
}

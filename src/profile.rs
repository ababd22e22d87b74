//! Credential payload decoding
//!
//! The backend hands out credentials as a compact base64 blob plus a secret.
//! This module turns them into a typed [`ConnectionProfile`] for one of the
//! two tunnel engines. Decoding is pure: no I/O, no shared state.
//!
//! Tunnel payload layout (58 bytes minimum):
//!
//! ```text
//! 0..4    local IPv4 address (/32)
//! 4..20   reserved
//! 20..24  peer IPv4 address
//! 24..26  peer port, big-endian
//! 26..58  peer public key (32 raw bytes)
//! ```
//!
//! Relay payload layout (exactly 7 bytes):
//!
//! ```text
//! 0..4    server IPv4 address
//! 4..6    server port, big-endian
//! 6       transport selector
//! ```

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::net::Ipv4Addr;

use crate::api::{Credentials, Protocol};
use crate::error::DecodeError;

/// Minimum tunnel payload size covering every field
pub const TUNNEL_PAYLOAD_LEN: usize = 58;

/// Exact relay payload size
pub const RELAY_PAYLOAD_LEN: usize = 7;

/// Standard alphabet, padding optional; whitespace is stripped beforehand
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Transport used by the relay engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Mkcp,
    WebSocket,
    Http,
    DomainSocket,
    Quic,
    Gun,
    Grpc,
    /// Selector byte not in the table; the engine picks its default
    Unspecified,
}

impl Transport {
    pub fn from_selector(selector: u8) -> Self {
        match selector {
            0x01 => Transport::Tcp,
            0x02 => Transport::Mkcp,
            0x03 => Transport::WebSocket,
            0x04 => Transport::Http,
            0x05 => Transport::DomainSocket,
            0x06 => Transport::Quic,
            0x07 => Transport::Gun,
            0x08 => Transport::Grpc,
            _ => Transport::Unspecified,
        }
    }

    /// Engine name for this transport; empty when unspecified
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Mkcp => "mkcp",
            Transport::WebSocket => "websocket",
            Transport::Http => "http",
            Transport::DomainSocket => "domainsocket",
            Transport::Quic => "quic",
            Transport::Gun => "gun",
            Transport::Grpc => "grpc",
            Transport::Unspecified => "",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DNS servers pushed into either engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsPreset {
    #[default]
    Cloudflare,
    Google,
    Handshake,
}

impl DnsPreset {
    pub fn servers(&self) -> &'static str {
        match self {
            DnsPreset::Cloudflare => "1.1.1.1, 1.0.0.1",
            DnsPreset::Google => "8.8.8.8, 8.8.4.4",
            DnsPreset::Handshake => "103.196.38.38, 103.196.38.39, 103.196.38.40",
        }
    }

    /// Individual server addresses
    pub fn server_list(&self) -> Vec<&'static str> {
        self.servers().split(", ").collect()
    }

    /// Look a preset up by its server list
    pub fn from_servers(servers: &str) -> Option<Self> {
        [DnsPreset::Cloudflare, DnsPreset::Google, DnsPreset::Handshake]
            .into_iter()
            .find(|preset| preset.servers() == servers)
    }
}

/// Decoded WireGuard-style tunnel profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelProfile {
    /// Private key material, opaque here
    pub secret_key: String,
    pub local_address: Ipv4Addr,
    pub peer_host: Ipv4Addr,
    pub peer_port: u16,
    /// Peer public key, base64
    pub peer_public_key: String,
    pub dns: DnsPreset,
}

impl TunnelProfile {
    /// Interface address, always a single host route
    pub fn local_address_cidr(&self) -> String {
        format!("{}/32", self.local_address)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.peer_host, self.peer_port)
    }

    /// Raw peer public key
    pub fn peer_public_key_bytes(&self) -> Result<[u8; 32], DecodeError> {
        let bytes = PAYLOAD_ENGINE.decode(&self.peer_public_key)?;
        let actual = bytes.len();
        bytes
            .try_into()
            .map_err(|_| DecodeError::WrongLength { expected: 32, actual })
    }

    /// Render as a wg-quick style configuration
    pub fn to_wg_config(&self) -> String {
        let mut cfg = String::new();

        cfg.push_str("[Interface]\n");
        cfg.push_str(&format!("PrivateKey = {}\n", self.secret_key));
        cfg.push_str(&format!("Address = {}\n", self.local_address_cidr()));
        cfg.push_str(&format!("DNS = {}\n", self.dns.servers()));

        cfg.push_str("\n[Peer]\n");
        cfg.push_str(&format!("PublicKey = {}\n", self.peer_public_key));
        cfg.push_str("AllowedIPs = 0.0.0.0/0\n");
        cfg.push_str(&format!("Endpoint = {}\n", self.endpoint()));

        cfg
    }
}

/// Decoded VMess-style relay profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayProfile {
    pub user_id: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub transport: Transport,
    pub dns: DnsPreset,
}

impl RelayProfile {
    /// DNS section for the relay engine
    pub fn to_dns_json(&self) -> Value {
        json!({ "servers": self.dns.server_list() })
    }

    /// Outbound section for the relay engine
    pub fn to_outbound_json(&self) -> Value {
        let mut outbound = json!({
            "protocol": "vmess",
            "tag": "proxy",
            "settings": {
                "vnext": [{
                    "address": self.address.to_string(),
                    "port": self.port,
                    "users": [{
                        "id": self.user_id,
                        "alterId": 0,
                        "level": 8,
                        "security": "auto",
                    }],
                }],
            },
        });

        if self.transport != Transport::Unspecified {
            outbound["streamSettings"] = json!({ "network": self.transport.as_str() });
        }

        outbound
    }
}

/// Profile for whichever engine the server picked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionProfile {
    Tunnel(TunnelProfile),
    Relay(RelayProfile),
}

impl ConnectionProfile {
    /// Resolve names through `dns` inside the tunnel
    pub fn with_dns(self, dns: DnsPreset) -> Self {
        match self {
            ConnectionProfile::Tunnel(profile) => ConnectionProfile::Tunnel(TunnelProfile { dns, ..profile }),
            ConnectionProfile::Relay(profile) => ConnectionProfile::Relay(RelayProfile { dns, ..profile }),
        }
    }

    pub fn dns(&self) -> DnsPreset {
        match self {
            ConnectionProfile::Tunnel(profile) => profile.dns,
            ConnectionProfile::Relay(profile) => profile.dns,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ConnectionProfile::Tunnel(_) => Protocol::Tunnel,
            ConnectionProfile::Relay(_) => Protocol::Relay,
        }
    }
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(PAYLOAD_ENGINE.decode(compact)?)
}

fn ipv4_at(bytes: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3])
}

fn port_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

/// Decode a tunnel payload; `secret_key` is passed through untouched
pub fn decode_tunnel(secret_key: &str, payload: &str) -> Result<TunnelProfile, DecodeError> {
    let bytes = decode_base64(payload)?;
    if bytes.len() < TUNNEL_PAYLOAD_LEN {
        return Err(DecodeError::TooShort {
            needed: TUNNEL_PAYLOAD_LEN,
            actual: bytes.len(),
        });
    }

    Ok(TunnelProfile {
        secret_key: secret_key.to_string(),
        local_address: ipv4_at(&bytes, 0),
        peer_host: ipv4_at(&bytes, 20),
        peer_port: port_at(&bytes, 24),
        peer_public_key: PAYLOAD_ENGINE.encode(&bytes[26..TUNNEL_PAYLOAD_LEN]),
        dns: DnsPreset::default(),
    })
}

/// Decode a relay payload for `user_id`
pub fn decode_relay(user_id: &str, payload: &str) -> Result<RelayProfile, DecodeError> {
    let bytes = decode_base64(payload)?;
    if bytes.len() != RELAY_PAYLOAD_LEN {
        return Err(DecodeError::WrongLength {
            expected: RELAY_PAYLOAD_LEN,
            actual: bytes.len(),
        });
    }

    Ok(RelayProfile {
        user_id: user_id.to_string(),
        address: ipv4_at(&bytes, 0),
        port: port_at(&bytes, 4),
        transport: Transport::from_selector(bytes[6]),
        dns: DnsPreset::default(),
    })
}

/// Decode credentials according to the protocol the server declared
pub fn decode_profile(credentials: &Credentials) -> Result<ConnectionProfile, DecodeError> {
    match credentials.protocol {
        Protocol::Tunnel => {
            decode_tunnel(&credentials.secret, &credentials.payload).map(ConnectionProfile::Tunnel)
        }
        Protocol::Relay => {
            decode_relay(&credentials.secret, &credentials.payload).map(ConnectionProfile::Relay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    fn tunnel_bytes() -> Vec<u8> {
        let mut bytes = vec![0u8; TUNNEL_PAYLOAD_LEN];
        bytes[0..4].copy_from_slice(&[10, 8, 0, 2]);
        bytes[4..20].copy_from_slice(&[0xee; 16]);
        bytes[20..24].copy_from_slice(&[185, 200, 116, 250]);
        bytes[24..26].copy_from_slice(&[0xca, 0x6c]);
        for (i, b) in bytes[26..58].iter_mut().enumerate() {
            *b = 0xa0 + i as u8;
        }
        bytes
    }

    #[test]
    fn test_decode_tunnel() {
        let bytes = tunnel_bytes();
        let profile = decode_tunnel("cHJpdmF0ZQ==", &encode(&bytes)).unwrap();

        assert_eq!(profile.secret_key, "cHJpdmF0ZQ==");
        assert_eq!(profile.local_address_cidr(), "10.8.0.2/32");
        assert_eq!(profile.peer_host, Ipv4Addr::new(185, 200, 116, 250));
        assert_eq!(profile.peer_port, 51820);
        assert_eq!(profile.endpoint(), "185.200.116.250:51820");
        assert_eq!(&profile.peer_public_key_bytes().unwrap()[..], &bytes[26..58]);
    }

    #[test]
    fn test_decode_tunnel_is_deterministic() {
        let payload = encode(&tunnel_bytes());
        assert_eq!(
            decode_tunnel("key", &payload).unwrap(),
            decode_tunnel("key", &payload).unwrap()
        );
    }

    #[test]
    fn test_decode_tunnel_ignores_trailing_bytes() {
        let mut bytes = tunnel_bytes();
        bytes.extend_from_slice(&[1, 2, 3]);
        let profile = decode_tunnel("key", &encode(&bytes)).unwrap();
        assert_eq!(profile.peer_port, 51820);
    }

    #[test]
    fn test_decode_tunnel_too_short() {
        let bytes = tunnel_bytes();
        let err = decode_tunnel("key", &encode(&bytes[..57])).unwrap_err();
        assert_eq!(err, DecodeError::TooShort { needed: 58, actual: 57 });
    }

    #[test]
    fn test_decode_tunnel_bad_base64() {
        assert!(matches!(
            decode_tunnel("key", "not*base64"),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn test_decode_accepts_wrapped_base64() {
        let payload = encode(&tunnel_bytes());
        let wrapped = format!("{}\n{}\n", &payload[..40], &payload[40..]);
        assert_eq!(
            decode_tunnel("key", &wrapped).unwrap(),
            decode_tunnel("key", &payload).unwrap()
        );
    }

    #[test]
    fn test_decode_relay() {
        let payload = encode(&[203, 0, 113, 200, 0x01, 0xbb, 0x08]);
        let profile = decode_relay("6f1c7d9e-uid", &payload).unwrap();

        assert_eq!(profile.user_id, "6f1c7d9e-uid");
        assert_eq!(profile.address, Ipv4Addr::new(203, 0, 113, 200));
        assert_eq!(profile.port, 443);
        assert_eq!(profile.transport, Transport::Grpc);
    }

    #[test]
    fn test_port_is_big_endian_unsigned() {
        let profile = decode_relay("uid", &encode(&[1, 2, 3, 4, 0x01, 0x00, 0x01])).unwrap();
        assert_eq!(profile.port, 256);

        let profile = decode_relay("uid", &encode(&[255, 255, 255, 255, 0xff, 0xfe, 0x01])).unwrap();
        assert_eq!(profile.address, Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(profile.port, 65534);
    }

    #[test]
    fn test_relay_length_must_be_exact() {
        for len in [0usize, 1, 6, 8, 58] {
            let err = decode_relay("uid", &encode(&vec![1u8; len])).unwrap_err();
            assert_eq!(err, DecodeError::WrongLength { expected: 7, actual: len });
        }
        assert!(decode_relay("uid", &encode(&[9u8; 7])).is_ok());
    }

    #[test]
    fn test_unknown_transport_is_unspecified() {
        let profile = decode_relay("uid", &encode(&[1, 2, 3, 4, 0, 80, 0x09])).unwrap();
        assert_eq!(profile.transport, Transport::Unspecified);
        assert_eq!(profile.transport.as_str(), "");

        let profile = decode_relay("uid", &encode(&[1, 2, 3, 4, 0, 80, 0x00])).unwrap();
        assert_eq!(profile.transport, Transport::Unspecified);
    }

    #[test]
    fn test_transport_table() {
        let names: Vec<&str> = (1u8..=8).map(|s| Transport::from_selector(s).as_str()).collect();
        assert_eq!(
            names,
            ["tcp", "mkcp", "websocket", "http", "domainsocket", "quic", "gun", "grpc"]
        );
    }

    #[test]
    fn test_decode_profile_dispatches_on_protocol() {
        let relay = Credentials {
            protocol: Protocol::Relay,
            payload: encode(&[1, 2, 3, 4, 0, 80, 0x03]),
            secret: "uid".to_string(),
        };
        assert_eq!(decode_profile(&relay).unwrap().protocol(), Protocol::Relay);

        let tunnel = Credentials {
            protocol: Protocol::Tunnel,
            payload: encode(&tunnel_bytes()),
            secret: "key".to_string(),
        };
        assert_eq!(decode_profile(&tunnel).unwrap().protocol(), Protocol::Tunnel);

        // a relay-sized payload declared as tunnel is rejected
        let mismatched = Credentials {
            protocol: Protocol::Tunnel,
            ..relay
        };
        assert!(decode_profile(&mismatched).is_err());
    }

    #[test]
    fn test_wg_config() {
        let profile = TunnelProfile {
            dns: DnsPreset::Google,
            ..decode_tunnel("PRIVATE", &encode(&tunnel_bytes())).unwrap()
        };
        let cfg = profile.to_wg_config();

        assert!(cfg.starts_with("[Interface]\nPrivateKey = PRIVATE\nAddress = 10.8.0.2/32\n"));
        assert!(cfg.contains("DNS = 8.8.8.8, 8.8.4.4\n"));
        assert!(cfg.contains(&format!("PublicKey = {}\n", profile.peer_public_key)));
        assert!(cfg.contains("Endpoint = 185.200.116.250:51820\n"));
    }

    #[test]
    fn test_outbound_json() {
        let profile = RelayProfile {
            user_id: "uid".to_string(),
            address: Ipv4Addr::new(203, 0, 113, 200),
            port: 443,
            transport: Transport::WebSocket,
            dns: DnsPreset::Handshake,
        };
        assert_eq!(
            profile.to_dns_json()["servers"],
            json!(["103.196.38.38", "103.196.38.39", "103.196.38.40"])
        );
        let outbound = profile.to_outbound_json();
        assert_eq!(outbound["settings"]["vnext"][0]["address"], "203.0.113.200");
        assert_eq!(outbound["settings"]["vnext"][0]["port"], 443);
        assert_eq!(outbound["settings"]["vnext"][0]["users"][0]["id"], "uid");
        assert_eq!(outbound["streamSettings"]["network"], "websocket");

        let unspecified = RelayProfile {
            transport: Transport::Unspecified,
            ..profile
        };
        assert!(unspecified.to_outbound_json().get("streamSettings").is_none());
    }

    #[test]
    fn test_with_dns_overrides_decoded_default() {
        let profile = decode_profile(&Credentials {
            protocol: Protocol::Relay,
            payload: encode(&[1, 2, 3, 4, 0, 80, 0x01]),
            secret: "uid".to_string(),
        })
        .unwrap();
        assert_eq!(profile.dns(), DnsPreset::Cloudflare);

        let profile = profile.with_dns(DnsPreset::Google);
        assert_eq!(profile.dns(), DnsPreset::Google);
        assert_eq!(profile.protocol(), Protocol::Relay);
    }

    #[test]
    fn test_dns_presets() {
        assert_eq!(DnsPreset::from_servers("1.1.1.1, 1.0.0.1"), Some(DnsPreset::Cloudflare));
        assert_eq!(
            DnsPreset::from_servers(DnsPreset::Handshake.servers()),
            Some(DnsPreset::Handshake)
        );
        assert_eq!(DnsPreset::from_servers("9.9.9.9"), None);
    }
}

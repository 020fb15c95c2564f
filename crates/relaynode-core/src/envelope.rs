use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport used between the node and an upstream game server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Connected byte stream (TCP).
    Tcp,
    /// Unconnected datagrams (UDP).
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// One unit of game traffic submitted by a client.
///
/// Arrives either as a text frame on the session's tunnel channel or as
/// the body of `POST /tunnel/packet`. Consumed once per forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketEnvelope {
    pub session_id: String,
    #[serde(default)]
    pub source_ip: String,
    #[serde(default)]
    pub source_port: u16,
    pub dest_ip: String,
    pub dest_port: u16,
    pub protocol: Protocol,
    /// Payload bytes, base64 on the wire.
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    /// Origination time, Unix epoch milliseconds.
    pub timestamp: u64,
}

impl PacketEnvelope {
    /// The upstream socket this envelope is addressed to.
    pub fn destination(&self) -> DestinationKey {
        DestinationKey {
            host: self.dest_ip.clone(),
            port: self.dest_port,
            protocol: self.protocol,
        }
    }

    /// Parse an envelope from a tunnel text frame.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Identifies one upstream socket within a session: (address, port, transport).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationKey {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.protocol)
    }
}

// ============================================================================
// Outbound control messages (node -> client)
// ============================================================================

/// JSON control message written to a session's tunnel channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Sent once when a session attaches.
    ConnectionEstablished {
        session_id: String,
        node_id: String,
        timestamp: u64,
    },
    /// Bytes received from an upstream, tagged with where they came from.
    PacketResponse {
        source_ip: String,
        source_port: u16,
        protocol: Protocol,
        #[serde(with = "b64")]
        data: Vec<u8>,
        timestamp: u64,
    },
}

impl ControlMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Serde adapter for base64-encoded byte payloads.
pub mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_parses_wire_format() {
        let json = r#"{
            "sessionId": "s1",
            "sourceIp": "10.0.0.2",
            "sourcePort": 5000,
            "destIp": "1.2.3.4",
            "destPort": 7000,
            "protocol": "udp",
            "data": "aGVsbG8=",
            "timestamp": 1700000000000
        }"#;
        let env = PacketEnvelope::from_json(json).unwrap();
        assert_eq!(env.session_id, "s1");
        assert_eq!(env.protocol, Protocol::Udp);
        assert_eq!(env.data, b"hello");
        assert_eq!(env.destination().to_string(), "1.2.3.4:7000/udp");
    }

    #[test]
    fn test_envelope_rejects_bad_base64() {
        let json = r#"{"sessionId":"s1","destIp":"1.2.3.4","destPort":1,
            "protocol":"tcp","data":"***","timestamp":0}"#;
        assert!(PacketEnvelope::from_json(json).is_err());
    }

    #[test]
    fn test_envelope_rejects_unknown_protocol() {
        let json = r#"{"sessionId":"s1","destIp":"1.2.3.4","destPort":1,
            "protocol":"sctp","data":"","timestamp":0}"#;
        assert!(PacketEnvelope::from_json(json).is_err());
    }

    #[test]
    fn test_destination_key_distinguishes_protocol() {
        let mut a = DestinationKey {
            host: "1.2.3.4".into(),
            port: 7000,
            protocol: Protocol::Udp,
        };
        let b = a.clone();
        assert_eq!(a, b);
        a.protocol = Protocol::Tcp;
        assert_ne!(a, b);
    }

    #[test]
    fn test_connection_established_wire_format() {
        let msg = ControlMessage::ConnectionEstablished {
            session_id: "s1".into(),
            node_id: "node-a".into(),
            timestamp: 42,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "connection_established");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["nodeId"], "node-a");
    }

    #[test]
    fn test_packet_response_wire_format() {
        let msg = ControlMessage::PacketResponse {
            source_ip: "1.2.3.4".into(),
            source_port: 7000,
            protocol: Protocol::Udp,
            data: b"pong".to_vec(),
            timestamp: 7,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "packet_response");
        assert_eq!(value["sourceIp"], "1.2.3.4");
        assert_eq!(value["sourcePort"], 7000);
        assert_eq!(value["protocol"], "udp");
        assert_eq!(value["data"], "cG9uZw==");
    }
}

//! Control-message protocol spoken over a peer channel.
//!
//! Every text frame is a JSON object. Plain messages carry a `type`
//! discriminant; once a session has negotiated encryption every message
//! except `public-key` travels as `{"encrypted": <base64>, "iv": <base64>}`,
//! whose plaintext is again a plain message.
//!
//! # Message Types
//!
//! | `type` | Direction | Purpose |
//! |--------|-----------|---------|
//! | `text` | both | chat text |
//! | `file` | sender → receivers | file offer |
//! | `file-accept` / `file-reject` | receiver → sender | offer decision |
//! | `file-cancel` | both | abandon a transfer |
//! | `chunk` | sender → receiver | chunk metadata, next binary frame is the payload |
//! | `file-chunk` | sender → receiver | chunk metadata with embedded payload |
//! | `resend-request` | receiver → sender | explicit list of missing chunks |
//! | `public-key` | both | key exchange (never encrypted) |
//! | `connection-test` / `connection-test-response` | both | liveness probe |
//! | `keepalive` (alias `health_check`) | both | keepalive |
//!
//! Unknown types decode to [`WireMessage::Unknown`] so newer peers can add
//! message types without breaking older ones.
//!
//! # Chunk Encoding
//!
//! Plaintext sessions send a `chunk` metadata frame immediately followed by
//! one binary frame with the raw bytes. Encrypted sessions send a single
//! enveloped `file-chunk` with the bytes in `data`. Receivers accept both.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use peerdrop_crypto::EnvelopeCipher;
use peerdrop_discovery::PeerId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Globally unique transfer identifier: `<unix-millis>-<9 base36 chars>`
pub type FileId = String;

/// Generate a new file identifier.
#[must_use]
pub fn new_file_id() -> FileId {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rand::random::<usize>() % ALPHABET.len()] as char)
        .collect();
    format!("{millis}-{suffix}")
}

/// File offer broadcast by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOffer {
    /// Transfer identifier
    pub file_id: FileId,
    /// File name
    pub file_name: String,
    /// MIME type
    pub file_type: String,
    /// Size in bytes
    pub file_size: u64,
    /// `ceil(file_size / chunk_size)`
    pub total_chunks: u64,
    /// Chunk size used by the sender
    pub chunk_size: usize,
    /// Hex BLAKE3 digest of the whole file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Offering peer
    pub sender_id: PeerId,
}

impl FileOffer {
    /// Check the size fields are consistent with each other.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if `total_chunks` does not match
    /// `file_size` and `chunk_size`.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::protocol("offer with zero chunk size"));
        }
        if self.file_size.div_ceil(self.chunk_size as u64) != self.total_chunks {
            return Err(Error::protocol("offer chunk count does not match file size"));
        }
        Ok(())
    }
}

/// Plain control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Chat text
    Text {
        /// Message body
        text: String,
    },
    /// File offer
    File(FileOffer),
    /// Receiver accepted an offer
    FileAccept {
        /// Transfer
        file_id: FileId,
    },
    /// Receiver declined an offer
    FileReject {
        /// Transfer
        file_id: FileId,
    },
    /// Either side abandoned a transfer
    FileCancel {
        /// Transfer
        file_id: FileId,
    },
    /// Chunk metadata; the payload follows as the next binary frame
    Chunk {
        /// Transfer
        file_id: FileId,
        /// Chunk index
        chunk_index: u64,
        /// Chunk count of the transfer
        total_chunks: u64,
    },
    /// Chunk metadata with embedded payload
    FileChunk {
        /// Transfer
        file_id: FileId,
        /// Chunk index
        chunk_index: u64,
        /// Chunk count of the transfer
        total_chunks: u64,
        /// Raw chunk bytes
        data: Vec<u8>,
    },
    /// Receiver asks for specific chunks
    ResendRequest {
        /// Transfer
        file_id: FileId,
        /// Missing chunk indices
        #[serde(rename = "missingChunkIndices", alias = "chunks")]
        missing: Vec<u64>,
    },
    /// Hex X25519 public key
    PublicKey {
        /// Hex-encoded key
        key: String,
    },
    /// Liveness probe
    ConnectionTest {
        /// Echoed in the response
        nonce: u64,
    },
    /// Liveness probe answer
    ConnectionTestResponse {
        /// Nonce of the probe being answered
        nonce: u64,
    },
    /// Keepalive
    #[serde(alias = "health_check")]
    Keepalive {
        /// Sender clock, unix millis
        #[serde(default)]
        timestamp: u64,
    },
}

/// `type` values understood by this implementation.
pub const KNOWN_TYPES: &[&str] = &[
    "text",
    "file",
    "file-accept",
    "file-reject",
    "file-cancel",
    "chunk",
    "file-chunk",
    "resend-request",
    "public-key",
    "connection-test",
    "connection-test-response",
    "keepalive",
    "health_check",
];

impl ControlMessage {
    /// Wire `type` of this message
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            ControlMessage::Text { .. } => "text",
            ControlMessage::File(_) => "file",
            ControlMessage::FileAccept { .. } => "file-accept",
            ControlMessage::FileReject { .. } => "file-reject",
            ControlMessage::FileCancel { .. } => "file-cancel",
            ControlMessage::Chunk { .. } => "chunk",
            ControlMessage::FileChunk { .. } => "file-chunk",
            ControlMessage::ResendRequest { .. } => "resend-request",
            ControlMessage::PublicKey { .. } => "public-key",
            ControlMessage::ConnectionTest { .. } => "connection-test",
            ControlMessage::ConnectionTestResponse { .. } => "connection-test-response",
            ControlMessage::Keepalive { .. } => "keepalive",
        }
    }

    /// Whether this message is exempt from the encrypted envelope
    #[must_use]
    pub fn is_key_exchange(&self) -> bool {
        matches!(self, ControlMessage::PublicKey { .. })
    }

    /// Keepalive stamped with the current time
    #[must_use]
    pub fn keepalive() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        ControlMessage::Keepalive { timestamp }
    }
}

/// Encrypted wrapper around a serialized [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Ciphertext with authentication tag
    #[serde(with = "base64_bytes")]
    pub encrypted: Vec<u8>,
    /// Nonce
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Seal a message.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if encryption fails.
    pub fn seal(msg: &ControlMessage, cipher: &EnvelopeCipher) -> Result<Self> {
        let plaintext = serde_json::to_vec(msg)?;
        let sealed = cipher.seal(&plaintext)?;
        Ok(Self {
            encrypted: sealed.ciphertext,
            iv: sealed.iv,
        })
    }

    /// Open and parse the inner message.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` on authentication failure and
    /// `Error::Protocol` if the plaintext is not a plain message.
    pub fn open(&self, cipher: &EnvelopeCipher) -> Result<WireMessage> {
        let plaintext = cipher.open(&self.encrypted, &self.iv)?;
        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| Error::protocol("envelope plaintext is not UTF-8"))?;
        match WireMessage::parse(text)? {
            WireMessage::Encrypted(_) => Err(Error::protocol("nested encrypted envelope")),
            inner => Ok(inner),
        }
    }
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

/// A decoded text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Plain control message
    Plain(ControlMessage),
    /// Encrypted envelope, not yet opened
    Encrypted(EncryptedEnvelope),
    /// Well-formed message of a type this implementation does not know
    Unknown(String),
}

impl WireMessage {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for invalid JSON, a missing `type`, or a
    /// known type with malformed fields.
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let Some(object) = value.as_object() else {
            return Err(Error::protocol("frame is not a JSON object"));
        };

        if object.contains_key("encrypted") && object.contains_key("iv") {
            let envelope = EncryptedEnvelope::deserialize(&value)?;
            return Ok(WireMessage::Encrypted(envelope));
        }

        let Some(kind) = object.get("type").and_then(serde_json::Value::as_str) else {
            return Err(Error::protocol("message without type"));
        };
        if !KNOWN_TYPES.contains(&kind) {
            return Ok(WireMessage::Unknown(kind.to_owned()));
        }

        Ok(WireMessage::Plain(ControlMessage::deserialize(&value)?))
    }

    /// Encode a message for the wire, sealing it when a cipher is present
    /// (except key exchange messages).
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if sealing fails.
    pub fn encode(msg: &ControlMessage, cipher: Option<&EnvelopeCipher>) -> Result<String> {
        match cipher {
            Some(cipher) if !msg.is_key_exchange() => {
                Ok(serde_json::to_string(&EncryptedEnvelope::seal(msg, cipher)?)?)
            }
            _ => Ok(serde_json::to_string(msg)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop_crypto::KeyAgreement;
    use serde_json::json;

    fn value_of(msg: &ControlMessage) -> serde_json::Value {
        serde_json::to_value(msg).unwrap()
    }

    #[test]
    fn test_chunk_wire_shape() {
        let msg = ControlMessage::Chunk {
            file_id: "f1".into(),
            chunk_index: 3,
            total_chunks: 7,
        };
        assert_eq!(
            value_of(&msg),
            json!({"type": "chunk", "fileId": "f1", "chunkIndex": 3, "totalChunks": 7})
        );
    }

    #[test]
    fn test_offer_wire_shape() {
        let offer = FileOffer {
            file_id: "f1".into(),
            file_name: "a.bin".into(),
            file_type: "application/octet-stream".into(),
            file_size: 100_000,
            total_chunks: 7,
            chunk_size: 16384,
            hash: None,
            sender_id: PeerId::from("p1"),
        };
        let value = value_of(&ControlMessage::File(offer.clone()));
        assert_eq!(value["type"], "file");
        assert_eq!(value["fileName"], "a.bin");
        assert_eq!(value["totalChunks"], 7);
        assert_eq!(value["senderId"], "p1");
        assert!(value.get("hash").is_none());
        assert!(offer.validate().is_ok());
    }

    #[test]
    fn test_offer_validate_rejects_inconsistent_counts() {
        let offer = FileOffer {
            file_id: "f1".into(),
            file_name: "a.bin".into(),
            file_type: String::new(),
            file_size: 100_000,
            total_chunks: 6,
            chunk_size: 16384,
            hash: None,
            sender_id: PeerId::from("p1"),
        };
        assert!(offer.validate().is_err());
    }

    #[test]
    fn test_resend_request_accepts_chunks_alias() {
        let parsed = WireMessage::parse(r#"{"type":"resend-request","fileId":"f","chunks":[3,4]}"#)
            .unwrap();
        assert_eq!(
            parsed,
            WireMessage::Plain(ControlMessage::ResendRequest {
                file_id: "f".into(),
                missing: vec![3, 4],
            })
        );

        let encoded = value_of(&ControlMessage::ResendRequest {
            file_id: "f".into(),
            missing: vec![1],
        });
        assert_eq!(encoded["missingChunkIndices"], json!([1]));
    }

    #[test]
    fn test_health_check_alias() {
        let parsed = WireMessage::parse(r#"{"type":"health_check"}"#).unwrap();
        assert_eq!(
            parsed,
            WireMessage::Plain(ControlMessage::Keepalive { timestamp: 0 })
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let parsed = WireMessage::parse(r#"{"type":"emoji-reaction","emoji":"+1"}"#).unwrap();
        assert_eq!(parsed, WireMessage::Unknown("emoji-reaction".into()));
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(WireMessage::parse("not json").is_err());
        assert!(WireMessage::parse("[1,2]").is_err());
        assert!(WireMessage::parse(r#"{"text":"no type"}"#).is_err());
        assert!(WireMessage::parse(r#"{"type":"chunk","fileId":"f"}"#).is_err());
    }

    #[test]
    fn test_encrypted_envelope_round_trip() {
        let a = KeyAgreement::new();
        let b = KeyAgreement::new();
        let cipher_a = a.complete(&b.public_key()).unwrap();
        let cipher_b = b.complete(&a.public_key()).unwrap();

        let msg = ControlMessage::FileChunk {
            file_id: "f".into(),
            chunk_index: 0,
            total_chunks: 1,
            data: vec![1, 2, 3],
        };
        let text = WireMessage::encode(&msg, Some(&cipher_a)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("type").is_none());
        assert!(value["encrypted"].is_string());

        let WireMessage::Encrypted(envelope) = WireMessage::parse(&text).unwrap() else {
            panic!("expected encrypted envelope");
        };
        assert_eq!(envelope.open(&cipher_b).unwrap(), WireMessage::Plain(msg));
    }

    #[test]
    fn test_public_key_never_encrypted() {
        let a = KeyAgreement::new();
        let b = KeyAgreement::new();
        let cipher = a.complete(&b.public_key()).unwrap();

        let msg = ControlMessage::PublicKey {
            key: a.public_key().to_hex(),
        };
        let text = WireMessage::encode(&msg, Some(&cipher)).unwrap();
        assert_eq!(WireMessage::parse(&text).unwrap(), WireMessage::Plain(msg));
    }

    #[test]
    fn test_file_id_format() {
        let id = new_file_id();
        let (millis, suffix) = id.split_once('-').unwrap();
        assert!(millis.parse::<u128>().is_ok());
        assert_eq!(suffix.len(), 9);
        assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(new_file_id(), new_file_id());
    }
}

//! How messages are laid out inside a record's `History` list, and the
//! optional encryption applied to each entry.

use super::{ChatMessage, MessageRole, StoreError};
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde_json::{json, Value};

const SEALED_TYPE: &str = "sealed";
const NONCE_LEN: usize = 12;

pub trait MessageCodec: Send + Sync {
    fn encode(&self, message: &ChatMessage) -> Result<Value, StoreError>;
    fn decode(&self, entry: &Value) -> Result<ChatMessage, StoreError>;
}

/// Message-dict layout: `{"type": role, "data": {"type": role, "content": ..}}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageCodec;

impl MessageCodec for JsonMessageCodec {
    fn encode(&self, message: &ChatMessage) -> Result<Value, StoreError> {
        let role = message.role.as_str();
        Ok(json!({
            "type": role,
            "data": {
                "type": role,
                "content": message.content,
                "additional_kwargs": {},
                "example": false,
            }
        }))
    }

    fn decode(&self, entry: &Value) -> Result<ChatMessage, StoreError> {
        let kind = entry
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Codec("history entry has no type".into()))?;
        let role = MessageRole::parse(kind)
            .ok_or_else(|| StoreError::Codec(format!("unsupported message type `{kind}`")))?;
        let content = entry
            .get("data")
            .and_then(|data| data.get("content"))
            .ok_or_else(|| StoreError::Codec("history entry has no content".into()))?;
        let content = match content {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Ok(ChatMessage { role, content })
    }
}

pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError>;
    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError>;
}

/// ChaCha20-Poly1305 with a random nonce prepended to each ciphertext.
pub struct ChaChaCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, StoreError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| StoreError::Codec(format!("history key is not hex: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|raw: Vec<u8>| {
            StoreError::Codec(format!("history key must be 32 bytes, got {}", raw.len()))
        })?;
        Ok(Self::new(&key))
    }
}

impl Cipher for ChaChaCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| StoreError::Codec("history encryption failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
        if sealed.len() < NONCE_LEN {
            return Err(StoreError::Codec("sealed entry too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Codec("history decryption failed".into()))
    }
}

/// Encrypts whatever the inner codec produces. Entries written before
/// encryption was enabled are still readable through the inner codec.
pub struct SealedCodec<C, K> {
    inner: C,
    cipher: K,
}

impl<C: MessageCodec, K: Cipher> SealedCodec<C, K> {
    pub fn new(inner: C, cipher: K) -> Self {
        Self { inner, cipher }
    }
}

impl<C: MessageCodec, K: Cipher> MessageCodec for SealedCodec<C, K> {
    fn encode(&self, message: &ChatMessage) -> Result<Value, StoreError> {
        let plain = serde_json::to_vec(&self.inner.encode(message)?)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        let sealed = self.cipher.encrypt(&plain)?;
        Ok(json!({
            "type": SEALED_TYPE,
            "data": base64::engine::general_purpose::STANDARD.encode(sealed),
        }))
    }

    fn decode(&self, entry: &Value) -> Result<ChatMessage, StoreError> {
        if entry.get("type").and_then(Value::as_str) != Some(SEALED_TYPE) {
            return self.inner.decode(entry);
        }
        let data = entry
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Codec("sealed entry has no data".into()))?;
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| StoreError::Codec(format!("sealed entry is not base64: {e}")))?;
        let plain = self.cipher.decrypt(&sealed)?;
        let inner: Value =
            serde_json::from_slice(&plain).map_err(|e| StoreError::Codec(e.to_string()))?;
        self.inner.decode(&inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn json_codec_uses_message_dict_layout() {
        let entry = JsonMessageCodec.encode(&ChatMessage::ai("hello")).unwrap();
        assert_eq!(entry["type"], "ai");
        assert_eq!(entry["data"]["type"], "ai");
        assert_eq!(entry["data"]["content"], "hello");
    }

    #[test]
    fn json_codec_reads_existing_records() {
        let entry = json!({
            "type": "human",
            "data": {"content": "你好", "additional_kwargs": {}, "type": "human", "example": false}
        });
        assert_eq!(
            JsonMessageCodec.decode(&entry).unwrap(),
            ChatMessage::human("你好")
        );
    }

    #[test]
    fn json_codec_rejects_unknown_types() {
        let entry = json!({"type": "function", "data": {"content": "x"}});
        assert!(matches!(
            JsonMessageCodec.decode(&entry),
            Err(StoreError::Codec(_))
        ));
        assert!(JsonMessageCodec.decode(&json!({"data": {}})).is_err());
    }

    #[test]
    fn sealed_codec_hides_content_and_reads_it_back() {
        let codec = SealedCodec::new(JsonMessageCodec, ChaChaCipher::from_hex(KEY_HEX).unwrap());
        let entry = codec.encode(&ChatMessage::human("secret plans")).unwrap();
        assert_eq!(entry["type"], "sealed");
        assert!(!entry.to_string().contains("secret plans"));
        assert_eq!(
            codec.decode(&entry).unwrap(),
            ChatMessage::human("secret plans")
        );
    }

    #[test]
    fn sealed_codec_reads_plain_entries() {
        let codec = SealedCodec::new(JsonMessageCodec, ChaChaCipher::from_hex(KEY_HEX).unwrap());
        let plain = JsonMessageCodec.encode(&ChatMessage::ai("legacy")).unwrap();
        assert_eq!(codec.decode(&plain).unwrap(), ChatMessage::ai("legacy"));
    }

    #[test]
    fn sealed_entries_fail_under_another_key() {
        let writer = SealedCodec::new(JsonMessageCodec, ChaChaCipher::new(&[7u8; 32]));
        let reader = SealedCodec::new(JsonMessageCodec, ChaChaCipher::new(&[8u8; 32]));
        let entry = writer.encode(&ChatMessage::human("x")).unwrap();
        assert!(reader.decode(&entry).is_err());
    }

    #[test]
    fn cipher_key_must_be_32_bytes() {
        assert!(ChaChaCipher::from_hex("abcd").is_err());
        assert!(ChaChaCipher::from_hex("zz").is_err());
    }
}

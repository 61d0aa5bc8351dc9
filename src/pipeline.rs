//! Per-event processing pipeline: redact → serialize → compress → encrypt.
//!
//! `encode` is a pure transform from an event to an opaque blob plus the
//! codec tags describing which stages ran. `decode` inverts it at query
//! time, driven entirely by the stored tags so readers never guess.

use std::collections::HashSet;
use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::config::TraceConfig;
use crate::error::{Result, TraceError};
use crate::events::{Event, ENVELOPE_KEYS};

/// Replacement for redacted values.
pub const REDACTION_MARKER: &str = "***REDACTED***";

const NONCE_LEN: usize = 12;

/// Which pipeline stages produced a stored blob.
///
/// Serialized as `<red|raw>+<gzip|none>+<aes256gcm|none>`; parsing is strict
/// so readers refuse tags they do not understand instead of misreading
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobCodec {
    pub redacted: bool,
    pub compressed: bool,
    pub encrypted: bool,
}

impl BlobCodec {
    pub fn as_tag(&self) -> String {
        format!(
            "{}+{}+{}",
            if self.redacted { "red" } else { "raw" },
            if self.compressed { "gzip" } else { "none" },
            if self.encrypted { "aes256gcm" } else { "none" },
        )
    }

    pub fn parse(tag: &str) -> Result<Self> {
        let mut parts = tag.split('+');
        let (red, comp, enc) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(r), Some(c), Some(e), None) => (r, c, e),
            _ => return Err(TraceError::Decode(format!("malformed blob codec '{tag}'"))),
        };
        let redacted = match red {
            "red" => true,
            "raw" => false,
            other => {
                return Err(TraceError::Decode(format!(
                    "unknown redaction tag '{other}' in '{tag}'"
                )))
            }
        };
        let compressed = match comp {
            "gzip" => true,
            "none" => false,
            other => {
                return Err(TraceError::Decode(format!(
                    "unknown compression tag '{other}' in '{tag}'"
                )))
            }
        };
        let encrypted = match enc {
            "aes256gcm" => true,
            "none" => false,
            other => {
                return Err(TraceError::Decode(format!(
                    "unknown encryption tag '{other}' in '{tag}'"
                )))
            }
        };
        Ok(Self {
            redacted,
            compressed,
            encrypted,
        })
    }
}

/// Compiled pipeline. Construction validates patterns and key material once;
/// the encode path reuses the compiled state for every event.
pub struct Pipeline {
    redact_keys: HashSet<String>,
    redact_patterns: Vec<Regex>,
    compression_enabled: bool,
    compression_level: u32,
    cipher: Option<Aes256Gcm>,
}

impl Pipeline {
    pub fn new(config: &TraceConfig) -> Result<Self> {
        let redact_patterns = config
            .redact_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    TraceError::config(format!("invalid redaction pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let cipher = if config.encryption_enabled {
            let key = config.resolved_encryption_key()?;
            Some(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)))
        } else {
            None
        };

        Ok(Self {
            redact_keys: config.redact_keys.iter().cloned().collect(),
            redact_patterns,
            compression_enabled: config.compression_enabled,
            compression_level: config.compression_level,
            cipher,
        })
    }

    /// Encode one event to `(blob, codec)`.
    ///
    /// Compression failure degrades to an uncompressed blob with the codec
    /// reflecting that; serialization and encryption failures are returned
    /// so the exporter drops the event (plaintext is never persisted when
    /// encryption was requested).
    pub fn encode(&self, event: &Event) -> Result<(Vec<u8>, BlobCodec)> {
        let mut value = serde_json::to_value(event)?;
        self.redact_root(&mut value);

        let serialized = serde_json::to_vec(&value)?;

        let (bytes, compressed) = if self.compression_enabled {
            match self.compress(&serialized) {
                Ok(compressed) => (compressed, true),
                Err(e) => {
                    warn!(event_id = event.event_id, run_id = %event.run_id,
                        "compression failed, storing uncompressed: {e}");
                    (serialized, false)
                }
            }
        } else {
            (serialized, false)
        };

        let (bytes, encrypted) = match &self.cipher {
            Some(cipher) => (encrypt(cipher, &bytes)?, true),
            None => (bytes, false),
        };

        Ok((
            bytes,
            BlobCodec {
                redacted: true,
                compressed,
                encrypted,
            },
        ))
    }

    /// Decode a stored blob back to its event JSON, driven by the codec.
    pub fn decode(&self, blob: &[u8], codec: &BlobCodec) -> Result<Value> {
        let bytes = if codec.encrypted {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                TraceError::Decode("blob is encrypted but no encryption key is configured".into())
            })?;
            decrypt(cipher, blob)?
        } else {
            blob.to_vec()
        };

        let bytes = if codec.compressed {
            self.decompress(&bytes)?
        } else {
            bytes
        };

        serde_json::from_slice(&bytes)
            .map_err(|e| TraceError::Decode(format!("blob is not valid event JSON: {e}")))
    }

    /// Decode all the way back to a typed [`Event`].
    pub fn decode_event(&self, blob: &[u8], codec: &BlobCodec) -> Result<Event> {
        let value = self.decode(blob, codec)?;
        serde_json::from_value(value)
            .map_err(|e| TraceError::Decode(format!("blob does not match event schema: {e}")))
    }

    /// Redact the serialized event. Envelope fields are exempt; every other
    /// top-level field belongs to the payload and is traversed.
    fn redact_root(&self, value: &mut Value) {
        if let Value::Object(map) = value {
            for (key, val) in map.iter_mut() {
                if ENVELOPE_KEYS.contains(&key.as_str()) {
                    continue;
                }
                if self.redact_keys.contains(key) {
                    *val = Value::String(REDACTION_MARKER.to_string());
                } else {
                    self.redact_value(val);
                }
            }
        }
    }

    fn redact_value(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    if self.redact_keys.contains(key) {
                        // Replace wholesale; never descend into the original.
                        *val = Value::String(REDACTION_MARKER.to_string());
                    } else {
                        self.redact_value(val);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.redact_value(item);
                }
            }
            Value::String(s) => {
                if self.matches_any_pattern(s) {
                    *s = REDACTION_MARKER.to_string();
                }
            }
            _ => {}
        }
    }

    /// Patterns are applied in order; a match must span the whole string.
    fn matches_any_pattern(&self, s: &str) -> bool {
        self.redact_patterns.iter().any(|re| {
            re.find(s)
                .map(|m| m.start() == 0 && m.end() == s.len())
                .unwrap_or(false)
        })
    }

    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(data.len() / 2),
            Compression::new(self.compression_level),
        );
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| TraceError::Decode(format!("gzip decompression failed: {e}")))?;
        Ok(out)
    }
}

fn encrypt(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| TraceError::pipeline("encryption", e))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(cipher: &Aes256Gcm, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() <= NONCE_LEN {
        return Err(TraceError::Decode("encrypted blob shorter than nonce".into()));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| TraceError::Decode(format!("decryption failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventPayload, RunOutcome};
    use serde_json::json;

    fn config_with(keys: &[&str], patterns: &[&str]) -> TraceConfig {
        let mut c = TraceConfig::default();
        c.redact_keys = keys.iter().map(|s| s.to_string()).collect();
        c.redact_patterns = patterns.iter().map(|s| s.to_string()).collect();
        c.compression_enabled = false;
        c
    }

    fn tool_event(args: Value) -> Event {
        Event::new(
            "run-p",
            1,
            EventPayload::ToolCall {
                tool_name: "search".into(),
                tool_args: args,
                tool_result: json!(null),
            },
        )
    }

    #[test]
    fn redacts_matching_keys_at_any_depth() {
        let pipeline = Pipeline::new(&config_with(&["api_key"], &[])).unwrap();
        let event = tool_event(json!({
            "q": "flights",
            "api_key": "SEKRET",
            "nested": {"api_key": {"inner": "also secret"}, "ok": 1}
        }));
        let (blob, codec) = pipeline.encode(&event).unwrap();
        let decoded = pipeline.decode(&blob, &codec).unwrap();
        assert_eq!(decoded["tool_args"]["api_key"], REDACTION_MARKER);
        // Replacement does not recurse: the nested map is gone entirely.
        assert_eq!(decoded["tool_args"]["nested"]["api_key"], REDACTION_MARKER);
        assert_eq!(decoded["tool_args"]["nested"]["ok"], 1);
        assert!(!String::from_utf8_lossy(&blob).contains("SEKRET"));
    }

    #[test]
    fn key_match_is_case_sensitive() {
        let pipeline = Pipeline::new(&config_with(&["api_key"], &[])).unwrap();
        let event = tool_event(json!({"API_KEY": "visible"}));
        let (blob, codec) = pipeline.encode(&event).unwrap();
        let decoded = pipeline.decode(&blob, &codec).unwrap();
        assert_eq!(decoded["tool_args"]["API_KEY"], "visible");
    }

    #[test]
    fn patterns_require_a_full_match() {
        let pipeline =
            Pipeline::new(&config_with(&[], &[r"\d{3}-\d{2}-\d{4}"])).unwrap();
        let event = tool_event(json!({
            "exact": "123-45-6789",
            "embedded": "ssn is 123-45-6789 ok"
        }));
        let (blob, codec) = pipeline.encode(&event).unwrap();
        let decoded = pipeline.decode(&blob, &codec).unwrap();
        assert_eq!(decoded["tool_args"]["exact"], REDACTION_MARKER);
        assert_eq!(decoded["tool_args"]["embedded"], "ssn is 123-45-6789 ok");
    }

    #[test]
    fn lists_are_traversed_and_scalars_untouched() {
        let pipeline = Pipeline::new(&config_with(&["secret"], &["tok_.*"])).unwrap();
        let event = tool_event(json!({
            "items": ["tok_abc", "plain", {"secret": 42}],
            "count": 7,
            "flag": true
        }));
        let (blob, codec) = pipeline.encode(&event).unwrap();
        let decoded = pipeline.decode(&blob, &codec).unwrap();
        assert_eq!(decoded["tool_args"]["items"][0], REDACTION_MARKER);
        assert_eq!(decoded["tool_args"]["items"][1], "plain");
        assert_eq!(decoded["tool_args"]["items"][2]["secret"], REDACTION_MARKER);
        assert_eq!(decoded["tool_args"]["count"], 7);
        assert_eq!(decoded["tool_args"]["flag"], true);
    }

    #[test]
    fn envelope_fields_are_exempt() {
        let pipeline = Pipeline::new(&config_with(&["run_id"], &["run-.*"])).unwrap();
        let event = tool_event(json!({}));
        let (blob, codec) = pipeline.encode(&event).unwrap();
        let decoded = pipeline.decode(&blob, &codec).unwrap();
        assert_eq!(decoded["run_id"], "run-p");
    }

    #[test]
    fn gzip_round_trip() {
        let mut config = config_with(&[], &[]);
        config.compression_enabled = true;
        config.compression_level = 9;
        let pipeline = Pipeline::new(&config).unwrap();
        let event = tool_event(json!({"payload": "x".repeat(4096)}));
        let (blob, codec) = pipeline.encode(&event).unwrap();
        assert!(codec.compressed);
        assert!(blob.len() < 4096, "compressible payload should shrink");
        let back = pipeline.decode_event(&blob, &codec).unwrap();
        assert_eq!(back.run_id, "run-p");
    }

    #[test]
    fn encryption_round_trip_with_fresh_nonce() {
        let mut config = config_with(&[], &[]);
        config.encryption_enabled = true;
        config.encryption_key = Some("a perfectly reasonable passphrase".into());
        let pipeline = Pipeline::new(&config).unwrap();
        let event = tool_event(json!({"v": 1}));
        let (a, codec) = pipeline.encode(&event).unwrap();
        let (b, _) = pipeline.encode(&event).unwrap();
        assert!(codec.encrypted);
        assert_ne!(a, b, "nonce-per-event makes ciphertexts differ");
        let decoded = pipeline.decode(&a, &codec).unwrap();
        assert_eq!(decoded["tool_args"]["v"], 1);
    }

    #[test]
    fn decode_rejects_encrypted_blob_without_key() {
        let mut config = config_with(&[], &[]);
        config.encryption_enabled = true;
        config.encryption_key = Some("a perfectly reasonable passphrase".into());
        let writer = Pipeline::new(&config).unwrap();
        let (blob, codec) = writer.encode(&tool_event(json!({}))).unwrap();

        let reader = Pipeline::new(&config_with(&[], &[])).unwrap();
        assert!(matches!(
            reader.decode(&blob, &codec),
            Err(TraceError::Decode(_))
        ));
    }

    #[test]
    fn codec_tags_round_trip_and_reject_unknown() {
        for redacted in [true, false] {
            for compressed in [true, false] {
                for encrypted in [true, false] {
                    let codec = BlobCodec {
                        redacted,
                        compressed,
                        encrypted,
                    };
                    assert_eq!(BlobCodec::parse(&codec.as_tag()).unwrap(), codec);
                }
            }
        }
        assert!(BlobCodec::parse("red+zstd+none").is_err());
        assert!(BlobCodec::parse("red+gzip").is_err());
        assert!(BlobCodec::parse("red+gzip+aes256gcm+extra").is_err());
        assert!(BlobCodec::parse("shiny").is_err());
    }

    #[test]
    fn round_trip_preserves_non_redacted_fields() {
        let pipeline = Pipeline::new(&config_with(&["password"], &[])).unwrap();
        let mut event = Event::new(
            "run-rt",
            9,
            EventPayload::RunEnd {
                final_status: RunOutcome::Failed,
            },
        );
        event.duration_ms = Some(1234);
        let (blob, codec) = pipeline.encode(&event).unwrap();
        let back = pipeline.decode_event(&blob, &codec).unwrap();
        assert_eq!(back, event);
    }
}

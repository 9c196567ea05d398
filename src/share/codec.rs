use std::io::{Read, Write};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use super::ShareError;

/// Refuse tokens that inflate past this.
const MAX_INFLATED_BYTES: u64 = 32 * 1024 * 1024;

/// `(path, language, content)`
pub type SnapshotEntry = (String, String, String);

/// Serialize `[name, [[path, language, content], …]]`, deflate it and
/// encode it as unpadded URL-safe base64.
pub fn encode_snapshot(name: &str, entries: &[SnapshotEntry]) -> Result<String, ShareError> {
    let json = serde_json::to_vec(&(name, entries))
        .map_err(|e| ShareError::Encode(format!("serialize snapshot: {e}")))?;
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(&json)
        .map_err(|e| ShareError::Encode(format!("deflate snapshot: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| ShareError::Encode(format!("deflate snapshot: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(compressed))
}

pub fn decode_snapshot(token: &str) -> Result<(String, Vec<SnapshotEntry>), ShareError> {
    let compressed = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|e| ShareError::DecodeFailure(format!("token is not base64: {e}")))?;

    let mut json = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .take(MAX_INFLATED_BYTES + 1)
        .read_to_end(&mut json)
        .map_err(|e| ShareError::DecodeFailure(format!("inflate failed: {e}")))?;
    if json.len() as u64 > MAX_INFLATED_BYTES {
        return Err(ShareError::DecodeFailure(format!(
            "snapshot exceeds {MAX_INFLATED_BYTES} bytes"
        )));
    }

    serde_json::from_slice(&json)
        .map_err(|e| ShareError::DecodeFailure(format!("malformed snapshot: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, language: &str, content: &str) -> SnapshotEntry {
        (path.into(), language.into(), content.into())
    }

    #[test]
    fn token_is_url_safe() {
        let entries = vec![
            entry("index.ts", "typescript", "console.log('hi') // ?&=#/+"),
            entry("src/util.ts", "typescript", &"x".repeat(4096)),
        ];
        let token = encode_snapshot("demo", &entries).unwrap();
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

        let (name, decoded) = decode_snapshot(&token).unwrap();
        assert_eq!(name, "demo");
        assert_eq!(decoded, entries);
    }

    #[test]
    fn payload_shape_is_a_nested_array() {
        let token = encode_snapshot("w", &[entry("a.md", "markdown", "#")]).unwrap();
        let bytes = URL_SAFE_NO_PAD.decode(token).unwrap();
        let mut json = String::new();
        DeflateDecoder::new(bytes.as_slice()).read_to_string(&mut json).unwrap();
        assert_eq!(json, r##"["w",[["a.md","markdown","#"]]]"##);
    }

    #[test]
    fn garbage_is_a_decode_failure() {
        for token in ["not base64 !!", "AAAA", ""] {
            assert!(matches!(
                decode_snapshot(token),
                Err(ShareError::DecodeFailure(_))
            ));
        }
    }
}

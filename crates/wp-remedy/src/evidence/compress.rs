use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Error, Result};

/// gzip, then standard base64 so the result stays valid JSON text.
pub fn encode(text: &str) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(|e| Error::Storage(format!("gzip encode: {e}")))?;
    let gz = encoder
        .finish()
        .map_err(|e| Error::Storage(format!("gzip finish: {e}")))?;
    Ok(BASE64.encode(gz))
}

pub fn decode(encoded: &str) -> Result<String> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::Storage(format!("base64 decode: {e}")))?;
    let mut decoder = GzDecoder::new(raw.as_slice());
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| Error::Storage(format!("gzip decode: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repetitive_logs_shrink() {
        let text = "PHP Warning: Undefined index in /var/www/html/index.php\n".repeat(100);
        let enc = encode(&text).expect("encode");
        assert!(enc.len() < text.len() / 4);
        assert_eq!(decode(&enc).expect("decode"), text);
    }

    #[test]
    fn decode_rejects_plaintext() {
        assert!(decode("not base64 at all!").is_err());
        assert!(decode(&BASE64.encode(b"plain bytes")).is_err());
    }
}

/// Base64 helpers used for key material persisted as text.
pub mod base64 {
    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::base64::encode(data)
    }

    #[inline]
    pub fn decode(encoded: &str) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(encoded.trim())
    }

    /// Decode into a fixed-size buffer, failing when the decoded length does not match.
    #[inline]
    pub fn decode_exact(encoded: &str, out: &mut [u8]) -> Result<(), String> {
        let decoded = decode(encoded).map_err(|err| err.to_string())?;

        if decoded.len() != out.len() {
            return Err(format!(
                "expected {} bytes of key material, got {}",
                out.len(),
                decoded.len()
            ));
        }

        out.copy_from_slice(&decoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::base64;

    #[test]
    fn test_roundtrip() {
        let data = [0u8, 1, 2, 250, 251, 252];
        let encoded = base64::encode(&data);
        assert_eq!(base64::decode(&encoded).unwrap(), &data[..]);
    }

    #[test]
    fn test_decode_exact_size_mismatch() {
        let encoded = base64::encode(&[1u8; 16]);
        let mut out = [0u8; 32];
        assert!(base64::decode_exact(&encoded, &mut out).is_err());
    }

    #[test]
    fn test_decode_exact_tolerates_trailing_newline() {
        let mut encoded = base64::encode(&[7u8; 32]);
        encoded.push('\n');

        let mut out = [0u8; 32];
        base64::decode_exact(&encoded, &mut out).unwrap();
        assert_eq!(out, [7u8; 32]);
    }
}

use md5::Digest;

/// Hex md5 of content, for the `<md5>` output-path variable.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = md5::Md5::new();
    hasher.update(data);
    to_hex(hasher.finalize().as_slice())
}

/// Hex sha1 of content, for the `<sha1>` output-path variable.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = sha1::Sha1::new();
    hasher.update(data);
    to_hex(hasher.finalize().as_slice())
}

/// Fast content fingerprint used for change detection.
pub fn content_fingerprint(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_value() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_sha1_known_value() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        assert_ne!(content_fingerprint(b"a"), content_fingerprint(b"b"));
        assert_eq!(content_fingerprint(b"a"), content_fingerprint(b"a"));
    }
}

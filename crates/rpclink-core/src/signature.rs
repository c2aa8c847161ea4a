//! Handshake signature.
//!
//! Each character is XOR-ed with a fixed key and the result reversed. This is
//! obfuscation kept for compatibility with existing peers, not
//! authentication: anyone who knows a name can sign it. Put a real MAC in
//! front of the transport before exposing an endpoint across a trust
//! boundary.

const KEY: u32 = 10;

/// Sign `name`.
pub fn make_signature(name: &str) -> String {
    name.chars()
        .map(|c| char::from_u32(u32::from(c) ^ KEY).unwrap_or(c))
        .rev()
        .collect()
}

/// Whether `signature` is the signature of `name`.
pub fn check_signature(name: &str, signature: &str) -> bool {
    make_signature(name) == signature
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // 'A' ^ 10 = 'K', 'B' ^ 10 = 'H', reversed
        assert_eq!(make_signature("AB"), "HK");
    }

    #[test]
    fn empty_name() {
        assert_eq!(make_signature(""), "");
        assert!(check_signature("", ""));
    }

    #[test]
    fn rejects_tampered_signature() {
        let signature = make_signature("client");
        assert!(check_signature("client", &signature));
        assert!(!check_signature("client", "client"));
        assert!(!check_signature("other", &signature));
    }

    #[test]
    fn applying_twice_restores_name() {
        let name = "Background-页面";
        let twice: String = make_signature(&make_signature(name));
        assert_eq!(twice, name);
    }
}

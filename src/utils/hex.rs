use alloy::primitives::{Address, U256};

/// Clean a hex string by removing "0x" prefix and whitespace
pub fn clean_hex(s: &str) -> &str {
    let s = s.trim();
    if let Some(stripped) = s.strip_prefix("0x") {
        stripped
    } else {
        s
    }
}

/// Convert a string (hex or decimal) to U256
pub fn to_u256(s: &str) -> Option<U256> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(hex) = s.strip_prefix("0x") {
        return U256::from_str_radix(hex, 16).ok();
    }

    if s.chars().all(|c| c.is_ascii_digit()) {
        return U256::from_str_radix(s, 10).ok();
    }

    None
}

/// Read the `index`-th 32-byte ABI word out of a raw return payload.
pub fn word(payload: &[u8], index: usize) -> Option<&[u8]> {
    let start = index.checked_mul(32)?;
    let end = start.checked_add(32)?;
    payload.get(start..end)
}

/// Decode an ABI word as an address (the low 20 bytes; the high 12 must be zero).
pub fn word_to_address(word: &[u8]) -> Option<Address> {
    if word.len() != 32 || word[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(Address::from_slice(&word[12..]))
}

/// Decode an ABI word as a U256.
pub fn word_to_u256(word: &[u8]) -> Option<U256> {
    if word.len() != 32 {
        return None;
    }
    Some(U256::from_be_slice(word))
}

/// Decode an ABI word as a u64, rejecting values that do not fit.
pub fn word_to_u64(word: &[u8]) -> Option<u64> {
    let value = word_to_u256(word)?;
    if value > U256::from(u64::MAX) {
        return None;
    }
    Some(value.to::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn test_clean_hex_strips_prefix_and_whitespace() {
        assert_eq!(clean_hex(" 0xabc "), "abc");
        assert_eq!(clean_hex("abc"), "abc");
    }

    #[test]
    fn test_to_u256_accepts_hex_and_decimal() {
        assert_eq!(to_u256("0x10"), Some(U256::from(16)));
        assert_eq!(to_u256("42"), Some(U256::from(42)));
        assert_eq!(to_u256("not-a-number"), None);
        assert_eq!(to_u256(""), None);
    }

    #[test]
    fn test_word_to_address_rejects_dirty_high_bytes() {
        let mut payload = [0u8; 32];
        payload[12..].copy_from_slice(address!("00000000000000000000000000000000000000aa").as_slice());
        assert!(word_to_address(&payload).is_some());

        payload[0] = 1;
        assert!(word_to_address(&payload).is_none());
    }

    #[test]
    fn test_word_indexing() {
        let payload = [0u8; 96];
        assert!(word(&payload, 2).is_some());
        assert!(word(&payload, 3).is_none());
    }

    #[test]
    fn test_word_to_u64_rejects_oversized_values() {
        let mut payload = [0u8; 32];
        payload[0] = 1;
        assert!(word_to_u64(&payload).is_none());
        let mut small = [0u8; 32];
        small[31] = 7;
        assert_eq!(word_to_u64(&small), Some(7));
    }
}

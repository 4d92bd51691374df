use std::collections::HashMap;
use std::sync::OnceLock;

/// utf8_general_ci, what the handshake advertises by default.
pub const DEFAULT_COLLATION_ID: u8 = 33;
pub const UTF8_MB4_GENERAL_CI: u8 = 45;
pub const BINARY: u8 = 63;

/// Collation name to id, the subset the proxy ever needs to reason about.
pub fn collation_names() -> &'static HashMap<&'static str, u8> {
    static COLLATIONS: OnceLock<HashMap<&'static str, u8>> = OnceLock::new();
    COLLATIONS.get_or_init(|| {
        HashMap::from([
            ("big5_chinese_ci", 1),
            ("latin1_swedish_ci", 8),
            ("ascii_general_ci", 11),
            ("utf8_general_ci", 33),
            ("utf8mb4_general_ci", 45),
            ("utf8mb4_bin", 46),
            ("binary", 63),
            ("utf8mb4_unicode_ci", 224),
            ("utf8mb4_0900_ai_ci", 255),
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_collation() {
        assert_eq!(
            *collation_names().get("utf8_general_ci").unwrap(),
            DEFAULT_COLLATION_ID
        );
    }
}

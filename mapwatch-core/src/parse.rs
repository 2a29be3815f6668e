//! パース関連のユーティリティ関数

use anyhow::Result;

/// アドレス文字列をu64にパース
///
/// /proc/pid/maps と同じく16進数として解釈する。`0x` プレフィックスと
/// 桁区切りの `_` は省略可能。
///
/// # Examples
/// ```
/// use mapwatch_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x7f00_0000_1000").unwrap(), 0x7f00_0000_1000);
/// assert_eq!(parse_address("7ffff7dc0000").unwrap(), 0x7ffff7dc0000);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .replace('_', "");

    if digits.is_empty() {
        return Err(anyhow::anyhow!("Empty address '{}'", s));
    }

    u64::from_str_radix(&digits, 16)
        .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_prefixed() {
        assert_eq!(parse_address("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_address("0XABCD").unwrap(), 0xabcd);
        assert_eq!(parse_address(" 0x7f00_0000_0000 ").unwrap(), 0x7f00_0000_0000);
    }

    #[test]
    fn test_parse_address_bare_is_hex() {
        assert_eq!(parse_address("1000").unwrap(), 0x1000);
        assert_eq!(parse_address("555555554000").unwrap(), 0x555555554000);
    }

    #[test]
    fn test_parse_address_invalid() {
        assert!(parse_address("").is_err());
        assert!(parse_address("0x").is_err());
        assert!(parse_address("xyz").is_err());
        assert!(parse_address("0x1_0000_0000_0000_0000").is_err());
    }
}

// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Credit pricing.

/// Credits required to narrate `text` at `unit_size` codepoints per credit.
///
/// Length is counted in codepoints, not bytes, so multilingual text prices
/// the same per character. Every story costs at least one credit.
/// `unit_size` is validated non-zero at configuration load.
#[must_use]
pub fn required_credits(text: &str, unit_size: u32) -> i64 {
    let codepoints = text.chars().count() as u64;
    let unit = u64::from(unit_size.max(1));
    std::cmp::max(1, codepoints.div_ceil(unit) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_per_unit() {
        assert_eq!(required_credits("", 1000), 1);
        assert_eq!(required_credits(&"a".repeat(1000), 1000), 1);
        assert_eq!(required_credits(&"a".repeat(1001), 1000), 2);
        assert_eq!(required_credits(&"a".repeat(2500), 1000), 3);
    }

    #[test]
    fn counts_codepoints_not_bytes() {
        // Multi-byte codepoints price like ASCII.
        let text = "ż".repeat(1000);
        assert!(text.len() > 1000);
        assert_eq!(required_credits(&text, 1000), 1);
    }
}

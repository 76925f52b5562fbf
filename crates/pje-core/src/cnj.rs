use std::fmt;

use serde::{Deserialize, Serialize};

/// A CNJ case number in canonical `NNNNNNN-DD.AAAA.J.TT.OOOO` form.
///
/// Construction only succeeds for the punctuated canonical form or a bare
/// 20-digit string; anything else is rejected up front so a bad number never
/// reaches the portal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseNumber(String);

/// The six CNJ segments, in form-field order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseNumberParts {
    pub sequential: String,
    pub check_digit: String,
    pub year: String,
    pub segment: String,
    pub court: String,
    pub origin: String,
}

/// Canonical layout: 7 digits, '-', 2, '.', 4, '.', 1, '.', 2, '.', 4.
fn is_canonical(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() != 25 {
        return false;
    }
    for (i, c) in b.iter().enumerate() {
        let ok = match i {
            7 => *c == b'-',
            10 | 15 | 17 | 20 => *c == b'.',
            _ => c.is_ascii_digit(),
        };
        if !ok {
            return false;
        }
    }
    true
}

impl CaseNumber {
    /// Parse either the canonical punctuated form or a raw 20-digit string.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if is_canonical(input) {
            return Some(Self(input.to_string()));
        }
        if input.chars().any(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() != 20 {
            return None;
        }
        Some(Self(format!(
            "{}-{}.{}.{}.{}.{}",
            &digits[..7],
            &digits[7..9],
            &digits[9..13],
            &digits[13..14],
            &digits[14..16],
            &digits[16..20],
        )))
    }

    /// Extract a leading canonical case number from a downloaded file's name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.len() < 25 || !name.is_char_boundary(25) {
            return None;
        }
        let head = &name[..25];
        if is_canonical(head) {
            Some(Self(head.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into the six form fields the portal's search form expects.
    pub fn parts(&self) -> CaseNumberParts {
        let s = &self.0;
        CaseNumberParts {
            sequential: s[..7].to_string(),
            check_digit: s[8..10].to_string(),
            year: s[11..15].to_string(),
            segment: s[16..17].to_string(),
            court: s[18..20].to_string(),
            origin: s[21..25].to_string(),
        }
    }
}

impl fmt::Display for CaseNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_raw_digits() {
        let n = CaseNumber::parse("00000012320248050001").unwrap();
        assert_eq!(n.as_str(), "0000001-23.2024.8.05.0001");
    }

    #[test]
    fn parse_canonical_is_identity() {
        let n = CaseNumber::parse("0000001-23.2024.8.05.0001").unwrap();
        assert_eq!(n.as_str(), "0000001-23.2024.8.05.0001");
    }

    #[test]
    fn parse_is_idempotent() {
        let once = CaseNumber::parse("00000012320248050001").unwrap();
        let twice = CaseNumber::parse(once.as_str()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn parse_trims_whitespace() {
        let n = CaseNumber::parse("  00000012320248050001  ").unwrap();
        assert_eq!(n.as_str(), "0000001-23.2024.8.05.0001");
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(CaseNumber::parse("123456").is_none());
        assert!(CaseNumber::parse("000000123202480500011").is_none());
        assert!(CaseNumber::parse("").is_none());
    }

    #[test]
    fn parse_rejects_letters() {
        assert!(CaseNumber::parse("0000001A320248050001").is_none());
        assert!(CaseNumber::parse("proc-0000001").is_none());
    }

    #[test]
    fn canonical_shape() {
        let re = regex::Regex::new(r"^\d{7}-\d{2}\.\d{4}\.\d\.\d{2}\.\d{4}$").unwrap();
        let n = CaseNumber::parse("98765432119998260123").unwrap();
        assert!(re.is_match(n.as_str()));
    }

    #[test]
    fn parts_split() {
        let n = CaseNumber::parse("0000001-23.2024.8.05.0001").unwrap();
        let p = n.parts();
        assert_eq!(p.sequential, "0000001");
        assert_eq!(p.check_digit, "23");
        assert_eq!(p.year, "2024");
        assert_eq!(p.segment, "8");
        assert_eq!(p.court, "05");
        assert_eq!(p.origin, "0001");
    }

    #[test]
    fn from_file_name_extracts_leading_number() {
        let n = CaseNumber::from_file_name("0000001-23.2024.8.05.0001-processo.pdf").unwrap();
        assert_eq!(n.as_str(), "0000001-23.2024.8.05.0001");
        assert!(CaseNumber::from_file_name("relatorio_20240101.json").is_none());
        assert!(CaseNumber::from_file_name("x.pdf").is_none());
    }

    #[test]
    fn from_file_name_accepts_exact_length() {
        assert!(CaseNumber::from_file_name("0000001-23.2024.8.05.0001").is_some());
    }
}

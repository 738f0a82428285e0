// Identifier Normalizer - canonical CNPJ and contact fields
//
// CNPJ arrives as an 8-digit root, a 14-digit establishment id, masked
// ("00.080.044/0001-99"), or with its leading zeros eaten by a numeric column
// ("80044000199", sometimes "80044000199.0"). Everything downstream joins on
// the canonical forms produced here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ROOT_LEN: usize = 8;
pub const FULL_LEN: usize = 14;

// ============================================================================
// CNPJ
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NormalizedCnpj {
    /// 8-digit zero-padded root (legal entity)
    pub root: String,

    /// 14-digit zero-padded establishment id, None when only the root was given
    pub full: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("empty identifier")]
    Empty,

    #[error("identifier `{raw}` contains non-digit character `{found}`")]
    NonDigit { raw: String, found: char },

    #[error("identifier `{raw}` has {digits} digits, more than a full CNPJ")]
    TooLong { raw: String, digits: usize },
}

/// Normalize any textual CNPJ into `(root, full)`.
///
/// Up to 8 digits is read as a root; 9 to 14 digits as a full CNPJ whose
/// leading zeros were lost.
pub fn normalize_cnpj(raw: &str) -> Result<NormalizedCnpj, IdentifierError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(IdentifierError::Empty);
    }

    let body = strip_float_suffix(trimmed);

    let mut digits = String::with_capacity(FULL_LEN);
    for c in body.chars() {
        match c {
            '0'..='9' => digits.push(c),
            '.' | '/' | '-' | ' ' | '\t' => {}
            other => {
                return Err(IdentifierError::NonDigit {
                    raw: raw.to_string(),
                    found: other,
                })
            }
        }
    }

    if digits.is_empty() {
        return Err(IdentifierError::Empty);
    }

    match digits.len() {
        n if n <= ROOT_LEN => Ok(NormalizedCnpj {
            root: left_pad(&digits, ROOT_LEN),
            full: None,
        }),
        n if n <= FULL_LEN => {
            let full = left_pad(&digits, FULL_LEN);
            Ok(NormalizedCnpj {
                root: full[..ROOT_LEN].to_string(),
                full: Some(full),
            })
        }
        n => Err(IdentifierError::TooLong {
            raw: raw.to_string(),
            digits: n,
        }),
    }
}

/// Normalize a value that must be a full CNPJ (e.g. an establishment key)
pub fn normalize_full_cnpj(raw: &str) -> Result<NormalizedCnpj, IdentifierError> {
    let normalized = normalize_cnpj(raw)?;
    if normalized.full.is_some() {
        return Ok(normalized);
    }

    // A short value where a full id is expected lost its leading zeros
    let full = left_pad(&normalized.root, FULL_LEN);
    Ok(NormalizedCnpj {
        root: full[..ROOT_LEN].to_string(),
        full: Some(full),
    })
}

/// "80044000199.0" -> "80044000199" (float-converted numeric column).
///
/// A single dot followed by exactly three digits after a group of at most
/// three is a mask separator ("12.000"), not a decimal point.
fn strip_float_suffix(s: &str) -> &str {
    if let Some((int, frac)) = s.split_once('.') {
        let int_is_digits = !int.is_empty() && int.chars().all(|c| c.is_ascii_digit());
        let frac_is_zeros = !frac.is_empty() && frac.chars().all(|c| c == '0');
        let mask_group = int.len() <= 3 && frac.len() == 3;
        if int_is_digits && frac_is_zeros && !mask_group {
            return int;
        }
    }
    s
}

fn left_pad(digits: &str, width: usize) -> String {
    format!("{:0>width$}", digits, width = width)
}

/// Display mask XX.XXX.XXX/XXXX-XX. Returns the input unchanged when it is not
/// a 14-digit CNPJ.
pub fn format_cnpj(full: &str) -> String {
    if full.len() != FULL_LEN || !full.chars().all(|c| c.is_ascii_digit()) {
        return full.to_string();
    }
    format!(
        "{}.{}.{}/{}-{}",
        &full[..2],
        &full[2..5],
        &full[5..8],
        &full[8..12],
        &full[12..14]
    )
}

// ============================================================================
// CONTACT FIELDS
// ============================================================================

/// Trimmed text, or None when blank
pub fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Collapse an (area code, number) pair into one display string.
///
/// Absence stays absence: neither part present yields None, never "" or "None".
pub fn normalize_phone(area_code: Option<&str>, number: Option<&str>) -> Option<String> {
    match (clean_text(area_code), clean_text(number)) {
        (Some(area), Some(number)) => Some(format!("({}) {}", area, number)),
        (None, Some(number)) => Some(number),
        (Some(area), None) => Some(format!("({})", area)),
        (None, None) => None,
    }
}

/// Registry text exported through a latin-1 round trip shows up as mojibake
const ENCODING_REPAIRS: &[(&str, &str)] = &[
    ("\u{c3}\u{8d}", "Í"),
    ("\u{c3}\u{89}", "É"),
    ("\u{c3}\u{87}", "Ç"),
    ("\u{c3}\u{83}", "Ã"),
    ("\u{c3}\u{81}", "Á"),
    ("\u{c3}\u{95}", "Õ"),
    ("\u{c3}\u{93}", "Ó"),
    ("\u{c3}\u{8a}", "Ê"),
];

pub fn repair_encoding(text: &str) -> String {
    let mut repaired = text.to_string();
    for (broken, fixed) in ENCODING_REPAIRS {
        if repaired.contains(broken) {
            repaired = repaired.replace(broken, fixed);
        }
    }
    repaired
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cnpj_canonical_is_noop() {
        let n = normalize_cnpj("00080044000199").unwrap();
        assert_eq!(n.root, "00080044");
        assert_eq!(n.full.as_deref(), Some("00080044000199"));

        let again = normalize_cnpj(n.full.as_deref().unwrap()).unwrap();
        assert_eq!(again, n);
    }

    #[test]
    fn test_masked_cnpj() {
        let n = normalize_cnpj("00.080.044/0001-99").unwrap();
        assert_eq!(n.full.as_deref(), Some("00080044000199"));
    }

    #[test]
    fn test_truncated_by_numeric_conversion() {
        let n = normalize_cnpj("80044000199").unwrap();
        assert_eq!(n.full.as_deref(), Some("00080044000199"));
        assert_eq!(n.root, "00080044");

        let n = normalize_cnpj("80044000199.0").unwrap();
        assert_eq!(n.full.as_deref(), Some("00080044000199"));

        let n = normalize_cnpj("123.0").unwrap();
        assert_eq!(n.root, "00000123");
    }

    #[test]
    fn test_partly_masked_root_keeps_trailing_zeros() {
        let n = normalize_cnpj("12.000").unwrap();
        assert_eq!(n.root, "00012000");
        assert!(n.full.is_none());

        let n = normalize_cnpj("12.000.000").unwrap();
        assert_eq!(n.root, "12000000");
    }

    #[test]
    fn test_root_only() {
        let n = normalize_cnpj("80044").unwrap();
        assert_eq!(n.root, "00080044");
        assert!(n.full.is_none());
    }

    #[test]
    fn test_full_expected_from_short_value() {
        let n = normalize_full_cnpj("80044").unwrap();
        assert_eq!(n.full.as_deref(), Some("00000000080044"));
        assert_eq!(n.root, "00000000");
    }

    #[test]
    fn test_invalid_identifiers() {
        assert_eq!(normalize_cnpj("   "), Err(IdentifierError::Empty));
        assert_eq!(normalize_cnpj("./-"), Err(IdentifierError::Empty));
        assert!(matches!(
            normalize_cnpj("12A45678"),
            Err(IdentifierError::NonDigit { found: 'A', .. })
        ));
        assert!(matches!(
            normalize_cnpj("123456789012345"),
            Err(IdentifierError::TooLong { digits: 15, .. })
        ));
    }

    #[test]
    fn test_format_cnpj() {
        assert_eq!(format_cnpj("00080044000199"), "00.080.044/0001-99");
        assert_eq!(format_cnpj("123"), "123");
    }

    #[test]
    fn test_normalize_phone_rules() {
        assert_eq!(
            normalize_phone(Some("11"), Some("33334444")).as_deref(),
            Some("(11) 33334444")
        );
        assert_eq!(normalize_phone(None, Some("33334444")).as_deref(), Some("33334444"));
        assert_eq!(normalize_phone(Some("11"), None).as_deref(), Some("(11)"));
        assert_eq!(normalize_phone(None, None), None);
        assert_eq!(normalize_phone(Some("  "), Some("")), None);
    }

    #[test]
    fn test_repair_encoding() {
        assert_eq!(repair_encoding("COM\u{c3}\u{89}RCIO"), "COMÉRCIO");
        assert_eq!(repair_encoding("SERVI\u{c3}\u{87}OS"), "SERVIÇOS");
        assert_eq!(repair_encoding("INDUSTRIA"), "INDUSTRIA");
    }
}

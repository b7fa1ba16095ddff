//! Envelope-address normalization.
//!
//! Routing keys and original-recipient lookups must be byte-identical
//! across Unicode-equivalent spellings of the same address, so every
//! comparison in the pipeline goes through [`for_lookup`].

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// The domainless special mailbox accepted as both sender and recipient.
pub const POSTMASTER: &str = "postmaster";

/// Errors produced when an envelope address fails to normalize.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// The address has no `@` separator.
    #[error("malformed address: no '@' separator")]
    MissingAtSign,

    /// The part before the last `@` is empty.
    #[error("malformed address: empty local part")]
    EmptyLocalPart,

    /// The part after the last `@` is empty.
    #[error("malformed address: empty domain")]
    EmptyDomain,

    /// The local part contains characters not allowed outside quotes.
    #[error("malformed address: illegal character in local part")]
    IllegalCharacter,

    /// The domain is not valid under IDNA mapping.
    #[error("malformed address: invalid domain {0:?}")]
    InvalidDomain(String),
}

/// Normalizes an envelope address for use as a routing or map key.
///
/// The null reverse-path `""` and the literal `postmaster` (any case)
/// are returned as `""` and `postmaster` unchanged. Everything else is
/// split at the last `@`; the domain is mapped through IDNA and folded
/// to lower case, the local part is folded only when it is not quoted,
/// and the result is Unicode NFC.
///
/// # Errors
///
/// Returns [`AddressError`] when the address is missing an `@`, has an
/// empty local part or domain, or contains illegal characters.
pub fn for_lookup(addr: &str) -> Result<String, AddressError> {
    if addr.is_empty() {
        return Ok(String::new());
    }
    if addr.eq_ignore_ascii_case(POSTMASTER) {
        return Ok(POSTMASTER.to_owned());
    }

    let (local, domain) = split(addr)?;

    let local = if local.starts_with('"') {
        // Quoted local parts are compared verbatim, only NFC-normalized.
        local.nfc().collect::<String>()
    } else {
        if local
            .chars()
            .any(|c| c.is_control() || c.is_whitespace() || c == '"')
        {
            return Err(AddressError::IllegalCharacter);
        }
        local.to_lowercase().nfc().collect::<String>()
    };

    let domain = normalize_domain(domain)?;

    Ok(format!("{local}@{domain}"))
}

/// Splits an address at the last `@` into `(local, domain)`.
///
/// # Errors
///
/// Returns [`AddressError`] when there is no `@` or either side is empty.
pub fn split(addr: &str) -> Result<(&str, &str), AddressError> {
    let at = addr.rfind('@').ok_or(AddressError::MissingAtSign)?;
    let (local, domain) = (&addr[..at], &addr[at + 1..]);
    if local.is_empty() {
        return Err(AddressError::EmptyLocalPart);
    }
    if domain.is_empty() {
        return Err(AddressError::EmptyDomain);
    }
    Ok((local, domain))
}

/// Normalizes a bare domain the same way [`for_lookup`] normalizes the
/// domain half of an address. Used for domain-only routing keys.
///
/// # Errors
///
/// Returns [`AddressError::InvalidDomain`] when the domain fails IDNA
/// mapping.
pub fn domain_for_lookup(domain: &str) -> Result<String, AddressError> {
    normalize_domain(domain)
}

/// Whether `s` is usable as a domain-only routing key.
pub fn valid_domain(s: &str) -> bool {
    !s.is_empty() && !s.starts_with('.') && !s.ends_with('.') && normalize_domain(s).is_ok()
}

/// Whether `addr` is a complete, normalizable mailbox (`local@domain`
/// or `postmaster`). The null address is not a valid mailbox.
pub fn valid(addr: &str) -> bool {
    !addr.is_empty() && for_lookup(addr).is_ok()
}

fn normalize_domain(domain: &str) -> Result<String, AddressError> {
    if domain.chars().any(char::is_control) || domain.chars().any(char::is_whitespace) {
        return Err(AddressError::InvalidDomain(domain.to_owned()));
    }
    idna::domain_to_ascii(domain)
        .map_err(|_| AddressError::InvalidDomain(domain.to_owned()))
        .and_then(|ascii| {
            if ascii.is_empty() {
                Err(AddressError::InvalidDomain(domain.to_owned()))
            } else {
                Ok(ascii)
            }
        })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_null_sender_passes_through() {
        assert_eq!(for_lookup("").unwrap(), "");
    }

    #[test]
    fn test_postmaster_is_case_folded() {
        assert_eq!(for_lookup("postmaster").unwrap(), "postmaster");
        assert_eq!(for_lookup("POSTMASTER").unwrap(), "postmaster");
        assert_eq!(for_lookup("PostMaster").unwrap(), "postmaster");
    }

    #[test]
    fn test_case_folding() {
        assert_eq!(for_lookup("User@EXAMPLE.COM").unwrap(), "user@example.com");
        assert_eq!(for_lookup("u@Example.Org").unwrap(), "u@example.org");
    }

    #[test]
    fn test_quoted_local_part_is_preserved() {
        assert_eq!(
            for_lookup("\"Quoted.User\"@example.com").unwrap(),
            "\"Quoted.User\"@example.com"
        );
    }

    #[test]
    fn test_idna_domain() {
        assert_eq!(
            for_lookup("user@bücher.example").unwrap(),
            "user@xn--bcher-kva.example"
        );
        // A-label and U-label spellings collapse to the same key.
        assert_eq!(
            for_lookup("user@BÜCHER.example").unwrap(),
            for_lookup("user@xn--bcher-kva.example").unwrap()
        );
    }

    #[test]
    fn test_nfc_normalization() {
        // U+00E9 vs U+0065 U+0301 normalize to the same bytes.
        let composed = "caf\u{e9}@example.com";
        let decomposed = "cafe\u{301}@example.com";
        assert_eq!(
            for_lookup(composed).unwrap(),
            for_lookup(decomposed).unwrap()
        );
    }

    #[test]
    fn test_malformed_addresses() {
        assert_eq!(for_lookup("no-at-sign"), Err(AddressError::MissingAtSign));
        assert_eq!(for_lookup("@example.com"), Err(AddressError::EmptyLocalPart));
        assert_eq!(for_lookup("user@"), Err(AddressError::EmptyDomain));
        assert_eq!(
            for_lookup("bad user@example.com"),
            Err(AddressError::IllegalCharacter)
        );
        assert_eq!(
            for_lookup("user@bad domain"),
            Err(AddressError::InvalidDomain("bad domain".to_owned()))
        );
    }

    #[test]
    fn test_split_uses_last_at() {
        assert_eq!(
            split("\"odd@local\"@example.com").unwrap(),
            ("\"odd@local\"", "example.com")
        );
    }

    #[test]
    fn test_valid_domain() {
        assert!(valid_domain("example.com"));
        assert!(valid_domain("bücher.example"));
        assert!(!valid_domain(""));
        assert!(!valid_domain(".example.com"));
        assert!(!valid_domain("example.com."));
    }

    #[test]
    fn test_valid_mailbox() {
        assert!(valid("user@example.com"));
        assert!(valid("postmaster"));
        assert!(!valid(""));
        assert!(!valid("user@"));
    }
}

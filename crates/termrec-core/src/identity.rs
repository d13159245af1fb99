//! Fingerprints for RSA identities and shortest-unique-prefix lookup.
//!
//! Like git's short hashes: fingerprint = SHA-256(SPKI DER), shown as the
//! shortest hex prefix that's unique among the keys being listed. The same
//! prefix resolution works for recording ids.

use sha2::{Digest, Sha256};

use crate::error::TermrecResult;
use crate::keys;

/// Full hex SHA-256 fingerprint of raw bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Fingerprint of a PKIX public key PEM, computed over its DER encoding so
/// PEM whitespace doesn't matter.
pub fn public_key_fingerprint(public_pem: &str) -> TermrecResult<String> {
    Ok(fingerprint(&keys::public_key_der(public_pem)?))
}

/// Shortest prefix (at least `min_len`, never under 4) that tells `fp` apart
/// from everything else in `all`.
pub fn short_fingerprint(fp: &str, all: &[&str], min_len: usize) -> String {
    let min_len = min_len.max(4).min(fp.len());
    let others: Vec<&str> = all.iter().filter(|&&f| f != fp).copied().collect();

    (min_len..=fp.len())
        .map(|len| &fp[..len])
        .find(|prefix| !others.iter().any(|f| f.starts_with(prefix)))
        .unwrap_or(fp)
        .to_string()
}

/// Resolve a prefix against a candidate list.
///
/// `Ok(None)` when nothing matches, `Err(matches)` when ambiguous. An exact
/// match always wins over longer candidates sharing it as a prefix.
pub fn resolve_prefix<'a>(
    prefix: &str,
    candidates: &[&'a str],
) -> Result<Option<&'a str>, Vec<&'a str>> {
    if let Some(exact) = candidates.iter().find(|&&c| c == prefix) {
        return Ok(Some(*exact));
    }
    let matches: Vec<&str> = candidates
        .iter()
        .filter(|&&c| c.starts_with(prefix))
        .copied()
        .collect();

    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches[0])),
        _ => Err(matches),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint(b"some der bytes");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn short_fingerprint_grows_until_unique() {
        let fps = ["a3f8c2d1e4", "a3f8d5b2c3", "b1c2d3e4f5"];
        assert_eq!(short_fingerprint("a3f8c2d1e4", &fps, 4), "a3f8c");
        assert_eq!(short_fingerprint("b1c2d3e4f5", &fps, 4), "b1c2");
    }

    #[test]
    fn short_fingerprint_of_short_input() {
        assert_eq!(short_fingerprint("ab", &["ab"], 8), "ab");
    }

    #[test]
    fn resolve_prefix_cases() {
        let ids = ["a3f8c2d1e4", "a3f8d5b2c3", "b1c2d3e4f5"];
        assert_eq!(resolve_prefix("b", &ids), Ok(Some("b1c2d3e4f5")));
        assert_eq!(resolve_prefix("zz", &ids), Ok(None));
        assert_eq!(resolve_prefix("a3f8", &ids).unwrap_err().len(), 2);
    }

    #[test]
    fn exact_match_beats_longer_candidates() {
        let names = ["bob", "bobby"];
        assert_eq!(resolve_prefix("bob", &names), Ok(Some("bob")));
    }
}

//! BIP-39 mnemonic generation, parsing and seed stretching.

use std::collections::HashMap;

use bip39::{Language, Mnemonic};
use rand::RngCore;
use zeroize::Zeroizing;

use satchel_core::error::ValidationError;

use crate::keys::Seed;

/// Word counts accepted by [`generate_mnemonic`].
pub const VALID_WORD_COUNTS: [usize; 5] = [12, 15, 18, 21, 24];

/// Public phrases from BIP-39 test vectors and documentation. Funds sent to
/// wallets restored from these are swept by bots within seconds.
const KNOWN_PUBLIC_PHRASES: &[&str] = &[
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon agent",
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon art",
    "legal winner thank year wave sausage worth useful legal winner thank yellow",
    "letter advice cage absurd amount doctor acoustic avoid letter advice cage above",
    "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong",
    "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo when",
    "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo vote",
];

/// Collapse whitespace and lowercase a phrase.
pub fn normalize_phrase(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Generate a fresh English phrase of `word_count` words from OS entropy.
pub fn generate_mnemonic(word_count: usize) -> Result<String, ValidationError> {
    if !VALID_WORD_COUNTS.contains(&word_count) {
        return Err(ValidationError::InvalidMnemonic(format!(
            "unsupported word count {word_count}"
        )));
    }
    let mut entropy = Zeroizing::new(vec![0u8; word_count * 4 / 3]);
    rand::rngs::OsRng.fill_bytes(&mut entropy);
    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
        .map_err(|e| ValidationError::InvalidMnemonic(e.to_string()))?;
    Ok(mnemonic.to_string())
}

/// Parse a phrase after normalization.
///
/// A checksum failure is reported as [`ValidationError::InvalidChecksum`];
/// every other problem (unknown word, bad length) as
/// [`ValidationError::InvalidMnemonic`].
pub fn parse_mnemonic(phrase: &str) -> Result<Mnemonic, ValidationError> {
    let normalized = normalize_phrase(phrase);
    Mnemonic::parse_in(Language::English, &normalized).map_err(|e| match e {
        bip39::Error::InvalidChecksum => {
            ValidationError::InvalidChecksum("mnemonic checksum does not match".into())
        }
        other => ValidationError::InvalidMnemonic(other.to_string()),
    })
}

/// Stretch a phrase and optional passphrase into a 64-byte BIP-39 seed.
pub fn mnemonic_to_seed(phrase: &str, passphrase: &str) -> Result<Seed, ValidationError> {
    let mnemonic = parse_mnemonic(phrase)?;
    Ok(Seed::from_bytes(mnemonic.to_seed(passphrase)))
}

/// Heuristic gate against public or degenerate phrases.
///
/// Rejects known test-vector phrases, any word making up more than a quarter
/// of the phrase, fewer distinct words than half the phrase length, and runs
/// of three or more identical consecutive words. This catches accidental use
/// of example phrases; it says nothing about real entropy.
pub fn check_entropy_quality(phrase: &str) -> Result<(), ValidationError> {
    let normalized = normalize_phrase(phrase);
    if KNOWN_PUBLIC_PHRASES.contains(&normalized.as_str()) {
        return Err(ValidationError::WeakMnemonic(
            "phrase is a published test vector".into(),
        ));
    }

    let words: Vec<&str> = normalized.split(' ').collect();
    let len = words.len();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for &word in &words {
        *counts.entry(word).or_default() += 1;
    }
    if let Some((word, count)) = counts.iter().max_by_key(|(_, c)| **c) {
        if *count * 4 > len {
            return Err(ValidationError::WeakMnemonic(format!(
                "\"{word}\" appears {count} times in {len} words"
            )));
        }
    }
    if counts.len() * 2 < len {
        return Err(ValidationError::WeakMnemonic(format!(
            "only {} distinct words in {len}",
            counts.len()
        )));
    }
    if words.windows(3).any(|w| w[0] == w[1] && w[1] == w[2]) {
        return Err(ValidationError::WeakMnemonic(
            "three identical consecutive words".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABANDON_ABOUT: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn generate_all_word_counts() {
        for count in VALID_WORD_COUNTS {
            let phrase = generate_mnemonic(count).unwrap();
            assert_eq!(phrase.split_whitespace().count(), count);
            assert!(parse_mnemonic(&phrase).is_ok());
        }
    }

    #[test]
    fn generate_rejects_odd_count() {
        assert!(matches!(
            generate_mnemonic(13),
            Err(ValidationError::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn generated_phrases_differ() {
        assert_ne!(generate_mnemonic(12).unwrap(), generate_mnemonic(12).unwrap());
    }

    #[test]
    fn bip39_seed_vector() {
        // Trezor vector: entropy 00..00, passphrase "TREZOR".
        let seed = mnemonic_to_seed(ABANDON_ABOUT, "TREZOR").unwrap();
        assert_eq!(
            hex::encode(seed.as_bytes()),
            "c55257c360c07c72029aebc1b53c05ed0362ada38ead3e3e9efa3708e53495531f09a6987599d18264c1e1c92f2cf141630c7a3c4ab7c81b2f001698e7463b04"
        );
    }

    #[test]
    fn passphrase_changes_seed() {
        let a = mnemonic_to_seed(ABANDON_ABOUT, "").unwrap();
        let b = mnemonic_to_seed(ABANDON_ABOUT, "extra").unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn whitespace_and_case_normalized() {
        let messy = "  ABANDON abandon\tabandon abandon abandon abandon abandon abandon abandon abandon abandon   About ";
        let a = mnemonic_to_seed(messy, "").unwrap();
        let b = mnemonic_to_seed(ABANDON_ABOUT, "").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn bad_checksum_reported_distinctly() {
        let phrase = ABANDON_ABOUT.replace("about", "abandon");
        assert!(matches!(
            mnemonic_to_seed(&phrase, ""),
            Err(ValidationError::InvalidChecksum(_))
        ));
    }

    #[test]
    fn unknown_word_rejected() {
        assert!(matches!(
            mnemonic_to_seed("abandon abandon abandon invalidword", ""),
            Err(ValidationError::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn quality_gate_rejects_test_vectors() {
        assert!(matches!(
            check_entropy_quality(ABANDON_ABOUT),
            Err(ValidationError::WeakMnemonic(_))
        ));
        assert!(check_entropy_quality(
            "legal winner thank year wave sausage worth useful legal winner thank yellow"
        )
        .is_err());
    }

    #[test]
    fn quality_gate_rejects_repetition() {
        // valid-looking but "ring" is a quarter-plus of the phrase
        assert!(check_entropy_quality(
            "ring ring ring fox ring oak pear lamp ring tree hill moon"
        )
        .is_err());
        // run of three identical words
        assert!(check_entropy_quality(
            "cat cat cat dog owl fox oak pear lamp tree hill moon"
        )
        .is_err());
    }

    #[test]
    fn quality_gate_accepts_generated() {
        let phrase = generate_mnemonic(24).unwrap();
        // a fresh 24-word phrase virtually never trips the heuristics
        assert!(check_entropy_quality(&phrase).is_ok(), "{phrase}");
    }
}

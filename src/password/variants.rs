//! Password variant generation
//!
//! Users type passwords that differ from the stored one in case,
//! punctuation or a leading country calling code. Every candidate expands
//! into an ordered, duplicate-free list of byte strings to try.

use std::fmt;

/// One encoding of a password candidate
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordVariant {
    pub label: String,
    pub bytes: Vec<u8>,
}

// Never print the password itself
impl fmt::Debug for PasswordVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordVariant")
            .field("label", &self.label)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Expand a candidate into the variants to try, in order
///
/// `country_codes` are calling codes without `+`; they must form a
/// prefix-free set so at most one matches.
pub fn password_variants(candidate: &str, country_codes: &[String]) -> Vec<PasswordVariant> {
    let mut variants = Vec::new();
    push_forms(&mut variants, "", candidate);
    if let Some(national) = strip_country_code(candidate, country_codes) {
        push_forms(&mut variants, "national ", national);
    }
    dedup_first(variants)
}

fn push_forms(out: &mut Vec<PasswordVariant>, prefix: &str, text: &str) {
    let mut push = |label: &str, bytes: Vec<u8>| {
        out.push(PasswordVariant {
            label: format!("{}{}", prefix, label),
            bytes,
        });
    };

    push("utf-8", text.as_bytes().to_vec());
    if let Some(latin1) = latin1_bytes(text) {
        push("latin-1", latin1);
    }
    push("uppercase", text.to_uppercase().into_bytes());
    push("lowercase", text.to_lowercase().into_bytes());

    let stripped: String = text.chars().filter(char::is_ascii_alphanumeric).collect();
    if !stripped.is_empty() {
        push("alphanumeric", stripped.clone().into_bytes());
        push("alphanumeric uppercase", stripped.to_ascii_uppercase().into_bytes());
        push("alphanumeric lowercase", stripped.to_ascii_lowercase().into_bytes());
    }
}

/// Latin-1 encoding when every char fits and it differs from UTF-8
///
/// Only useful to backends that accept raw password bytes; MuPDF takes
/// UTF-8 and rejects this variant.
fn latin1_bytes(text: &str) -> Option<Vec<u8>> {
    if text.is_ascii() {
        return None;
    }
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}

/// The number after a leading `+<code>`, trimmed
fn strip_country_code<'a>(candidate: &'a str, country_codes: &[String]) -> Option<&'a str> {
    let rest = candidate.trim_start().strip_prefix('+')?;
    country_codes
        .iter()
        .filter(|code| !code.is_empty())
        .find_map(|code| rest.strip_prefix(code.as_str()))
        .map(str::trim)
        .filter(|national| !national.is_empty())
}

fn dedup_first(variants: Vec<PasswordVariant>) -> Vec<PasswordVariant> {
    let mut seen = std::collections::HashSet::new();
    variants
        .into_iter()
        .filter(|variant| seen.insert(variant.bytes.clone()))
        .collect()
}

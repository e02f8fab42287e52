//! One-time-code redaction.
//!
//! Inbound DMs can contain verification codes. Anything that looks like a
//! 4-8 digit code is masked before the message reaches the persistent
//! message log. Redaction is applied on every log write; the live relay to
//! the worker is unaffected.

use std::sync::OnceLock;

use regex::Regex;

fn code_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{4,8}\b").expect("static pattern"))
}

/// Mask every 4-8 digit run in `text`.
pub fn redact_codes(text: &str) -> String {
    code_pattern()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            "\u{2022}".repeat(caps[0].len())
        })
        .into_owned()
}

/// Whether `text` is exactly one bare 4-8 digit code (an OTP reply).
pub fn looks_like_otp(text: &str) -> bool {
    let trimmed: String = text
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    (4..=8).contains(&trimmed.len()) && trimmed.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_codes_in_context() {
        assert_eq!(redact_codes("code is 123456 ok"), "code is •••••• ok");
        assert_eq!(redact_codes("1234 and 87654321"), "•••• and ••••••••");
    }

    #[test]
    fn leaves_other_numbers_alone() {
        assert_eq!(redact_codes("paid 300 sats"), "paid 300 sats");
        assert_eq!(redact_codes("order 123456789"), "order 123456789");
    }

    #[test]
    fn otp_detection() {
        assert!(looks_like_otp("123456"));
        assert!(looks_like_otp(" 1234 "));
        assert!(looks_like_otp("123-456"));
        assert!(!looks_like_otp("123"));
        assert!(!looks_like_otp("123456789"));
        assert!(!looks_like_otp("yes"));
        assert!(!looks_like_otp("12a456"));
    }
}

//! Phone number normalization
//!
//! Every tenant is keyed by its WhatsApp number, so the device id, the session
//! directory and the identity check all go through the same normalization.

use regex::Regex;
use std::sync::OnceLock;

/// Numbers shorter than this cannot identify a contact.
pub const MIN_CONTACT_DIGITS: usize = 10;

fn non_digit_regex() -> &'static Regex {
    static NON_DIGIT: OnceLock<Regex> = OnceLock::new();
    NON_DIGIT.get_or_init(|| Regex::new(r"\D").expect("Failed to compile non-digit regex"))
}

/// Strip everything that is not an ASCII digit
pub fn digits_only(raw: &str) -> String {
    non_digit_regex().replace_all(raw, "").into_owned()
}

/// Normalize a phone number to digits with a country code
///
/// National numbers (10 digits, or 11 digits without the country prefix) get
/// `country_code` prepended. Anything else is returned as bare digits.
pub fn normalize(raw: &str, country_code: &str) -> String {
    let digits = digits_only(raw);

    match digits.len() {
        10 => format!("{country_code}{digits}"),
        11 if !digits.starts_with(country_code) => format!("{country_code}{digits}"),
        _ => digits,
    }
}

/// Extract the user part of a messaging JID
///
/// `5511987654321:12@s.whatsapp.net` yields `5511987654321`.
pub fn number_from_jid(jid: &str) -> &str {
    let user = jid.split('@').next().unwrap_or_default();
    user.split(':').next().unwrap_or_default()
}

/// Derive the device id from a normalized phone number
pub fn device_id_for(normalized_number: &str) -> String {
    format!("device-{normalized_number}")
}

/// Whether two numbers identify the same line once normalized
pub fn same_number(a: &str, b: &str, country_code: &str) -> bool {
    let a = normalize(a, country_code);
    !a.is_empty() && a == normalize(b, country_code)
}

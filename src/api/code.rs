//! Verification code detection in message text

use regex::Regex;
use std::sync::LazyLock;

/// Senders that typically mail one-time codes (substring match on `From`).
const CODE_SENDERS: &[&str] = &[
    "no-reply@",
    "noreply@",
    "account@",
    "security@",
    "google.com",
    "microsoft.com",
    "amazon.com",
    "facebook.com",
    "twitter.com",
    "apple.com",
    "paypal.com",
    "github.com",
];

/// Lowercase subject fragments of code mails.
const CODE_SUBJECTS: &[&str] = &[
    "verification code",
    "security code",
    "login code",
    "2fa code",
    "otp",
    "one-time password",
    "authentication code",
    "code",
    "passcode",
    "auth code",
    "verification",
    "2-factor",
];

/// A colon this close before a candidate marks it as a labelled value.
const COLON_PROXIMITY: usize = 15;

static CONTEXTUAL_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:code is|is:|code:|your code is|verification code)\s*:?\s*([A-Z0-9]{4,8})")
        .expect("contextual code pattern")
});

/// Fallback patterns, most specific first.
static CODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\b\d{6}\b",
        r"(?i)\b[A-Z0-9]{6}\b",
        r"\b\d{4,8}\b",
        r"(?i)\b[A-Z0-9]{4,8}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("code pattern"))
    .collect()
});

static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(19|20)\d{2}$").expect("year pattern"));

static STYLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b.*?</style>").expect("style pattern"));

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern"));

/// Whether a message looks like it carries a one-time code.
pub fn is_likely_code_mail(from: &str, subject: &str) -> bool {
    let subject = subject.to_lowercase();
    CODE_SENDERS.iter().any(|s| from.contains(s))
        || CODE_SUBJECTS.iter().any(|s| subject.contains(s))
}

/// Best one-time code candidate in `text`.
///
/// A code right after "code is", "code:" and similar wins. Otherwise the
/// longest candidate with a digit that is not a year, preferring one that
/// closely follows a colon.
pub fn find_code(text: &str) -> Option<String> {
    if let Some(code) = CONTEXTUAL_CODE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .find(|code| has_digit(code))
    {
        tracing::debug!("Contextual code match");
        return Some(code.to_string());
    }

    let mut candidates: Vec<&str> = Vec::new();
    for pattern in CODE_PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            if !candidates.contains(&m.as_str()) {
                candidates.push(m.as_str());
            }
        }
    }
    candidates.retain(|code| code.len() >= 4 && !YEAR.is_match(code) && has_digit(code));
    // Stable: equal lengths keep pattern order.
    candidates.sort_by(|a, b| b.len().cmp(&a.len()));

    candidates
        .iter()
        .find(|code| follows_colon(text, code))
        .or_else(|| candidates.first())
        .map(|code| code.to_string())
}

/// Drop `<style>` blocks and replace tags with spaces.
pub fn strip_html(html: &str) -> String {
    let without_style = STYLE_BLOCK.replace_all(html, "");
    TAG.replace_all(&without_style, " ").into_owned()
}

fn has_digit(code: &str) -> bool {
    code.chars().any(|c| c.is_ascii_digit())
}

/// Whether the first occurrence of `code` has a colon shortly before it.
fn follows_colon(text: &str, code: &str) -> bool {
    let Some(index) = text.find(code) else {
        return false;
    };
    text[..index]
        .rfind(':')
        .is_some_and(|colon| index - colon < COLON_PROXIMITY)
}

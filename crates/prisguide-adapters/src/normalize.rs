//! Price and rating normalization shared by both fetchers.

use prisguide_core::{MAX_RATING, NEUTRAL_RATING};
use serde_json::Value as JsonValue;

/// Numeric prices pass through clamped to `>= 0`; strings go through [`parse_price_str`].
pub fn parse_price(value: &JsonValue) -> f64 {
    match value {
        JsonValue::Number(n) => n.as_f64().map(clamp_price).unwrap_or(0.0),
        JsonValue::String(s) => parse_price_str(s),
        _ => 0.0,
    }
}

/// Parses Norwegian-formatted price text such as `"1 299,50 kr"` or `"1.299,-"`.
///
/// Everything except digits and separators is dropped. Comma is the decimal
/// point unless a later `.` claims that role. Unparseable input yields `0`.
pub fn parse_price_str(raw: &str) -> f64 {
    let mut kept = String::with_capacity(raw.len());
    let mut negative = false;
    for ch in raw.chars() {
        match ch {
            '0'..='9' => kept.push(ch),
            ',' | '.' if !kept.is_empty() => kept.push(ch),
            '-' if kept.is_empty() => negative = true,
            _ => {}
        }
    }

    let Some(number) = normalize_separators(&kept) else {
        return 0.0;
    };
    match number.parse::<f64>() {
        Ok(v) if negative => clamp_price(-v),
        Ok(v) => clamp_price(v),
        Err(_) => 0.0,
    }
}

fn normalize_separators(kept: &str) -> Option<String> {
    let trimmed = kept.trim_end_matches([',', '.']);
    if trimmed.is_empty() {
        return None;
    }
    // "1.299,-" style: a dangling separator marks whole kroner, so the rest is grouping.
    let whole_kroner = trimmed.len() != kept.len();
    let kept = trimmed;
    let commas = kept.matches(',').count();
    let dots = kept.matches('.').count();

    let decimal = match (commas, dots) {
        _ if whole_kroner => None,
        (0, 0) => None,
        (1, 0) => Some(','),
        (0, 1) => Some('.'),
        (c, 0) if c > 1 => None,
        (0, d) if d > 1 => None,
        _ => kept.rfind([',', '.']).and_then(|i| kept[i..].chars().next()),
    };

    let mut out = String::with_capacity(kept.len());
    let last_sep = decimal.and_then(|d| kept.rfind(d));
    for (idx, ch) in kept.char_indices() {
        match ch {
            ',' | '.' if Some(idx) == last_sep => out.push('.'),
            ',' | '.' => {}
            _ => out.push(ch),
        }
    }
    Some(out)
}

fn clamp_price(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

/// Ratings are clamped to `[0, 5]`; anything unparseable becomes [`NEUTRAL_RATING`].
pub fn parse_rating(value: &JsonValue) -> f64 {
    match value {
        JsonValue::Number(n) => n.as_f64().map(clamp_rating).unwrap_or(NEUTRAL_RATING),
        JsonValue::String(s) => parse_rating_str(s),
        _ => NEUTRAL_RATING,
    }
}

/// Reads the first number in the text, so `"4,5 av 5"` and `"4.5/5"` both give `4.5`.
pub fn parse_rating_str(raw: &str) -> f64 {
    let start = raw.find(|c: char| c.is_ascii_digit() || c == '-');
    let Some(start) = start else {
        return NEUTRAL_RATING;
    };
    let token = raw[start..]
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || *c == ',' || *c == '.' || (*i == 0 && *c == '-'))
        .map(|(_, c)| if c == ',' { '.' } else { c })
        .collect::<String>();
    token
        .trim_end_matches('.')
        .parse::<f64>()
        .map(clamp_rating)
        .unwrap_or(NEUTRAL_RATING)
}

fn clamp_rating(v: f64) -> f64 {
    if v.is_nan() {
        NEUTRAL_RATING
    } else {
        v.clamp(0.0, MAX_RATING)
    }
}

//! Field extraction from fetched documents.
//!
//! Two layers: endpoint-configured CSS selectors (exact, per site) and an ordered
//! table of `(pattern, extractor)` rules per field (generic, first valid match wins).
//! The rule table is plain data so it can be tested without any fetching.

use std::collections::BTreeMap;

use regex::{Captures, Regex};
use scraper::{ElementRef, Selector};
use thiserror::Error;
use url::Url;

use crate::normalize::parse_price_str;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldKind {
    Description,
    Phone,
    Email,
    Address,
    Price,
    Logo,
    OrganizationNumber,
}

impl FieldKind {
    pub const ALL: [FieldKind; 7] = [
        FieldKind::Description,
        FieldKind::Phone,
        FieldKind::Email,
        FieldKind::Address,
        FieldKind::Price,
        FieldKind::Logo,
        FieldKind::OrganizationNumber,
    ];

    /// Key used for this field in `scrapingConfig.selectors`.
    pub fn selector_key(self) -> &'static str {
        match self {
            FieldKind::Description => "description",
            FieldKind::Phone => "phone",
            FieldKind::Email => "email",
            FieldKind::Address => "address",
            FieldKind::Price => "price",
            FieldKind::Logo => "logo",
            FieldKind::OrganizationNumber => "organization_number",
        }
    }
}

/// How a match is turned into a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extractor {
    /// Capture group text, entity-decoded with whitespace collapsed.
    Text(usize),
    /// Only the digits of the capture group.
    Digits(usize),
    /// Capture group resolved against the page URL.
    Url(usize),
}

impl Extractor {
    fn apply(self, caps: &Captures<'_>, base: Option<&Url>) -> Option<String> {
        match self {
            Extractor::Text(group) => caps.get(group).map(|m| clean_text(m.as_str())),
            Extractor::Digits(group) => caps
                .get(group)
                .map(|m| m.as_str().chars().filter(char::is_ascii_digit).collect()),
            Extractor::Url(group) => caps
                .get(group)
                .and_then(|m| resolve_url(&clean_text(m.as_str()), base)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternRule {
    pub pattern: Regex,
    pub extractor: Extractor,
}

const DEFAULT_RULES: &[(FieldKind, &str, Extractor)] = &[
    (
        FieldKind::Description,
        r#"(?is)<meta\s+[^>]*name\s*=\s*["']description["'][^>]*content\s*=\s*["']([^"']+)["']"#,
        Extractor::Text(1),
    ),
    (
        FieldKind::Description,
        r#"(?is)<meta\s+[^>]*content\s*=\s*["']([^"']+)["'][^>]*name\s*=\s*["']description["']"#,
        Extractor::Text(1),
    ),
    (
        FieldKind::Description,
        r#"(?is)<meta\s+[^>]*property\s*=\s*["']og:description["'][^>]*content\s*=\s*["']([^"']+)["']"#,
        Extractor::Text(1),
    ),
    (
        FieldKind::Description,
        r#"(?is)<p[^>]*>\s*([^<]{40,600}?)\s*</p>"#,
        Extractor::Text(1),
    ),
    (
        FieldKind::Phone,
        r#"(?i)href\s*=\s*["']tel:([+\d\s().-]{8,20})["']"#,
        Extractor::Digits(1),
    ),
    (
        FieldKind::Phone,
        r#"(?i)(?:telefon|tlf\.?|ring oss|kundeservice)[^0-9+<]{0,20}(\+?\d[\d\s]{6,14}\d)"#,
        Extractor::Digits(1),
    ),
    (
        FieldKind::Email,
        r#"(?i)href\s*=\s*["']mailto:([A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,})"#,
        Extractor::Text(1),
    ),
    (
        FieldKind::Email,
        r#"(?i)\b([A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,})\b"#,
        Extractor::Text(1),
    ),
    (
        FieldKind::Address,
        r#"(?i)(?:besøksadresse|postadresse|adresse)\s*:?\s*(?:</[^>]+>\s*)*([^<]{3,80}?\d{4}\s+[A-ZÆØÅ][A-Za-zÆØÅæøå-]+)"#,
        Extractor::Text(1),
    ),
    (
        FieldKind::Address,
        r#"([A-ZÆØÅ][A-Za-zÆØÅæøå.]*(?:veien|vegen|gata|gaten|gate|vei|veg|plass|allé)\s+\d+[A-Za-z]?,?\s+\d{4}\s+[A-ZÆØÅ][A-Za-zÆØÅæøå]+)"#,
        Extractor::Text(1),
    ),
    (
        FieldKind::Price,
        r#"(?i)(\d[\d\s.,]*\d|\d)\s*(?:kr\b|nok\b|,-)"#,
        Extractor::Text(1),
    ),
    (
        FieldKind::Price,
        r#"(?i)(?:pris|fra)\s*:?\s*(?:kr\.?\s*)?(\d[\d\s.,]*)"#,
        Extractor::Text(1),
    ),
    (
        FieldKind::Logo,
        r#"(?is)<img[^>]+class\s*=\s*["'][^"']*logo[^"']*["'][^>]*src\s*=\s*["']([^"']+)["']"#,
        Extractor::Url(1),
    ),
    (
        FieldKind::Logo,
        r#"(?is)<img[^>]+src\s*=\s*["']([^"']*logo[^"']*)["']"#,
        Extractor::Url(1),
    ),
    (
        FieldKind::Logo,
        r#"(?is)<meta\s+[^>]*property\s*=\s*["']og:image["'][^>]*content\s*=\s*["']([^"']+)["']"#,
        Extractor::Url(1),
    ),
    (
        FieldKind::OrganizationNumber,
        r#"(?i)org(?:anisasjons)?\.?\s*-?\s*(?:nr|nummer)\.?\s*:?\s*(?:NO\s*)?(\d{3}\s?\d{3}\s?\d{3})"#,
        Extractor::Digits(1),
    ),
    (
        FieldKind::OrganizationNumber,
        r#"(?i)\bNO\s?(\d{3}\s?\d{3}\s?\d{3})\s?MVA\b"#,
        Extractor::Digits(1),
    ),
];

const BLOCKED_EMAIL_LOCAL_PARTS: &[&str] = &[
    "noreply",
    "no-reply",
    "no_reply",
    "donotreply",
    "do-not-reply",
    "mailer-daemon",
    "postmaster",
];

const BLOCKED_EMAIL_DOMAINS: &[&str] = &[
    "example.com",
    "example.no",
    "domain.com",
    "email.com",
    "yourdomain.com",
    "sentry.io",
    "wixpress.com",
    "godaddy.com",
];

const ASSET_SUFFIXES: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp"];

/// Rejects no-reply addresses, tracker/vendor domains and asset names that look like emails.
pub fn is_contact_email(email: &str) -> bool {
    let lower = email.trim().to_ascii_lowercase();
    let Some((local, domain)) = lower.rsplit_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    if BLOCKED_EMAIL_LOCAL_PARTS.iter().any(|b| local.contains(b)) {
        return false;
    }
    if BLOCKED_EMAIL_DOMAINS
        .iter()
        .any(|d| domain == *d || domain.ends_with(&format!(".{d}")))
    {
        return false;
    }
    !ASSET_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

fn is_valid(field: FieldKind, value: &str) -> bool {
    match field {
        FieldKind::Description => value.chars().count() >= 10,
        FieldKind::Phone => (8..=12).contains(&value.len()),
        FieldKind::Email => is_contact_email(value),
        FieldKind::Address => value.len() >= 6,
        FieldKind::Price => parse_price_str(value) > 0.0,
        FieldKind::Logo => !value.is_empty(),
        FieldKind::OrganizationNumber => value.len() == 9,
    }
}

pub fn clean_text(raw: &str) -> String {
    html_escape::decode_html_entities(raw)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn resolve_url(raw: &str, base: Option<&Url>) -> Option<String> {
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    match base {
        Some(base) => base.join(raw).ok().map(String::from),
        None => Url::parse(raw).ok().map(String::from),
    }
}

/// Ordered pattern rules per field.
#[derive(Debug, Clone, Default)]
pub struct ExtractionRules {
    rules: BTreeMap<FieldKind, Vec<PatternRule>>,
}

impl ExtractionRules {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in rule table tuned for Norwegian provider sites.
    pub fn norwegian_defaults() -> Result<Self, regex::Error> {
        let mut rules = Self::empty();
        for (field, pattern, extractor) in DEFAULT_RULES {
            rules.push(*field, pattern, *extractor)?;
        }
        Ok(rules)
    }

    /// Appends a rule after the existing ones for `field`.
    pub fn push(&mut self, field: FieldKind, pattern: &str, extractor: Extractor) -> Result<(), regex::Error> {
        let pattern = Regex::new(pattern)?;
        self.rules
            .entry(field)
            .or_default()
            .push(PatternRule { pattern, extractor });
        Ok(())
    }

    pub fn rules_for(&self, field: FieldKind) -> &[PatternRule] {
        self.rules.get(&field).map(Vec::as_slice).unwrap_or_default()
    }

    /// First value, across rules in order and matches in document order, that passes the field check.
    pub fn extract(&self, field: FieldKind, html: &str, base: Option<&Url>) -> Option<String> {
        self.rules_for(field).iter().find_map(|rule| {
            rule.pattern
                .captures_iter(html)
                .filter_map(|caps| rule.extractor.apply(&caps, base))
                .find(|value| is_valid(field, value))
        })
    }
}

#[derive(Debug, Error)]
#[error("invalid selector {selector:?}: {message}")]
pub struct SelectorError {
    pub selector: String,
    pub message: String,
}

fn parse_selector(selector: &str) -> Result<Selector, SelectorError> {
    Selector::parse(selector).map_err(|e| SelectorError {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let cleaned = clean_text(&value);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

pub fn select_first_text(scope: ElementRef<'_>, selector: &str) -> Result<Option<String>, SelectorError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

pub fn select_all_texts(scope: ElementRef<'_>, selector: &str) -> Result<Vec<String>, SelectorError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

pub fn select_first_attr(
    scope: ElementRef<'_>,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, SelectorError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// Raw field values pulled from one document or one listing item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedFields {
    pub name: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub price: Option<String>,
    pub rating: Option<String>,
    pub logo: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub organization_number: Option<String>,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
}

impl ExtractedFields {
    fn slot(&mut self, field: FieldKind) -> &mut Option<String> {
        match field {
            FieldKind::Description => &mut self.description,
            FieldKind::Phone => &mut self.phone,
            FieldKind::Email => &mut self.email,
            FieldKind::Address => &mut self.address,
            FieldKind::Price => &mut self.price,
            FieldKind::Logo => &mut self.logo,
            FieldKind::OrganizationNumber => &mut self.organization_number,
        }
    }

    /// Reads every configured selector inside `scope`.
    pub fn from_selectors(
        scope: ElementRef<'_>,
        selectors: &BTreeMap<String, String>,
        base: Option<&Url>,
    ) -> Result<Self, SelectorError> {
        let mut fields = Self::default();
        for (key, selector) in selectors {
            match key.as_str() {
                "item" => {}
                "name" => fields.name = select_first_text(scope, selector)?,
                "rating" => fields.rating = select_first_text(scope, selector)?,
                "pros" => fields.pros = select_all_texts(scope, selector)?,
                "cons" => fields.cons = select_all_texts(scope, selector)?,
                "link" => {
                    fields.link = select_first_attr(scope, selector, "href")?
                        .and_then(|href| resolve_url(&href, base));
                }
                "logo" => {
                    fields.logo = select_first_attr(scope, selector, "src")?
                        .or(select_first_attr(scope, selector, "content")?)
                        .and_then(|src| resolve_url(&src, base));
                }
                "email" => {
                    fields.email = select_first_text(scope, selector)?
                        .map(|e| e.trim_start_matches("mailto:").to_string())
                        .filter(|e| is_contact_email(e));
                }
                "phone" => {
                    fields.phone = select_first_text(scope, selector)?
                        .map(|p| p.chars().filter(char::is_ascii_digit).collect());
                }
                "organization_number" => {
                    fields.organization_number = select_first_text(scope, selector)?
                        .map(|p| p.chars().filter(char::is_ascii_digit).collect());
                }
                "description" => fields.description = select_first_text(scope, selector)?,
                "price" => fields.price = select_first_text(scope, selector)?,
                "address" => fields.address = select_first_text(scope, selector)?,
                other => tracing::debug!(field = other, "ignoring unknown selector field"),
            }
        }
        Ok(fields)
    }

    /// Fills every pattern-extractable field the selectors left empty.
    pub fn fill_from_patterns(&mut self, rules: &ExtractionRules, html: &str, base: Option<&Url>) {
        for field in FieldKind::ALL {
            let slot = self.slot(field);
            if slot.is_none() {
                *slot = rules.extract(field, html, base);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    fn rules() -> ExtractionRules {
        ExtractionRules::norwegian_defaults().expect("default rules compile")
    }

    #[test]
    fn every_field_has_default_rules() {
        let rules = rules();
        for field in FieldKind::ALL {
            assert!(!rules.rules_for(field).is_empty(), "{field:?} has no rules");
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let html = r#"<meta name="description" content="Meta beskrivelse av selskapet">
            <p>Dette er en lang paragraf som også kunne vært brukt som beskrivelse her.</p>"#;
        assert_eq!(
            rules().extract(FieldKind::Description, html, None).as_deref(),
            Some("Meta beskrivelse av selskapet")
        );
    }

    #[test]
    fn custom_rule_order_is_respected() {
        let mut rules = ExtractionRules::empty();
        rules.push(FieldKind::Phone, r"B:(\d{8})", Extractor::Digits(1)).unwrap();
        rules.push(FieldKind::Phone, r"A:(\d{8})", Extractor::Digits(1)).unwrap();
        assert_eq!(
            rules.extract(FieldKind::Phone, "A:11111111 B:22222222", None).as_deref(),
            Some("22222222")
        );
    }

    #[test]
    fn invalid_emails_are_skipped() {
        let html = r#"<a href="mailto:noreply@tibber.com">x</a>
            <img src="logo@2x.png"> support@sentry.io kundeservice@fjordkraft.no"#;
        assert_eq!(
            rules().extract(FieldKind::Email, html, None).as_deref(),
            Some("kundeservice@fjordkraft.no")
        );
        assert!(!is_contact_email("no-reply@telia.no"));
        assert!(!is_contact_email("post@example.com"));
        assert!(is_contact_email("post@ice.no"));
    }

    #[test]
    fn phone_and_org_number_are_digits_only() {
        let html = r#"<a href="tel:+47 22 33 44 55">Ring</a> Org.nr: 917 245 975"#;
        let rules = rules();
        assert_eq!(rules.extract(FieldKind::Phone, html, None).as_deref(), Some("4722334455"));
        assert_eq!(
            rules.extract(FieldKind::OrganizationNumber, html, None).as_deref(),
            Some("917245975")
        );
    }

    #[test]
    fn logo_resolves_relative_to_page() {
        let base = Url::parse("https://www.fjordkraft.no/strom/").unwrap();
        let html = r#"<img class="site-logo" src="/img/fk.svg">"#;
        assert_eq!(
            rules().extract(FieldKind::Logo, html, Some(&base)).as_deref(),
            Some("https://www.fjordkraft.no/img/fk.svg")
        );
    }

    #[test]
    fn price_rule_requires_positive_amount() {
        let html = "Pris: 0 kr i oppstart. Månedspris 49,90 kr";
        assert_eq!(rules().extract(FieldKind::Price, html, None).as_deref(), Some("49,90"));
    }

    #[test]
    fn selectors_scope_to_listing_items() {
        let html = r#"<ul>
            <li class="p"><h3>Ice</h3><span class="pris">199,-</span><a href="/ice">Les</a><li class="pro">Billig</li></li>
        </ul>"#;
        let document = Html::parse_document(html);
        let mut selectors = BTreeMap::new();
        selectors.insert("name".to_string(), "h3".to_string());
        selectors.insert("price".to_string(), ".pris".to_string());
        selectors.insert("link".to_string(), "a".to_string());
        let base = Url::parse("https://sammenlign.no/mobil").unwrap();
        let fields =
            ExtractedFields::from_selectors(document.root_element(), &selectors, Some(&base)).unwrap();
        assert_eq!(fields.name.as_deref(), Some("Ice"));
        assert_eq!(fields.price.as_deref(), Some("199,-"));
        assert_eq!(fields.link.as_deref(), Some("https://sammenlign.no/ice"));
    }

    #[test]
    fn bad_selector_is_an_error() {
        let document = Html::parse_document("<p>x</p>");
        let mut selectors = BTreeMap::new();
        selectors.insert("name".to_string(), "h1[[".to_string());
        assert!(ExtractedFields::from_selectors(document.root_element(), &selectors, None).is_err());
    }
}

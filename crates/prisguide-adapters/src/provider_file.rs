//! Parser for the pipe-delimited provider source file (`category|name|url`).

use prisguide_core::Category;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderLine {
    pub line_no: usize,
    pub category: Category,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderFile {
    pub lines: Vec<ProviderLine>,
    /// One human-readable reason per rejected line.
    pub skipped: Vec<String>,
}

pub fn parse_provider_file(text: &str) -> ProviderFile {
    let mut out = ProviderFile::default();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Ok((category, name, url)) => out.lines.push(ProviderLine {
                line_no,
                category,
                name,
                url,
            }),
            Err(reason) => out.skipped.push(format!("line {line_no}: {reason}")),
        }
    }
    out
}

fn parse_line(line: &str) -> Result<(Category, String, String), String> {
    let parts = line.split('|').map(str::trim).collect::<Vec<_>>();
    let [category, name, url] = parts.as_slice() else {
        return Err(format!("expected 3 fields, found {}", parts.len()));
    };
    let category = category.parse::<Category>().map_err(|e| e.to_string())?;
    if name.is_empty() {
        return Err("empty provider name".to_string());
    }
    let parsed = Url::parse(url).map_err(|e| format!("invalid url {url:?}: {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported url scheme {:?}", parsed.scheme()));
    }
    Ok((category, name.to_string(), url.to_string()))
}

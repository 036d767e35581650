//! Content fingerprints: SHA-256 over the text a target cares about.
//!
//! Markup churn (attribute order, whitespace between tags, tracking pixels)
//! does not move the fingerprint; only extracted text does.

use std::fmt;

use scraper::{Html, Node, Selector as CssSelector};
use sha2::{Digest, Sha256};
use sxd_xpath::Value;

use crate::error::ExtractionError;
use crate::targets::Selector;

/// Elements whose text never renders.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Lowercase hex SHA-256 digest of a page's extracted text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Digest already-extracted text.
    pub fn of_text(text: &str) -> Self {
        let mut h = Sha256::new();
        h.update(text.as_bytes());
        Self(format!("{:x}", h.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, enough to tell fingerprints apart in a log line.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint `document`, restricted to the elements matching `selector`
/// when one is given.
pub fn fingerprint(
    document: &str,
    selector: Option<&Selector>,
) -> Result<Fingerprint, ExtractionError> {
    let text = extract_text(document, selector)?;
    Ok(Fingerprint::of_text(&text))
}

/// Extract the text a fingerprint is computed over.
///
/// With a selector (CSS or XPath), the trimmed text of each matching node is
/// joined with single spaces; nodes without text are skipped and no match
/// yields an empty string.  Without one, every visible text node of the
/// document is concatenated as-is.
pub fn extract_text(document: &str, selector: Option<&Selector>) -> Result<String, ExtractionError> {
    let expr = selector.map(|s| s.expression().trim()).unwrap_or_default();
    match selector {
        _ if expr.is_empty() => Ok(visible_text(&Html::parse_document(document))),
        Some(Selector::XPath(_)) => xpath_text(document, expr),
        _ => css_text(document, expr),
    }
}

fn css_text(document: &str, expr: &str) -> Result<String, ExtractionError> {
    let sel = CssSelector::parse(expr).map_err(|e| ExtractionError::InvalidSelector {
        selector: expr.to_string(),
        reason: e.to_string(),
    })?;

    let doc = Html::parse_document(document);
    let parts: Vec<String> = doc
        .select(&sel)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    Ok(parts.join(" "))
}

fn xpath_text(document: &str, expr: &str) -> Result<String, ExtractionError> {
    let package = sxd_html::parse_html(document);
    let doc = package.as_document();
    let value = sxd_xpath::evaluate_xpath(&doc, expr).map_err(|e| {
        ExtractionError::InvalidXPath {
            xpath: expr.to_string(),
            reason: e.to_string(),
        }
    })?;

    let texts: Vec<String> = match value {
        Value::Nodeset(nodes) => nodes
            .document_order()
            .into_iter()
            .map(|node| node.string_value())
            .collect(),
        // `count(//li)`, `string(//h1)` and friends.
        scalar => vec![scalar.string()],
    };
    let parts: Vec<String> = texts
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    Ok(parts.join(" "))
}

fn visible_text(doc: &Html) -> String {
    let mut out = String::new();
    for node in doc.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|el| HIDDEN_ELEMENTS.contains(&el.name()))
        });
        if !hidden {
            out.push_str(text);
        }
    }
    out
}

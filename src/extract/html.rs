//! Shared scraper helpers for extractor implementations

use scraper::{Html, Selector};
use url::Url;

/// Harvests absolute links matching a CSS selector, resolving relative hrefs
/// against the page URL.
///
/// Excluded: `javascript:`, `mailto:`, `tel:` and `data:` hrefs, anything
/// that does not resolve to http(s).
pub fn select_links(document: &Html, selector: &str, base_url: &Url) -> Vec<String> {
    let mut links = Vec::new();
    if let Ok(selector) = Selector::parse(selector) {
        for element in document.select(&selector) {
            if let Some(href) = element.value().attr("href") {
                if let Some(absolute) = resolve_link(href, base_url) {
                    links.push(absolute);
                }
            }
        }
    }
    links
}

/// First text content matching a CSS selector, trimmed.
pub fn select_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Detects the challenge-interstitial shape common to anti-bot walls: a form
/// posting back a captcha field, or the characteristic robot-check marker.
pub fn has_challenge_form(document: &Html) -> bool {
    for selector in [
        "form[action*='validateCaptcha']",
        "input[name='captchaCharacters']",
        "img[src*='captcha']",
    ] {
        if let Ok(selector) = Selector::parse(selector) {
            if document.select(&selector).next().is_some() {
                return true;
            }
        }
    }
    false
}

fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    for scheme in ["javascript:", "mailto:", "tel:", "data:"] {
        if href.starts_with(scheme) {
            return None;
        }
    }
    let resolved = base_url.join(href).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(resolved.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(html: &str) -> Html {
        Html::parse_document(html)
    }

    #[test]
    fn test_select_links_resolves_relative() {
        let document = doc(r#"<html><body><a class="next" href="/page?p=2">next</a></body></html>"#);
        let base = Url::parse("https://shop.example/list").unwrap();
        let links = select_links(&document, "a.next", &base);
        assert_eq!(links, vec!["https://shop.example/page?p=2".to_string()]);
    }

    #[test]
    fn test_select_links_skips_pseudo_schemes() {
        let document = doc(r#"<html><body><a href="javascript:void(0)">x</a><a href="mailto:a@b">m</a></body></html>"#);
        let base = Url::parse("https://shop.example/").unwrap();
        assert!(select_links(&document, "a", &base).is_empty());
    }

    #[test]
    fn test_select_text() {
        let document = doc("<html><head><title> Widgets </title></head></html>");
        assert_eq!(select_text(&document, "title"), Some("Widgets".to_string()));
        assert_eq!(select_text(&document, "h1"), None);
    }

    #[test]
    fn test_challenge_form_detected() {
        let document = doc(
            r#"<html><body><form action="/errors/validateCaptcha"><input name="captchaCharacters"></form></body></html>"#,
        );
        assert!(has_challenge_form(&document));
        assert!(!has_challenge_form(&doc("<html><body>catalog</body></html>")));
    }
}

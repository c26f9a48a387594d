//! Readability-style text extraction from archived HTML, and the Markdown
//! preprocessing pipeline for archived curated content.
//!
//! Condition A runs [`extract_article_text`] over stored HTML pages: locate
//! the main content element, strip chrome, and convert what remains to plain
//! Markdown text via `htmd`. Condition B runs [`preprocess::preprocess_markdown`]
//! over stored Markdown files.

pub mod preprocess;

use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use tracing::debug;

use ccbench_shared::{CcbenchError, Result};

/// Content-bearing elements tried in priority order before falling back to
/// `<body>`.
const CONTENT_SELECTORS: &[&str] = &["main", "article", "div#content", "div.content"];

static BODY_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("body selector"));

/// Extract the readable article text of an HTML page as Markdown-ish text.
///
/// Returns an empty string when the page has no content element at all;
/// the caller decides what "too short to be renderable" means.
pub fn extract_article_text(html: &str) -> Result<String> {
    let doc = Html::parse_document(html);

    let content_html = select_content_html(&doc);
    if content_html.trim().is_empty() {
        return Ok(String::new());
    }

    // htmd drops non-content tags during conversion; the result reads as
    // plain Markdown text suitable for direct prompt inclusion.
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec![
            "script", "style", "nav", "header", "footer", "aside", "iframe", "noscript", "svg",
            "form", "button",
        ])
        .build();

    let text = converter
        .convert(&content_html)
        .map_err(|e| CcbenchError::parse(format!("html-to-text conversion failed: {e}")))?;

    let text = text.trim().to_string();
    debug!(html_len = html.len(), text_len = text.len(), "extracted article text");

    Ok(text)
}

/// Pick the innermost content element's HTML, preferring semantic containers.
fn select_content_html(doc: &Html) -> String {
    for selector_str in CONTENT_SELECTORS {
        let Ok(selector) = Selector::parse(selector_str) else {
            continue;
        };
        if let Some(el) = doc.select(&selector).next() {
            return element_html(&el);
        }
    }

    doc.select(&BODY_SELECTOR)
        .next()
        .map(|el| element_html(&el))
        .unwrap_or_default()
}

fn element_html(el: &ElementRef) -> String {
    el.inner_html()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_main_over_body() {
        let html = r#"<html><body>
            <nav><a href="/">Home</a></nav>
            <main><h1>Charges</h1><p>Create a charge with the API.</p></main>
            <footer>Copyright</footer>
        </body></html>"#;

        let text = extract_article_text(html).unwrap();
        assert!(text.contains("Charges"));
        assert!(text.contains("Create a charge"));
        assert!(!text.contains("Copyright"));
        assert!(!text.contains("Home"));
    }

    #[test]
    fn falls_back_to_body() {
        let html = "<html><body><h2>Plain page</h2><p>No main element here.</p></body></html>";
        let text = extract_article_text(html).unwrap();
        assert!(text.contains("Plain page"));
        assert!(text.contains("No main element"));
    }

    #[test]
    fn skips_script_and_style() {
        let html = r#"<html><body><main>
            <script>var x = "tracker";</script>
            <style>.hidden { display: none }</style>
            <p>Visible content only.</p>
        </main></body></html>"#;

        let text = extract_article_text(html).unwrap();
        assert!(text.contains("Visible content only."));
        assert!(!text.contains("tracker"));
        assert!(!text.contains("display"));
    }

    #[test]
    fn js_shell_yields_near_empty_text() {
        let html = r#"<html><body><div id="root"></div></body></html>"#;
        let text = extract_article_text(html).unwrap();
        assert!(text.is_empty());
    }
}

//! HTML → plain-ish text for the semantic extractor.

use tracing::debug;

use adaptcrawl_shared::{AdaptError, Result};

/// Convert a page to Markdown-flavoured text with page chrome removed,
/// truncated to at most `max_chars` characters.
pub fn page_text(html: &str, max_chars: usize) -> Result<String> {
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec![
            "script", "style", "nav", "header", "footer", "iframe", "noscript", "svg",
        ])
        .build();

    let markdown = converter
        .convert(html)
        .map_err(|e| AdaptError::parse(format!("htmd conversion failed: {e}")))?;

    let text = markdown.trim();
    let truncated: String = text.chars().take(max_chars).collect();
    debug!(
        raw_len = text.len(),
        truncated = truncated.len() < text.len(),
        "page text prepared"
    );
    Ok(truncated)
}

//! Page fetching and HTML-level extraction primitives.
//!
//! This crate provides:
//! - [`fetcher`]: `reqwest`-backed [`Fetcher`](adaptcrawl_shared::Fetcher) with
//!   transient/permanent failure classification
//! - [`selectors`]: applying a [`SelectorSpec`](adaptcrawl_shared::SelectorSpec) to HTML
//! - [`detect`]: repeated-structure detection for unknown layouts
//! - [`text`]: HTML to text for the semantic extractor

pub mod detect;
pub mod fetcher;
pub mod selectors;
pub mod text;

pub use detect::{DetectedStructure, detect_structure};
pub use fetcher::{HttpFetcher, fingerprint_for, is_ssrf_target};
pub use selectors::apply_spec;
pub use text::page_text;

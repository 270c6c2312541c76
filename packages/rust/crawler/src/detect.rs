//! Rule-based detection of repeated item structure.
//!
//! Used when no stored pattern or hand-written selector works: find the
//! largest group of structurally identical siblings, derive a CSS selector for
//! it, then pick a locator per schema field by trying kind-specific candidates
//! against a few sample items.

use std::collections::HashMap;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use adaptcrawl_shared::{FieldKind, FieldLocator, FieldSchema, FieldSpec, SelectorSpec};

use crate::selectors::read_value;

/// Groups smaller than this are not treated as lists.
const MIN_REPEAT: usize = 2;

/// Items inspected when validating a field locator.
const SAMPLE_ITEMS: usize = 5;

/// Elements never considered as list items.
const SKIP_TAGS: &[&str] = &[
    "html", "head", "body", "script", "style", "noscript", "svg", "br", "meta", "link", "option",
];

/// Page chrome whose descendants are ignored.
const CHROME_TAGS: &[&str] = &["nav", "header", "footer", "aside"];

/// Result of structure detection.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedStructure {
    pub spec: SelectorSpec,
    /// Elements matched by the item selector (1 for detail pages).
    pub item_count: usize,
}

/// Detect an item selector and field locators for `schema`.
///
/// `hint` is a previously known spec: its item selector is kept when it still
/// matches, and its field locators are tried before the built-in candidates.
/// Returns `None` when no field could be located.
pub fn detect_structure(
    html: &str,
    schema: &FieldSchema,
    hint: Option<&SelectorSpec>,
) -> Option<DetectedStructure> {
    let doc = Html::parse_document(html);

    let item_css = hint_item(&doc, hint).or_else(|| find_repeated_group(&doc));
    let items: Vec<ElementRef<'_>> = match &item_css {
        Some(css) => {
            let sel = Selector::parse(css).ok()?;
            doc.select(&sel).collect()
        }
        None => vec![doc.root_element()],
    };
    if items.is_empty() {
        return None;
    }
    let samples = &items[..items.len().min(SAMPLE_ITEMS)];

    let mut fields = Vec::new();
    for field in &schema.fields {
        let hinted = hint.and_then(|h| h.locator(&field.name)).cloned();
        let found = hinted
            .into_iter()
            .chain(candidates_for(field))
            .find(|candidate| locator_fits(candidate, samples, field.kind));
        if let Some(locator) = found {
            fields.push(locator);
        }
    }

    debug!(
        item = item_css.as_deref().unwrap_or("<document>"),
        items = items.len(),
        located = fields.len(),
        "structure detection finished"
    );

    if fields.is_empty() {
        return None;
    }
    Some(DetectedStructure {
        spec: SelectorSpec {
            item: item_css,
            fields,
        },
        item_count: items.len(),
    })
}

fn hint_item(doc: &Html, hint: Option<&SelectorSpec>) -> Option<String> {
    let css = hint?.item.as_deref()?;
    let sel = Selector::parse(css).ok()?;
    doc.select(&sel).next().map(|_| css.to_string())
}

// ---------------------------------------------------------------------------
// Repeated group search
// ---------------------------------------------------------------------------

fn find_repeated_group(doc: &Html) -> Option<String> {
    let mut groups: HashMap<(_, String), Vec<ElementRef<'_>>> = HashMap::new();

    for node in doc.root_element().descendants() {
        let Some(el) = ElementRef::wrap(node) else {
            continue;
        };
        if SKIP_TAGS.contains(&el.value().name()) || in_chrome(el) {
            continue;
        }
        let Some(parent) = el.parent().and_then(ElementRef::wrap) else {
            continue;
        };
        groups
            .entry((parent.id(), signature(el)))
            .or_default()
            .push(el);
    }

    let (members, sig) = groups
        .into_iter()
        .filter(|(_, members)| members.len() >= MIN_REPEAT)
        .map(|((_, sig), members)| (members, sig))
        .max_by_key(|(members, _)| group_score(members))?;

    item_selector(doc, &members, &sig)
}

fn in_chrome(el: ElementRef<'_>) -> bool {
    std::iter::once(*el)
        .chain(el.ancestors())
        .filter_map(ElementRef::wrap)
        .any(|a| CHROME_TAGS.contains(&a.value().name()))
}

/// Favor groups carrying text and links.
fn group_score(members: &[ElementRef<'_>]) -> usize {
    let link_sel = Selector::parse("a[href]").expect("valid selector");
    members
        .iter()
        .map(|m| {
            let text_len = m.text().map(str::trim).map(str::len).sum::<usize>().min(200);
            let link = if m.value().name() == "a" || m.select(&link_sel).next().is_some() {
                20
            } else {
                0
            };
            text_len + link
        })
        .sum()
}

/// `tag.class1.class2` with classes that are plain CSS identifiers.
fn signature(el: ElementRef<'_>) -> String {
    let mut classes: Vec<&str> = el.value().classes().filter(|c| is_css_ident(c)).collect();
    classes.sort_unstable();
    let mut sig = el.value().name().to_string();
    for class in classes {
        sig.push('.');
        sig.push_str(class);
    }
    sig
}

fn is_css_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Pick the tightest selector that still covers every group member.
fn item_selector(doc: &Html, members: &[ElementRef<'_>], sig: &str) -> Option<String> {
    let mut candidates = vec![sig.to_string()];
    if let Some(parent) = members[0].parent().and_then(ElementRef::wrap) {
        let parent_sig = match parent.value().id() {
            Some(id) if is_css_ident(id) => format!("{}#{id}", parent.value().name()),
            _ => signature(parent),
        };
        candidates.push(format!("{parent_sig} > {sig}"));
    }

    candidates
        .into_iter()
        .filter_map(|css| {
            let sel = Selector::parse(&css).ok()?;
            let count = doc.select(&sel).count();
            (count >= members.len()).then_some((count, css))
        })
        .min_by_key(|(count, _)| *count)
        .map(|(_, css)| css)
}

// ---------------------------------------------------------------------------
// Field locators
// ---------------------------------------------------------------------------

fn candidate(selector: &str, attr: Option<&str>, field: &str) -> FieldLocator {
    FieldLocator {
        field: field.to_string(),
        selector: selector.to_string(),
        attr: attr.map(str::to_string),
    }
}

/// Kind- and name-driven locator candidates, most specific first.
fn candidates_for(field: &FieldSpec) -> Vec<FieldLocator> {
    let name = field.name.to_lowercase();
    let mut out = Vec::new();

    if field.kind != FieldKind::Url && is_css_ident(&name) {
        out.push(candidate(&format!("[class*=\"{name}\"]"), None, &field.name));
    }

    let generic: &[(&str, Option<&str>)] = match field.kind {
        FieldKind::Url => &[("a[href]", Some("href")), ("", Some("href"))],
        FieldKind::Date => &[
            ("time[datetime]", Some("datetime")),
            ("time", None),
            ("[class*=\"date\"]", None),
            ("[class*=\"time\"]", None),
            ("[class*=\"meta\"]", None),
            ("span", None),
            ("small", None),
        ],
        FieldKind::Number => &[
            ("[class*=\"price\"]", None),
            ("[class*=\"count\"]", None),
            ("[class*=\"num\"]", None),
            ("span", None),
            ("td", None),
        ],
        FieldKind::Text if is_title_like(&name) => &[
            ("h1", None),
            ("h2", None),
            ("h3", None),
            ("h4", None),
            ("[class*=\"title\"]", None),
            ("a", None),
            ("strong", None),
        ],
        FieldKind::Text if is_body_like(&name) => &[
            ("p", None),
            ("[class*=\"summary\"]", None),
            ("[class*=\"desc\"]", None),
            ("[class*=\"excerpt\"]", None),
            ("[class*=\"content\"]", None),
        ],
        FieldKind::Text if name.contains("author") => &[
            ("[rel=\"author\"]", None),
            ("[class*=\"byline\"]", None),
        ],
        FieldKind::Text => &[("p", None), ("span", None)],
    };

    out.extend(
        generic
            .iter()
            .map(|(sel, attr)| candidate(sel, *attr, &field.name)),
    );
    out
}

fn is_title_like(name: &str) -> bool {
    ["title", "headline", "name", "heading"]
        .iter()
        .any(|k| name.contains(k))
}

fn is_body_like(name: &str) -> bool {
    ["summary", "content", "body", "desc", "excerpt", "text"]
        .iter()
        .any(|k| name.contains(k))
}

/// A locator fits when at least half the samples yield a value of the right kind.
fn locator_fits(locator: &FieldLocator, samples: &[ElementRef<'_>], kind: FieldKind) -> bool {
    let selector = match locator.selector.trim() {
        "" => None,
        css => match Selector::parse(css) {
            Ok(sel) => Some(sel),
            Err(_) => return false,
        },
    };

    let hits = samples
        .iter()
        .filter(|item| {
            let target = match &selector {
                Some(sel) => item.select(sel).next(),
                None => Some(**item),
            };
            target
                .and_then(|el| read_value(el, locator.attr.as_deref()))
                .is_some_and(|v| kind.accepts(&v))
        })
        .count();

    hits > 0 && hits * 2 >= samples.len()
}

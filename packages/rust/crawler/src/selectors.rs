//! Apply a [`SelectorSpec`] to an HTML document.

use scraper::{ElementRef, Html, Selector};

use adaptcrawl_shared::{AdaptError, FieldValue, Item, Result, SelectorSpec};

/// A locator compiled once per document pass.
struct CompiledLocator<'a> {
    field: &'a str,
    /// `None` targets the item element itself.
    selector: Option<Selector>,
    attr: Option<&'a str>,
}

/// Parse a CSS selector, mapping failures to a parse error.
pub fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| AdaptError::parse(format!("invalid selector '{css}': {e}")))
}

fn compile(spec: &SelectorSpec) -> Result<Vec<CompiledLocator<'_>>> {
    spec.fields
        .iter()
        .map(|l| {
            let selector = match l.selector.trim() {
                "" | ":scope" => None,
                css => Some(parse_selector(css)?),
            };
            Ok(CompiledLocator {
                field: l.field.as_str(),
                selector,
                attr: l.attr.as_deref(),
            })
        })
        .collect()
}

/// Extract items from `html` using `spec`.
///
/// With an item selector, each matching element yields one item; otherwise
/// the whole document is a single item. Fields whose locator matches nothing
/// are left out of the item rather than set to an empty value.
pub fn apply_spec(html: &str, spec: &SelectorSpec) -> Result<Vec<Item>> {
    let doc = Html::parse_document(html);
    apply_to_document(&doc, spec)
}

/// Same as [`apply_spec`] on an already-parsed document.
pub fn apply_to_document(doc: &Html, spec: &SelectorSpec) -> Result<Vec<Item>> {
    let locators = compile(spec)?;

    let items = match spec.item.as_deref() {
        Some(item_css) => {
            let item_sel = parse_selector(item_css)?;
            doc.select(&item_sel)
                .map(|el| extract_item(el, &locators))
                .collect()
        }
        None => vec![extract_item(doc.root_element(), &locators)],
    };

    Ok(items)
}

fn extract_item(scope: ElementRef<'_>, locators: &[CompiledLocator<'_>]) -> Item {
    let mut item = Item::new();
    for locator in locators {
        let target = match &locator.selector {
            Some(sel) => scope.select(sel).next(),
            None => Some(scope),
        };
        if let Some(value) = target.and_then(|el| read_value(el, locator.attr)) {
            item.insert(locator.field.to_string(), FieldValue::Single(value));
        }
    }
    item
}

/// Read an attribute, or the element's whitespace-collapsed text.
pub fn read_value(el: ElementRef<'_>, attr: Option<&str>) -> Option<String> {
    let raw = match attr {
        Some(name) => el.value().attr(name)?.to_string(),
        None => collapse_whitespace(&el.text().collect::<String>()),
    };
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Collapse runs of whitespace into single spaces.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

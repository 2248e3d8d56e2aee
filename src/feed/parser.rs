use sxd_document::parser;
use sxd_xpath::nodeset::Node;
use sxd_xpath::{Context, Factory, Value, XPath};
use tracing::trace;

use super::entry::{coerce_severity, parse_date, FeedEntry};
use super::FeedError;

const ITEMS: &str = "/*/channel[1]/item";

fn compile(expr: &str) -> Result<XPath, FeedError> {
    Factory::new()
        .build(expr)
        .map_err(|e| FeedError::Parse(format!("could not compile `{expr}`: {e:?}")))?
        .ok_or_else(|| FeedError::Parse(format!("`{expr}` is not an XPath expression")))
}

struct ItemFields {
    severity: XPath,
    pub_date: XPath,
    title: XPath,
    description: XPath,
    link: XPath,
}

impl ItemFields {
    fn new() -> Result<Self, FeedError> {
        Ok(Self {
            severity: compile("string(severity)")?,
            pub_date: compile("string(pubDate)")?,
            title: compile("string(title)")?,
            description: compile("string(description)")?,
            link: compile("string(link)")?,
        })
    }
}

fn text_of<'d>(xpath: &XPath, context: &Context<'d>, item: Node<'d>) -> Result<String, FeedError> {
    xpath
        .evaluate(context, item)
        .map(|value| value.string())
        .map_err(|e| FeedError::Parse(format!("could not evaluate an item field: {e:?}")))
}

/// Parses an RSS-like document into entries, in document order.
///
/// Only the items of the first `channel` under the root element are read. A well-formed document
/// without items yields no entries.
pub fn parse_feed(body: &str) -> Result<Vec<FeedEntry>, FeedError> {
    let package = parser::parse(body.trim())
        .map_err(|e| FeedError::Parse(format!("malformed XML: {e:?}")))?;
    let document = package.as_document();
    let context = Context::new();

    let items = match compile(ITEMS)?
        .evaluate(&context, document.root())
        .map_err(|e| FeedError::Parse(format!("could not select feed items: {e:?}")))?
    {
        Value::Nodeset(nodes) => nodes.document_order(),
        _ => vec![],
    };

    let fields = ItemFields::new()?;
    let mut entries = Vec::with_capacity(items.len());

    for item in items {
        let entry = FeedEntry {
            severity: coerce_severity(&text_of(&fields.severity, &context, item)?),
            published_at: parse_date(&text_of(&fields.pub_date, &context, item)?),
            title: text_of(&fields.title, &context, item)?,
            description: text_of(&fields.description, &context, item)?,
            url: text_of(&fields.link, &context, item)?,
        };
        trace!(title = %entry.title, url = %entry.url, "Parsed a feed item");

        entries.push(entry);
    }

    Ok(entries)
}

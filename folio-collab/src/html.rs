//! Editor-facing HTML seam.
//!
//! The rich-text editor hands us its content as HTML. [`parse`] turns it
//! into a small node tree that the replica can load: block-level tags
//! become elements and inline formatting tags become marks on text runs.
//! Parsing is lenient because editor output is HTML, not XML: void tags,
//! unmatched end tags and named HTML5 entities are accepted.

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;

use crate::error::CollabError;
use crate::replica::Mark;

/// Parsed editor content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtmlNode {
    Element {
        tag: String,
        attributes: Vec<(String, String)>,
        children: Vec<HtmlNode>,
    },
    Text {
        text: String,
        marks: Vec<Mark>,
    },
}

impl HtmlNode {
    pub fn element(tag: impl Into<String>, children: Vec<HtmlNode>) -> Self {
        Self::Element {
            tag: tag.into(),
            attributes: Vec::new(),
            children,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            marks: Vec::new(),
        }
    }
}

const VOID_TAGS: &[&str] = &["br", "hr", "img", "input", "col", "wbr"];

/// Canonical mark name for an inline formatting tag, `None` for block tags.
fn mark_name(tag: &str) -> Option<&'static str> {
    Some(match tag {
        "strong" | "b" => "strong",
        "em" | "i" => "em",
        "u" => "u",
        "s" | "strike" | "del" => "s",
        "code" => "code",
        "a" => "a",
        "sub" => "sub",
        "sup" => "sup",
        "mark" => "mark",
        _ => return None,
    })
}

struct OpenElement {
    tag: String,
    attributes: Vec<(String, String)>,
    children: Vec<HtmlNode>,
}

impl OpenElement {
    fn close(self) -> HtmlNode {
        HtmlNode::Element {
            tag: self.tag,
            attributes: self.attributes,
            children: self.children,
        }
    }
}

struct TreeBuilder {
    /// Index 0 is the synthetic root.
    open: Vec<OpenElement>,
    /// Active inline marks, outermost first, with the tag that opened them.
    marks: Vec<(String, Mark)>,
}

impl TreeBuilder {
    fn new() -> Self {
        Self {
            open: vec![OpenElement {
                tag: String::new(),
                attributes: Vec::new(),
                children: Vec::new(),
            }],
            marks: Vec::new(),
        }
    }

    fn push_node(&mut self, node: HtmlNode) {
        if let Some(parent) = self.open.last_mut() {
            parent.children.push(node);
        }
    }

    fn push_text(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        // Indentation between blocks.
        if self.marks.is_empty() && text.trim().is_empty() && text.contains('\n') {
            return;
        }
        let marks: Vec<Mark> = self.marks.iter().map(|(_, m)| m.clone()).collect();

        if let Some(HtmlNode::Text { text: last, marks: last_marks }) =
            self.open.last_mut().and_then(|p| p.children.last_mut())
        {
            if *last_marks == marks {
                last.push_str(&text);
                return;
            }
        }
        self.push_node(HtmlNode::Text { text, marks });
    }

    fn open_tag(&mut self, tag: String, attributes: Vec<(String, String)>, self_closing: bool) {
        if let Some(name) = mark_name(&tag) {
            if !self_closing {
                let mark = Mark {
                    name: name.to_string(),
                    attributes: attributes.into_iter().collect(),
                };
                self.marks.push((tag, mark));
            }
            return;
        }

        // Unknown markup keeps its content but not its wrapper.
        if !is_valid_name(&tag) {
            return;
        }
        let element = OpenElement {
            tag,
            attributes,
            children: Vec::new(),
        };
        if self_closing || VOID_TAGS.contains(&element.tag.as_str()) {
            self.push_node(element.close());
        } else {
            self.open.push(element);
        }
    }

    fn close_tag(&mut self, tag: &str) {
        if mark_name(tag).is_some() {
            if let Some(pos) = self.marks.iter().rposition(|(open, _)| open == tag) {
                self.marks.remove(pos);
            }
            return;
        }

        // Unmatched end tags are ignored; matched ones also close anything
        // left open inside them.
        let Some(pos) = self.open.iter().rposition(|e| e.tag == tag) else {
            return;
        };
        if pos == 0 {
            return;
        }
        while self.open.len() > pos {
            self.close_innermost();
        }
    }

    fn close_innermost(&mut self) {
        if self.open.len() <= 1 {
            return;
        }
        if let Some(element) = self.open.pop() {
            self.push_node(element.close());
        }
    }

    fn finish(mut self) -> Vec<HtmlNode> {
        while self.open.len() > 1 {
            self.close_innermost();
        }
        self.open.pop().map(|root| root.children).unwrap_or_default()
    }
}

fn tag_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase()
}

fn tag_attributes(e: &BytesStart<'_>) -> Vec<(String, String)> {
    let mut attributes = Vec::new();
    for attr in e.html_attributes().with_checks(false) {
        match attr {
            Ok(attr) => {
                let key = String::from_utf8_lossy(attr.key.as_ref()).to_ascii_lowercase();
                let value = attr
                    .unescape_value()
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
                if is_valid_name(&key) {
                    attributes.push((key, value));
                }
            }
            Err(e) => log::debug!("Skipping malformed attribute: {e}"),
        }
    }
    attributes
}

fn decode_text(e: &BytesText<'_>) -> String {
    e.unescape()
        .map(|t| t.into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(e).into_owned())
}

/// Parse editor HTML into a node tree.
pub fn parse(html: &str) -> Result<Vec<HtmlNode>, CollabError> {
    let mut reader = Reader::from_str(html);
    let config = reader.config_mut();
    config.trim_text_start = false;
    config.trim_text_end = false;
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let mut builder = TreeBuilder::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => builder.open_tag(tag_name(&e), tag_attributes(&e), false),
            Ok(Event::Empty(e)) => builder.open_tag(tag_name(&e), tag_attributes(&e), true),
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
                builder.close_tag(&tag);
            }
            Ok(Event::Text(e)) => builder.push_text(decode_text(&e)),
            Ok(Event::CData(e)) => builder.push_text(String::from_utf8_lossy(&e).into_owned()),
            Ok(Event::Comment(_) | Event::PI(_) | Event::Decl(_) | Event::DocType(_)) => {}
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(CollabError::Html(format!(
                    "{err} at position {}",
                    reader.error_position()
                )));
            }
        }
    }

    Ok(builder.finish())
}

/// Plain text of a node tree, for tests and diagnostics.
pub fn text_content(nodes: &[HtmlNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            HtmlNode::Text { text, .. } => out.push_str(text),
            HtmlNode::Element { children, .. } => out.push_str(&text_content(children)),
        }
    }
    out
}

/// Whether `name` is safe to emit as a tag, attribute or mark name:
/// an ASCII letter followed by letters, digits, `-`, `_` or `:`.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
}

/// Escape an attribute value for rendered HTML.
pub fn escape(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}

/// Escape text content for rendered HTML; quotes are left alone.
pub fn escape_text(text: &str) -> String {
    quick_xml::escape::partial_escape(text).into_owned()
}

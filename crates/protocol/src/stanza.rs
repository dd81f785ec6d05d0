use std::fmt;

use crate::constants::NS_STANZAS;

/// A minimal XML element as handed over by the signaling layer.
///
/// Parsing the XML stream is the signaling layer's job; this type only
/// carries the already-parsed tree and can render itself back to XML.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub namespace: Option<String>,
    /// Attributes in insertion order.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Creates an element carrying an `xmlns` declaration.
    pub fn with_ns(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    /// Builder: sets (or replaces) an attribute.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(key, value);
        self
    }

    /// Builder: appends a child element.
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// Builder: sets the text content.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First direct child with the given name, in any namespace.
    pub fn find_child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First direct child with the given name and namespace.
    pub fn find_child_ns(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.name == name && c.namespace.as_deref() == Some(namespace))
    }

    /// All direct children with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text content of the first direct child with the given name.
    pub fn find_child_content(&self, name: &str) -> Option<&str> {
        self.find_child(name).map(|c| c.text.as_str())
    }
}

fn escape(out: &mut fmt::Formatter<'_>, raw: &str) -> fmt::Result {
    for ch in raw.chars() {
        match ch {
            '&' => out.write_str("&amp;")?,
            '<' => out.write_str("&lt;")?,
            '>' => out.write_str("&gt;")?,
            '"' => out.write_str("&quot;")?,
            '\'' => out.write_str("&apos;")?,
            c => fmt::Write::write_char(out, c)?,
        }
    }
    Ok(())
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        if let Some(ns) = &self.namespace {
            f.write_str(" xmlns=\"")?;
            escape(f, ns)?;
            f.write_str("\"")?;
        }
        for (key, value) in &self.attributes {
            write!(f, " {key}=\"")?;
            escape(f, value)?;
            f.write_str("\"")?;
        }
        if self.children.is_empty() && self.text.is_empty() {
            return f.write_str("/>");
        }
        f.write_str(">")?;
        escape(f, &self.text)?;
        for child in &self.children {
            write!(f, "{child}")?;
        }
        write!(f, "</{}>", self.name)
    }
}

/// IQ stanza type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

/// Info/query envelope exchanged with the signaling peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iq {
    pub id: String,
    pub kind: IqType,
    pub to: Option<String>,
    pub from: Option<String>,
    /// Query payload (requests) or result payload (responses).
    pub payload: Option<Element>,
    /// `<error/>` child of an error response.
    pub error: Option<Element>,
}

impl Iq {
    /// Creates a `get` request addressed to `to`.
    pub fn get(id: impl Into<String>, to: impl Into<String>, payload: Element) -> Self {
        Self {
            id: id.into(),
            kind: IqType::Get,
            to: Some(to.into()),
            from: None,
            payload: Some(payload),
            error: None,
        }
    }

    /// Creates a `result` response to this request.
    pub fn result(&self, payload: Option<Element>) -> Self {
        Self {
            id: self.id.clone(),
            kind: IqType::Result,
            to: self.from.clone(),
            from: self.to.clone(),
            payload,
            error: None,
        }
    }

    /// Creates an `error` response to this request.
    pub fn error_reply(&self, error: Element) -> Self {
        Self {
            id: self.id.clone(),
            kind: IqType::Error,
            to: self.from.clone(),
            from: self.to.clone(),
            payload: None,
            error: Some(error),
        }
    }

    /// Human-readable text the peer attached to an error response, if any.
    pub fn error_message(&self) -> Option<String> {
        extract_error_message(self)
    }

    /// Renders the stanza as an element tree.
    pub fn to_element(&self) -> Element {
        let mut el = Element::new("iq")
            .attr("type", self.kind.as_str())
            .attr("id", self.id.clone());
        if let Some(to) = &self.to {
            el.set_attribute("to", to.clone());
        }
        if let Some(from) = &self.from {
            el.set_attribute("from", from.clone());
        }
        if let Some(payload) = &self.payload {
            el.children.push(payload.clone());
        }
        if let Some(error) = &self.error {
            el.children.push(error.clone());
        }
        el
    }
}

impl fmt::Display for Iq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_element().fmt(f)
    }
}

/// Reads the `<text/>` child of an IQ error, trimmed. Empty text counts as absent.
pub fn extract_error_message(iq: &Iq) -> Option<String> {
    if iq.kind != IqType::Error {
        return None;
    }
    let error = iq.error.as_ref()?;
    let text = error
        .find_child_ns("text", NS_STANZAS)
        .or_else(|| error.find_child("text"))?;
    let trimmed = text.text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

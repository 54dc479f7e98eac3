//! Exclusive XML canonicalization (without comments).
//!
//! Output is byte-for-byte stable for a given element tree: empty elements
//! are expanded, only visibly-utilized namespace declarations are rendered,
//! declarations are sorted by prefix and attributes by namespace URI then
//! local name.

use crate::error::XmlError;
use crate::xml::{escape_attr, escape_text, NamespaceDecl, XmlElement, XmlNode};

/// Algorithm URI for exclusive canonicalization without comments.
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

/// Captured canonical bytes of one element.
///
/// The send pipeline digests these bytes and writes the very same bytes into
/// the envelope, so what was signed is exactly what goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalFragment {
    text: String,
}

impl CanonicalFragment {
    /// Canonicalize an element into a new fragment.
    pub fn capture(element: &XmlElement) -> Result<Self, XmlError> {
        let mut text = String::new();
        let mut rendered = Vec::new();
        render(element, &mut rendered, &mut text)?;
        Ok(Self { text })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Canonicalize an element to bytes.
pub fn canonicalize(element: &XmlElement) -> Result<Vec<u8>, XmlError> {
    CanonicalFragment::capture(element).map(|f| f.text.into_bytes())
}

/// Canonicalize a content list (the children of an element) as a sequence
/// of standalone nodes. Used for element-content encryption.
pub fn canonicalize_content(children: &[XmlNode]) -> Result<String, XmlError> {
    let mut out = String::new();
    for child in children {
        match child {
            XmlNode::Element(e) => {
                let mut rendered = Vec::new();
                render(e, &mut rendered, &mut out)?;
            }
            XmlNode::Text(t) => escape_text(t, &mut out),
        }
    }
    Ok(out)
}

fn rendered_uri<'a>(rendered: &'a [NamespaceDecl], prefix: Option<&str>) -> Option<&'a str> {
    rendered
        .iter()
        .rev()
        .find(|(p, _)| p.as_deref() == prefix)
        .map(|(_, uri)| uri.as_str())
}

fn render(
    element: &XmlElement,
    rendered: &mut Vec<NamespaceDecl>,
    out: &mut String,
) -> Result<(), XmlError> {
    let mark = rendered.len();

    let mut utilized: Vec<(Option<String>, String)> = Vec::new();
    match (&element.prefix, &element.namespace) {
        (Some(p), Some(ns)) => utilized.push((Some(p.clone()), ns.clone())),
        (None, Some(ns)) => utilized.push((None, ns.clone())),
        (None, None) => utilized.push((None, String::new())),
        (Some(p), None) => return Err(XmlError::UnboundPrefix(p.clone())),
    }
    for attr in &element.attributes {
        match (&attr.prefix, &attr.namespace) {
            (Some(p), _) if p == "xml" => {}
            (Some(p), Some(ns)) => {
                if !utilized.iter().any(|(up, _)| up.as_deref() == Some(p.as_str())) {
                    utilized.push((Some(p.clone()), ns.clone()));
                }
            }
            (Some(p), None) => return Err(XmlError::UnboundPrefix(p.clone())),
            (None, _) => {}
        }
    }

    let mut emit: Vec<(Option<String>, String)> = utilized
        .into_iter()
        .filter(|(prefix, uri)| {
            let current = rendered_uri(rendered, prefix.as_deref());
            match prefix {
                None if uri.is_empty() => current.is_some_and(|c| !c.is_empty()),
                _ => current != Some(uri.as_str()),
            }
        })
        .collect();
    emit.sort_by(|a, b| match (&a.0, &b.0) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(y),
    });

    let mut attributes: Vec<_> = element.attributes.iter().collect();
    attributes.sort_by(|a, b| {
        let ka = (a.namespace.as_deref().unwrap_or(""), a.local_name.as_str());
        let kb = (b.namespace.as_deref().unwrap_or(""), b.local_name.as_str());
        ka.cmp(&kb)
    });

    let qname = element.qname();
    out.push('<');
    out.push_str(&qname);
    for (prefix, uri) in &emit {
        match prefix {
            Some(p) => {
                out.push_str(" xmlns:");
                out.push_str(p);
            }
            None => out.push_str(" xmlns"),
        }
        out.push_str("=\"");
        escape_attr(uri, out);
        out.push('"');
    }
    for attr in attributes {
        out.push(' ');
        out.push_str(&attr.qname());
        out.push_str("=\"");
        escape_attr(&attr.value, out);
        out.push('"');
    }
    out.push('>');

    rendered.extend(emit);
    for child in &element.children {
        match child {
            XmlNode::Element(e) => render(e, rendered, out)?,
            XmlNode::Text(t) => escape_text(t, out),
        }
    }
    out.push_str("</");
    out.push_str(&qname);
    out.push('>');

    rendered.truncate(mark);
    Ok(())
}

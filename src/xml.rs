//! Owned XML element tree backed by quick-xml.
//!
//! Uses quick-xml which is safe against XXE by default (doesn't expand
//! entities). Every element and attribute keeps its resolved namespace URI,
//! so any subtree can be canonicalized or re-serialized on its own.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::XmlError;

/// The namespace bound to the reserved `xml` prefix.
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// A namespace declaration: `None` is the default namespace.
pub type NamespaceDecl = (Option<String>, String);

/// An attribute with its resolved namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlAttribute {
    pub prefix: Option<String>,
    pub local_name: String,
    pub namespace: Option<String>,
    pub value: String,
}

impl XmlAttribute {
    /// Qualified name as written.
    pub fn qname(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{}:{}", p, self.local_name),
            None => self.local_name.clone(),
        }
    }
}

/// A child node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

/// An element with its attributes and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    pub prefix: Option<String>,
    pub local_name: String,
    pub namespace: Option<String>,
    /// Declarations written on this element (kept from parsed input)
    pub namespace_decls: Vec<NamespaceDecl>,
    pub attributes: Vec<XmlAttribute>,
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    /// Create a namespace-qualified element.
    pub fn new(prefix: &str, local_name: &str, namespace: &str) -> Self {
        Self {
            prefix: Some(prefix.to_string()),
            local_name: local_name.to_string(),
            namespace: Some(namespace.to_string()),
            namespace_decls: Vec::new(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Create an element in no namespace.
    pub fn unqualified(local_name: &str) -> Self {
        Self {
            prefix: None,
            local_name: local_name.to_string(),
            namespace: None,
            namespace_decls: Vec::new(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Qualified name as written.
    pub fn qname(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{}:{}", p, self.local_name),
            None => self.local_name.clone(),
        }
    }

    /// Whether this element has the given namespace and local name.
    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.local_name == local_name && self.namespace.as_deref() == Some(namespace)
    }

    pub fn with_attr(mut self, local_name: &str, value: impl Into<String>) -> Self {
        self.set_attr(local_name, value);
        self
    }

    pub fn with_ns_attr(
        mut self,
        prefix: &str,
        local_name: &str,
        namespace: &str,
        value: impl Into<String>,
    ) -> Self {
        self.set_ns_attr(prefix, local_name, namespace, value);
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(XmlNode::Text(text.into()));
        self
    }

    pub fn push_child(&mut self, child: XmlElement) {
        self.children.push(XmlNode::Element(child));
    }

    /// Set an unqualified attribute, replacing an existing one.
    pub fn set_attr(&mut self, local_name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(existing) = self
            .attributes
            .iter_mut()
            .find(|a| a.namespace.is_none() && a.local_name == local_name)
        {
            existing.value = value;
            return;
        }
        self.attributes.push(XmlAttribute {
            prefix: None,
            local_name: local_name.to_string(),
            namespace: None,
            value,
        });
    }

    /// Set a namespace-qualified attribute, replacing an existing one.
    pub fn set_ns_attr(
        &mut self,
        prefix: &str,
        local_name: &str,
        namespace: &str,
        value: impl Into<String>,
    ) {
        let value = value.into();
        if let Some(existing) = self
            .attributes
            .iter_mut()
            .find(|a| a.namespace.as_deref() == Some(namespace) && a.local_name == local_name)
        {
            existing.value = value;
            return;
        }
        self.attributes.push(XmlAttribute {
            prefix: Some(prefix.to_string()),
            local_name: local_name.to_string(),
            namespace: Some(namespace.to_string()),
            value,
        });
    }

    /// Value of an unqualified attribute.
    pub fn attr(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.local_name == local_name)
            .map(|a| a.value.as_str())
    }

    /// Value of a namespace-qualified attribute.
    pub fn ns_attr(&self, namespace: &str, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.as_deref() == Some(namespace) && a.local_name == local_name)
            .map(|a| a.value.as_str())
    }

    /// The element's id: `wsu:Id` first, then an unqualified `Id`.
    pub fn id(&self) -> Option<&str> {
        self.ns_attr(crate::standards::WSU_NS, "Id")
            .or_else(|| self.attr("Id"))
    }

    /// Iterate over child elements, skipping text.
    pub fn element_children(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|c| match c {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    /// First child element with the given name.
    pub fn child(&self, namespace: &str, local_name: &str) -> Option<&XmlElement> {
        self.element_children().find(|e| e.is(namespace, local_name))
    }

    /// Text of a required child element.
    pub fn child_text(&self, namespace: &str, local_name: &str) -> Option<String> {
        self.child(namespace, local_name).map(|c| c.text())
    }

    /// Concatenated text of the direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|c| match c {
                XmlNode::Text(t) => Some(t.as_str()),
                XmlNode::Element(_) => None,
            })
            .collect()
    }

    /// Collect every id in this subtree, this element included.
    pub fn collect_ids<'a>(&'a self, out: &mut Vec<&'a str>) {
        if let Some(id) = self.id() {
            out.push(id);
        }
        for child in self.element_children() {
            child.collect_ids(out);
        }
    }

    /// Find a descendant (or self) by id.
    pub fn find_by_id(&self, id: &str) -> Option<&XmlElement> {
        if self.id() == Some(id) {
            return Some(self);
        }
        self.element_children().find_map(|c| c.find_by_id(id))
    }

    /// Serialize this element, adding any namespace declarations it needs.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        let mut scope = Vec::new();
        write_element(self, &mut scope, &mut out);
        out
    }
}

/// Reject DTD-based constructs before handing input to the parser.
pub fn check_xxe_patterns(xml: &str) -> Result<(), XmlError> {
    if xml.contains("<!DOCTYPE") || xml.contains("<!doctype") {
        return Err(XmlError::DoctypeNotAllowed);
    }
    if xml.contains("<!ENTITY") || xml.contains("<!entity") {
        return Err(XmlError::EntityNotAllowed);
    }
    Ok(())
}

/// Default element nesting limit for parsed input.
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// Parse a document and return its root element.
pub fn parse_document(xml: &str) -> Result<XmlElement, XmlError> {
    parse_document_with_depth(xml, DEFAULT_MAX_DEPTH)
}

/// Parse a document whose elements nest at most `max_depth` levels.
pub fn parse_document_with_depth(xml: &str, max_depth: usize) -> Result<XmlElement, XmlError> {
    check_xxe_patterns(xml)?;
    let mut nodes = parse_nodes(xml, max_depth)?;
    let mut roots = nodes.drain(..).filter_map(|n| match n {
        XmlNode::Element(e) => Some(e),
        XmlNode::Text(_) => None,
    });
    let root = roots
        .next()
        .ok_or_else(|| XmlError::Parse("document has no root element".to_string()))?;
    if roots.next().is_some() {
        return Err(XmlError::Parse("document has more than one root element".to_string()));
    }
    Ok(root)
}

/// Parse a content fragment such as decrypted element content.
pub fn parse_fragment(xml: &str) -> Result<Vec<XmlNode>, XmlError> {
    check_xxe_patterns(xml)?;
    let wrapped = format!("<fragment>{}</fragment>", xml);
    let mut nodes = parse_nodes(&wrapped, DEFAULT_MAX_DEPTH + 1)?;
    match nodes.pop() {
        Some(XmlNode::Element(wrapper)) if nodes.is_empty() => Ok(wrapper.children),
        _ => Err(XmlError::Parse("invalid fragment".to_string())),
    }
}

// Iterative, but everything that walks the tree afterwards recurses, so
// depth is bounded here.
fn parse_nodes(xml: &str, max_depth: usize) -> Result<Vec<XmlNode>, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut scopes: Vec<Vec<NamespaceDecl>> = Vec::new();
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut top_level: Vec<XmlNode> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if stack.len() >= max_depth {
                    return Err(XmlError::DepthExceeded(max_depth));
                }
                let (element, decls) = open_element(e, &scopes)?;
                scopes.push(decls);
                stack.push(element);
            }
            Ok(Event::Empty(ref e)) => {
                if stack.len() >= max_depth {
                    return Err(XmlError::DepthExceeded(max_depth));
                }
                let (element, _) = open_element(e, &scopes)?;
                attach(XmlNode::Element(element), &mut stack, &mut top_level);
            }
            Ok(Event::End(_)) => {
                scopes.pop();
                let element = stack
                    .pop()
                    .ok_or_else(|| XmlError::Parse("unbalanced end tag".to_string()))?;
                attach(XmlNode::Element(element), &mut stack, &mut top_level);
            }
            Ok(Event::Text(ref e)) => {
                if !stack.is_empty() {
                    let text = e.unescape().map_err(|e| XmlError::Parse(e.to_string()))?;
                    append_text(&mut stack, &text);
                }
            }
            Ok(Event::CData(e)) => {
                if !stack.is_empty() {
                    let text = String::from_utf8(e.into_inner().into_owned())
                        .map_err(|e| XmlError::Parse(e.to_string()))?;
                    append_text(&mut stack, &text);
                }
            }
            Ok(Event::DocType(_)) => return Err(XmlError::DoctypeNotAllowed),
            Ok(Event::PI(_)) => return Err(XmlError::ProcessingInstructionNotAllowed),
            Ok(Event::Comment(_)) | Ok(Event::Decl(_)) => {}
            Ok(Event::Eof) => break,
            Err(e) => return Err(XmlError::Parse(e.to_string())),
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::Parse("unexpected end of document".to_string()));
    }
    Ok(top_level)
}

fn attach(node: XmlNode, stack: &mut [XmlElement], top_level: &mut Vec<XmlNode>) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => top_level.push(node),
    }
}

fn append_text(stack: &mut [XmlElement], text: &str) {
    if let Some(parent) = stack.last_mut() {
        if let Some(XmlNode::Text(existing)) = parent.children.last_mut() {
            existing.push_str(text);
        } else {
            parent.children.push(XmlNode::Text(text.to_string()));
        }
    }
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

fn resolve(
    prefix: Option<&str>,
    scopes: &[Vec<NamespaceDecl>],
    local: &[NamespaceDecl],
) -> Option<String> {
    if prefix == Some("xml") {
        return Some(XML_NS.to_string());
    }
    let matches = |(p, _): &&NamespaceDecl| p.as_deref() == prefix;
    local
        .iter()
        .rev()
        .find(matches)
        .or_else(|| scopes.iter().rev().find_map(|frame| frame.iter().rev().find(matches)))
        .map(|(_, uri)| uri.clone())
        .filter(|uri| !uri.is_empty())
}

fn open_element(
    e: &BytesStart,
    scopes: &[Vec<NamespaceDecl>],
) -> Result<(XmlElement, Vec<NamespaceDecl>), XmlError> {
    let name = std::str::from_utf8(e.name().as_ref())
        .map_err(|e| XmlError::Parse(e.to_string()))?
        .to_string();

    let mut decls: Vec<NamespaceDecl> = Vec::new();
    let mut raw_attrs: Vec<(String, String)> = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| XmlError::Parse(e.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| XmlError::Parse(e.to_string()))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::Parse(e.to_string()))?
            .into_owned();
        if key == "xmlns" {
            decls.push((None, value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            decls.push((Some(prefix.to_string()), value));
        } else {
            raw_attrs.push((key, value));
        }
    }

    let (prefix, local_name) = split_qname(&name);
    let namespace = resolve(prefix, scopes, &decls);
    if prefix.is_some() && namespace.is_none() {
        return Err(XmlError::UnboundPrefix(prefix.unwrap_or_default().to_string()));
    }

    let mut attributes = Vec::with_capacity(raw_attrs.len());
    for (key, value) in raw_attrs {
        let (attr_prefix, attr_local) = split_qname(&key);
        let attr_ns = match attr_prefix {
            Some(p) => Some(
                resolve(Some(p), scopes, &decls).ok_or_else(|| XmlError::UnboundPrefix(p.to_string()))?,
            ),
            None => None,
        };
        attributes.push(XmlAttribute {
            prefix: attr_prefix.map(str::to_string),
            local_name: attr_local.to_string(),
            namespace: attr_ns,
            value,
        });
    }

    let element = XmlElement {
        prefix: prefix.map(str::to_string),
        local_name: local_name.to_string(),
        namespace,
        namespace_decls: decls.clone(),
        attributes,
        children: Vec::new(),
    };
    Ok((element, decls))
}

/// Escape character data the way exclusive canonicalization does.
pub fn escape_text(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

/// Escape an attribute value the way exclusive canonicalization does.
pub fn escape_attr(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn lookup<'a>(scope: &'a [NamespaceDecl], prefix: Option<&str>) -> Option<&'a str> {
    scope
        .iter()
        .rev()
        .find(|(p, _)| p.as_deref() == prefix)
        .map(|(_, uri)| uri.as_str())
}

fn write_decl(prefix: Option<&str>, uri: &str, out: &mut String) {
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

fn write_element(element: &XmlElement, scope: &mut Vec<NamespaceDecl>, out: &mut String) {
    let mark = scope.len();
    let qname = element.qname();
    out.push('<');
    out.push_str(&qname);

    for (prefix, uri) in &element.namespace_decls {
        write_decl(prefix.as_deref(), uri, out);
        scope.push((prefix.clone(), uri.clone()));
    }

    let mut needed: Vec<(Option<&str>, &str)> = Vec::new();
    match (&element.prefix, &element.namespace) {
        (prefix, Some(ns)) => needed.push((prefix.as_deref(), ns.as_str())),
        (None, None) => needed.push((None, "")),
        (Some(_), None) => {}
    }
    for attr in &element.attributes {
        if let (Some(p), Some(ns)) = (&attr.prefix, &attr.namespace) {
            if p != "xml" {
                needed.push((Some(p.as_str()), ns.as_str()));
            }
        }
    }
    for (prefix, uri) in needed {
        let current = lookup(scope, prefix);
        let missing = match (prefix, uri) {
            (None, "") => current.is_some_and(|c| !c.is_empty()),
            _ => current != Some(uri),
        };
        if missing {
            write_decl(prefix, uri, out);
            scope.push((prefix.map(str::to_string), uri.to_string()));
        }
    }

    for attr in &element.attributes {
        out.push(' ');
        out.push_str(&attr.qname());
        out.push_str("=\"");
        escape_attr(&attr.value, out);
        out.push('"');
    }

    if element.children.is_empty() {
        out.push_str("/>");
    } else {
        out.push('>');
        for child in &element.children {
            match child {
                XmlNode::Element(e) => write_element(e, scope, out),
                XmlNode::Text(t) => escape_text(t, out),
            }
        }
        out.push_str("</");
        out.push_str(&qname);
        out.push('>');
    }
    scope.truncate(mark);
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body xmlns:u="urn:util" u:Id="body-1">
    <m:GetPrice xmlns:m="http://example.org/stock">
      <m:Item>Apples &amp; Pears</m:Item>
      <m:Note><![CDATA[<raw>]]></m:Note>
    </m:GetPrice>
  </soap:Body>
</soap:Envelope>"#;

    #[test]
    fn test_parse_resolves_namespaces() {
        let root = parse_document(SAMPLE).unwrap();
        assert!(root.is("http://schemas.xmlsoap.org/soap/envelope/", "Envelope"));
        let body = root
            .child("http://schemas.xmlsoap.org/soap/envelope/", "Body")
            .unwrap();
        assert_eq!(body.ns_attr("urn:util", "Id"), Some("body-1"));
        let op = body.element_children().next().unwrap();
        assert_eq!(op.namespace.as_deref(), Some("http://example.org/stock"));
        assert_eq!(
            op.child_text("http://example.org/stock", "Item").unwrap(),
            "Apples & Pears"
        );
        assert_eq!(
            op.child_text("http://example.org/stock", "Note").unwrap(),
            "<raw>"
        );
    }

    #[test]
    fn test_serialize_round_trip() {
        let root = parse_document(SAMPLE).unwrap();
        let reparsed = parse_document(&root.to_xml()).unwrap();
        assert_eq!(root.children, reparsed.children);
    }

    #[test]
    fn test_serializer_adds_missing_declarations() {
        let element = XmlElement::new("o", "Security", "urn:sec")
            .with_ns_attr("u", "Id", "urn:util", "sec-1")
            .with_child(XmlElement::new("o", "Child", "urn:sec").with_text("a<b"));
        let xml = element.to_xml();
        assert_eq!(
            xml,
            r#"<o:Security xmlns:o="urn:sec" xmlns:u="urn:util" u:Id="sec-1"><o:Child>a&lt;b</o:Child></o:Security>"#
        );
    }

    #[test]
    fn test_nesting_depth_limit() {
        let nested = |depth: usize| format!("{}{}", "<a>".repeat(depth), "</a>".repeat(depth));
        assert!(parse_document_with_depth(&nested(8), 8).is_ok());
        assert_eq!(
            parse_document_with_depth(&nested(9), 8).unwrap_err(),
            XmlError::DepthExceeded(8)
        );
        assert_eq!(
            parse_document_with_depth("<a><a><a/></a></a>", 2).unwrap_err(),
            XmlError::DepthExceeded(2)
        );

        let deep = nested(140_000);
        assert_eq!(
            parse_document(&deep).unwrap_err(),
            XmlError::DepthExceeded(DEFAULT_MAX_DEPTH)
        );
        assert_eq!(
            parse_fragment(&deep).unwrap_err(),
            XmlError::DepthExceeded(DEFAULT_MAX_DEPTH + 1)
        );
    }

    #[test]
    fn test_unbound_prefix_rejected() {
        let result = parse_document("<a:Root/>");
        assert_eq!(result.unwrap_err(), XmlError::UnboundPrefix("a".to_string()));
    }

    #[test]
    fn test_doctype_rejected() {
        let xxe = r#"<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]><foo>&xxe;</foo>"#;
        assert_eq!(parse_document(xxe).unwrap_err(), XmlError::DoctypeNotAllowed);
    }

    #[test]
    fn test_processing_instruction_rejected() {
        let result = parse_document("<root><?evil data?></root>");
        assert_eq!(result.unwrap_err(), XmlError::ProcessingInstructionNotAllowed);
    }

    #[test]
    fn test_parse_fragment() {
        let nodes = parse_fragment(r#"<m:A xmlns:m="urn:m">1</m:A>text"#).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(matches!(&nodes[1], XmlNode::Text(t) if t == "text"));
    }

    #[test]
    fn test_find_by_id() {
        let root = parse_document(
            r#"<r xmlns:u="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd"><a u:Id="x"/><b Id="y"/></r>"#,
        )
        .unwrap();
        assert_eq!(root.find_by_id("x").unwrap().local_name, "a");
        assert_eq!(root.find_by_id("y").unwrap().local_name, "b");
        let mut ids = Vec::new();
        root.collect_ids(&mut ids);
        assert_eq!(ids, vec!["x", "y"]);
    }
}

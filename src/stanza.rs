//! Stanza node trees and XMPP XML framing.
//!
//! A [`Stanza`] is a small owned tree: element name, attributes, text and
//! child elements. [`StanzaReader`] performs stateful stanza boundary
//! detection on a TCP byte stream, handling the `<stream:stream>` wrapper
//! that is opened once and never closed until the session ends.

use quick_xml::errors::SyntaxError;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::Error;

/// Routing category of a top-level stanza, derived from its element name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
    StreamError,
    Unknown,
}

impl StanzaKind {
    fn from_name(name: &str) -> Self {
        match name {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "iq" => StanzaKind::Iq,
            "stream:error" => StanzaKind::StreamError,
            _ => StanzaKind::Unknown,
        }
    }
}

/// An owned XML element tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Stanza>,
}

impl Stanza {
    pub fn new(name: impl Into<String>) -> Self {
        Stanza {
            name: name.into(),
            attributes: Vec::new(),
            text: String::new(),
            children: Vec::new(),
        }
    }

    /// Builds an `<iq>` stanza of the given type ("get", "set", ...).
    pub fn new_iq(iq_type: &str) -> Self {
        Stanza::new("iq").with_attribute("type", iq_type)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StanzaKind {
        StanzaKind::from_name(&self.name)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets or replaces an attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(key, value);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.set_text(text);
        self
    }

    pub fn children(&self) -> &[Stanza] {
        &self.children
    }

    /// Appends a child element, returning a mutable borrow of it so callers
    /// can keep building in place.
    pub fn add_child(&mut self, child: Stanza) -> &mut Stanza {
        self.children.push(child);
        self.children.last_mut().unwrap()
    }

    pub fn with_child(mut self, child: Stanza) -> Self {
        self.children.push(child);
        self
    }

    /// First direct child with the given element name.
    pub fn child(&self, name: &str) -> Option<&Stanza> {
        self.children.iter().find(|c| c.name == name)
    }

    /// The `id` attribute, used to correlate replies.
    pub fn id(&self) -> Option<&str> {
        self.attribute("id")
    }

    /// Parses a complete standalone XML element into a tree.
    pub fn parse(xml: &str) -> Result<Stanza, Error> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = false;

        let mut stack: Vec<Stanza> = Vec::new();
        loop {
            match reader.read_event()? {
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
                Event::Start(e) => stack.push(Stanza::from_event(&e)),
                Event::Empty(e) => {
                    let node = Stanza::from_event(&e);
                    match stack.last_mut() {
                        Some(parent) => {
                            parent.children.push(node);
                        }
                        None => return Ok(node),
                    }
                }
                Event::Text(t) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&t.unescape()?);
                    }
                }
                Event::CData(c) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&c));
                    }
                }
                Event::End(_) => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| Error::MalformedStanza(xml.to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => {
                            parent.children.push(node);
                        }
                        None => return Ok(node),
                    }
                }
                Event::Eof => return Err(Error::MalformedStanza(xml.to_string())),
            }
        }
    }

    fn from_event(e: &BytesStart<'_>) -> Stanza {
        let mut node = Stanza::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
        for attr in e.attributes().flatten() {
            node.attributes.push((
                String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                String::from_utf8_lossy(&attr.value).into_owned(),
            ));
        }
        node
    }

    /// Serializes the tree, escaping attribute values and text content.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("='");
            out.push_str(&escape(value.as_str()));
            out.push('\'');
        }
        if self.text.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(self.text.as_str()));
        for child in &self.children {
            child.write_xml(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// One item pulled off the incoming byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// The server's `<stream:stream ...>` header. Attributes (notably the
    /// server-assigned `id`) are available on the stanza.
    StreamOpen(Stanza),
    /// The `</stream:stream>` terminator.
    StreamClose,
    /// A complete top-level stanza.
    Stanza(Stanza),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanState {
    /// Between stanzas, or before the stream open.
    Idle,
    /// Inside a top-level stanza, collecting events.
    InStanza,
}

fn is_stream_tag(e: &BytesStart<'_>) -> bool {
    e.name().as_ref() == b"stream:stream" || e.name().local_name().as_ref() == b"stream"
}

/// Incremental stanza reader over a growing byte buffer.
#[derive(Debug, Default)]
pub struct StanzaReader {
    buf: Vec<u8>,
}

impl StanzaReader {
    pub fn new() -> Self {
        StanzaReader::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered and not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Pulls the next complete item off the buffer, or `Ok(None)` when the
    /// buffer holds only a partial stanza and more bytes are needed.
    pub fn next_item(&mut self) -> Result<Option<StreamItem>, Error> {
        match Self::scan(&self.buf)? {
            Some((item, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    fn scan(buffer: &[u8]) -> Result<Option<(StreamItem, usize)>, Error> {
        // The stream terminator appears alone, without a matching opening
        // tag in the buffer, so check for it up front.
        let content_start = buffer
            .iter()
            .position(|&b| b != b' ' && b != b'\t' && b != b'\n' && b != b'\r');
        if let Some(start) = content_start {
            if buffer[start..].starts_with(b"</stream:stream>") {
                let tag_end = start + b"</stream:stream>".len();
                return Ok(Some((StreamItem::StreamClose, tag_end)));
            }
        }

        let mut reader = Reader::from_reader(buffer);
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = false;

        let mut depth: u32 = 0;
        let mut state = ScanState::Idle;
        let mut stanza_start: usize = 0;

        loop {
            let pos = reader.buffer_position() as usize;

            match reader.read_event() {
                Ok(Event::Decl(_))
                | Ok(Event::PI(_))
                | Ok(Event::Comment(_))
                | Ok(Event::DocType(_)) => continue,
                Ok(Event::Start(e)) => {
                    if state == ScanState::Idle && is_stream_tag(&e) {
                        let tag_end = reader.buffer_position() as usize;
                        let header = Stanza::from_event(&e);
                        return Ok(Some((StreamItem::StreamOpen(header), tag_end)));
                    }

                    depth += 1;

                    if state == ScanState::Idle && depth == 1 {
                        state = ScanState::InStanza;
                        stanza_start = pos;
                    }
                }
                Ok(Event::Empty(e)) => {
                    if state == ScanState::Idle && is_stream_tag(&e) {
                        let tag_end = reader.buffer_position() as usize;
                        let header = Stanza::from_event(&e);
                        return Ok(Some((StreamItem::StreamOpen(header), tag_end)));
                    }

                    // Self-closing top-level stanza such as <presence/>
                    if state == ScanState::Idle && depth == 0 {
                        let tag_end = reader.buffer_position() as usize;
                        let stanza = Self::parse_slice(&buffer[pos..tag_end])?;
                        return Ok(Some((StreamItem::Stanza(stanza), tag_end)));
                    }
                }
                Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
                Ok(Event::End(e)) => {
                    if depth == 0
                        && (e.name().as_ref() == b"stream:stream"
                            || e.name().local_name().as_ref() == b"stream")
                    {
                        let tag_end = reader.buffer_position() as usize;
                        return Ok(Some((StreamItem::StreamClose, tag_end)));
                    }

                    depth = depth.saturating_sub(1);

                    if state == ScanState::InStanza && depth == 0 {
                        let tag_end = reader.buffer_position() as usize;
                        let stanza = Self::parse_slice(&buffer[stanza_start..tag_end])?;
                        return Ok(Some((StreamItem::Stanza(stanza), tag_end)));
                    }
                }
                Ok(Event::Eof) => return Ok(None),
                Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => {
                    // Expected during TCP streaming: the buffer ends inside a
                    // tag that the next read will complete.
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn parse_slice(bytes: &[u8]) -> Result<Stanza, Error> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::MalformedStanza(String::from_utf8_lossy(bytes).into_owned()))?;
        Stanza::parse(text)
    }
}

//! Incremental XML parsing for XMPP streams using minidom.
//!
//! XMPP uses a single long-lived XML document per stream, so the parser
//! frames top-level elements out of an accumulating byte buffer and hands
//! each complete stanza to minidom. Stream restarts (after STARTTLS and
//! SASL) are modelled by [`XmlParser::reset`].

use minidom::Element;

use crate::XmppError;

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
}

/// Upper bound on buffered, not yet framed input.
pub const MAX_STANZA_SIZE: usize = 1024 * 1024;

/// Parsed stream header information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source address)
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by server)
    pub id: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Parse a stream header from raw XML data.
    ///
    /// Stream headers are never closed until the session ends, so the
    /// attributes are read straight from the opening tag.
    pub fn parse(data: &str) -> Result<Self, XmppError> {
        let stream_start = find_stream_start(data)
            .ok_or_else(|| XmppError::xml_parse("No stream:stream element found"))?;

        let stream_end = find_tag_end(data.as_bytes(), stream_start + 1)
            .ok_or_else(|| XmppError::xml_parse("Incomplete stream header"))?;

        let attributes = tag_attributes(&data[stream_start..=stream_end]);
        let attribute = |name: &str| {
            attributes
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| unescape(value))
        };

        Ok(StreamHeader {
            to: attribute("to"),
            from: attribute("from"),
            id: attribute("id"),
            version: attribute("version"),
            lang: attribute("xml:lang"),
        })
    }
}

/// Offset of the `<stream:stream` (or unprefixed `<stream`) open tag.
fn find_stream_start(data: &str) -> Option<usize> {
    ["<stream:stream", "<stream"].iter().find_map(|open| {
        data.match_indices(open).map(|(at, _)| at).find(|&at| {
            data[at + open.len()..]
                .chars()
                .next()
                .is_some_and(|c| c.is_whitespace() || c == '>' || c == '/')
        })
    })
}

/// Split an open tag into raw `(name, value)` attribute pairs.
///
/// Whitespace around `=` is allowed. Scanning stops at the first token that
/// is not a well-formed attribute.
fn tag_attributes(tag: &str) -> Vec<(&str, &str)> {
    let body = tag.trim_start_matches('<').trim_end_matches('>').trim_end_matches('/');
    let Some(name_end) = body.find(char::is_whitespace) else {
        return Vec::new();
    };

    let mut attributes = Vec::new();
    let mut rest = &body[name_end..];
    loop {
        rest = rest.trim_start();
        let Some(eq) = rest.find('=') else {
            break;
        };
        let name = rest[..eq].trim_end();
        if name.is_empty() || name.contains(char::is_whitespace) {
            break;
        }

        let after_eq = rest[eq + 1..].trim_start();
        let Some(quote) = after_eq.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            break;
        };
        let Some(value_len) = after_eq[1..].find(quote) else {
            break;
        };

        attributes.push((name, &after_eq[1..1 + value_len]));
        rest = &after_eq[value_len + 2..];
    }
    attributes
}

/// An event produced by the incremental parser.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The peer opened (or restarted) the stream
    Opened(StreamHeader),
    /// A complete top-level stanza
    Stanza(Element),
    /// The peer closed the stream
    Closed,
}

/// Incremental XML parser for XMPP streams.
///
/// Accumulates raw bytes and yields [`StreamEvent`]s as soon as enough data
/// is buffered to frame them.
#[derive(Debug)]
pub struct XmlParser {
    /// Accumulated data buffer
    buffer: Vec<u8>,
    /// Whether we've seen the stream header
    stream_started: bool,
}

impl XmlParser {
    /// Create a new XML parser.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            stream_started: false,
        }
    }

    /// Feed data into the parser.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Whether a stream header has been seen since the last reset.
    pub fn stream_started(&self) -> bool {
        self.stream_started
    }

    /// Number of buffered bytes not yet turned into events.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discard all parser state, as required on a stream restart.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stream_started = false;
    }

    /// Take the next complete event out of the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>, XmppError> {
        loop {
            let Some(start) = self.buffer.iter().position(|b| !b.is_ascii_whitespace()) else {
                self.buffer.clear();
                return Ok(None);
            };
            if start > 0 {
                self.buffer.drain(..start);
            }

            if self.buffer[0] != b'<' {
                return Err(XmppError::xml_parse(
                    "Unexpected character data outside of a stanza",
                ));
            }
            if self.buffer.len() < 2 {
                return self.incomplete();
            }

            match self.buffer[1] {
                // XML declaration, possibly repeated by a client reopening the stream
                b'?' => {
                    match find_subslice(&self.buffer, b"?>", 2) {
                        Some(end) => {
                            self.buffer.drain(..end + 2);
                        }
                        None => return self.incomplete(),
                    }
                }
                b'!' => {
                    if self.buffer.len() < 4 {
                        return self.incomplete();
                    }
                    if !self.buffer.starts_with(b"<!--") {
                        return Err(XmppError::xml_parse("Restricted XML construct in stream"));
                    }
                    match find_subslice(&self.buffer, b"-->", 4) {
                        Some(end) => {
                            self.buffer.drain(..end + 3);
                        }
                        None => return self.incomplete(),
                    }
                }
                b'/' => {
                    let Some(tag_end) = find_tag_end(&self.buffer, 2) else {
                        return self.incomplete();
                    };
                    if !is_stream_tag(tag_name(&self.buffer[2..tag_end])) {
                        return Err(XmppError::xml_parse("Unexpected closing tag"));
                    }
                    self.buffer.drain(..=tag_end);
                    self.stream_started = false;
                    return Ok(Some(StreamEvent::Closed));
                }
                _ => {
                    let Some(tag_end) = find_tag_end(&self.buffer, 1) else {
                        return self.incomplete();
                    };

                    if is_stream_tag(tag_name(&self.buffer[1..tag_end])) {
                        let tag = std::str::from_utf8(&self.buffer[..=tag_end]).map_err(|e| {
                            XmppError::xml_parse(format!("Invalid UTF-8 in stream header: {}", e))
                        })?;
                        let header = StreamHeader::parse(tag)?;
                        self.buffer.drain(..=tag_end);
                        self.stream_started = true;
                        return Ok(Some(StreamEvent::Opened(header)));
                    }

                    if !self.stream_started {
                        return Err(XmppError::xml_parse("Expected stream header"));
                    }

                    let Some(end) = find_element_end(&self.buffer)? else {
                        return self.incomplete();
                    };
                    let data = std::str::from_utf8(&self.buffer[..end])
                        .map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))?;
                    let element = parse_stanza(data)?;
                    self.buffer.drain(..end);
                    return Ok(Some(StreamEvent::Stanza(element)));
                }
            }
        }
    }

    fn incomplete(&self) -> Result<Option<StreamEvent>, XmppError> {
        if self.buffer.len() > MAX_STANZA_SIZE {
            return Err(XmppError::xml_parse(format!(
                "Stanza exceeds maximum size of {} bytes",
                MAX_STANZA_SIZE
            )));
        }
        Ok(None)
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

fn tag_name(tag: &[u8]) -> &[u8] {
    let end = tag
        .iter()
        .position(|&b| b.is_ascii_whitespace() || b == b'/' || b == b'>')
        .unwrap_or(tag.len());
    &tag[..end]
}

fn is_stream_tag(name: &[u8]) -> bool {
    name == b"stream:stream" || name == b"stream"
}

/// Find the `>` closing the tag that starts before `from`, skipping quoted
/// attribute values.
fn find_tag_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (offset, &b) in buf.get(from..)?.iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(from + offset),
            None => {}
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Find the end (exclusive) of the element starting at offset 0.
fn find_element_end(buf: &[u8]) -> Result<Option<usize>, XmppError> {
    let mut depth = 0usize;
    let mut pos = 0usize;

    loop {
        let Some(lt) = find_subslice(buf, b"<", pos) else {
            return Ok(None);
        };
        let rest = &buf[lt..];

        if rest.starts_with(b"<!--") {
            match find_subslice(buf, b"-->", lt + 4) {
                Some(end) => {
                    pos = end + 3;
                    continue;
                }
                None => return Ok(None),
            }
        }
        if rest.starts_with(b"<![CDATA[") {
            match find_subslice(buf, b"]]>", lt + 9) {
                Some(end) => {
                    pos = end + 3;
                    continue;
                }
                None => return Ok(None),
            }
        }
        if rest.len() < 2 {
            return Ok(None);
        }
        if rest[1] == b'!' || rest[1] == b'?' {
            if b"<![CDATA[".starts_with(rest) || b"<!--".starts_with(rest) {
                return Ok(None);
            }
            return Err(XmppError::xml_parse("Restricted XML construct in stanza"));
        }

        let Some(gt) = find_tag_end(buf, lt + 1) else {
            return Ok(None);
        };

        if rest[1] == b'/' {
            depth = depth
                .checked_sub(1)
                .ok_or_else(|| XmppError::xml_parse("Unbalanced closing tag"))?;
        } else if buf[gt - 1] != b'/' {
            depth += 1;
        }

        pos = gt + 1;
        if depth == 0 {
            return Ok(Some(pos));
        }
    }
}

/// Parse one framed stanza.
///
/// The stanza is wrapped in a stream root so that it inherits the
/// `jabber:client` default namespace and the `stream` prefix the way it
/// would inside the real stream.
fn parse_stanza(data: &str) -> Result<Element, XmppError> {
    let wrapped = format!(
        "<stream:stream xmlns='{}' xmlns:stream='{}'>{}</stream:stream>",
        ns::JABBER_CLIENT,
        ns::STREAM,
        data
    );
    let root = wrapped
        .parse::<Element>()
        .map_err(|e| XmppError::xml_parse(format!("Failed to parse element: {}", e)))?;

    root.children()
        .next()
        .cloned()
        .ok_or_else(|| XmppError::xml_parse("Empty stanza"))
}

/// Convert a minidom Element back to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::xml_parse(format!("Failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))
}

/// Escape text for use in XML character data or attribute values.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

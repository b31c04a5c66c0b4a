//! Incremental reader for the small XML subset coqtop speaks.
//!
//! Bytes arrive in arbitrary chunks, so the reader buffers input until a
//! whole top-level element is available. Only elements, attributes, text,
//! character/entity references, comments and processing instructions are
//! understood; there is no DTD or namespace support.

/// An XML node: either a nested element or a run of (unescaped) text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// A parsed XML element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    /// Value of the attribute `key`, if present.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Child elements, skipping text nodes.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// Text of this element and all its descendants, concatenated.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                Node::Text(t) => out.push_str(t),
                Node::Element(e) => e.collect_text(out),
            }
        }
    }
}

/// Deepest element nesting accepted before the input is rejected.
const MAX_DEPTH: usize = 128;

enum ParseError {
    /// Input ends before the element does; wait for more data.
    Incomplete,
    Malformed(String),
    /// Nesting exceeds [`MAX_DEPTH`]; there is no sane resync point inside.
    TooDeep,
}

type ParseResult<T> = Result<T, ParseError>;

/// Buffers text and yields complete top-level elements.
#[derive(Debug, Default)]
pub struct XmlReader {
    buf: String,
}

impl XmlReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of text to the buffer.
    pub fn push(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
    }

    /// Whether unconsumed (non-whitespace) input is buffered.
    pub fn has_pending(&self) -> bool {
        !self.buf.trim().is_empty()
    }

    /// Next complete top-level element.
    ///
    /// Returns `None` when more input is needed, `Some(Err(_))` when the
    /// buffered input is malformed. Malformed input is skipped up to the next
    /// `<` so later elements can still be read.
    pub fn next_element(&mut self) -> Option<Result<Element, String>> {
        let mut cursor = Cursor::new(&self.buf);
        match cursor.skip_prolog() {
            Ok(()) => {}
            Err(ParseError::Incomplete) => {
                let upto = cursor.pos;
                self.discard(upto);
                return None;
            }
            Err(ParseError::Malformed(msg)) => {
                let at = cursor.pos;
                return Some(Err(self.recover(at, msg)));
            }
            Err(ParseError::TooDeep) => return Some(Err(self.reject_all())),
        }
        if cursor.at_end() {
            self.buf.clear();
            return None;
        }
        let start = cursor.pos;
        match cursor.element(0) {
            Ok(element) => {
                let upto = cursor.pos;
                self.discard(upto);
                Some(Ok(element))
            }
            Err(ParseError::Incomplete) => {
                self.discard(start);
                None
            }
            Err(ParseError::Malformed(msg)) => Some(Err(self.recover(start, msg))),
            Err(ParseError::TooDeep) => Some(Err(self.reject_all())),
        }
    }

    /// Drop everything buffered.
    fn reject_all(&mut self) -> String {
        let dropped: String = self.buf.chars().take(80).collect();
        self.buf.clear();
        format!("elements nested deeper than {MAX_DEPTH} (near {dropped:?})")
    }

    fn discard(&mut self, upto: usize) {
        self.buf.drain(..upto);
    }

    fn recover(&mut self, start: usize, msg: String) -> String {
        let skip = self.buf[start + 1..]
            .find('<')
            .map(|i| start + 1 + i)
            .unwrap_or(self.buf.len());
        let dropped: String = self.buf[..skip].chars().take(80).collect();
        self.discard(skip);
        format!("{msg} (near {dropped:?})")
    }
}

struct Cursor<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Self { s, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.s[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.s.len()
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    /// Advance past `marker`, failing with `Incomplete` if it never appears.
    fn skip_past(&mut self, marker: &str) -> ParseResult<()> {
        match self.rest().find(marker) {
            Some(i) => {
                self.pos += i + marker.len();
                Ok(())
            }
            None => Err(ParseError::Incomplete),
        }
    }

    /// Skip whitespace, stray text, declarations and comments before an element.
    fn skip_prolog(&mut self) -> ParseResult<()> {
        loop {
            match self.rest().find('<') {
                Some(i) => self.pos += i,
                None => {
                    self.pos = self.s.len();
                    return Ok(());
                }
            }
            let rest = self.rest();
            if rest.starts_with("<?") {
                self.skip_past("?>")?;
            } else if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if rest.len() < 4 && "<!--".starts_with(rest) {
                return Err(ParseError::Incomplete);
            } else if rest.starts_with("</") {
                return Err(ParseError::Malformed("unexpected closing tag".into()));
            } else {
                return Ok(());
            }
        }
    }

    fn name(&mut self) -> ParseResult<String> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '/' || c == '>' || c == '=')
            .ok_or(ParseError::Incomplete)?;
        if end == 0 {
            return Err(ParseError::Malformed("empty name".into()));
        }
        self.pos += end;
        Ok(rest[..end].to_string())
    }

    fn element(&mut self, depth: usize) -> ParseResult<Element> {
        debug_assert!(self.rest().starts_with('<'));
        if depth >= MAX_DEPTH {
            return Err(ParseError::TooDeep);
        }
        self.pos += 1;
        let name = self.name()?;
        let mut element = Element {
            name,
            ..Element::default()
        };

        loop {
            self.skip_ws();
            let rest = self.rest();
            if rest.is_empty() {
                return Err(ParseError::Incomplete);
            }
            if rest.starts_with("/>") {
                self.pos += 2;
                return Ok(element);
            }
            if rest == "/" {
                return Err(ParseError::Incomplete);
            }
            if rest.starts_with('>') {
                self.pos += 1;
                break;
            }
            element.attrs.push(self.attribute()?);
        }

        loop {
            let rest = self.rest();
            if rest.is_empty() {
                return Err(ParseError::Incomplete);
            }
            if rest.starts_with("</") {
                self.pos += 2;
                let close = self.name()?;
                self.skip_ws();
                if !self.rest().starts_with('>') {
                    return if self.at_end() {
                        Err(ParseError::Incomplete)
                    } else {
                        Err(ParseError::Malformed(format!("bad closing tag </{close}")))
                    };
                }
                self.pos += 1;
                if close != element.name {
                    return Err(ParseError::Malformed(format!(
                        "expected </{}>, found </{close}>",
                        element.name
                    )));
                }
                return Ok(element);
            }
            if rest.starts_with("<!--") {
                self.skip_past("-->")?;
                continue;
            }
            if rest.starts_with('<') {
                if rest.len() < 4 && "<!--".starts_with(rest) {
                    return Err(ParseError::Incomplete);
                }
                let child = self.element(depth + 1)?;
                element.children.push(Node::Element(child));
                continue;
            }
            let end = rest.find('<').ok_or(ParseError::Incomplete)?;
            element
                .children
                .push(Node::Text(unescape_xml(&rest[..end])));
            self.pos += end;
        }
    }

    fn attribute(&mut self) -> ParseResult<(String, String)> {
        let key = self.name()?;
        self.skip_ws();
        if self.at_end() {
            return Err(ParseError::Incomplete);
        }
        if !self.rest().starts_with('=') {
            return Err(ParseError::Malformed(format!("attribute {key} has no value")));
        }
        self.pos += 1;
        self.skip_ws();
        let quote = self.rest().chars().next().ok_or(ParseError::Incomplete)?;
        if quote != '"' && quote != '\'' {
            return Err(ParseError::Malformed(format!("attribute {key} is not quoted")));
        }
        self.pos += 1;
        let rest = self.rest();
        let end = rest.find(quote).ok_or(ParseError::Incomplete)?;
        self.pos += end + 1;
        Ok((key, unescape_xml(&rest[..end])))
    }
}

/// Resolve entity and character references.
///
/// Unknown references are kept verbatim. `&nbsp;`, which coqtop uses in
/// pretty-printed output, becomes a plain space.
pub fn unescape_xml(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..semi];
        let resolved = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match resolved {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

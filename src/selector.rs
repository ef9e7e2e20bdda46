//! The selector engine.
//!
//! Selectors are the query language drivers use to address elements of the
//! indexed tree. A selector is a sequence of segments joined by whitespace
//! (descendant) or `>` (direct child); each segment constrains the widget
//! type and/or attributes:
//!
//! ```text
//! Button[text="Save"]            type-qualified attribute list
//! text=Save & label=Primary      bare attribute list
//! #submit_btn                    key shorthand
//! Column > Text[text=~/^Item/]   combinators and regex values
//! ```
//!
//! Parsing reports failures with a character offset; evaluation never
//! fails, it returns zero or more matches in traversal order.

use std::fmt;

use regex::Regex;

use crate::error::AgentError;
use crate::indexer::IndexedElement;

/// Attribute names with dedicated matching semantics. Anything else is
/// looked up in the element's custom metadata map.
const KNOWN_ATTRIBUTES: &[&str] = &[
    "id", "key", "text", "label", "value", "hint", "role", "type", "tooltip",
];

/// How a segment relates to the one after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combinator {
    /// The next segment matches somewhere in this segment's subtree.
    Descendant,
    /// The next segment matches a direct child.
    Child,
    /// No next segment.
    #[default]
    Terminal,
}

/// A regex-valued attribute constraint, keeping the source pattern for
/// rendering.
#[derive(Debug, Clone)]
pub struct RegexAttr {
    pub name: String,
    pub pattern: String,
    pub regex: Regex,
}

/// One segment of a selector.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub type_name: Option<String>,
    /// Literal attribute constraints, in source order.
    pub literals: Vec<(String, String)>,
    /// Regex attribute constraints, in source order.
    pub regexes: Vec<RegexAttr>,
    /// Link to the next segment.
    pub combinator: Combinator,
}

/// A parsed selector: a non-empty list of segments.
#[derive(Debug, Clone)]
pub struct Selector {
    pub segments: Vec<Segment>,
}

// ============================================================================
// Parsing
// ============================================================================

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> AgentError {
        AgentError::SelectorParse {
            offset,
            message: message.into(),
        }
    }

    fn is_ident_start(c: char) -> bool {
        c.is_alphabetic() || c == '_'
    }

    fn is_ident_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_'
    }

    fn parse_ident(&mut self) -> Result<String, AgentError> {
        match self.peek() {
            Some(c) if Self::is_ident_start(c) => {}
            _ => return Err(self.error(self.pos, "expected identifier")),
        }
        let start = self.pos;
        while matches!(self.peek(), Some(c) if Self::is_ident_char(c)) {
            self.pos += 1;
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    /// A quoted value with backslash escaping. `quote` has been peeked.
    fn parse_quoted(&mut self) -> Result<String, AgentError> {
        let open_at = self.pos;
        let quote = self.bump().unwrap();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(open_at, "unterminated string")),
                Some('\\') => match self.bump() {
                    None => return Err(self.error(open_at, "unterminated string")),
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
            }
        }
    }

    /// A `~/pattern/` regex value, compiled eagerly. `~` has been peeked.
    fn parse_regex(&mut self) -> Result<(String, Regex), AgentError> {
        let tilde_at = self.pos;
        self.bump(); // ~
        if self.bump() != Some('/') {
            return Err(self.error(tilde_at, "expected `/` after `~`"));
        }
        let mut pattern = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(tilde_at, "unterminated regex")),
                Some('\\') => match self.bump() {
                    None => return Err(self.error(tilde_at, "unterminated regex")),
                    // `\/` ends up as a literal slash; everything else keeps
                    // its backslash for the regex engine.
                    Some('/') => pattern.push('/'),
                    Some(c) => {
                        pattern.push('\\');
                        pattern.push(c);
                    }
                },
                Some('/') => break,
                Some(c) => pattern.push(c),
            }
        }
        let regex = Regex::new(&pattern)
            .map_err(|e| self.error(tilde_at, format!("invalid regex: {e}")))?;
        Ok((pattern, regex))
    }

    /// An unquoted value: runs to the next separator.
    fn parse_unquoted(&mut self, in_brackets: bool) -> Result<String, AgentError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            let stop = c.is_whitespace()
                || c == '>'
                || c == '&'
                || (in_brackets && c == ']');
            if stop {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error(start, "expected attribute value"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    /// `name=value`, pushed onto the segment.
    fn parse_attr(&mut self, segment: &mut Segment, in_brackets: bool) -> Result<(), AgentError> {
        let name = self.parse_ident()?;
        if self.peek() != Some('=') {
            return Err(self.error(self.pos, "expected `=` after attribute name"));
        }
        self.bump();
        match self.peek() {
            Some('"') | Some('\'') => {
                let value = self.parse_quoted()?;
                segment.literals.push((name, value));
            }
            Some('~') => {
                let (pattern, regex) = self.parse_regex()?;
                segment.regexes.push(RegexAttr { name, pattern, regex });
            }
            _ => {
                let value = self.parse_unquoted(in_brackets)?;
                segment.literals.push((name, value));
            }
        }
        Ok(())
    }

    /// `[attr=value attr2=value2 …]`; the `[` has been peeked.
    fn parse_bracket_list(&mut self, segment: &mut Segment) -> Result<(), AgentError> {
        let open_at = self.pos;
        self.bump(); // [
        self.skip_ws();
        while self.peek() != Some(']') {
            if self.peek().is_none() {
                return Err(self.error(open_at, "unterminated attribute list"));
            }
            self.parse_attr(segment, true)?;
            self.skip_ws();
        }
        self.bump(); // ]
        Ok(())
    }

    /// One full segment. The cursor sits on its first character.
    fn parse_segment(&mut self) -> Result<Segment, AgentError> {
        let mut segment = Segment::default();
        match self.peek() {
            // #key_value shorthand
            Some('#') => {
                self.bump();
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c.is_whitespace() || c == '>' {
                        break;
                    }
                    self.pos += 1;
                }
                if self.pos == start {
                    return Err(self.error(start, "expected key after `#`"));
                }
                let key: String = self.chars[start..self.pos].iter().collect();
                segment.literals.push(("key".into(), key));
                return Ok(segment);
            }
            Some(c) if Self::is_ident_start(c) => {}
            Some(_) => return Err(self.error(self.pos, "expected segment")),
            None => return Err(self.error(self.pos, "expected segment")),
        }

        let ident_at = self.pos;
        let ident = self.parse_ident()?;
        if self.peek() == Some('=') {
            // Bare attribute list: rewind and parse `attr=value & …`.
            self.pos = ident_at;
            self.parse_attr(&mut segment, false)?;
            loop {
                let rewind = self.pos;
                self.skip_ws();
                if self.peek() == Some('&') {
                    self.bump();
                    self.skip_ws();
                    self.parse_attr(&mut segment, false)?;
                } else {
                    // Whitespace belonged to a combinator, not this segment.
                    self.pos = rewind;
                    break;
                }
            }
        } else {
            segment.type_name = Some(ident);
            if self.peek() == Some('[') {
                self.parse_bracket_list(&mut segment)?;
            }
        }
        Ok(segment)
    }

    fn parse_selector(&mut self) -> Result<Selector, AgentError> {
        self.skip_ws();
        if self.peek().is_none() {
            return Err(self.error(0, "empty selector"));
        }

        let mut segments = vec![self.parse_segment()?];
        loop {
            let had_ws = self.skip_ws();
            match self.peek() {
                None => break,
                Some('>') => {
                    self.bump();
                    self.skip_ws();
                    segments.last_mut().unwrap().combinator = Combinator::Child;
                    segments.push(self.parse_segment()?);
                }
                Some(_) if had_ws => {
                    segments.last_mut().unwrap().combinator = Combinator::Descendant;
                    segments.push(self.parse_segment()?);
                }
                Some(_) => {
                    return Err(self.error(self.pos, "expected combinator between segments"));
                }
            }
        }
        Ok(Selector { segments })
    }
}

impl Selector {
    /// Parse a selector string.
    pub fn parse(input: &str) -> Result<Selector, AgentError> {
        Parser::new(input).parse_selector()
    }
}

// ============================================================================
// Matching
// ============================================================================

/// The role string derived from a node's flags, for `role=` matching.
fn role_of(elem: &IndexedElement) -> Option<&'static str> {
    if elem.flags.is_button {
        Some("button")
    } else if elem.flags.is_text_field {
        Some("textField")
    } else {
        None
    }
}

fn field_of<'a>(elem: &'a IndexedElement, name: &str) -> Option<&'a str> {
    match name {
        "id" => Some(elem.fap_id.as_str()),
        "key" => elem.key.as_deref(),
        "label" => elem.label.as_deref(),
        "value" => elem.value.as_deref(),
        "hint" => elem.hint.as_deref(),
        "tooltip" => elem.tooltip.as_deref(),
        "type" => elem.type_name.as_deref(),
        _ => None,
    }
}

fn literal_matches(elem: &IndexedElement, name: &str, value: &str) -> bool {
    match name {
        // `text` matches any text-bearing field.
        "text" => [&elem.label, &elem.value, &elem.hint]
            .into_iter()
            .any(|f| f.as_deref() == Some(value)),
        "role" => role_of(elem) == Some(value),
        _ if KNOWN_ATTRIBUTES.contains(&name) => field_of(elem, name) == Some(value),
        // Unrecognized attributes are looked up in the metadata map.
        _ => elem.metadata.get(name).map(String::as_str) == Some(value),
    }
}

fn regex_matches(elem: &IndexedElement, attr: &RegexAttr) -> bool {
    match attr.name.as_str() {
        "text" => [&elem.label, &elem.value, &elem.hint]
            .into_iter()
            .any(|f| f.as_deref().is_some_and(|v| attr.regex.is_match(v))),
        "role" => role_of(elem).is_some_and(|r| attr.regex.is_match(r)),
        name if KNOWN_ATTRIBUTES.contains(&name) => {
            field_of(elem, name).is_some_and(|v| attr.regex.is_match(v))
        }
        name => elem
            .metadata
            .get(name)
            .is_some_and(|v| attr.regex.is_match(v)),
    }
}

impl Segment {
    /// Does this segment match the element, ignoring combinators?
    pub fn matches(&self, elem: &IndexedElement) -> bool {
        if let Some(type_name) = &self.type_name {
            if elem.type_name.as_deref() != Some(type_name.as_str()) {
                return false;
            }
        }
        self.literals
            .iter()
            .all(|(name, value)| literal_matches(elem, name, value))
            && self.regexes.iter().all(|attr| regex_matches(elem, attr))
    }
}

impl Selector {
    /// Does the full selector, combinators included, match `elements[index]`?
    ///
    /// The target must match the last segment; preceding segments are
    /// matched ancestor-ward. All candidates lie on a single ancestor
    /// chain, so taking the nearest matching ancestor at each step is
    /// exhaustive.
    pub fn matches(&self, elements: &[IndexedElement], index: usize) -> bool {
        let last = self.segments.len() - 1;
        if !self.segments[last].matches(&elements[index]) {
            return false;
        }
        let mut cursor = index;
        for seg_idx in (0..last).rev() {
            let segment = &self.segments[seg_idx];
            match segment.combinator {
                Combinator::Child => {
                    match elements[cursor].parent {
                        Some(p) if segment.matches(&elements[p]) => cursor = p,
                        _ => return false,
                    }
                }
                Combinator::Descendant | Combinator::Terminal => {
                    let mut ancestor = elements[cursor].parent;
                    loop {
                        match ancestor {
                            None => return false,
                            Some(p) if segment.matches(&elements[p]) => {
                                cursor = p;
                                break;
                            }
                            Some(p) => ancestor = elements[p].parent,
                        }
                    }
                }
            }
        }
        true
    }

    /// All matching element indices, in traversal order.
    pub fn evaluate(&self, elements: &[IndexedElement]) -> Vec<usize> {
        (0..elements.len())
            .filter(|&i| self.matches(elements, i))
            .collect()
    }
}

// ============================================================================
// Canonical rendering
// ============================================================================

fn value_needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value.chars().any(|c| {
            c.is_whitespace()
                || matches!(c, '"' | '\'' | '>' | '&' | '[' | ']' | '=' | '~' | '#')
        })
}

fn render_value(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    if value_needs_quoting(value) {
        write!(f, "\"")?;
        for c in value.chars() {
            match c {
                '"' | '\\' => write!(f, "\\{c}")?,
                '\n' => write!(f, "\\n")?,
                '\t' => write!(f, "\\t")?,
                _ => write!(f, "{c}")?,
            }
        }
        write!(f, "\"")
    } else {
        write!(f, "{value}")
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key-only segments keep the shorthand.
        if self.type_name.is_none()
            && self.regexes.is_empty()
            && self.literals.len() == 1
            && self.literals[0].0 == "key"
            && !value_needs_quoting(&self.literals[0].1)
        {
            return write!(f, "#{}", self.literals[0].1);
        }

        let attr_count = self.literals.len() + self.regexes.len();
        if let Some(type_name) = &self.type_name {
            write!(f, "{type_name}")?;
            if attr_count == 0 {
                return Ok(());
            }
            write!(f, "[")?;
            let mut first = true;
            for (name, value) in &self.literals {
                if !first {
                    write!(f, " ")?;
                }
                first = false;
                write!(f, "{name}=")?;
                render_value(f, value)?;
            }
            for attr in &self.regexes {
                if !first {
                    write!(f, " ")?;
                }
                first = false;
                write!(f, "{}=~/{}/", attr.name, attr.pattern.replace('/', "\\/"))?;
            }
            write!(f, "]")
        } else {
            let mut first = true;
            for (name, value) in &self.literals {
                if !first {
                    write!(f, " & ")?;
                }
                first = false;
                write!(f, "{name}=")?;
                render_value(f, value)?;
            }
            for attr in &self.regexes {
                if !first {
                    write!(f, " & ")?;
                }
                first = false;
                write!(f, "{}=~/{}/", attr.name, attr.pattern.replace('/', "\\/"))?;
            }
            Ok(())
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                match self.segments[i - 1].combinator {
                    Combinator::Child => write!(f, " > ")?,
                    _ => write!(f, " ")?,
                }
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

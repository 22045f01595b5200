//! Packing instruction codec.
//!
//! Every iRODS message body is a packing instruction: a named tree whose leaves are string or
//! integer values. On the wire (XML protocol) a leaf is `<name>value</name>` and a nested
//! instruction is `<name>` followed by its children and `</name>`, one tag per line. Text values
//! escape `&`, `<`, `>`, `"` and `'`.
//!
//! A container without children is written as `<name></name>`, which reads back as an empty leaf.
//! Both have no [`Tag::children`], so readers that expect a container see the same thing.
//!
//! ```
//! use remote::protocol::Tag;
//!
//! let tag = Tag::new("INT_PI").with_leaf("myInt", 3);
//! assert_eq!(tag.to_wire(), "<INT_PI>\n<myInt>3</myInt>\n</INT_PI>\n");
//! assert_eq!(Tag::parse(&tag.to_wire()).unwrap(), tag);
//! ```

pub mod api;
pub mod messages;

use common::error::{Error, Result};

const MAX_DEPTH: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Children(Vec<Tag>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    name: String,
    value: Value,
}

impl Tag {
    /// Container tag without children.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Value::Children(Vec::new()),
        }
    }

    pub fn leaf(name: impl Into<String>, value: impl ToString) -> Self {
        Self {
            name: name.into(),
            value: Value::Text(value.to_string()),
        }
    }

    pub fn with(mut self, child: Tag) -> Self {
        self.push(child);
        self
    }

    pub fn with_leaf(self, name: impl Into<String>, value: impl ToString) -> Self {
        self.with(Tag::leaf(name, value))
    }

    /// Appends a child, turning a leaf into a container.
    pub fn push(&mut self, child: Tag) {
        match &mut self.value {
            Value::Children(children) => children.push(child),
            Value::Text(_) => self.value = Value::Children(vec![child]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Text of a leaf; `None` for containers.
    pub fn text(&self) -> Option<&str> {
        match &self.value {
            Value::Text(text) => Some(text),
            Value::Children(_) => None,
        }
    }

    pub fn children(&self) -> &[Tag] {
        match &self.value {
            Value::Children(children) => children,
            Value::Text(_) => &[],
        }
    }

    pub fn child(&self, name: &str) -> Option<&Tag> {
        self.children().iter().find(|child| child.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.children().iter().filter(move |child| child.name == name)
    }

    pub fn required(&self, name: &str) -> Result<&Tag> {
        self.child(name).ok_or_else(|| {
            Error::protocol(format!("{} is missing required field {name}", self.name))
        })
    }

    pub fn str_field(&self, name: &str) -> Result<&str> {
        let child = self.required(name)?;
        child.text().ok_or_else(|| {
            Error::protocol(format!("{}.{name} is not a value field", self.name))
        })
    }

    pub fn int_field(&self, name: &str) -> Result<i32> {
        let text = self.str_field(name)?;
        text.trim().parse().map_err(|err| {
            Error::protocol(format!("{}.{name}: invalid int {text:?}: {err}", self.name))
        })
    }

    pub fn long_field(&self, name: &str) -> Result<i64> {
        let text = self.str_field(name)?;
        text.trim().parse().map_err(|err| {
            Error::protocol(format!("{}.{name}: invalid long {text:?}: {err}", self.name))
        })
    }

    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) {
        match &self.value {
            Value::Text(text) => {
                out.push('<');
                out.push_str(&self.name);
                out.push('>');
                escape_into(text, out);
                out.push_str("</");
                out.push_str(&self.name);
                out.push_str(">\n");
            }
            Value::Children(children) if children.is_empty() => {
                out.push('<');
                out.push_str(&self.name);
                out.push_str("></");
                out.push_str(&self.name);
                out.push_str(">\n");
            }
            Value::Children(children) => {
                out.push('<');
                out.push_str(&self.name);
                out.push_str(">\n");
                for child in children {
                    child.write_to(out);
                }
                out.push_str("</");
                out.push_str(&self.name);
                out.push_str(">\n");
            }
        }
    }

    pub fn parse(input: &str) -> Result<Tag> {
        let mut parser = Parser { input, pos: 0 };
        parser.skip_whitespace();
        let tag = parser.tag(0)?;
        parser.skip_whitespace();
        // the server null-terminates some bodies
        let rest = parser.rest().trim_end_matches('\0');
        if !rest.trim().is_empty() {
            return Err(Error::protocol(format!(
                "trailing data after {}: {:?}",
                tag.name,
                truncate(rest)
            )));
        }
        Ok(tag)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Tag> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| Error::protocol(format!("message body is not UTF-8: {err}")))?;
        Self::parse(text)
    }
}

fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
}

fn unescape(text: &str) -> Result<String> {
    if !text.contains('&') {
        return Ok(text.to_string());
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let entity = &rest[start..];
        let end = entity.find(';').ok_or_else(|| {
            Error::protocol(format!("unterminated entity in {:?}", truncate(text)))
        })?;
        let decoded = match &entity[..=end] {
            "&amp;" => '&',
            "&lt;" => '<',
            "&gt;" => '>',
            "&quot;" => '"',
            "&apos;" => '\'',
            other => {
                return Err(Error::protocol(format!("unknown entity {other}")));
            }
        };
        out.push(decoded);
        rest = &entity[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(64) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn name_until_gt(&mut self, prefix: &str) -> Result<&'a str> {
        let rest = self.rest();
        let Some(after) = rest.strip_prefix(prefix) else {
            return Err(Error::protocol(format!(
                "expected {prefix:?} at {:?}",
                truncate(rest)
            )));
        };
        let end = after
            .find('>')
            .ok_or_else(|| Error::protocol(format!("unterminated tag at {:?}", truncate(rest))))?;
        let name = &after[..end];
        if !valid_name(name) {
            return Err(Error::protocol(format!("invalid tag name {name:?}")));
        }
        self.pos += prefix.len() + end + 1;
        Ok(name)
    }

    fn close_tag(&mut self, name: &str) -> Result<()> {
        let closing = self.name_until_gt("</")?;
        if closing != name {
            return Err(Error::protocol(format!(
                "mismatched closing tag: expected </{name}>, found </{closing}>"
            )));
        }
        Ok(())
    }

    fn tag(&mut self, depth: usize) -> Result<Tag> {
        if depth > MAX_DEPTH {
            return Err(Error::protocol("packing instruction nested too deeply"));
        }
        let name = self.name_until_gt("<")?;
        let rest = self.rest();
        let trimmed = rest.trim_start();
        if trimmed.starts_with('<') && !trimmed.starts_with("</") {
            let mut children = Vec::new();
            loop {
                self.skip_whitespace();
                let rest = self.rest();
                if rest.starts_with("</") {
                    break;
                }
                if rest.is_empty() {
                    return Err(Error::protocol(format!("unexpected end of input inside {name}")));
                }
                children.push(self.tag(depth + 1)?);
            }
            self.close_tag(name)?;
            return Ok(Tag {
                name: name.to_string(),
                value: Value::Children(children),
            });
        }
        let end = rest
            .find("</")
            .ok_or_else(|| Error::protocol(format!("unterminated value of {name}")))?;
        let text = unescape(&rest[..end])?;
        self.pos += end;
        self.close_tag(name)?;
        Ok(Tag {
            name: name.to_string(),
            value: Value::Text(text),
        })
    }
}

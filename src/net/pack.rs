//! Fixed textual packing profile.
//!
//! Structures travel as
//!
//! ```text
//! <Name_PI>
//! <field>value</field>
//! ...
//! </Name_PI>
//! ```
//!
//! with one child per field in a fixed order. Headers and control structures
//! always use this profile regardless of what a session negotiates later.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{ErrorCode, GridError, Result};

/// A structure with a fixed packing layout.
pub trait PackStruct: Sized {
    /// Element name, e.g. `MsgHeader_PI`.
    const NAME: &'static str;

    /// Write fields in order.
    fn pack_fields(&self, writer: &mut PackWriter);

    /// Read fields in the same order.
    fn unpack_fields(reader: &mut PackReader<'_>) -> Result<Self>;

    /// Packed bytes.
    fn pack(&self) -> Vec<u8> {
        let mut writer = PackWriter::new();
        writer.nested(self);
        writer.finish()
    }

    /// Parse packed bytes; trailing whitespace is allowed, anything else is not.
    fn unpack(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| pack_error(format!("{}: not UTF-8: {e}", Self::NAME)))?;
        let mut reader = PackReader::new(text);
        let value = reader.nested::<Self>()?;
        reader.finish()?;
        Ok(value)
    }
}

fn pack_error(message: impl Into<String>) -> GridError {
    GridError::framing(ErrorCode::USER_PACKSTRUCT_INPUT_ERR, message)
}

/// Builds a packed structure.
#[derive(Debug, Default)]
pub struct PackWriter {
    out: String,
}

impl PackWriter {
    /// Empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Text field.
    pub fn str(&mut self, name: &str, value: &str) -> &mut Self {
        self.out.push('<');
        self.out.push_str(name);
        self.out.push('>');
        escape_into(value, &mut self.out);
        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push_str(">\n");
        self
    }

    /// Integer field.
    pub fn int(&mut self, name: &str, value: i64) -> &mut Self {
        self.str(name, &value.to_string())
    }

    /// Embedded structure.
    pub fn nested<T: PackStruct>(&mut self, value: &T) -> &mut Self {
        self.out.push('<');
        self.out.push_str(T::NAME);
        self.out.push_str(">\n");
        value.pack_fields(self);
        self.out.push_str("</");
        self.out.push_str(T::NAME);
        self.out.push_str(">\n");
        self
    }

    /// Packed bytes.
    pub fn finish(self) -> Vec<u8> {
        self.out.into_bytes()
    }
}

/// Sequential reader over a packed structure.
#[derive(Debug)]
pub struct PackReader<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> PackReader<'a> {
    /// Reader positioned at the start of `text`.
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn skip_whitespace(&mut self) {
        let rest = &self.text[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn expect_tag(&mut self, tag: &str, closing: bool) -> Result<()> {
        self.skip_whitespace();
        let open = if closing { "</" } else { "<" };
        let rest = &self.text[self.pos..];
        let matched = rest
            .strip_prefix(open)
            .and_then(|r| r.strip_prefix(tag))
            .and_then(|r| r.strip_prefix('>'));
        match matched {
            Some(after) => {
                self.pos = self.text.len() - after.len();
                Ok(())
            },
            None => Err(pack_error(format!(
                "expected {open}{tag}> at offset {}",
                self.pos
            ))),
        }
    }

    /// Text field.
    pub fn str(&mut self, name: &str) -> Result<String> {
        self.expect_tag(name, false)?;
        let rest = &self.text[self.pos..];
        let end = rest
            .find('<')
            .ok_or_else(|| pack_error(format!("unterminated field {name}")))?;
        let value = unescape(&rest[..end])?;
        self.pos += end;
        self.expect_tag(name, true)?;
        Ok(value)
    }

    /// Integer field.
    pub fn int(&mut self, name: &str) -> Result<i64> {
        let text = self.str(name)?;
        text.trim()
            .parse()
            .map_err(|_| pack_error(format!("field {name} is not an integer: {text:?}")))
    }

    /// Integer field that must fit an `i32`.
    pub fn int32(&mut self, name: &str) -> Result<i32> {
        let value = self.int(name)?;
        i32::try_from(value).map_err(|_| pack_error(format!("field {name} out of range: {value}")))
    }

    /// Embedded structure.
    pub fn nested<T: PackStruct>(&mut self) -> Result<T> {
        self.expect_tag(T::NAME, false)?;
        let value = T::unpack_fields(self)?;
        self.expect_tag(T::NAME, true)?;
        Ok(value)
    }

    /// Fail unless only whitespace remains.
    pub fn finish(mut self) -> Result<()> {
        self.skip_whitespace();
        if self.pos == self.text.len() {
            Ok(())
        } else {
            Err(pack_error(format!(
                "trailing data at offset {}",
                self.pos
            )))
        }
    }
}

/// Escape markup characters.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    escape_into(text, &mut out);
    out
}

fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
}

/// Reverse [`escape`]; unknown entities are rejected.
pub fn unescape(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let end = rest
            .find(';')
            .ok_or_else(|| pack_error("unterminated entity"))?;
        let replacement = match &rest[..=end] {
            "&amp;" => '&',
            "&lt;" => '<',
            "&gt;" => '>',
            "&quot;" => '"',
            "&apos;" => '\'',
            other => return Err(pack_error(format!("unknown entity {other}"))),
        };
        out.push(replacement);
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Length-prefixed byte buffer (`BinBytesBuf_PI`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinBytesBuf(pub Vec<u8>);

impl PackStruct for BinBytesBuf {
    const NAME: &'static str = "BinBytesBuf_PI";

    fn pack_fields(&self, writer: &mut PackWriter) {
        writer
            .int("buflen", self.0.len() as i64)
            .str("buf", &STANDARD.encode(&self.0));
    }

    fn unpack_fields(reader: &mut PackReader<'_>) -> Result<Self> {
        let declared = reader.int("buflen")?;
        let bytes = STANDARD.decode(reader.str("buf")?)?;
        if declared < 0 || declared as usize != bytes.len() {
            return Err(pack_error(format!(
                "buflen {declared} does not match {} decoded bytes",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }
}

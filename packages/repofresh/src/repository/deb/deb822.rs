//! Minimal RFC-822-style control parsing: ordered fields, continuation
//! lines preserved verbatim so stanzas re-render byte-identically.

use nom::IResult;
use nom::bytes::complete::take_until;
use nom::character::complete::{char, space0};
use nom::combinator::{map, rest, verify};
use nom::sequence::{pair, separated_pair};

use crate::error::{Error, Result};

#[inline]
fn key_name(input: &str) -> IResult<&str, &str> {
    verify(take_until(":"), |key: &str| {
        !key.is_empty() && !key.contains('\n') && !key.starts_with(' ') && !key.starts_with('\t')
    })(input)
}

#[inline]
fn separator(input: &str) -> IResult<&str, ()> {
    map(pair(char(':'), space0), |_| ())(input)
}

#[inline]
fn key_value(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(key_name, separator, rest)(input)
}

/// One control stanza with field order preserved.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Paragraph {
    pub fields: Vec<(String, String)>,
}

impl Paragraph {
    /// Case-insensitive field lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replace a field in place, or append it.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .fields
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(field) => field.1 = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

/// Parse a sequence of blank-line separated stanzas.
pub fn parse(input: &str) -> Result<Vec<Paragraph>> {
    let mut paragraphs = Vec::new();
    let mut current = Paragraph::default();
    for line in input.lines() {
        if line.trim().is_empty() {
            if !current.fields.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            let Some(last) = current.fields.last_mut() else {
                return Err(Error::Metadata(format!(
                    "continuation line without a field: {line:?}"
                )));
            };
            last.1.push('\n');
            last.1.push_str(line);
            continue;
        }
        let (_, (key, value)) = key_value(line)
            .map_err(|_| Error::Metadata(format!("malformed control line: {line:?}")))?;
        current.fields.push((key.to_string(), value.to_string()));
    }
    if !current.fields.is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs)
}

/// Parse exactly one stanza.
pub fn parse_one(input: &str) -> Result<Paragraph> {
    parse(input)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Metadata("empty control file".to_string()))
}

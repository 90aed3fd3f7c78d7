//! Parser for the model-definition document:
//!
//! ```text
//! FROM <model-reference-or-path>
//! PARAMETER <key> <value>
//! TEMPLATE """<template text>"""
//! SYSTEM """<text>"""
//! ADAPTER <path-or-reference>
//! LICENSE """<text>"""
//! ```
//!
//! Lines starting with `#` are comments; triple-quoted values span lines.

use crate::error::{Error, Result};

const DIRECTIVES: &[&str] = &["from", "parameter", "template", "system", "adapter", "license"];

#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub name: String,
    pub args: String,
    pub line: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Modelfile {
    pub commands: Vec<Directive>,
}

impl Modelfile {
    pub fn from_value(&self) -> Option<&str> {
        self.first("from")
    }

    pub fn template(&self) -> Option<&str> {
        self.first("template")
    }

    pub fn system(&self) -> Option<&str> {
        self.first("system")
    }

    pub fn license(&self) -> Option<&str> {
        self.first("license")
    }

    pub fn adapters(&self) -> impl Iterator<Item = &str> {
        self.all("adapter")
    }

    /// `PARAMETER <key> <value>` pairs in document order.
    pub fn parameters(&self) -> Vec<(String, String)> {
        self.all("parameter")
            .map(|args| {
                let mut parts = args.splitn(2, char::is_whitespace);
                let key = parts.next().unwrap_or("").to_string();
                let value = parts.next().unwrap_or("").trim().to_string();
                (key, value)
            })
            .collect()
    }

    fn first(&self, name: &str) -> Option<&str> {
        self.commands
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.args.as_str())
    }

    fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.commands
            .iter()
            .filter(move |c| c.name == name)
            .map(|c| c.args.as_str())
    }
}

pub fn parse(input: &str) -> Result<Modelfile> {
    let mut modelfile = Modelfile::default();
    let mut lines = input.lines().enumerate();

    while let Some((idx, raw)) = lines.next() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let column = raw.len() - raw.trim_start().len() + 1;
        let (word, rest) = split_word(line);
        let name = word.to_lowercase();
        if !DIRECTIVES.contains(&name.as_str()) {
            return Err(Error::Parse {
                line: line_no,
                column,
                message: format!("unknown directive {word:?}"),
            });
        }

        let arg_column = column + word.len() + (rest.len() - rest.trim_start().len()) + 1;
        let rest = rest.trim();
        let args = if let Some(body) = rest.strip_prefix("\"\"\"") {
            read_multiline(body, &mut lines, line_no, arg_column)?
        } else {
            rest.to_string()
        };

        if args.is_empty() {
            return Err(Error::Parse {
                line: line_no,
                column,
                message: format!("{} requires a value", name.to_uppercase()),
            });
        }

        modelfile.commands.push(Directive {
            name,
            args,
            line: line_no,
        });
    }

    Ok(modelfile)
}

fn split_word(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], &line[i..]),
        None => (line, ""),
    }
}

/// Consume a `"""..."""` value. `first` is the remainder of the opening line
/// after the quotes.
fn read_multiline<'a, I>(
    first: &str,
    lines: &mut I,
    start_line: usize,
    start_column: usize,
) -> Result<String>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    if let Some(body) = first.strip_suffix("\"\"\"") {
        return Ok(body.to_string());
    }

    let mut value = String::from(first);
    for (_, raw) in lines.by_ref() {
        if let Some(body) = raw.trim_end().strip_suffix("\"\"\"") {
            // A closing line with no content of its own adds no newline.
            if !body.is_empty() {
                if !value.is_empty() {
                    value.push('\n');
                }
                value.push_str(body);
            }
            return Ok(value);
        }
        if !value.is_empty() {
            value.push('\n');
        }
        value.push_str(raw);
    }

    Err(Error::Parse {
        line: start_line,
        column: start_column,
        message: "unterminated \"\"\" value".to_string(),
    })
}

//! Indentation-preserving template composition.
//!
//! Manifests are YAML, so splicing a multi-line fragment into a nested
//! position must re-indent every continuation line to the column where the
//! placeholder sits. Templates carry two kinds of actions:
//!
//! - `{{.name}}` interpolates a plain value from the variable table
//! - `{{template "name"}}` hands the position over to a named renderer
//!
//! Renderers write through a [`PrefixWriter`] and may compose further
//! templates themselves; indentation accumulates per nesting level.

mod prefix;

pub use prefix::PrefixWriter;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown template {0:?}")]
    UnknownTemplate(String),
    #[error("unknown variable {0:?}")]
    UnknownVariable(String),
    #[error("missing renderer parameter {0:?}")]
    MissingParam(String),
    #[error("unbalanced indent scope")]
    UnbalancedIndent,
    #[error("template parse error at byte {offset}: {reason}")]
    Parse { offset: usize, reason: &'static str },
    #[error("template output failed")]
    Write(#[from] fmt::Error),
}

/// Plain interpolation values, also visible to renderers.
pub type Vars = BTreeMap<String, String>;

/// Looks up a parameter a renderer cannot do without.
pub fn param<'v>(vars: &'v Vars, name: &str) -> Result<&'v str, TemplateError> {
    vars.get(name)
        .map(String::as_str)
        .ok_or_else(|| TemplateError::MissingParam(name.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Var(String),
    Placeholder(String),
}

/// A parsed parent template.
#[derive(Debug, Clone)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(src: &str) -> Result<Self, TemplateError> {
        let mut nodes = Vec::new();
        let mut rest = src;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                nodes.push(Node::Text(rest[..start].to_string()));
            }
            let body = &rest[start + 2..];
            let end = body.find("}}").ok_or(TemplateError::Parse {
                offset: offset + start,
                reason: "unclosed action",
            })?;
            let node = parse_action(body[..end].trim()).ok_or(TemplateError::Parse {
                offset: offset + start,
                reason: "unrecognized action",
            })?;
            nodes.push(node);

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            nodes.push(Node::Text(rest.to_string()));
        }

        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

fn parse_action(action: &str) -> Option<Node> {
    if let Some(name) = action.strip_prefix('.') {
        return is_ident(name).then(|| Node::Var(name.to_string()));
    }
    let arg = action.strip_prefix("template")?.trim_start();
    let name = arg.strip_prefix('"')?.strip_suffix('"')?;
    is_ident(name).then(|| Node::Placeholder(name.to_string()))
}

fn is_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

type RenderFn<'a> = dyn Fn(&mut PrefixWriter<'_>, &Vars) -> Result<(), TemplateError> + 'a;

/// Placeholder name to renderer table.
#[derive(Default)]
pub struct Renderers<'a> {
    table: HashMap<String, Box<RenderFn<'a>>>,
}

impl<'a> Renderers<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: impl Into<String>, render: F) -> Self
    where
        F: Fn(&mut PrefixWriter<'_>, &Vars) -> Result<(), TemplateError> + 'a,
    {
        self.table.insert(name.into(), Box::new(render));
        self
    }

    fn get(&self, name: &str) -> Option<&RenderFn<'a>> {
        self.table.get(name).map(|r| r.as_ref())
    }
}

/// Renders `template` into `out`.
///
/// Placeholder output is buffered per placeholder, so a failing renderer
/// leaves nothing of its own in `out`.
pub fn compose(
    template: &Template,
    vars: &Vars,
    renderers: &Renderers<'_>,
    out: &mut dyn Write,
) -> Result<(), TemplateError> {
    let mut cursor = Cursor::new(out);

    for node in template.nodes() {
        match node {
            Node::Text(text) => cursor.text(text)?,
            Node::Var(name) => {
                let value = vars
                    .get(name)
                    .ok_or_else(|| TemplateError::UnknownVariable(name.clone()))?;
                cursor.text(value)?;
            }
            Node::Placeholder(name) => {
                let render = renderers
                    .get(name)
                    .ok_or_else(|| TemplateError::UnknownTemplate(name.clone()))?;

                let mut buf = String::new();
                let mut pw = PrefixWriter::new(&mut buf, true);
                pw.push_prefix(" ".repeat(cursor.column));
                render(&mut pw, vars)?;
                pw.pop_prefix()?;
                pw.finish()?;

                cursor.placeholder(&buf)?;
            }
        }
    }

    cursor.finish()?;
    Ok(())
}

/// Tracks the output column and withholds leading whitespace until the line
/// turns out to carry content.
struct Cursor<'o> {
    out: &'o mut dyn Write,
    column: usize,
    at_line_start: bool,
    held: String,
    absorb_newline: bool,
}

impl<'o> Cursor<'o> {
    fn new(out: &'o mut dyn Write) -> Self {
        Self {
            out,
            column: 0,
            at_line_start: true,
            held: String::new(),
            absorb_newline: false,
        }
    }

    fn text(&mut self, text: &str) -> fmt::Result {
        let mut text = text;
        if std::mem::take(&mut self.absorb_newline) {
            if let Some(rest) = text.strip_prefix('\n') {
                text = rest;
                self.held.clear();
                self.column = 0;
                self.at_line_start = true;
            }
        }

        for segment in text.split_inclusive('\n') {
            if segment.ends_with('\n') {
                self.release()?;
                self.out.write_str(segment)?;
                self.column = 0;
                self.at_line_start = true;
            } else if self.at_line_start && segment.chars().all(|c| c == ' ' || c == '\t') {
                self.held.push_str(segment);
                self.column += segment.chars().count();
            } else {
                self.release()?;
                self.out.write_str(segment)?;
                self.column += segment.chars().count();
                self.at_line_start = false;
            }
        }
        Ok(())
    }

    fn placeholder(&mut self, rendered: &str) -> fmt::Result {
        if rendered.is_empty() {
            // a line holding nothing but this placeholder disappears
            if self.at_line_start {
                self.absorb_newline = true;
            }
            return Ok(());
        }

        if rendered.starts_with('\n') {
            self.held.clear();
        } else {
            self.release()?;
        }
        self.out.write_str(rendered)?;
        match rendered.rfind('\n') {
            Some(idx) => self.column = rendered[idx + 1..].chars().count(),
            None => self.column += rendered.chars().count(),
        }
        self.at_line_start = rendered.ends_with('\n');
        self.absorb_newline = self.at_line_start;
        Ok(())
    }

    fn release(&mut self) -> fmt::Result {
        if !self.held.is_empty() {
            self.out.write_str(&self.held)?;
            self.held.clear();
        }
        Ok(())
    }

    fn finish(mut self) -> fmt::Result {
        // an empty placeholder ended the template: its indent goes with it
        if self.absorb_newline && self.at_line_start {
            self.held.clear();
        }
        self.release()
    }
}

use std::fmt::{self, Write};

use super::TemplateError;

/// Line-oriented writer that prepends the current prefix stack to every
/// non-empty line it forwards.
///
/// The first line can be left unprefixed: a placeholder's output starts on a
/// line the parent has already indented.
pub struct PrefixWriter<'w> {
    inner: &'w mut dyn Write,
    prefixes: Vec<String>,
    line: String,
    skip_first: bool,
}

impl<'w> PrefixWriter<'w> {
    pub fn new(inner: &'w mut dyn Write, skip_first: bool) -> Self {
        Self {
            inner,
            prefixes: Vec::new(),
            line: String::new(),
            skip_first,
        }
    }

    pub fn push_prefix(&mut self, prefix: impl Into<String>) {
        self.prefixes.push(prefix.into());
    }

    pub fn pop_prefix(&mut self) -> Result<String, TemplateError> {
        self.prefixes.pop().ok_or(TemplateError::UnbalancedIndent)
    }

    /// Runs `f` with `prefix` pushed, popping it again afterwards.
    pub fn scope<F>(&mut self, prefix: &str, f: F) -> Result<(), TemplateError>
    where
        F: FnOnce(&mut Self) -> Result<(), TemplateError>,
    {
        self.push_prefix(prefix);
        f(self)?;
        self.pop_prefix().map(|_| ())
    }

    /// Writes `s` followed by a newline.
    pub fn line(&mut self, s: &str) -> Result<(), TemplateError> {
        self.write_str(s)?;
        self.write_char('\n')?;
        Ok(())
    }

    /// Flushes any partial line and checks that every pushed prefix was popped.
    pub fn finish(mut self) -> Result<(), TemplateError> {
        self.flush_line()?;
        if !self.prefixes.is_empty() {
            return Err(TemplateError::UnbalancedIndent);
        }
        Ok(())
    }

    fn flush_line(&mut self) -> fmt::Result {
        if self.line.is_empty() {
            return Ok(());
        }
        if !std::mem::take(&mut self.skip_first) {
            for prefix in &self.prefixes {
                self.inner.write_str(prefix)?;
            }
        }
        self.inner.write_str(&self.line)?;
        self.line.clear();
        Ok(())
    }
}

impl Write for PrefixWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for segment in s.split_inclusive('\n') {
            match segment.strip_suffix('\n') {
                Some(body) => {
                    self.line.push_str(body);
                    self.flush_line()?;
                    // a blank first line still ends the unprefixed one
                    self.skip_first = false;
                    self.inner.write_char('\n')?;
                }
                None => self.line.push_str(segment),
            }
        }
        Ok(())
    }
}

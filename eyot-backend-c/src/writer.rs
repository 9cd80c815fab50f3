#![forbid(unsafe_code)]

/// Token-spaced, indentation-aware line writer. Components accumulate
/// until `end_line`; each is separated from the previous by one space
/// unless spacing was suppressed for it.
#[derive(Debug, Default)]
pub struct Writer {
    out: String,
    parts: Vec<Part>,
    indent: usize,
    no_space: bool,
    force_space: bool,
}

#[derive(Debug)]
struct Part {
    content: String,
    space: bool,
}

impl Writer {
    pub fn new() -> Writer {
        Writer::default()
    }

    fn push_part(&mut self, content: String, mut space: bool) {
        if self.force_space {
            space = true;
        } else if self.no_space {
            space = false;
        }
        self.no_space = false;
        self.force_space = false;
        self.parts.push(Part { content, space });
    }

    pub fn add(&mut self, s: impl Into<String>) {
        self.push_part(s.into(), true);
    }

    pub fn add_all(&mut self, parts: &[&str]) {
        for p in parts {
            self.add(*p);
        }
    }

    pub fn add_no_space(&mut self, s: impl Into<String>) {
        self.push_part(s.into(), false);
    }

    /// Force a space before the next component even if it asks for none.
    pub fn force_space(&mut self) {
        self.force_space = true;
    }

    /// Suppress the space before the next component.
    pub fn suppress_next_space(&mut self) {
        self.no_space = true;
    }

    pub fn indent(&mut self) {
        self.indent += 1;
    }

    pub fn unindent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    /// Write text straight through, bypassing the component model.
    pub fn raw(&mut self, s: &str) {
        self.out.push_str(s);
    }

    pub fn end_line(&mut self) {
        if self.parts.is_empty() {
            self.out.push('\n');
            return;
        }

        for _ in 0..self.indent {
            self.out.push_str("    ");
        }

        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 && part.space {
                self.out.push(' ');
            }
            self.out.push_str(&part.content);
        }

        self.out.push('\n');
        self.parts.clear();
    }

    pub fn finish(mut self) -> String {
        if !self.parts.is_empty() {
            self.end_line();
        }
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_are_space_separated() {
        let mut w = Writer::new();
        w.add_all(&["int", "x", "=", "1"]);
        w.add_no_space(";");
        w.end_line();
        assert_eq!(w.finish(), "int x = 1;\n");
    }

    #[test]
    fn suppression_and_forcing() {
        let mut w = Writer::new();
        w.add("f");
        w.add_no_space("(");
        w.suppress_next_space();
        w.add("x");
        w.add_no_space(")");
        w.end_line();
        assert_eq!(w.finish(), "f(x)\n");
    }

    #[test]
    fn indentation_applies_per_line() {
        let mut w = Writer::new();
        w.add("{");
        w.end_line();
        w.indent();
        w.add("body");
        w.add_no_space(";");
        w.end_line();
        w.unindent();
        w.add("}");
        w.end_line();
        assert_eq!(w.finish(), "{\n    body;\n}\n");
    }

    #[test]
    fn empty_line_is_just_a_newline() {
        let mut w = Writer::new();
        w.end_line();
        assert_eq!(w.finish(), "\n");
    }
}

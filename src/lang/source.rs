use std::rc::Rc;

/// A piece of Cinder source text, shared between the AST, the compiler's
/// output and the VM's error reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    name: Option<String>,
    body: String,
}

impl Source {
    pub fn new(name: Option<String>, body: impl Into<String>) -> Rc<Self> {
        Rc::new(Source {
            name,
            body: body.into(),
        })
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("<memory>")
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Maps a byte offset to a 1-based `(line, column)` pair.
    ///
    /// Offsets past the end of the text resolve to the position one past the
    /// last character, so EOF-related errors still render something useful.
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let mut line = 1;
        let mut col = 1;
        for (i, ch) in self.body.char_indices() {
            if i >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }
}

impl Default for Source {
    fn default() -> Self {
        Source {
            name: None,
            body: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col_first_line() {
        let src = Source::new(None, "abc\ndef");
        assert_eq!(src.line_col(0), (1, 1));
        assert_eq!(src.line_col(2), (1, 3));
    }

    #[test]
    fn test_line_col_after_newline() {
        let src = Source::new(None, "abc\ndef");
        assert_eq!(src.line_col(4), (2, 1));
        assert_eq!(src.line_col(6), (2, 3));
    }

    #[test]
    fn test_line_col_past_end() {
        let src = Source::new(None, "ab");
        assert_eq!(src.line_col(100), (1, 3));
    }

    #[test]
    fn test_name_fallback() {
        let src = Source::new(None, "");
        assert_eq!(src.name(), "<memory>");

        let src = Source::new(Some("script.cn".to_string()), "");
        assert_eq!(src.name(), "script.cn");
    }
}

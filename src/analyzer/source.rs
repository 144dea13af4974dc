use crate::config::types::Location;

/// Byte offset to line/column mapping over raw script bytes.
///
/// Columns count UTF-8 characters, so the mapping also works for content
/// that is only valid up to some prefix.
pub struct SourceMap<'a> {
    bytes: &'a [u8],
    line_starts: Vec<usize>,
}

impl<'a> SourceMap<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            bytes
                .iter()
                .enumerate()
                .filter(|(_, b)| **b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self { bytes, line_starts }
    }

    pub fn locate(&self, offset: usize) -> Location {
        let offset = offset.min(self.bytes.len());
        let line_index = match self.line_starts.binary_search(&offset) {
            Ok(exact) => exact,
            Err(next) => next - 1,
        };
        let line_start = self.line_starts[line_index];
        let column = self.bytes[line_start..offset]
            .iter()
            .filter(|b| (**b & 0xC0) != 0x80)
            .count()
            + 1;
        Location {
            line: line_index + 1,
            column,
            offset,
        }
    }
}

/// Spans of text the lexers found, plus the first structural problem
#[derive(Debug, Default)]
pub struct Lexed {
    /// Same length as the input; comments and literal contents replaced by spaces
    pub masked: String,
    /// Literal spans as (content_start, content_end) byte offsets into the input
    pub literals: Vec<(usize, usize)>,
    /// First structural issue: (offset, description)
    pub issue: Option<(usize, String)>,
}

impl Lexed {
    pub(crate) fn note_issue(&mut self, offset: usize, description: impl Into<String>) {
        match &self.issue {
            Some((existing, _)) if *existing <= offset => {}
            _ => self.issue = Some((offset, description.into())),
        }
    }

    /// Literal whose opening quote sits at `quote_offset`
    pub fn literal_after_quote(&self, quote_offset: usize) -> Option<(usize, usize)> {
        self.literals
            .iter()
            .copied()
            .find(|(start, _)| *start == quote_offset + 1)
    }
}

/// Replace every non-newline byte in `range` with a space
pub(crate) fn blank(buf: &mut [u8], start: usize, end: usize) {
    for b in &mut buf[start..end] {
        if *b != b'\n' {
            *b = b' ';
        }
    }
}

/// Report the first unbalanced bracket in masked text
pub(crate) fn check_brackets(masked: &str, lexed: &mut Lexed) {
    let mut stack: Vec<(u8, usize)> = Vec::new();
    for (offset, byte) in masked.bytes().enumerate() {
        match byte {
            b'(' | b'[' | b'{' => stack.push((byte, offset)),
            b')' | b']' | b'}' => {
                let expected = match byte {
                    b')' => b'(',
                    b']' => b'[',
                    _ => b'{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    _ => {
                        lexed.note_issue(offset, format!("unbalanced '{}'", byte as char));
                        return;
                    }
                }
            }
            _ => {}
        }
    }
    if let Some((open, offset)) = stack.first() {
        lexed.note_issue(*offset, format!("unclosed '{}'", *open as char));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locates_lines_and_columns() {
        let src = b"a = 1\nb = eval(x)\n";
        let map = SourceMap::new(src);
        let loc = map.locate(10);
        assert_eq!(loc.line, 2);
        assert_eq!(loc.column, 5);
        assert_eq!(loc.offset, 10);
    }

    #[test]
    fn columns_count_characters_not_bytes() {
        let src = "é = eval(x)".as_bytes();
        let map = SourceMap::new(src);
        // 'é' is two bytes; eval starts at byte 5
        assert_eq!(map.locate(5).column, 5);
    }

    #[test]
    fn first_issue_wins() {
        let mut lexed = Lexed::default();
        lexed.note_issue(20, "later");
        lexed.note_issue(4, "earlier");
        lexed.note_issue(9, "middle");
        assert_eq!(lexed.issue, Some((4, "earlier".to_string())));
    }

    #[test]
    fn detects_unbalanced_brackets() {
        let mut lexed = Lexed::default();
        check_brackets("f(a, [b)", &mut lexed);
        assert_eq!(lexed.issue.as_ref().map(|(o, _)| *o), Some(7));

        let mut lexed = Lexed::default();
        check_brackets("call(x", &mut lexed);
        assert_eq!(lexed.issue.as_ref().map(|(o, _)| *o), Some(4));
    }
}

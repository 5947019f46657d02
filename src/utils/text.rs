//! Text helpers shared by log expansion, replace splicing, and code frames.

/// 0-based line/column position inside a text document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextPosition {
    pub line: usize,
    pub column: usize,
}

/// Convert a byte offset into a 0-based line/column pair. Offsets past the
/// end clamp to the final position.
pub fn position_at(text: &str, offset: usize) -> TextPosition {
    let offset = offset.min(text.len());
    let mut line = 0;
    let mut line_start = 0;
    for (idx, byte) in text.as_bytes().iter().enumerate().take(offset) {
        if *byte == b'\n' {
            line += 1;
            line_start = idx + 1;
        }
    }
    TextPosition {
        line,
        column: offset - line_start,
    }
}

/// Convert a 0-based line/column pair back into a byte offset.
pub fn offset_at(text: &str, pos: TextPosition) -> usize {
    let mut line = 0;
    let mut line_start = 0;
    if pos.line > 0 {
        for (idx, byte) in text.as_bytes().iter().enumerate() {
            if *byte == b'\n' {
                line += 1;
                line_start = idx + 1;
                if line == pos.line {
                    break;
                }
            }
        }
        if line < pos.line {
            return text.len();
        }
    }
    let line_end = text[line_start..]
        .find('\n')
        .map(|i| line_start + i)
        .unwrap_or(text.len());
    (line_start + pos.column).min(line_end)
}

/// One pending range replacement, `start..end` in the original text.
#[derive(Debug, Clone)]
pub struct Splice {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Apply range replacements to `text`. Ranges are applied in ascending start
/// order; overlapping ranges keep the first and drop the rest.
pub fn splice(text: &str, mut edits: Vec<Splice>) -> String {
    edits.sort_by_key(|e| (e.start, e.end));
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for edit in edits {
        if edit.start < cursor || edit.end > text.len() || edit.start > edit.end {
            continue;
        }
        out.push_str(&text[cursor..edit.start]);
        out.push_str(&edit.text);
        cursor = edit.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Render a few lines of context around an error location, 0-based input.
pub fn code_frame(text: &str, line: usize, column: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let first = line.saturating_sub(2);
    let last = (line + 2).min(lines.len().saturating_sub(1));
    let mut output = String::new();

    for (idx, content) in lines.iter().enumerate().take(last + 1).skip(first) {
        let display_num = idx + 1;
        if idx == line {
            output.push_str(&format!("> {:4} | {}\n", display_num, content));
            output.push_str(&format!("  {:4} | {}^\n", "", " ".repeat(column)));
        } else {
            output.push_str(&format!("  {:4} | {}\n", display_num, content));
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "let a = 1;\nlet b = 2;\nlet c = 3;\n";

    #[test]
    fn test_position_at() {
        assert_eq!(position_at(TEXT, 0), TextPosition { line: 0, column: 0 });
        assert_eq!(position_at(TEXT, 4), TextPosition { line: 0, column: 4 });
        // First char of the second line
        assert_eq!(position_at(TEXT, 11), TextPosition { line: 1, column: 0 });
        assert_eq!(position_at(TEXT, 15), TextPosition { line: 1, column: 4 });
    }

    #[test]
    fn test_offset_at_round_trip() {
        for offset in [0, 4, 11, 15, 26] {
            let pos = position_at(TEXT, offset);
            assert_eq!(offset_at(TEXT, pos), offset);
        }
    }

    #[test]
    fn test_position_clamps_past_end() {
        let pos = position_at("ab", 99);
        assert_eq!(pos, TextPosition { line: 0, column: 2 });
    }

    #[test]
    fn test_splice_ordered() {
        let out = splice(
            "url(a.png) url(b.png)",
            vec![
                Splice {
                    start: 4,
                    end: 9,
                    text: "x.png".into(),
                },
                Splice {
                    start: 15,
                    end: 20,
                    text: "y.png".into(),
                },
            ],
        );
        assert_eq!(out, "url(x.png) url(y.png)");
    }

    #[test]
    fn test_splice_drops_overlaps() {
        let out = splice(
            "abcdef",
            vec![
                Splice {
                    start: 0,
                    end: 4,
                    text: "X".into(),
                },
                Splice {
                    start: 2,
                    end: 5,
                    text: "Y".into(),
                },
            ],
        );
        assert_eq!(out, "Xef");
    }

    #[test]
    fn test_code_frame_marks_line() {
        let frame = code_frame(TEXT, 1, 4);
        assert!(frame.contains(">    2 | let b = 2;"));
        assert!(frame.contains('^'));
    }
}

//! Turns raw PTY bytes into a flat text rendering via a VT100/xterm screen model.

use crate::marker::strip_markers;

/// Screen dimensions used to size the VT parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for ScreenSize {
    fn default() -> Self {
        ScreenSize { rows: 24, cols: 80 }
    }
}

/// Upper bound on the grid height we'll grow to for a single render, so a
/// pathological buffer can't make us allocate an unbounded screen.
const MAX_GRID_ROWS: u16 = 20_000;

/// Scrollback depth handed to `vt100::Parser`, matched to what the rest of
/// the pty-session corpus passes (10_000 is the common figure there too).
const SCROLLBACK_LEN: usize = 10_000;

/// Renders `data` (already marker-stripped by the caller, or not — this
/// function strips them itself so callers never have to remember to) into
/// plain text: history-top rows, current-screen rows, history-bottom rows,
/// concatenated, each row right-trimmed of trailing whitespace.
///
/// `vt100::Screen::contents()` only reports the rows currently on-screen; a
/// grid fixed at the configured height would silently drop anything that
/// scrolled past it, which is wrong for a renderer whose job is to hand back
/// a command's *entire* output. So the grid is grown tall enough to hold
/// every line actually present (`size.height` is still used as the floor and
/// for wrapping width), and scrollback is kept around besides in case a
/// future caller wants a genuinely windowed view.
///
/// Referentially transparent and non-mutating: the same bytes always render
/// to the same string, and `data` is read-only.
pub fn render(data: &[u8], size: ScreenSize) -> String {
    let stripped = strip_markers(data);
    let rows = grid_rows_for(&stripped, size);

    let mut parser = vt100::Parser::new(rows, size.cols, SCROLLBACK_LEN);
    parser.process(&stripped);
    let screen = parser.screen();

    let contents = screen.contents();
    contents
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Counting `\n` bytes alone undercounts: a logical line longer than
/// `size.cols` wraps into `ceil(len / cols)` screen rows, not one, and a
/// grid sized by newline count then falls short of what the content needs,
/// pushing the excess into scrollback where `Screen::contents()` can't see
/// it. So each `\n`-delimited segment contributes its wrapped row count
/// (byte length is a safe upper bound on visible width: escape sequences
/// and multi-byte UTF-8 only ever add bytes without adding columns).
fn grid_rows_for(stripped: &[u8], size: ScreenSize) -> u16 {
    let cols = size.cols.max(1) as usize;
    let mut rows: usize = 2;
    for line in stripped.split(|&b| b == b'\n') {
        let len = line.len();
        rows += if len == 0 { 1 } else { (len + cols - 1) / cols };
    }
    let needed = u16::try_from(rows).unwrap_or(u16::MAX);
    needed.max(size.rows).min(MAX_GRID_ROWS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_plain_text() {
        let out = render(b"hello\r\nworld\r\n", ScreenSize::default());
        assert!(out.contains("hello"));
        assert!(out.contains("world"));
    }

    #[test]
    fn strips_ansi_color_codes() {
        let out = render(b"\x1b[31mred\x1b[0m\r\n", ScreenSize::default());
        assert!(out.contains("red"));
        assert!(!out.contains("\x1b"));
    }

    #[test]
    fn whitespace_and_markers_only_renders_empty() {
        use crate::marker::MarkerKind;
        let mut buf = MarkerKind::EditStart.wire_bytes();
        buf.extend(b"   \r\n  \r\n");
        buf.extend(MarkerKind::EditEnd.wire_bytes());
        let out = render(&buf, ScreenSize::default());
        assert!(out.trim().is_empty());
    }

    #[test]
    fn output_taller_than_the_configured_grid_is_not_truncated() {
        let mut data = Vec::new();
        for i in 0..500 {
            data.extend_from_slice(format!("line-{i}\r\n").as_bytes());
        }
        let small = ScreenSize { rows: 24, cols: 80 };
        let out = render(&data, small);
        assert!(out.contains("line-0"), "oldest line missing from render");
        assert!(out.contains("line-499"), "newest line missing from render");
    }

    #[test]
    fn a_single_line_wider_than_cols_is_not_truncated_by_wrapping() {
        // One logical line of 500 chars at cols=80 wraps into 7 screen rows
        // on its own; a grid sized only by newline count (here: ~2 rows)
        // would push the tail of this line into scrollback and drop it.
        let small = ScreenSize { rows: 24, cols: 80 };
        let mut data = b"START-".to_vec();
        data.extend(std::iter::repeat(b'x').take(500));
        data.extend_from_slice(b"-END\r\n");

        let out = render(&data, small);
        assert!(out.contains("START-"), "start of the wide line missing from render");
        assert!(out.contains("-END"), "end of the wide line missing from render");
    }
}

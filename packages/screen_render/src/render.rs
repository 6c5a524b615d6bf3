use crate::cell::{CellStyle, Color, ScreenLine, ScreenSnapshot};

const CLEAR_SCREEN: &[u8] = b"\x1b[2J";
const CURSOR_HOME: &[u8] = b"\x1b[H";
const RESET: &[u8] = b"\x1b[0m";
const LINE_BREAK: &[u8] = b"\r\n";

/// Render a snapshot as a full-redraw ANSI blob.
///
/// Layout: clear screen, cursor home, lines joined with CRLF (trailing
/// whitespace trimmed), a final reset when any line was styled, then a cursor
/// placement on the line after the content.
pub fn render_snapshot(snapshot: &ScreenSnapshot) -> Vec<u8> {
    let mut out = Vec::with_capacity(snapshot.lines.iter().map(|l| l.text.len() + 2).sum());
    out.extend_from_slice(CLEAR_SCREEN);
    out.extend_from_slice(CURSOR_HOME);

    let mut styled = false;
    for (i, line) in snapshot.lines.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(LINE_BREAK);
        }
        styled |= line.is_styled();
        out.extend_from_slice(render_line(line).as_bytes());
    }

    if styled {
        out.extend_from_slice(RESET);
    }
    out.extend_from_slice(format!("\x1b[{};1H", snapshot.line_count()).as_bytes());
    out
}

/// Render one line. Unstyled lines come back as their trimmed text.
///
/// For styled lines an SGR sequence is emitted only when the cell style
/// differs from the last emitted one. Cells without a style keep whatever
/// was emitted before them.
pub fn render_line(line: &ScreenLine) -> String {
    if !line.is_styled() {
        return line.text.trim_end().to_string();
    }

    let mut out = String::with_capacity(line.text.len() * 2);
    let mut current: Option<CellStyle> = None;

    for (x, ch) in line.text.chars().enumerate() {
        if let Some(style) = line.style_at(x) {
            if current.as_ref() != Some(style) {
                out.push_str(&sgr_sequence(style));
                current = Some(*style);
            }
        }
        out.push(ch);
    }

    out.truncate(out.trim_end().len());
    out
}

/// Build the SGR sequence for a style. Always starts from a full reset so the
/// result does not depend on what the terminal had set before.
pub fn sgr_sequence(style: &CellStyle) -> String {
    let mut codes: Vec<String> = vec!["0".to_string()];

    let attrs = &style.attrs;
    if attrs.bold {
        codes.push("1".to_string());
    }
    if attrs.faint {
        codes.push("2".to_string());
    }
    if attrs.italic {
        codes.push("3".to_string());
    }
    if attrs.underline {
        codes.push("4".to_string());
    }
    if attrs.inverse {
        codes.push("7".to_string());
    }
    if attrs.strikethrough {
        codes.push("9".to_string());
    }
    if let Some(fg) = &style.fg {
        codes.push(color_code(38, fg));
    }
    if let Some(bg) = &style.bg {
        codes.push(color_code(48, bg));
    }

    format!("\x1b[{}m", codes.join(";"))
}

fn color_code(base: u8, color: &Color) -> String {
    match color {
        Color::Standard(n) => format!("{};5;{}", base, n),
        Color::Rgb(r, g, b) => format!("{};2;{};{};{}", base, r, g, b),
    }
}

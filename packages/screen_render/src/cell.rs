/// Cell color as reported by the host. `None` in a style means "terminal default".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Color {
    /// Index into the 256-color palette.
    Standard(u8),
    Rgb(u8, u8, u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Attrs {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub faint: bool,
    pub inverse: bool,
    pub strikethrough: bool,
}

/// Attributes plus resolved colors for one cell.
///
/// Two cells render identically exactly when their styles compare equal, which
/// is what the renderer uses to decide whether a new SGR sequence is needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct CellStyle {
    pub attrs: Attrs,
    pub fg: Option<Color>,
    pub bg: Option<Color>,
}

/// One line of a screen snapshot.
///
/// `styles` is indexed by character position in `text`. A line without style
/// information (or whose first cell has none) renders as plain text.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ScreenLine {
    pub text: String,
    pub styles: Option<Vec<Option<CellStyle>>>,
}

impl ScreenLine {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            styles: None,
        }
    }

    pub fn styled(text: impl Into<String>, styles: Vec<Option<CellStyle>>) -> Self {
        Self {
            text: text.into(),
            styles: Some(styles),
        }
    }

    pub fn style_at(&self, x: usize) -> Option<&CellStyle> {
        self.styles.as_ref()?.get(x)?.as_ref()
    }

    pub fn is_styled(&self) -> bool {
        self.style_at(0).is_some()
    }
}

/// Point-in-time capture of a session's visible screen.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ScreenSnapshot {
    pub lines: Vec<ScreenLine>,
}

impl ScreenSnapshot {
    pub fn new(lines: Vec<ScreenLine>) -> Self {
        Self { lines }
    }

    /// Snapshot without any style information.
    pub fn plain<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(ScreenLine::plain).collect(),
        }
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn has_style(&self) -> bool {
        self.lines.iter().any(ScreenLine::is_styled)
    }

    /// Build a styled snapshot from a parsed vt100 screen.
    ///
    /// Wide-character continuation cells are skipped so that `styles` stays
    /// aligned with the characters of `text`.
    pub fn from_vt100(screen: &vt100::Screen) -> Self {
        let (rows, cols) = screen.size();
        let mut lines = Vec::with_capacity(rows as usize);

        for row in 0..rows {
            let mut text = String::new();
            let mut styles = Vec::new();
            for col in 0..cols {
                let Some(cell) = screen.cell(row, col) else {
                    continue;
                };
                if cell.is_wide_continuation() {
                    continue;
                }
                let style = style_from_vt100(cell);
                let contents: &str = &cell.contents();
                let contents = if contents.is_empty() { " " } else { contents };
                for ch in contents.chars() {
                    text.push(ch);
                    styles.push(Some(style));
                }
            }
            lines.push(ScreenLine::styled(text, styles));
        }

        Self { lines }
    }
}

fn style_from_vt100(cell: &vt100::Cell) -> CellStyle {
    CellStyle {
        attrs: Attrs {
            bold: cell.bold(),
            italic: cell.italic(),
            underline: cell.underline(),
            faint: cell.dim(),
            inverse: cell.inverse(),
            // vt100 does not track strikethrough.
            strikethrough: false,
        },
        fg: convert_color(cell.fgcolor()),
        bg: convert_color(cell.bgcolor()),
    }
}

fn convert_color(color: vt100::Color) -> Option<Color> {
    match color {
        vt100::Color::Default => None,
        vt100::Color::Idx(n) => Some(Color::Standard(n)),
        vt100::Color::Rgb(r, g, b) => Some(Color::Rgb(r, g, b)),
    }
}

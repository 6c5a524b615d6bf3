mod cell;
mod render;

pub use cell::{Attrs, CellStyle, Color, ScreenLine, ScreenSnapshot};
pub use render::{render_line, render_snapshot, sgr_sequence};

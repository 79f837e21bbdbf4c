use clap::builder::styling::{AnsiColor, Color, Style, Styles};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const HEADING: Style = fg(AnsiColor::Yellow).bold();
const FLAG: Style = fg(AnsiColor::Cyan).bold();
const VALUE: Style = fg(AnsiColor::Green);
const FAULT: Style = fg(AnsiColor::Red).bold();

/// Help and error colors of the `imagegw` binary.
pub const STYLES: Styles = Styles::styled()
    .header(HEADING.underline())
    .usage(HEADING)
    .literal(FLAG)
    .placeholder(VALUE)
    .valid(VALUE.bold())
    .error(FAULT)
    .invalid(FAULT);

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

const fn fg(color: AnsiColor) -> Style {
    Style::new().fg_color(Some(Color::Ansi(color)))
}

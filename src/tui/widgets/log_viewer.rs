//! Log viewer widget

use ratatui::{
    prelude::*,
    widgets::{Block, Widget},
};

/// Scrolling view over output lines, following the tail unless scrolled up.
pub struct LogViewer<'a> {
    lines: Vec<&'a str>,
    block: Option<Block<'a>>,
    /// Lines scrolled up from the bottom.
    scroll: usize,
    highlight_pattern: Option<&'a str>,
}

impl<'a> LogViewer<'a> {
    pub fn new<I>(lines: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self {
            lines: lines.into_iter().collect(),
            block: None,
            scroll: 0,
            highlight_pattern: None,
        }
    }

    pub fn block(mut self, block: Block<'a>) -> Self {
        self.block = Some(block);
        self
    }

    pub fn scroll(mut self, scroll: usize) -> Self {
        self.scroll = scroll;
        self
    }

    pub fn highlight(mut self, pattern: &'a str) -> Self {
        self.highlight_pattern = Some(pattern);
        self
    }
}

/// Color for a line of test output.
pub fn line_style(line: &str) -> Style {
    let trimmed = line.trim_start();
    if trimmed.starts_with("--- FAIL")
        || trimmed.starts_with("FAIL")
        || trimmed.starts_with("panic:")
        || line.starts_with('!')
    {
        Style::default().fg(Color::Red)
    } else if trimmed.starts_with("--- SKIP") {
        Style::default().fg(Color::DarkGray)
    } else if trimmed.starts_with("--- PASS")
        || trimmed.starts_with("ok ")
        || trimmed.starts_with("PASS")
        || line.starts_with('✓')
    {
        Style::default().fg(Color::Green)
    } else if line.starts_with("===") || line.starts_with('▶') {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default().fg(Color::Gray)
    }
}

impl Widget for LogViewer<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let inner_area = match self.block {
            Some(b) => {
                let inner = b.inner(area);
                b.render(area, buf);
                inner
            }
            None => area,
        };

        if self.lines.is_empty() || inner_area.height == 0 || inner_area.width == 0 {
            return;
        }

        let visible_height = inner_area.height as usize;
        let max_offset = self.lines.len().saturating_sub(visible_height);
        let offset = max_offset.saturating_sub(self.scroll);

        for (i, line) in self.lines.iter().skip(offset).take(visible_height).enumerate() {
            let y = inner_area.y + i as u16;
            let mut style = line_style(line);

            if let Some(pattern) = self.highlight_pattern {
                if !pattern.is_empty() && line.to_lowercase().contains(&pattern.to_lowercase()) {
                    style = style.bg(Color::DarkGray);
                }
            }

            buf.set_stringn(inner_area.x, y, line, inner_area.width as usize, style);
        }

        // Scroll indicator
        if self.scroll > 0 && max_offset > 0 {
            let indicator = format!("↑{}", self.scroll.min(max_offset));
            let width = indicator.chars().count() as u16;
            if width < inner_area.width {
                let x = inner_area.x + inner_area.width - width;
                buf.set_string(x, inner_area.y, &indicator, Style::default().fg(Color::DarkGray));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(buf: &Buffer, y: u16) -> String {
        (0..buf.area.width)
            .map(|x| buf.get(x, y).symbol().to_string())
            .collect::<String>()
            .trim_end()
            .to_string()
    }

    #[test]
    fn test_follows_tail() {
        let lines = ["one", "two", "three", "four"];
        let area = Rect::new(0, 0, 10, 2);
        let mut buf = Buffer::empty(area);
        LogViewer::new(lines).render(area, &mut buf);

        assert_eq!(row(&buf, 0), "three");
        assert_eq!(row(&buf, 1), "four");
    }

    #[test]
    fn test_scrolled_view() {
        let lines = ["one", "two", "three", "four"];
        let area = Rect::new(0, 0, 10, 2);
        let mut buf = Buffer::empty(area);
        LogViewer::new(lines).scroll(2).render(area, &mut buf);

        assert_eq!(row(&buf, 0), "one     ↑2");
        assert_eq!(row(&buf, 1), "two");
    }

    #[test]
    fn test_line_colors() {
        assert_eq!(line_style("--- FAIL: TestX (0.00s)").fg, Some(Color::Red));
        assert_eq!(line_style("ok  \texample.com/m/a\t0.1s").fg, Some(Color::Green));
        assert_eq!(line_style("=== example.com/m/a · TestX").fg, Some(Color::Cyan));
        assert_eq!(line_style("hello").fg, Some(Color::Gray));
    }
}

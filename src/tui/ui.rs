//! TUI rendering

use std::time::{Duration, Instant};

use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Clear, Gauge, List, ListItem, ListState, Paragraph, Wrap},
};

use super::app::{App, Focus, Phase};
use super::events::HELP;
use super::widgets::LogViewer;

/// Draw the entire UI
pub fn draw(frame: &mut Frame, app: &App, now: Instant) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(10),   // Main content
            Constraint::Length(3), // Footer
        ])
        .split(frame.size());

    draw_header(frame, app, now, chunks[0]);
    draw_main(frame, app, chunks[1]);
    draw_footer(frame, app, now, chunks[2]);
    draw_toasts(frame, app);

    if let Phase::Fatal(message) = &app.phase {
        draw_error(frame, message);
    }
}

pub fn format_duration(d: Duration) -> String {
    if d >= Duration::from_secs(1) {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn elapsed(app: &App, now: Instant) -> Option<Duration> {
    match (app.is_running(), app.started_at) {
        (true, Some(start)) => Some(now.saturating_duration_since(start)),
        _ => app.last_duration,
    }
}

fn draw_header(frame: &mut Frame, app: &App, now: Instant, area: Rect) {
    let phase = match &app.phase {
        Phase::Discovering => "discovering",
        Phase::Idle => "idle",
        Phase::Running => "running",
        Phase::Fatal(_) => "error",
    };
    let title = format!(" testpulse · {phase} ");

    let counters = &app.counters;
    let mut label = format!(
        "✓ {}  ✗ {}  ⊘ {}",
        counters.passed, counters.failed, counters.skipped
    );
    if app.is_running() && app.progress.total > 0 {
        label.push_str(&format!(
            "  [{}/{}] {}",
            app.progress.index(),
            app.progress.total,
            app.progress.current.as_deref().unwrap_or("")
        ));
    }
    if let Some(d) = elapsed(app, now) {
        label.push_str(&format!("  {}", format_duration(d)));
    }

    let ratio = if app.progress.total == 0 {
        0.0
    } else {
        (app.progress.finished as f64 / app.progress.total as f64).min(1.0)
    };

    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(
            Style::default()
                .fg(if counters.failed > 0 { Color::Red } else { Color::Green })
                .bg(Color::DarkGray),
        )
        .ratio(ratio)
        .label(label);

    frame.render_widget(gauge, area);
}

fn draw_main(frame: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(45), // Test tree
            Constraint::Percentage(55), // Output and log
        ])
        .split(area);

    draw_tree(frame, app, chunks[0]);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(chunks[1]);

    draw_output(frame, app, right[0]);
    draw_log(frame, app, right[1]);
}

fn focus_style(app: &App, focus: Focus) -> Style {
    if app.focus == focus {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default()
    }
}

fn draw_tree(frame: &mut Frame, app: &App, area: Rect) {
    let rows = app.rows();
    let items: Vec<ListItem> = rows
        .iter()
        .map(|row| {
            let marker = if app.selected.contains(&(row.package.clone(), row.path.clone())) {
                "● "
            } else {
                "  "
            };
            let duration = row
                .duration
                .map(|d| format!(" {}", format_duration(d)))
                .unwrap_or_default();
            let name_style = if row.is_package() {
                Style::default().bold()
            } else {
                Style::default()
            };

            ListItem::new(Line::from(vec![
                Span::styled(marker, Style::default().fg(Color::Yellow)),
                Span::raw("  ".repeat(row.depth)),
                Span::styled(row.status.symbol(), Style::default().fg(row.status.color())),
                Span::raw(" "),
                Span::styled(row.name.clone(), name_style),
                Span::styled(duration, Style::default().fg(Color::DarkGray)),
            ]))
        })
        .collect();

    let mut title = " Tests ".to_string();
    if !app.filter.text.is_empty() {
        title = format!(" Tests [{}] ", app.filter.text);
    }
    if app.filter.failed_only {
        title.push_str("[failed] ");
    }

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(title)
                .border_style(focus_style(app, Focus::Tree)),
        )
        .highlight_style(Style::default().bg(Color::DarkGray))
        .highlight_symbol("> ");

    let mut state = ListState::default();
    if !rows.is_empty() {
        state.select(Some(app.cursor.min(rows.len() - 1)));
    }
    frame.render_stateful_widget(list, area, &mut state);
}

fn draw_output(frame: &mut Frame, app: &App, area: Rect) {
    let row = app.current_row();
    let title = row
        .as_ref()
        .map(|r| {
            if r.is_package() {
                format!(" Output: {} ", r.package)
            } else {
                format!(" Output: {} ", r.path)
            }
        })
        .unwrap_or_else(|| " Output ".to_string());
    let block = Block::default().borders(Borders::ALL).title(title);

    let lines = app.selected_output();
    if lines.is_empty() {
        let placeholder = match (&app.phase, row) {
            (Phase::Discovering, _) => "Discovering tests...",
            (_, None) => "No test selected",
            (_, Some(_)) => "No output",
        };
        let paragraph = Paragraph::new(placeholder)
            .block(block)
            .style(Style::default().fg(Color::DarkGray))
            .wrap(Wrap { trim: false });
        frame.render_widget(paragraph, area);
        return;
    }

    frame.render_widget(LogViewer::new(lines).block(block), area);
}

fn draw_log(frame: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Log ")
        .border_style(focus_style(app, Focus::Log));

    let mut viewer = LogViewer::new(app.log.iter().map(String::as_str))
        .block(block)
        .scroll(app.log_scroll);
    if !app.filter.text.is_empty() {
        viewer = viewer.highlight(&app.filter.text);
    }
    frame.render_widget(viewer, area);
}

fn draw_footer(frame: &mut Frame, app: &App, now: Instant, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(20), Constraint::Length(34)])
        .split(area);

    let help = if app.filter_input {
        Paragraph::new(format!(" /{}▏", app.filter.text))
            .style(Style::default().fg(Color::Yellow))
    } else {
        Paragraph::new(HELP).style(Style::default().fg(Color::DarkGray))
    };
    frame.render_widget(help.block(Block::default().borders(Borders::ALL)), chunks[0]);

    let mut toggles = Vec::new();
    for (on, name) in [
        (app.watching, "watch"),
        (app.flags.race, "race"),
        (app.flags.cover, "cover"),
        (app.flags.short, "short"),
    ] {
        if on {
            toggles.push(name);
        }
    }
    let mut status = if toggles.is_empty() {
        "defaults".to_string()
    } else {
        toggles.join(" ")
    };
    if !app.is_running() {
        if let Some(d) = elapsed(app, now) {
            status.push_str(&format!(" · last {}", format_duration(d)));
        }
    }

    let status_style = if app.is_running() {
        Style::default().fg(Color::Yellow)
    } else if app.counters.failed > 0 {
        Style::default().fg(Color::Red)
    } else {
        Style::default().fg(Color::Green)
    };

    let status_text = Paragraph::new(status)
        .block(Block::default().borders(Borders::ALL))
        .style(status_style)
        .alignment(Alignment::Center);
    frame.render_widget(status_text, chunks[1]);
}

fn draw_toasts(frame: &mut Frame, app: &App) {
    let screen = frame.size();
    for (i, toast) in app.toasts.iter().rev().take(3).enumerate() {
        let width = (toast.text.chars().count() as u16 + 4).min(screen.width);
        let y = 1 + (i as u16) * 3;
        if y + 3 > screen.height {
            break;
        }
        let area = Rect::new(screen.width - width, y, width, 3);
        let paragraph = Paragraph::new(toast.text.as_str())
            .block(Block::default().borders(Borders::ALL))
            .style(Style::default().fg(Color::Yellow));
        frame.render_widget(Clear, area);
        frame.render_widget(paragraph, area);
    }
}

fn draw_error(frame: &mut Frame, message: &str) {
    let area = centered_rect(60, 7, frame.size());
    let text = format!("{message}\n\nPress any key to exit.");
    let paragraph = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title(" Discovery failed "))
        .style(Style::default().fg(Color::Red))
        .wrap(Wrap { trim: false });

    frame.render_widget(Clear, area);
    frame.render_widget(paragraph, area);
}

/// Create a centered rectangle
fn centered_rect(percent_x: u16, height: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - 20) / 2),
            Constraint::Length(height),
            Constraint::Percentage((100 - 20) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Package;
    use crate::failures::FailureStore;
    use crate::test_runner::RunFlags;
    use crate::tui::app::Message;
    use ratatui::backend::TestBackend;
    use std::path::{Path, PathBuf};

    fn screen_text(terminal: &Terminal<TestBackend>) -> String {
        let buffer = terminal.backend().buffer();
        let mut text = String::new();
        for y in 0..buffer.area.height {
            for x in 0..buffer.area.width {
                text.push_str(buffer.get(x, y).symbol());
            }
            text.push('\n');
        }
        text
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
    }

    #[test]
    fn test_draw_tree_and_error_state() {
        let mut app = App::new(
            Path::new("/m"),
            RunFlags::default(),
            FailureStore::new(None),
            false,
        );
        app.start();
        app.update(
            Message::Discovered(Ok(vec![Package {
                import_path: "example.com/m/calc".to_string(),
                dir: PathBuf::from("/m/calc"),
                name: "calc".to_string(),
                tests: vec!["TestAdd".to_string()],
            }])),
            Instant::now(),
        );

        let mut terminal = Terminal::new(TestBackend::new(120, 30)).unwrap();
        terminal.draw(|f| draw(f, &app, Instant::now())).unwrap();
        let text = screen_text(&terminal);
        assert!(text.contains("example.com/m/calc"));
        assert!(text.contains("TestAdd"));
        assert!(text.contains("testpulse · idle"));

        app.update(Message::Discovered(Err("go: command not found".to_string())), Instant::now());
        terminal.draw(|f| draw(f, &app, Instant::now())).unwrap();
        let text = screen_text(&terminal);
        assert!(text.contains("Discovery failed"));
        assert!(text.contains("go: command not found"));
    }
}

//! Key bindings for the dashboard

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// What a key press asks the app to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    Up,
    Down,
    First,
    Last,
    ToggleSelect,
    RunSelection,
    RunAll,
    RunFailed,
    RepeatLast,
    Rediscover,
    StartFilter,
    FilterPush(char),
    FilterPop,
    EndFilter,
    /// Clears the filter, or cancels a running batch.
    Escape,
    ToggleFailOnly,
    ToggleWatch,
    ToggleCover,
    ToggleRace,
    ToggleShort,
    OpenEditor,
    SwitchFocus,
    ScrollUp,
    ScrollDown,
}

/// Help line shown in the footer.
pub const HELP: &str = " [enter]run [space]select [a]ll [R]failed [.]repeat [/]filter [f]ail-only [w]atch [c]over [x]race [s]hort [o]pen [q]uit ";

/// Translate a key press. `filter_input` is true while typing a filter.
pub fn key_command(key: KeyEvent, filter_input: bool) -> Option<Command> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        return Some(Command::Quit);
    }
    if filter_input {
        return filter_key(key);
    }

    let command = match key.code {
        KeyCode::Char('q') => Command::Quit,
        KeyCode::Esc => Command::Escape,

        // Navigation
        KeyCode::Up | KeyCode::Char('k') => Command::Up,
        KeyCode::Down | KeyCode::Char('j') => Command::Down,
        KeyCode::Home | KeyCode::Char('g') => Command::First,
        KeyCode::End | KeyCode::Char('G') => Command::Last,
        KeyCode::PageUp => Command::ScrollUp,
        KeyCode::PageDown => Command::ScrollDown,
        KeyCode::Tab => Command::SwitchFocus,

        // Runs
        KeyCode::Char(' ') => Command::ToggleSelect,
        KeyCode::Enter => Command::RunSelection,
        KeyCode::Char('a') => Command::RunAll,
        KeyCode::Char('R') => Command::RunFailed,
        KeyCode::Char('.') => Command::RepeatLast,
        KeyCode::Char('d') => Command::Rediscover,

        // Filter
        KeyCode::Char('/') => Command::StartFilter,
        KeyCode::Char('f') => Command::ToggleFailOnly,

        // Toggles
        KeyCode::Char('w') => Command::ToggleWatch,
        KeyCode::Char('c') => Command::ToggleCover,
        KeyCode::Char('x') => Command::ToggleRace,
        KeyCode::Char('s') => Command::ToggleShort,
        KeyCode::Char('o') => Command::OpenEditor,

        _ => return None,
    };
    Some(command)
}

fn filter_key(key: KeyEvent) -> Option<Command> {
    match key.code {
        KeyCode::Esc => Some(Command::Escape),
        KeyCode::Enter => Some(Command::EndFilter),
        KeyCode::Backspace => Some(Command::FilterPop),
        KeyCode::Char(c) => Some(Command::FilterPush(c)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn test_navigation_and_runs() {
        assert_eq!(key_command(key(KeyCode::Char('j')), false), Some(Command::Down));
        assert_eq!(key_command(key(KeyCode::Up), false), Some(Command::Up));
        assert_eq!(key_command(key(KeyCode::Enter), false), Some(Command::RunSelection));
        assert_eq!(key_command(key(KeyCode::Char('R')), false), Some(Command::RunFailed));
        assert_eq!(key_command(key(KeyCode::Char('z')), false), None);
    }

    #[test]
    fn test_filter_mode_captures_letters() {
        assert_eq!(key_command(key(KeyCode::Char('q')), true), Some(Command::FilterPush('q')));
        assert_eq!(key_command(key(KeyCode::Enter), true), Some(Command::EndFilter));
        assert_eq!(key_command(key(KeyCode::Backspace), true), Some(Command::FilterPop));
    }

    #[test]
    fn test_ctrl_c_always_quits() {
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(key_command(ctrl_c, false), Some(Command::Quit));
        assert_eq!(key_command(ctrl_c, true), Some(Command::Quit));
        assert_eq!(key_command(key(KeyCode::Char('c')), false), Some(Command::ToggleCover));
    }
}

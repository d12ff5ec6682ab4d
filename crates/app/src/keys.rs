use std::time::Duration;

use crossterm::event::{self, Event, KeyCode};
use crossterm::terminal;

/// Non-blocking poll of the terminal for `target`, matched case-insensitively.
///
/// Legacy control-channel helper. The terminal is flipped into raw mode only
/// for the duration of one poll, so ordinary line-based logging between polls
/// is unaffected.
pub fn is_key_pressed(target: char) -> bool {
    let raw = terminal::enable_raw_mode().is_ok();
    let hit = poll_once(target);
    if raw {
        let _ = terminal::disable_raw_mode();
    }
    hit
}

fn poll_once(target: char) -> bool {
    if !event::poll(Duration::from_millis(0)).unwrap_or(false) {
        return false;
    }
    match event::read() {
        Ok(Event::Key(key)) => {
            matches!(key.code, KeyCode::Char(c) if c.eq_ignore_ascii_case(&target))
        }
        _ => false,
    }
}

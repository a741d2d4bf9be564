use chrono::NaiveDateTime;

use crate::models::{BlackoutWindow, BlockAction, PowerAction};

/// Whether `action` is suppressed at `now` by any of `windows`.
#[cfg(test)]
pub fn is_blocked(action: PowerAction, now: NaiveDateTime, windows: &[BlackoutWindow]) -> bool {
    blocking_window(action, now, windows).is_some()
}

/// The first window that suppresses `action` at `now`.
///
/// Windows are closed intervals. A window whose stored `block_action` cannot
/// be read blocks both actions.
pub fn blocking_window<'a>(
    action: PowerAction,
    now: NaiveDateTime,
    windows: &'a [BlackoutWindow],
) -> Option<&'a BlackoutWindow> {
    windows.iter().find(|window| {
        window.contains(now) && window.block_action().unwrap_or(BlockAction::Both).covers(action)
    })
}

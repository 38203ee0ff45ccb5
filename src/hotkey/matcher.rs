//! Combination matching
//!
//! A pure function deciding whether a live key event completes a
//! subscribed key option.

use crate::events::{KeyAction, LiveKeyEvent};

use super::keys::{KeyOption, MAX_PRE_KEYS};

/// Check whether `live` completes the combination described by `option`
pub fn matches(option: &KeyOption, live: &LiveKeyEvent) -> bool {
    if option.final_key != live.key_code {
        return false;
    }

    if live.pressed.len() > MAX_PRE_KEYS + 1 {
        return false;
    }

    let direction_ok = match live.action {
        KeyAction::Down => option.final_key_down,
        KeyAction::Up => !option.final_key_down,
        KeyAction::Cancel => false,
    };
    if !direction_ok {
        return false;
    }

    if live.repeat && !option.repeat {
        return false;
    }

    // Held keys other than the final key must be exactly the pre keys
    let mut held = 0usize;
    for code in live.pressed_codes() {
        if code == live.key_code {
            continue;
        }
        if !option.pre_keys.contains(&code) {
            return false;
        }
        held += 1;
    }
    if held != option.pre_keys.len() {
        return false;
    }

    if option.duration_ms > 0 {
        let elapsed = live.action_time.saturating_sub(live.key_down_time);
        if elapsed >= i64::from(option.duration_ms) * 1000 {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::KeyItem;

    const A: i32 = 1;
    const B: i32 = 2;
    const C: i32 = 3;
    const D: i32 = 4;

    fn live(key: i32, held: &[i32], action: KeyAction) -> LiveKeyEvent {
        LiveKeyEvent {
            key_code: key,
            pressed: held.iter().map(|&code| KeyItem { code, down_time: 0 }).collect(),
            key_down_time: 0,
            action_time: 0,
            action,
            repeat: false,
        }
    }

    fn timed(elapsed_us: i64) -> LiveKeyEvent {
        let mut event = live(C, &[A, B, C], KeyAction::Down);
        event.key_down_time = 1_000_000;
        event.action_time = 1_000_000 + elapsed_us;
        event
    }

    #[test]
    fn test_exact_chord_matches() {
        let option = KeyOption::chord(&[A, B], C);
        assert!(matches(&option, &live(C, &[A, B, C], KeyAction::Down)));
    }

    #[test]
    fn test_missing_pre_key_does_not_match() {
        let option = KeyOption::chord(&[A, B], C);
        assert!(!matches(&option, &live(C, &[A, C], KeyAction::Down)));
    }

    #[test]
    fn test_extra_key_does_not_match() {
        let option = KeyOption::chord(&[A, B], C);
        assert!(!matches(&option, &live(C, &[A, B, C, D], KeyAction::Down)));
    }

    #[test]
    fn test_wrong_direction_does_not_match() {
        let option = KeyOption::chord(&[A, B], C);
        assert!(!matches(&option, &live(C, &[A, B, C], KeyAction::Up)));
        assert!(!matches(&option, &live(C, &[A, B, C], KeyAction::Cancel)));

        let up = KeyOption::chord(&[A, B], C).with_final_key_up();
        assert!(matches(&up, &live(C, &[A, B], KeyAction::Up)));
        assert!(!matches(&up, &live(C, &[A, B, C], KeyAction::Down)));
    }

    #[test]
    fn test_wrong_final_key_does_not_match() {
        let option = KeyOption::chord(&[A, B], C);
        assert!(!matches(&option, &live(D, &[A, B, D], KeyAction::Down)));
    }

    #[test]
    fn test_too_many_held_keys_rejected() {
        let option = KeyOption::chord(&[A, B], C);
        assert!(!matches(&option, &live(C, &[A, B, C, 10, 11, 12], KeyAction::Down)));
    }

    #[test]
    fn test_duration_is_a_completion_window() {
        let option = KeyOption::chord(&[A, B], C).with_duration(500);
        assert!(matches(&option, &timed(100_000)));
        assert!(matches(&option, &timed(400_000)));
        assert!(!matches(&option, &timed(500_000)));
        assert!(!matches(&option, &timed(600_000)));
    }

    #[test]
    fn test_zero_duration_is_unconstrained() {
        let option = KeyOption::chord(&[A, B], C);
        assert!(matches(&option, &timed(60_000_000)));
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let option = KeyOption::chord(&[A, B], C).with_duration(500);
        let mut event = live(C, &[A, B, C], KeyAction::Down);

        // Elapsed time saturates high: outside any window
        event.key_down_time = i64::MIN;
        event.action_time = i64::MAX;
        assert!(!matches(&option, &event));

        // A clock that went backwards saturates low: inside the window
        event.key_down_time = i64::MAX;
        event.action_time = i64::MIN;
        assert!(matches(&option, &event));
    }

    #[test]
    fn test_repeat_flag() {
        let mut event = live(C, &[A, C], KeyAction::Down);
        event.repeat = true;
        assert!(matches(&KeyOption::chord(&[A], C), &event));
        assert!(!matches(&KeyOption::chord(&[A], C).with_repeat(false), &event));
    }
}

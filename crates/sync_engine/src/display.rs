use serde::Serialize;
use shared::domain::UserId;

use crate::unreads::UnreadCounts;

/// What a channel entry should show, derived from current snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DisplayState {
    Typing { users: Vec<UserId> },
    UnreadBadge { msgs: u32, mentions: u32 },
    Muted,
    Idle,
}

/// Typing wins, then mentions (even in a muted channel), then the muted
/// marker, then plain unread messages.
pub fn display_state(typing_users: &[UserId], counts: UnreadCounts, muted: bool) -> DisplayState {
    if !typing_users.is_empty() {
        return DisplayState::Typing {
            users: typing_users.to_vec(),
        };
    }
    let badge = DisplayState::UnreadBadge {
        msgs: counts.msg_count,
        mentions: counts.mention_count,
    };
    if counts.mention_count > 0 {
        badge
    } else if muted {
        DisplayState::Muted
    } else if counts.msg_count > 0 {
        badge
    } else {
        DisplayState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_overrides_unread_badge() {
        let state = display_state(&[UserId::from("bob")], UnreadCounts::new(4, 2), false);
        assert_eq!(
            state,
            DisplayState::Typing {
                users: vec![UserId::from("bob")]
            }
        );
    }

    #[test]
    fn mentions_show_through_mute_but_plain_unreads_do_not() {
        assert_eq!(
            display_state(&[], UnreadCounts::new(3, 1), true),
            DisplayState::UnreadBadge { msgs: 3, mentions: 1 }
        );
        assert_eq!(display_state(&[], UnreadCounts::new(3, 0), true), DisplayState::Muted);
    }

    #[test]
    fn quiet_channel_is_idle() {
        assert_eq!(display_state(&[], UnreadCounts::default(), false), DisplayState::Idle);
        assert_eq!(
            display_state(&[], UnreadCounts::new(1, 0), false),
            DisplayState::UnreadBadge { msgs: 1, mentions: 0 }
        );
    }
}

use std::fmt::Write as _;

use backend_sdk::Message;
use chrono::Local;
use serde::Serialize;

use super::buffer::Window;
use super::live::badge_text;
use super::viewport::ScrollDirective;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Contact,
    Agent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DisplayItem {
    pub id: i64,
    pub side: Side,
    pub text: String,
    pub meta: String,
}

/// What a surface draws for the open conversation.
///
/// While the reader is browsing, a live insert leaves `items` and `window`
/// alone and only bumps `new_messages`. `total` is buffer bookkeeping for the
/// status line and does grow with it.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayModel {
    pub items: Vec<DisplayItem>,
    pub loading_older: bool,
    pub conversation_start: bool,
    pub new_messages: Option<String>,
    pub scroll: ScrollDirective,
    /// Records buffered, including those past the window.
    pub total: usize,
    pub window: Window,
}

impl Default for DisplayModel {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            loading_older: false,
            conversation_start: false,
            new_messages: None,
            scroll: ScrollDirective::Keep,
            total: 0,
            window: Window::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderFlags {
    pub older_in_flight: bool,
    pub has_more: bool,
    pub unseen: usize,
    pub scroll: ScrollDirective,
}

pub fn render(slice: &[Message], window: Window, total: usize, flags: RenderFlags) -> DisplayModel {
    DisplayModel {
        items: slice.iter().map(display_item).collect(),
        loading_older: flags.older_in_flight && flags.has_more,
        conversation_start: !flags.has_more && total > 0,
        new_messages: badge_text(flags.unseen),
        scroll: flags.scroll,
        total,
        window,
    }
}

fn display_item(message: &Message) -> DisplayItem {
    DisplayItem {
        id: message.id,
        side: if message.is_from_contact() {
            Side::Contact
        } else {
            Side::Agent
        },
        text: message.text.clone(),
        meta: format_meta(message),
    }
}

pub fn format_meta(message: &Message) -> String {
    let local = message.timestamp.with_timezone(&Local);
    format!("{} • {}", message.sender, local.format("%Y-%m-%d %H:%M:%S"))
}

/// Plain-text rendering used by the command line surface.
pub fn to_text(model: &DisplayModel) -> String {
    let mut out = String::new();
    if model.loading_older {
        out.push_str("  … loading older messages\n");
    }
    if model.conversation_start {
        out.push_str("  ── start of conversation ──\n");
    }
    for item in &model.items {
        let marker = match item.side {
            Side::Contact => '<',
            Side::Agent => '>',
        };
        let _ = writeln!(out, "{marker} {}", item.text);
        let _ = writeln!(out, "    {}", item.meta);
    }
    if let Some(badge) = &model.new_messages {
        let _ = writeln!(out, "  [{badge}]");
    }
    let _ = writeln!(
        out,
        "  showing {} of {} messages ({})",
        model.window.len(),
        model.total,
        model.window
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::livechat::buffer::tests::run;

    fn flags(older_in_flight: bool, has_more: bool, unseen: usize) -> RenderFlags {
        RenderFlags {
            older_in_flight,
            has_more,
            unseen,
            scroll: ScrollDirective::ToBottom,
        }
    }

    #[test]
    fn maps_senders_to_sides_and_meta() {
        let slice = run(1, 2);
        let model = render(&slice, Window { start: 0, end: 2 }, 2, flags(false, true, 0));
        assert_eq!(model.items[0].side, Side::Contact);
        assert_eq!(model.items[1].side, Side::Agent);
        assert!(model.items[0].meta.starts_with("user • "));
        assert!(!model.conversation_start);
        assert_eq!(model.new_messages, None);
    }

    #[test]
    fn indicators_follow_pager_flags() {
        let slice = run(1, 3);
        let window = Window { start: 0, end: 3 };
        assert!(render(&slice, window, 3, flags(true, true, 0)).loading_older);
        assert!(!render(&slice, window, 3, flags(true, false, 0)).loading_older);
        assert!(render(&slice, window, 3, flags(false, false, 0)).conversation_start);
        assert!(!render(&[], Window::default(), 0, flags(false, false, 0)).conversation_start);
        assert_eq!(
            render(&slice, window, 3, flags(false, true, 4)).new_messages.as_deref(),
            Some("4 new messages")
        );
    }

    #[test]
    fn text_form_lists_items_and_window() {
        let slice = run(1, 2);
        let text = to_text(&render(
            &slice,
            Window { start: 3, end: 5 },
            9,
            flags(false, false, 1),
        ));
        assert!(text.contains("< m1"));
        assert!(text.contains("> m2"));
        assert!(text.contains("[1 new message]"));
        assert!(text.contains("showing 2 of 9 messages ([3, 5))"));
    }
}

//! Livechat message viewer: a sliding window over a keyset-paginated,
//! live-appended message buffer.
//!
//! The synchronous pieces ([`buffer`], [`pager`], [`viewport`], [`live`],
//! [`render`]) hold no IO. [`controller::LivechatController`] ties them
//! together and emits commands; [`session::LivechatSession`] runs those
//! commands on one tokio task.

pub mod buffer;
pub mod controller;
pub mod directory;
pub mod live;
pub mod pager;
pub mod render;
pub mod session;
pub mod viewport;

use std::time::Duration;

pub use buffer::{LiveOrdering, MessageBuffer, ViewMode, Window, DEFAULT_WINDOW_SIZE};
pub use controller::{Command, LiveTicket, LivechatController};
pub use directory::ConversationDirectory;
pub use render::{DisplayItem, DisplayModel, Side};
pub use session::{LivechatSession, SessionInput, SessionView};
pub use viewport::{ScrollDirective, ScrollMetrics, DEFAULT_SCROLL_DEBOUNCE, DEFAULT_SCROLL_THRESHOLD};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LivechatSettings {
    pub window_size: usize,
    pub scroll_threshold: f64,
    pub scroll_debounce: Duration,
    pub live_ordering: LiveOrdering,
}

impl Default for LivechatSettings {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            scroll_threshold: DEFAULT_SCROLL_THRESHOLD,
            scroll_debounce: DEFAULT_SCROLL_DEBOUNCE,
            live_ordering: LiveOrdering::Append,
        }
    }
}

//! Live inserts for the open conversation.

use backend_sdk::{ConversationId, FeedError, LiveFeed, Message, SubscriptionHandle};
use tracing::{debug, info};

use super::buffer::{AppendOutcome, MessageBuffer, Placement, ViewMode};
use super::viewport::{ScrollDirective, ScrollMetrics};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LiveOutcome {
    /// Not for the open conversation, or already buffered.
    Ignored,
    /// Rendered at the tail; the surface should scroll down.
    Followed,
    /// Rendered around the current window without moving the reader. When
    /// the window is full the record lands past it and counts as unseen.
    Extended { directive: ScrollDirective },
    /// Buffered only; the rendered window is untouched.
    Unseen { count: usize },
}

/// Integrates one pushed record into `buffer`.
///
/// `metrics` is the last scroll geometry the surface reported; it decides
/// whether a reader at the live edge is pulled down to the new record.
pub fn apply_insert(
    buffer: &mut MessageBuffer,
    record: Message,
    metrics: ScrollMetrics,
    threshold: f64,
) -> LiveOutcome {
    if buffer.conversation() != Some(&record.contact_id) {
        debug!(
            target: "inbox::livechat::live",
            other = %record.contact_id,
            "insert for a conversation that is not open"
        );
        return LiveOutcome::Ignored;
    }
    let id = record.id;
    if matches!(
        buffer.append_live(record),
        AppendOutcome::Duplicate | AppendOutcome::BeforeHead
    ) {
        return LiveOutcome::Ignored;
    }

    match buffer.view_mode() {
        ViewMode::LiveEdge => {
            if metrics.near_bottom(threshold) {
                buffer.place(Placement::FollowTail);
                LiveOutcome::Followed
            } else {
                buffer.place(Placement::Anchored);
                // A full window stops short of the new tail; badge it.
                if buffer.view_mode() == ViewMode::Browsing {
                    let count = buffer.note_unseen();
                    debug!(target: "inbox::livechat::live", id, unseen = count, "insert landed past the window");
                }
                LiveOutcome::Extended {
                    directive: ScrollDirective::anchored_at(metrics),
                }
            }
        }
        ViewMode::Browsing => {
            let count = buffer.note_unseen();
            debug!(target: "inbox::livechat::live", id, unseen = count, "insert held back while browsing");
            LiveOutcome::Unseen { count }
        }
    }
}

/// Returns to the live edge and clears the unseen counter.
pub fn jump_to_latest(buffer: &mut MessageBuffer) {
    buffer.set_view_mode(ViewMode::LiveEdge);
    buffer.clear_unseen();
    buffer.place(Placement::FollowTail);
}

pub fn badge_text(unseen: usize) -> Option<String> {
    match unseen {
        0 => None,
        1 => Some("1 new message".to_string()),
        n => Some(format!("{n} new messages")),
    }
}

/// Holds the single live subscription of the session.
#[derive(Default)]
pub struct LiveLink {
    handle: Option<SubscriptionHandle>,
}

impl LiveLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        self.handle.as_ref().map(SubscriptionHandle::conversation)
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    /// Stops the previous subscription, then subscribes to `conversation`.
    pub async fn attach<F>(
        &mut self,
        feed: &dyn LiveFeed,
        conversation: &ConversationId,
        on_insert: F,
    ) -> Result<(), FeedError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.detach().await;
        let subscription = feed.subscribe(conversation).await?;
        self.handle = Some(subscription.start(on_insert));
        info!(target: "inbox::livechat::live", conversation = %conversation, "subscribed to inserts");
        Ok(())
    }

    pub async fn detach(&mut self) {
        if let Some(handle) = self.handle.take() {
            let conversation = handle.conversation().clone();
            handle.stop().await;
            info!(target: "inbox::livechat::live", conversation = %conversation, "unsubscribed from inserts");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::livechat::buffer::tests::{message, run};
    use crate::livechat::buffer::{LiveOrdering, Window};
    use backend_sdk::BusFeed;
    use change_bus::{Bus, LocalBus};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const AT_BOTTOM: ScrollMetrics = ScrollMetrics {
        scroll_top: 1500.0,
        client_height: 500.0,
        scroll_height: 2000.0,
    };
    const SCROLLED_UP: ScrollMetrics = ScrollMetrics {
        scroll_top: 600.0,
        client_height: 500.0,
        scroll_height: 2000.0,
    };

    fn loaded(len: i64) -> MessageBuffer {
        let mut buffer = MessageBuffer::new(15, LiveOrdering::Append);
        buffer.reset(ConversationId::new("c-1"));
        buffer.prepend_older(run(1, len)).unwrap();
        buffer.place(Placement::FollowTail);
        buffer
    }

    #[test]
    fn live_edge_near_bottom_follows_the_tail() {
        let mut buffer = loaded(30);
        let outcome = apply_insert(&mut buffer, message(31, 31), AT_BOTTOM, 100.0);
        assert_eq!(outcome, LiveOutcome::Followed);
        assert_eq!(buffer.window(), Window { start: 16, end: 31 });
        assert_eq!(buffer.view_mode(), ViewMode::LiveEdge);
    }

    #[test]
    fn live_edge_scrolled_up_keeps_the_window_start() {
        let mut buffer = loaded(30);
        let outcome = apply_insert(&mut buffer, message(31, 31), SCROLLED_UP, 100.0);
        assert!(matches!(outcome, LiveOutcome::Extended { .. }));
        assert_eq!(buffer.len(), 31);
        // The full window already reached the old end, so it does not grow.
        assert_eq!(buffer.window(), Window { start: 15, end: 30 });
        assert_eq!(buffer.view_mode(), ViewMode::Browsing);
        assert_eq!(buffer.unseen(), 1);
        assert_eq!(badge_text(buffer.unseen()).as_deref(), Some("1 new message"));
    }

    #[test]
    fn partial_window_grows_to_include_the_insert() {
        let mut buffer = loaded(5);
        apply_insert(&mut buffer, message(6, 6), SCROLLED_UP, 100.0);
        assert_eq!(buffer.window(), Window { start: 0, end: 6 });
        assert_eq!(buffer.view_mode(), ViewMode::LiveEdge);
        assert_eq!(buffer.unseen(), 0);
    }

    #[test]
    fn ordered_insert_before_the_head_is_ignored() {
        let mut buffer = MessageBuffer::new(15, LiveOrdering::Ordered);
        buffer.reset(ConversationId::new("c-1"));
        buffer.prepend_older(run(10, 40)).unwrap();
        buffer.place(Placement::FollowTail);

        let outcome = apply_insert(&mut buffer, message(99, 1), AT_BOTTOM, 100.0);
        assert_eq!(outcome, LiveOutcome::Ignored);
        assert_eq!(buffer.oldest_key(), Some(message(10, 10).key()));
        assert!(!buffer.contains(99));
    }

    #[test]
    fn browsing_only_counts_unseen() {
        let mut buffer = loaded(40);
        buffer.set_start(5);
        buffer.place(Placement::Anchored);
        let window = buffer.window();
        let visible = buffer.visible_slice().to_vec();

        assert_eq!(
            apply_insert(&mut buffer, message(41, 41), AT_BOTTOM, 100.0),
            LiveOutcome::Unseen { count: 1 }
        );
        assert_eq!(buffer.window(), window);
        assert_eq!(buffer.visible_slice(), visible.as_slice());
        assert_eq!(badge_text(buffer.unseen()).as_deref(), Some("1 new message"));

        apply_insert(&mut buffer, message(42, 42), AT_BOTTOM, 100.0);
        assert_eq!(badge_text(buffer.unseen()).as_deref(), Some("2 new messages"));

        jump_to_latest(&mut buffer);
        assert_eq!(buffer.unseen(), 0);
        assert_eq!(buffer.window(), Window { start: 27, end: 42 });
        assert_eq!(badge_text(buffer.unseen()), None);
    }

    #[test]
    fn inserts_for_other_conversations_are_ignored() {
        let mut buffer = loaded(3);
        let mut foreign = message(9, 9);
        foreign.contact_id = ConversationId::new("c-2");
        assert_eq!(apply_insert(&mut buffer, foreign, AT_BOTTOM, 100.0), LiveOutcome::Ignored);
        assert_eq!(
            apply_insert(&mut buffer, message(3, 3), AT_BOTTOM, 100.0),
            LiveOutcome::Ignored
        );
        assert_eq!(buffer.len(), 3);
    }

    #[tokio::test]
    async fn switching_detaches_the_previous_conversation() {
        let bus = Arc::new(LocalBus::new());
        let feed = BusFeed::new(bus.clone());
        let publisher = feed.publisher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut link = LiveLink::new();

        let sink = tx.clone();
        link.attach(&feed, &ConversationId::new("c-1"), move |m| {
            let _ = sink.send(m);
        })
        .await
        .unwrap();
        assert_eq!(bus.subscriber_count("room:messages:c-1"), 1);

        let sink = tx.clone();
        let mut other = message(2, 2);
        other.contact_id = ConversationId::new("c-2");
        link.attach(&feed, &ConversationId::new("c-2"), move |m| {
            let _ = sink.send(m);
        })
        .await
        .unwrap();
        assert_eq!(bus.subscriber_count("room:messages:c-1"), 0);
        assert_eq!(link.conversation().map(|c| c.as_str()), Some("c-2"));

        publisher.publish_insert(&message(1, 1)).unwrap();
        publisher.publish_insert(&other).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, 2);

        link.detach().await;
        assert!(!link.is_attached());
    }
}

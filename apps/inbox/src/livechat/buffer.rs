//! Ordered, deduplicated history of the open conversation plus the window of
//! it that is currently rendered.

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use backend_sdk::{ConversationId, Message, OrderingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_WINDOW_SIZE: usize = 15;

/// How live inserts are placed when they do not sort after the current tail.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveOrdering {
    /// Push at the tail whatever the key; out-of-order records are logged.
    #[default]
    Append,
    /// Insert at the sorted position. Records older than the head are
    /// dropped and the browsed window is never reshuffled.
    Ordered,
}

impl FromStr for LiveOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(LiveOrdering::Append),
            "ordered" => Ok(LiveOrdering::Ordered),
            other => Err(format!("unknown live ordering {other:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewMode {
    LiveEdge,
    Browsing,
}

/// Earliest message known to the backend for the open conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EarliestMarker {
    Unknown,
    /// The conversation has no messages at all.
    Empty,
    Key(OrderingKey),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("record {key} is not older than buffer head {head}")]
    NotOlder { key: OrderingKey, head: OrderingKey },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Pushed at the tail although it sorts at or before the previous tail.
    AppendedOutOfOrder,
    InsertedAt(usize),
    /// Sorts inside the window being browsed; merged once the reader is back
    /// at the live edge.
    Held,
    /// Sorts before the head; dropped so the buffer stays contiguous.
    BeforeHead,
    Duplicate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Window {
    pub start: usize,
    pub end: usize,
}

impl Window {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn contains(&self, index: usize) -> bool {
        self.range().contains(&index)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// How a render positions the window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Full render: jump to the tail while following the live edge.
    FollowTail,
    /// Keep `start` where it is; the live edge is re-derived from the end.
    Anchored,
    /// Re-clamp `start` into the buffer.
    Settle,
}

#[derive(Debug)]
pub struct MessageBuffer {
    conversation: Option<ConversationId>,
    records: Vec<Message>,
    ids: HashSet<i64>,
    held: Vec<Message>,
    earliest: EarliestMarker,
    has_more: bool,
    window_size: usize,
    start: usize,
    view_mode: ViewMode,
    unseen: usize,
    ordering: LiveOrdering,
}

impl MessageBuffer {
    pub fn new(window_size: usize, ordering: LiveOrdering) -> Self {
        Self {
            conversation: None,
            records: Vec::new(),
            ids: HashSet::new(),
            held: Vec::new(),
            earliest: EarliestMarker::Unknown,
            has_more: true,
            window_size: window_size.max(1),
            start: 0,
            view_mode: ViewMode::LiveEdge,
            unseen: 0,
            ordering,
        }
    }

    pub fn reset(&mut self, conversation: ConversationId) {
        debug!(target: "inbox::livechat::buffer", conversation = %conversation, "reset");
        self.conversation = Some(conversation);
        self.clear_contents();
    }

    /// Forgets the conversation entirely.
    pub fn clear(&mut self) {
        self.conversation = None;
        self.clear_contents();
    }

    fn clear_contents(&mut self) {
        self.records.clear();
        self.ids.clear();
        self.held.clear();
        self.earliest = EarliestMarker::Unknown;
        self.has_more = true;
        self.start = 0;
        self.view_mode = ViewMode::LiveEdge;
        self.unseen = 0;
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        self.conversation.as_ref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Message] {
        &self.records
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// Cursor for the next older page.
    pub fn oldest_key(&self) -> Option<OrderingKey> {
        self.records.first().map(Message::key)
    }

    pub fn newest_key(&self) -> Option<OrderingKey> {
        self.records.last().map(Message::key)
    }

    /// Merges an older page in front of the buffer and returns how many
    /// records were added. Every record must sort strictly before the current
    /// head; otherwise nothing is merged.
    pub fn prepend_older(&mut self, mut records: Vec<Message>) -> Result<usize, BufferError> {
        backend_sdk::model::sort_by_key(&mut records);
        if let (Some(head), Some(last)) = (self.oldest_key(), records.last()) {
            if last.key() >= head {
                return Err(BufferError::NotOlder {
                    key: last.key(),
                    head,
                });
            }
        }

        let mut seen = HashSet::with_capacity(records.len());
        records.retain(|record| !self.ids.contains(&record.id) && seen.insert(record.id));
        let added = records.len();
        self.ids.extend(seen);
        records.append(&mut self.records);
        self.records = records;
        Ok(added)
    }

    pub fn append_live(&mut self, record: Message) -> AppendOutcome {
        if self.ids.contains(&record.id) {
            debug!(target: "inbox::livechat::buffer", id = record.id, "dropping duplicate live record");
            return AppendOutcome::Duplicate;
        }
        let key = record.key();
        if self.newest_key().is_none_or(|tail| key > tail) {
            self.ids.insert(record.id);
            self.records.push(record);
            return AppendOutcome::Appended;
        }

        match self.ordering {
            LiveOrdering::Append => {
                warn!(
                    target: "inbox::livechat::buffer",
                    id = record.id,
                    key = %key,
                    tail = ?self.newest_key().map(|k| k.to_string()),
                    "live record does not sort after the tail; appending anyway"
                );
                self.ids.insert(record.id);
                self.records.push(record);
                AppendOutcome::AppendedOutOfOrder
            }
            LiveOrdering::Ordered => self.insert_sorted(record),
        }
    }

    fn insert_sorted(&mut self, record: Message) -> AppendOutcome {
        let key = record.key();
        if let Some(head) = self.oldest_key().filter(|head| key < *head) {
            warn!(
                target: "inbox::livechat::buffer",
                id = record.id,
                key = %key,
                head = %head,
                "live record sorts before the buffer head; dropping it"
            );
            return AppendOutcome::BeforeHead;
        }

        let index = self.records.partition_point(|m| m.key() < key);
        let window = self.window();
        self.ids.insert(record.id);
        if self.view_mode == ViewMode::Browsing && index > window.start && index < window.end {
            debug!(
                target: "inbox::livechat::buffer",
                id = record.id,
                index,
                window = %window,
                "holding back out-of-order record inside the browsed window"
            );
            self.held.push(record);
            return AppendOutcome::Held;
        }

        warn!(
            target: "inbox::livechat::buffer",
            id = record.id,
            key = %key,
            index,
            "live record arrived out of order; inserting at its sorted position"
        );
        self.records.insert(index, record);
        if index <= self.start {
            self.start += 1;
        }
        AppendOutcome::InsertedAt(index)
    }

    fn release_held(&mut self) {
        if self.held.is_empty() {
            return;
        }
        debug!(target: "inbox::livechat::buffer", count = self.held.len(), "merging held live records");
        for record in std::mem::take(&mut self.held) {
            let index = self.records.partition_point(|m| m.key() < record.key());
            self.records.insert(index, record);
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// Moves the window start without re-deriving the view mode; call
    /// [`place`](Self::place) afterwards.
    pub fn set_start(&mut self, start: usize) {
        self.start = start.min(self.max_start());
    }

    pub fn max_start(&self) -> usize {
        self.records.len().saturating_sub(self.window_size)
    }

    pub fn window(&self) -> Window {
        let start = self.start.min(self.records.len());
        Window {
            start,
            end: (start + self.window_size).min(self.records.len()),
        }
    }

    pub fn visible_slice(&self) -> &[Message] {
        &self.records[self.window().range()]
    }

    /// Positions the window for a render and updates the view mode.
    pub fn place(&mut self, placement: Placement) -> Window {
        if self.view_mode == ViewMode::LiveEdge {
            self.release_held();
        }
        let len = self.records.len();
        if len <= self.window_size {
            self.start = 0;
            self.view_mode = ViewMode::LiveEdge;
            return self.window();
        }
        match placement {
            Placement::FollowTail if self.view_mode == ViewMode::LiveEdge => {
                self.start = len - self.window_size;
            }
            Placement::FollowTail | Placement::Settle | Placement::Anchored => {
                self.start = self.start.min(self.max_start());
                let window = self.window();
                self.view_mode = if window.end >= len {
                    ViewMode::LiveEdge
                } else {
                    ViewMode::Browsing
                };
            }
        }
        self.window()
    }

    pub fn view_mode(&self) -> ViewMode {
        self.view_mode
    }

    pub fn set_view_mode(&mut self, mode: ViewMode) {
        self.view_mode = mode;
    }

    pub fn unseen(&self) -> usize {
        self.unseen
    }

    pub fn note_unseen(&mut self) -> usize {
        self.unseen += 1;
        self.unseen
    }

    pub fn clear_unseen(&mut self) {
        self.unseen = 0;
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn set_has_more(&mut self, more: bool) {
        self.has_more = more;
    }

    pub fn earliest(&self) -> EarliestMarker {
        self.earliest
    }

    pub fn set_earliest(&mut self, marker: EarliestMarker) {
        self.earliest = marker;
    }

    pub fn ordering(&self) -> LiveOrdering {
        self.ordering
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    pub(crate) fn message(id: i64, second: i64) -> Message {
        Message {
            id,
            contact_id: ConversationId::new("c-1"),
            sender: if id % 2 == 0 { "bot".into() } else { "user".into() },
            text: format!("m{id}"),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
                + Duration::seconds(second),
        }
    }

    pub(crate) fn run(from: i64, to: i64) -> Vec<Message> {
        (from..=to).map(|id| message(id, id)).collect()
    }

    fn buffer(window: usize) -> MessageBuffer {
        let mut buffer = MessageBuffer::new(window, LiveOrdering::Append);
        buffer.reset(ConversationId::new("c-1"));
        buffer
    }

    fn assert_invariants(buffer: &MessageBuffer) {
        let records = buffer.records();
        for pair in records.windows(2) {
            assert!(pair[0].key() <= pair[1].key(), "ordering broken at {pair:?}");
        }
        let ids: HashSet<i64> = records.iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), records.len(), "duplicate ids");
    }

    #[test]
    fn prepend_sorts_and_dedupes_the_page() {
        let mut buffer = buffer(15);
        let mut page = run(1, 5);
        page.reverse();
        page.push(message(3, 3));
        assert_eq!(buffer.prepend_older(page), Ok(5));
        assert_eq!(
            buffer.records().iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );

        assert_eq!(buffer.prepend_older(vec![message(0, -1)]), Ok(1));
        assert_eq!(buffer.oldest_key(), Some(message(0, -1).key()));
        assert_invariants(&buffer);
    }

    #[test]
    fn prepend_rejects_records_that_are_not_older() {
        let mut buffer = buffer(15);
        buffer.prepend_older(run(10, 12)).unwrap();
        let before = buffer.records().to_vec();

        let err = buffer.prepend_older(vec![message(1, 1), message(11, 11)]);
        assert!(matches!(err, Err(BufferError::NotOlder { .. })));
        assert_eq!(buffer.records(), before.as_slice());
    }

    #[test]
    fn shared_timestamps_order_by_id() {
        let mut buffer = buffer(15);
        buffer
            .prepend_older(vec![message(7, 5), message(6, 5), message(5, 5)])
            .unwrap();
        assert_eq!(
            buffer.records().iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![5, 6, 7]
        );
        assert_eq!(buffer.append_live(message(8, 5)), AppendOutcome::Appended);
        assert_invariants(&buffer);
    }

    #[test]
    fn live_duplicates_are_always_dropped() {
        let mut buffer = buffer(15);
        buffer.prepend_older(run(1, 3)).unwrap();
        assert_eq!(buffer.append_live(message(3, 3)), AppendOutcome::Duplicate);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn out_of_order_live_records_follow_the_configured_ordering() {
        let mut blind = buffer(15);
        blind.prepend_older(run(1, 4)).unwrap();
        assert_eq!(
            blind.append_live(message(9, 2)),
            AppendOutcome::AppendedOutOfOrder
        );
        assert_eq!(blind.records().last().map(|m| m.id), Some(9));

        let mut ordered = MessageBuffer::new(15, LiveOrdering::Ordered);
        ordered.reset(ConversationId::new("c-1"));
        ordered.prepend_older(run(1, 4)).unwrap();
        assert_eq!(
            ordered.append_live(message(9, 2)),
            AppendOutcome::InsertedAt(2)
        );
        assert_invariants(&ordered);
    }

    #[test]
    fn placement_rules() {
        let mut buffer = buffer(15);
        buffer.prepend_older(run(1, 10)).unwrap();
        assert_eq!(buffer.place(Placement::FollowTail), Window { start: 0, end: 10 });
        assert_eq!(buffer.view_mode(), ViewMode::LiveEdge);

        buffer.prepend_older(run(-29, 0)).unwrap();
        assert_eq!(buffer.len(), 40);
        assert_eq!(buffer.place(Placement::FollowTail), Window { start: 25, end: 40 });

        buffer.set_start(10);
        assert_eq!(buffer.place(Placement::Anchored), Window { start: 10, end: 25 });
        assert_eq!(buffer.view_mode(), ViewMode::Browsing);

        // Browsing: a full render keeps the window where the reader left it.
        assert_eq!(buffer.place(Placement::FollowTail), Window { start: 10, end: 25 });

        buffer.set_start(99);
        assert_eq!(buffer.place(Placement::Settle), Window { start: 25, end: 40 });
        assert_eq!(buffer.view_mode(), ViewMode::LiveEdge);
    }

    #[test]
    fn visible_slice_matches_the_window() {
        let mut buffer = buffer(15);
        buffer.prepend_older(run(0, 39)).unwrap();
        buffer.set_start(3);
        buffer.place(Placement::Anchored);
        let ids: Vec<i64> = buffer.visible_slice().iter().map(|m| m.id).collect();
        assert_eq!(ids, (3..18).collect::<Vec<_>>());
    }

    #[test]
    fn reset_clears_markers_and_view_state() {
        let mut buffer = buffer(5);
        buffer.prepend_older(run(1, 20)).unwrap();
        buffer.set_has_more(false);
        buffer.set_earliest(EarliestMarker::Empty);
        buffer.set_view_mode(ViewMode::Browsing);
        buffer.note_unseen();

        buffer.reset(ConversationId::new("c-2"));
        assert!(buffer.is_empty());
        assert!(buffer.has_more());
        assert_eq!(buffer.earliest(), EarliestMarker::Unknown);
        assert_eq!(buffer.view_mode(), ViewMode::LiveEdge);
        assert_eq!(buffer.unseen(), 0);
        assert_eq!(buffer.conversation().map(|c| c.as_str()), Some("c-2"));
    }

    fn ordered(window: usize, from: i64, to: i64) -> MessageBuffer {
        let mut buffer = MessageBuffer::new(window, LiveOrdering::Ordered);
        buffer.reset(ConversationId::new("c-1"));
        buffer.prepend_older(run(from, to)).unwrap();
        buffer.place(Placement::FollowTail);
        buffer
    }

    fn visible_ids(buffer: &MessageBuffer) -> Vec<i64> {
        buffer.visible_slice().iter().map(|m| m.id).collect()
    }

    #[test]
    fn ordered_live_record_before_the_head_keeps_the_cursor() {
        let mut buffer = ordered(15, 50, 80);
        assert_eq!(buffer.append_live(message(99, 10)), AppendOutcome::BeforeHead);
        assert_eq!(buffer.oldest_key(), Some(message(50, 50).key()));
        assert_eq!(buffer.len(), 31);
        assert!(!buffer.contains(99));
        assert_invariants(&buffer);
    }

    #[test]
    fn ordered_inserts_never_reshuffle_the_browsed_window() {
        let mut buffer = ordered(15, 1, 40);
        buffer.set_start(10);
        buffer.place(Placement::Anchored);
        assert_eq!(buffer.view_mode(), ViewMode::Browsing);
        assert_eq!(visible_ids(&buffer), (11..=25).collect::<Vec<_>>());

        // Lands between 15 and 16, inside the window.
        assert_eq!(buffer.append_live(message(100, 15)), AppendOutcome::Held);
        assert_eq!(buffer.append_live(message(100, 15)), AppendOutcome::Duplicate);
        // Lands in front of the window; the window moves with its records.
        assert_eq!(buffer.append_live(message(101, 5)), AppendOutcome::InsertedAt(5));
        // Lands exactly at the window start.
        assert_eq!(buffer.append_live(message(102, 10)), AppendOutcome::InsertedAt(11));
        assert_eq!(buffer.start(), 12);
        assert_eq!(visible_ids(&buffer), (11..=25).collect::<Vec<_>>());
        assert_eq!(buffer.len(), 42);
        assert_invariants(&buffer);

        buffer.set_view_mode(ViewMode::LiveEdge);
        buffer.place(Placement::FollowTail);
        assert_eq!(buffer.len(), 43);
        assert!(buffer.records().iter().any(|m| m.id == 100));
        assert_invariants(&buffer);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Debug)]
        enum Op {
            Older { count: i64 },
            Live { id: i64, second: i64 },
            Scroll { start: usize, placement: Placement },
        }

        fn op() -> impl Strategy<Value = Op> {
            let placement = prop_oneof![
                Just(Placement::FollowTail),
                Just(Placement::Anchored),
                Just(Placement::Settle),
            ];
            prop_oneof![
                (1i64..20).prop_map(|count| Op::Older { count }),
                (0i64..300, 0i64..300).prop_map(|(id, second)| Op::Live { id, second }),
                (0usize..80, placement).prop_map(|(start, placement)| Op::Scroll { start, placement }),
            ]
        }

        fn ordering() -> impl Strategy<Value = LiveOrdering> {
            prop_oneof![Just(LiveOrdering::Append), Just(LiveOrdering::Ordered)]
        }

        proptest! {
            #[test]
            fn random_histories_keep_the_buffer_consistent(
                ordering in ordering(),
                window in 1usize..20,
                ops in prop::collection::vec(op(), 1..60),
            ) {
                let mut buffer = MessageBuffer::new(window, ordering);
                buffer.reset(ConversationId::new("c-1"));
                // Older pages count down from zero; live ids and seconds are >= 0.
                let mut floor = 0i64;

                for op in ops {
                    match op {
                        Op::Older { count } => {
                            let page = ((floor - count)..floor).map(|id| message(id, id)).collect();
                            if buffer.prepend_older(page).is_ok() {
                                floor -= count;
                            }
                            buffer.place(Placement::Anchored);
                        }
                        Op::Live { id, second } => {
                            let browsing = buffer.view_mode() == ViewMode::Browsing;
                            let visible = buffer.visible_slice().to_vec();
                            buffer.append_live(message(id, second));
                            if browsing {
                                prop_assert_eq!(buffer.visible_slice(), visible.as_slice());
                            }
                        }
                        Op::Scroll { start, placement } => {
                            buffer.set_start(start);
                            let placed = buffer.place(placement);
                            prop_assert_eq!(placed.len(), buffer.len().min(window));
                            prop_assert_eq!(
                                buffer.view_mode() == ViewMode::LiveEdge,
                                placed.end >= buffer.len()
                            );
                        }
                    }

                    let unique: HashSet<i64> = buffer
                        .records
                        .iter()
                        .chain(&buffer.held)
                        .map(|m| m.id)
                        .collect();
                    prop_assert_eq!(unique.len(), buffer.records.len() + buffer.held.len());
                    prop_assert_eq!(&unique, &buffer.ids);
                    if ordering == LiveOrdering::Ordered {
                        assert_invariants(&buffer);
                    }
                    let window_now = buffer.window();
                    prop_assert!(window_now.end <= buffer.len());
                    prop_assert!(window_now.len() <= buffer.window_size());
                }
            }
        }
    }
}

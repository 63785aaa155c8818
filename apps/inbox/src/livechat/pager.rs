//! Keyset pagination over the message gateway.
//!
//! The pager never performs IO itself. It hands out [`FetchRequest`]s tagged
//! with a [`Ticket`] and later applies the matching completion to the buffer,
//! dropping completions whose ticket no longer matches the open conversation.

use std::cmp::Ordering;

use backend_sdk::{ConversationId, GatewayError, Message, MessageGateway, OrderingKey};
use tracing::{debug, error, info, warn};

use super::buffer::{EarliestMarker, MessageBuffer};

pub const INITIAL_PAGE_FLOOR: usize = 30;
pub const OLDER_PAGE_FLOOR: usize = 20;

/// Page sizes before the extra lookahead record of the limit+1 technique.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageSizes {
    pub initial: usize,
    pub older: usize,
}

impl PageSizes {
    pub fn for_window(window_size: usize) -> Self {
        Self {
            initial: (window_size * 2).max(INITIAL_PAGE_FLOOR),
            older: window_size.max(OLDER_PAGE_FLOOR),
        }
    }

    pub fn initial_limit(&self) -> usize {
        self.initial + 1
    }

    pub fn older_limit(&self) -> usize {
        self.older + 1
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub epoch: u64,
    pub conversation: ConversationId,
    pub request_id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchKind {
    Initial,
    Older { before: OrderingKey },
    EarliestMarker,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub ticket: Ticket,
    pub kind: FetchKind,
    pub limit: usize,
}

impl FetchRequest {
    /// Runs the request against `gateway`. Errors are carried in the outcome.
    pub async fn execute(&self, gateway: &dyn MessageGateway) -> FetchOutcome {
        let conversation = &self.ticket.conversation;
        match self.kind {
            FetchKind::Initial => {
                FetchOutcome::Page(gateway.fetch_messages_page(conversation, None, self.limit).await)
            }
            FetchKind::Older { before } => FetchOutcome::Page(
                gateway
                    .fetch_messages_page(conversation, Some(before), self.limit)
                    .await,
            ),
            FetchKind::EarliestMarker => {
                FetchOutcome::Marker(gateway.fetch_earliest_message(conversation).await)
            }
        }
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    Page(Result<Vec<Message>, GatewayError>),
    Marker(Result<Option<Message>, GatewayError>),
}

/// What applying a completion did to the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Initial { stored: usize },
    Older { added: usize },
    Marker,
    Failed,
    Rejected,
    Stale,
}

#[derive(Debug)]
pub struct Pager {
    sizes: PageSizes,
    epoch: u64,
    next_request: u64,
    conversation: Option<ConversationId>,
    initial: Option<Ticket>,
    older: Option<Ticket>,
    marker: Option<Ticket>,
}

impl Pager {
    pub fn new(sizes: PageSizes) -> Self {
        Self {
            sizes,
            epoch: 0,
            next_request: 0,
            conversation: None,
            initial: None,
            older: None,
            marker: None,
        }
    }

    pub fn sizes(&self) -> PageSizes {
        self.sizes
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        self.conversation.as_ref()
    }

    pub fn older_in_flight(&self) -> bool {
        self.older.is_some()
    }

    pub fn initial_in_flight(&self) -> bool {
        self.initial.is_some()
    }

    /// Starts a new epoch for `conversation`; every outstanding ticket turns stale.
    pub fn begin(&mut self, conversation: ConversationId) -> FetchRequest {
        self.epoch += 1;
        self.conversation = Some(conversation);
        self.older = None;
        self.marker = None;
        let ticket = self.ticket();
        self.initial = Some(ticket.clone());
        FetchRequest {
            ticket,
            kind: FetchKind::Initial,
            limit: self.sizes.initial_limit(),
        }
    }

    /// Drops the open conversation; late completions are discarded.
    pub fn end(&mut self) {
        self.epoch += 1;
        self.conversation = None;
        self.initial = None;
        self.older = None;
        self.marker = None;
    }

    pub fn request_marker(&mut self) -> Option<FetchRequest> {
        if self.conversation.is_none() {
            return None;
        }
        let ticket = self.ticket();
        self.marker = Some(ticket.clone());
        Some(FetchRequest {
            ticket,
            kind: FetchKind::EarliestMarker,
            limit: 1,
        })
    }

    /// Asks for the page before the buffer head. Returns `None` when a fetch
    /// is already outstanding, history is exhausted, or nothing is loaded yet.
    pub fn request_older(&mut self, buffer: &MessageBuffer) -> Option<FetchRequest> {
        if let Some(pending) = &self.older {
            debug!(
                target: "inbox::livechat::pager",
                request_id = pending.request_id,
                "older page already in flight; dropping request"
            );
            return None;
        }
        if self.conversation.is_none() || self.initial.is_some() || !buffer.has_more() {
            return None;
        }
        let before = buffer.oldest_key()?;
        let ticket = self.ticket();
        self.older = Some(ticket.clone());
        debug!(
            target: "inbox::livechat::pager",
            conversation = %ticket.conversation,
            request_id = ticket.request_id,
            before = %before,
            "requesting older page"
        );
        Some(FetchRequest {
            ticket,
            kind: FetchKind::Older { before },
            limit: self.sizes.older_limit(),
        })
    }

    pub fn is_current(&self, ticket: &Ticket) -> bool {
        ticket.epoch == self.epoch && self.conversation.as_ref() == Some(&ticket.conversation)
    }

    pub fn apply(
        &mut self,
        buffer: &mut MessageBuffer,
        request: &FetchRequest,
        outcome: FetchOutcome,
    ) -> Applied {
        let ticket = &request.ticket;
        if !self.is_current(ticket) {
            debug!(
                target: "inbox::livechat::pager",
                conversation = %ticket.conversation,
                epoch = ticket.epoch,
                current = self.epoch,
                "discarding stale completion"
            );
            return Applied::Stale;
        }
        match (request.kind, outcome) {
            (FetchKind::Initial, FetchOutcome::Page(result)) => {
                self.clear_slot(ticket, Slot::Initial);
                self.apply_initial(buffer, result)
            }
            (FetchKind::Older { .. }, FetchOutcome::Page(result)) => {
                self.clear_slot(ticket, Slot::Older);
                self.apply_older(buffer, result)
            }
            (FetchKind::EarliestMarker, FetchOutcome::Marker(result)) => {
                self.clear_slot(ticket, Slot::Marker);
                self.apply_marker(buffer, result)
            }
            (kind, _) => {
                error!(target: "inbox::livechat::pager", ?kind, "completion does not match its request");
                Applied::Failed
            }
        }
    }

    fn apply_initial(
        &mut self,
        buffer: &mut MessageBuffer,
        result: Result<Vec<Message>, GatewayError>,
    ) -> Applied {
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                warn!(target: "inbox::livechat::pager", error = %err, "initial page fetch failed");
                return Applied::Failed;
            }
        };
        let (page, more) = trim_page(page, self.sizes.initial);
        let stored = match buffer.prepend_older(page) {
            Ok(stored) => stored,
            Err(err) => return rejected(err),
        };
        buffer.set_has_more(more);
        reconcile_with_marker(buffer);
        info!(
            target: "inbox::livechat::pager",
            stored,
            base = self.sizes.initial,
            more = buffer.has_more(),
            oldest = ?buffer.oldest_key().map(|k| k.to_string()),
            "initial page loaded"
        );
        Applied::Initial { stored }
    }

    fn apply_older(
        &mut self,
        buffer: &mut MessageBuffer,
        result: Result<Vec<Message>, GatewayError>,
    ) -> Applied {
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                warn!(target: "inbox::livechat::pager", error = %err, "older page fetch failed");
                return Applied::Failed;
            }
        };
        if page.is_empty() {
            buffer.set_has_more(false);
            info!(target: "inbox::livechat::pager", "reached the start of the conversation");
            return Applied::Older { added: 0 };
        }
        let (page, more) = trim_page(page, self.sizes.older);
        let added = match buffer.prepend_older(page) {
            Ok(added) => added,
            Err(err) => return rejected(err),
        };
        buffer.set_has_more(more);
        reconcile_with_marker(buffer);
        info!(
            target: "inbox::livechat::pager",
            added,
            base = self.sizes.older,
            total = buffer.len(),
            more = buffer.has_more(),
            "older page merged"
        );
        Applied::Older { added }
    }

    fn apply_marker(
        &mut self,
        buffer: &mut MessageBuffer,
        result: Result<Option<Message>, GatewayError>,
    ) -> Applied {
        match result {
            Ok(Some(earliest)) => buffer.set_earliest(EarliestMarker::Key(earliest.key())),
            Ok(None) => buffer.set_earliest(EarliestMarker::Empty),
            Err(err) => {
                warn!(
                    target: "inbox::livechat::pager",
                    error = %err,
                    "earliest marker fetch failed; keeping page-count heuristic"
                );
                return Applied::Failed;
            }
        }
        reconcile_with_marker(buffer);
        debug!(
            target: "inbox::livechat::pager",
            marker = ?buffer.earliest(),
            more = buffer.has_more(),
            "earliest marker applied"
        );
        Applied::Marker
    }

    fn ticket(&mut self) -> Ticket {
        self.next_request += 1;
        Ticket {
            epoch: self.epoch,
            conversation: self
                .conversation
                .clone()
                .unwrap_or_else(|| ConversationId::new("")),
            request_id: self.next_request,
        }
    }

    fn clear_slot(&mut self, ticket: &Ticket, slot: Slot) {
        let held = match slot {
            Slot::Initial => &mut self.initial,
            Slot::Older => &mut self.older,
            Slot::Marker => &mut self.marker,
        };
        if held.as_ref() == Some(ticket) {
            *held = None;
        }
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Initial,
    Older,
    Marker,
}

fn rejected(err: super::buffer::BufferError) -> Applied {
    error!(target: "inbox::livechat::pager", error = %err, "gateway returned a page that is not older than the buffer");
    debug_assert!(false, "{err}");
    Applied::Rejected
}

/// Sorts ascending and applies the limit+1 lookahead: a page longer than `base`
/// loses its single oldest record and reports more history.
pub fn trim_page(mut page: Vec<Message>, base: usize) -> (Vec<Message>, bool) {
    backend_sdk::model::sort_by_key(&mut page);
    if page.len() > base {
        let excess = page.len() - base;
        page.drain(..excess);
        (page, true)
    } else {
        (page, false)
    }
}

/// The earliest marker overrides the page-count heuristic once known.
pub fn reconcile_with_marker(buffer: &mut MessageBuffer) {
    match buffer.earliest() {
        EarliestMarker::Unknown => {}
        EarliestMarker::Empty => buffer.set_has_more(false),
        EarliestMarker::Key(marker) => {
            let more = match buffer.oldest_key() {
                Some(oldest) => marker.cmp(&oldest) == Ordering::Less,
                None => false,
            };
            buffer.set_has_more(more);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::livechat::buffer::tests::{message, run};
    use crate::livechat::buffer::LiveOrdering;

    fn setup() -> (Pager, MessageBuffer, FetchRequest) {
        let mut pager = Pager::new(PageSizes::for_window(15));
        let mut buffer = MessageBuffer::new(15, LiveOrdering::Append);
        buffer.reset(ConversationId::new("c-1"));
        let initial = pager.begin(ConversationId::new("c-1"));
        (pager, buffer, initial)
    }

    #[test]
    fn page_sizes_follow_the_window() {
        let sizes = PageSizes::for_window(15);
        assert_eq!(sizes, PageSizes { initial: 30, older: 20 });
        assert_eq!(sizes.initial_limit(), 31);
        assert_eq!(PageSizes::for_window(40).older_limit(), 41);
    }

    #[test]
    fn full_initial_page_drops_the_lookahead_record() {
        let (mut pager, mut buffer, initial) = setup();
        assert_eq!(initial.limit, 31);
        let mut page = run(1, 31);
        page.reverse();

        let applied = pager.apply(&mut buffer, &initial, FetchOutcome::Page(Ok(page)));
        assert_eq!(applied, Applied::Initial { stored: 30 });
        assert_eq!(buffer.len(), 30);
        assert_eq!(buffer.oldest_key(), Some(message(2, 2).key()));
        assert!(buffer.has_more());
        assert!(!pager.initial_in_flight());
    }

    #[test]
    fn short_initial_page_means_no_more_history() {
        let (mut pager, mut buffer, initial) = setup();
        pager.apply(&mut buffer, &initial, FetchOutcome::Page(Ok(run(1, 12))));
        assert!(!buffer.has_more());
    }

    #[test]
    fn marker_dominates_the_heuristic() {
        let (mut pager, mut buffer, initial) = setup();
        pager.apply(&mut buffer, &initial, FetchOutcome::Page(Ok(run(1, 5))));
        buffer.set_has_more(true);

        let marker = pager.request_marker().unwrap();
        let applied = pager.apply(
            &mut buffer,
            &marker,
            FetchOutcome::Marker(Ok(Some(message(1, 1)))),
        );
        assert_eq!(applied, Applied::Marker);
        assert!(!buffer.has_more());

        buffer.set_earliest(EarliestMarker::Key(message(0, 0).key()));
        reconcile_with_marker(&mut buffer);
        assert!(buffer.has_more());
    }

    #[test]
    fn null_marker_forces_no_more() {
        let (mut pager, mut buffer, initial) = setup();
        pager.apply(&mut buffer, &initial, FetchOutcome::Page(Ok(run(1, 31))));
        assert!(buffer.has_more());
        let marker = pager.request_marker().unwrap();
        pager.apply(&mut buffer, &marker, FetchOutcome::Marker(Ok(None)));
        assert!(!buffer.has_more());
    }

    #[test]
    fn failed_marker_keeps_the_heuristic() {
        let (mut pager, mut buffer, initial) = setup();
        pager.apply(&mut buffer, &initial, FetchOutcome::Page(Ok(run(1, 31))));
        let marker = pager.request_marker().unwrap();
        let applied = pager.apply(
            &mut buffer,
            &marker,
            FetchOutcome::Marker(Err(GatewayError::Backend("down".into()))),
        );
        assert_eq!(applied, Applied::Failed);
        assert!(buffer.has_more());
        assert_eq!(buffer.earliest(), EarliestMarker::Unknown);
    }

    #[test]
    fn older_pages_are_single_flight_and_strictly_older() {
        let (mut pager, mut buffer, initial) = setup();
        pager.apply(&mut buffer, &initial, FetchOutcome::Page(Ok(run(50, 80))));
        let head = buffer.oldest_key().unwrap();

        let first = pager.request_older(&buffer).expect("first request");
        assert_eq!(first.kind, FetchKind::Older { before: head });
        assert_eq!(first.limit, 21);
        assert!(pager.request_older(&buffer).is_none());

        let applied = pager.apply(&mut buffer, &first, FetchOutcome::Page(Ok(run(30, 50))));
        assert_eq!(applied, Applied::Older { added: 20 });
        assert!(buffer.records()[..20].iter().all(|m| m.key() < head));
        assert!(buffer.has_more());
        assert!(pager.request_older(&buffer).is_some());
    }

    #[test]
    fn failed_older_page_leaves_state_untouched() {
        let (mut pager, mut buffer, initial) = setup();
        pager.apply(&mut buffer, &initial, FetchOutcome::Page(Ok(run(50, 80))));
        let before = buffer.records().to_vec();

        let request = pager.request_older(&buffer).unwrap();
        let applied = pager.apply(
            &mut buffer,
            &request,
            FetchOutcome::Page(Err(GatewayError::Backend("timeout".into()))),
        );
        assert_eq!(applied, Applied::Failed);
        assert_eq!(buffer.records(), before.as_slice());
        assert!(buffer.has_more());
        assert!(!pager.older_in_flight());
    }

    #[test]
    fn empty_older_page_ends_history() {
        let (mut pager, mut buffer, initial) = setup();
        pager.apply(&mut buffer, &initial, FetchOutcome::Page(Ok(run(50, 80))));
        let request = pager.request_older(&buffer).unwrap();
        pager.apply(&mut buffer, &request, FetchOutcome::Page(Ok(Vec::new())));
        assert!(!buffer.has_more());
        assert!(pager.request_older(&buffer).is_none());
    }

    #[test]
    fn completions_from_an_earlier_epoch_are_discarded() {
        let (mut pager, mut buffer, initial) = setup();
        pager.apply(&mut buffer, &initial, FetchOutcome::Page(Ok(run(50, 80))));
        let request = pager.request_older(&buffer).unwrap();

        buffer.reset(ConversationId::new("c-2"));
        let next = pager.begin(ConversationId::new("c-2"));
        assert!(!pager.older_in_flight());

        let applied = pager.apply(&mut buffer, &request, FetchOutcome::Page(Ok(run(30, 49))));
        assert_eq!(applied, Applied::Stale);
        assert!(buffer.is_empty());
        assert!(pager.is_current(&next.ticket));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "not older"))]
    fn overlapping_older_page_is_a_defect() {
        let (mut pager, mut buffer, initial) = setup();
        pager.apply(&mut buffer, &initial, FetchOutcome::Page(Ok(run(50, 80))));
        let request = pager.request_older(&buffer).unwrap();
        let applied = pager.apply(&mut buffer, &request, FetchOutcome::Page(Ok(run(45, 55))));
        assert_eq!(applied, Applied::Rejected);
        assert_eq!(buffer.len(), 30);
    }
}

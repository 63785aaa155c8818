use backend_sdk::{ConversationId, Message};
use tracing::{debug, trace};

use super::buffer::{MessageBuffer, Placement};
use super::live::{self, LiveOutcome};
use super::pager::{Applied, FetchKind, FetchOutcome, FetchRequest, PageSizes, Pager};
use super::render::{self, DisplayModel, RenderFlags};
use super::viewport::{ScrollAction, ScrollDirective, ScrollMetrics, Viewport};
use super::LivechatSettings;

/// Identifies one live subscription; inserts carrying an older ticket are dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveTicket {
    pub conversation: ConversationId,
    pub generation: u64,
}

/// Side effects requested by the controller.
#[derive(Debug)]
pub enum Command {
    Fetch(FetchRequest),
    Subscribe(LiveTicket),
    Unsubscribe,
    Render(DisplayModel),
}

/// State machine for the open conversation. Every method runs to completion
/// without IO and returns the commands the caller has to carry out.
#[derive(Debug)]
pub struct LivechatController {
    settings: LivechatSettings,
    buffer: MessageBuffer,
    pager: Pager,
    viewport: Viewport,
    metrics: ScrollMetrics,
    live: Option<LiveTicket>,
    generation: u64,
    held_live: Vec<Message>,
    /// Directive of the most recent render; repeated by renders that only
    /// refresh flags so a pending `ToBottom` is not replaced.
    last_scroll: ScrollDirective,
}

impl LivechatController {
    pub fn new(settings: LivechatSettings) -> Self {
        Self {
            settings,
            buffer: MessageBuffer::new(settings.window_size, settings.live_ordering),
            pager: Pager::new(PageSizes::for_window(settings.window_size)),
            viewport: Viewport::new(settings.window_size, settings.scroll_threshold),
            metrics: ScrollMetrics::default(),
            live: None,
            generation: 0,
            held_live: Vec::new(),
            last_scroll: ScrollDirective::Keep,
        }
    }

    pub fn settings(&self) -> &LivechatSettings {
        &self.settings
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        self.pager.conversation()
    }

    pub fn live_ticket(&self) -> Option<&LiveTicket> {
        self.live.as_ref()
    }

    pub fn metrics(&self) -> ScrollMetrics {
        self.metrics
    }

    /// Switches to `conversation`: drops the old subscription and buffer and
    /// asks for the newest page.
    pub fn open(&mut self, conversation: ConversationId) -> Vec<Command> {
        debug!(target: "inbox::livechat", conversation = %conversation, "opening conversation");
        self.buffer.reset(conversation.clone());
        self.held_live.clear();
        self.live = None;
        self.metrics = ScrollMetrics::default();
        let initial = self.pager.begin(conversation);
        vec![
            Command::Unsubscribe,
            self.render(ScrollDirective::ToBottom),
            Command::Fetch(initial),
        ]
    }

    /// Reloads the newest page of the open conversation; the live
    /// subscription stays attached.
    pub fn refresh(&mut self) -> Vec<Command> {
        let Some(conversation) = self.pager.conversation().cloned() else {
            return Vec::new();
        };
        debug!(target: "inbox::livechat", conversation = %conversation, "refreshing conversation");
        self.buffer.reset(conversation.clone());
        self.held_live.clear();
        vec![Command::Fetch(self.pager.begin(conversation))]
    }

    pub fn close(&mut self) -> Vec<Command> {
        self.buffer.clear();
        self.pager.end();
        self.held_live.clear();
        self.live = None;
        vec![Command::Unsubscribe, Command::Render(DisplayModel::default())]
    }

    pub fn on_fetched(&mut self, request: &FetchRequest, outcome: FetchOutcome) -> Vec<Command> {
        let had_more = self.buffer.has_more();
        let applied = self.pager.apply(&mut self.buffer, request, outcome);
        trace!(target: "inbox::livechat", ?applied, kind = ?request.kind, "fetch applied");
        match (request.kind, applied) {
            (_, Applied::Stale) => Vec::new(),
            (FetchKind::Initial, _) => self.after_initial(applied),
            (FetchKind::Older { .. }, Applied::Older { .. }) => {
                self.buffer.place(Placement::Anchored);
                vec![self.render(ScrollDirective::anchored_at(self.metrics))]
            }
            (FetchKind::EarliestMarker, _) if self.buffer.has_more() == had_more => Vec::new(),
            (FetchKind::EarliestMarker, _) => vec![self.render(self.last_scroll)],
            _ => vec![self.render(ScrollDirective::Keep)],
        }
    }

    fn after_initial(&mut self, applied: Applied) -> Vec<Command> {
        let mut commands = Vec::new();
        if matches!(applied, Applied::Initial { .. }) {
            if let Some(marker) = self.pager.request_marker() {
                commands.push(Command::Fetch(marker));
            }
        }
        let mut directive = ScrollDirective::ToBottom;
        self.buffer.place(Placement::FollowTail);
        for message in std::mem::take(&mut self.held_live) {
            if let Some(held) = self.integrate(message) {
                directive = held;
            }
        }
        let render = self.render(directive);
        commands.insert(0, render);
        if self.live.is_none() {
            if let Some(conversation) = self.pager.conversation().cloned() {
                self.generation += 1;
                let ticket = LiveTicket {
                    conversation,
                    generation: self.generation,
                };
                self.live = Some(ticket.clone());
                commands.push(Command::Subscribe(ticket));
            }
        }
        commands
    }

    /// Evaluates a settled scroll position.
    pub fn on_scroll(&mut self, metrics: ScrollMetrics) -> Vec<Command> {
        self.metrics = metrics;
        if self.pager.conversation().is_none() {
            return Vec::new();
        }
        match self
            .viewport
            .evaluate(metrics, &mut self.buffer, self.pager.older_in_flight())
        {
            ScrollAction::ShiftedBack { from, to } | ScrollAction::ShiftedForward { from, to } => {
                trace!(target: "inbox::livechat", from, to, "window shifted");
                vec![self.render(ScrollDirective::anchored_at(metrics))]
            }
            ScrollAction::RequestOlder => self.load_older(),
            ScrollAction::Idle => Vec::new(),
        }
    }

    /// Records the geometry of the latest render without evaluating it.
    pub fn note_metrics(&mut self, metrics: ScrollMetrics) {
        self.metrics = metrics;
    }

    pub fn load_older(&mut self) -> Vec<Command> {
        match self.pager.request_older(&self.buffer) {
            Some(request) => vec![
                Command::Fetch(request),
                self.render(ScrollDirective::Keep),
            ],
            None => Vec::new(),
        }
    }

    pub fn on_live(&mut self, ticket: &LiveTicket, message: Message) -> Vec<Command> {
        if self.live.as_ref() != Some(ticket) {
            debug!(
                target: "inbox::livechat",
                conversation = %ticket.conversation,
                generation = ticket.generation,
                "dropping insert from a detached subscription"
            );
            return Vec::new();
        }
        if self.pager.initial_in_flight() {
            self.held_live.push(message);
            return Vec::new();
        }
        match self.integrate(message) {
            Some(directive) => vec![self.render(directive)],
            None => Vec::new(),
        }
    }

    fn integrate(&mut self, message: Message) -> Option<ScrollDirective> {
        match live::apply_insert(
            &mut self.buffer,
            message,
            self.metrics,
            self.viewport.threshold(),
        ) {
            LiveOutcome::Ignored => None,
            LiveOutcome::Followed => Some(ScrollDirective::ToBottom),
            LiveOutcome::Extended { directive } => Some(directive),
            LiveOutcome::Unseen { .. } => Some(ScrollDirective::Keep),
        }
    }

    pub fn jump_to_latest(&mut self) -> Vec<Command> {
        if self.pager.conversation().is_none() {
            return Vec::new();
        }
        live::jump_to_latest(&mut self.buffer);
        vec![self.render(ScrollDirective::ToBottom)]
    }

    fn render(&mut self, scroll: ScrollDirective) -> Command {
        self.last_scroll = scroll;
        Command::Render(self.display(scroll))
    }

    /// Display model of the current window.
    pub fn display(&self, scroll: ScrollDirective) -> DisplayModel {
        render::render(
            self.buffer.visible_slice(),
            self.buffer.window(),
            self.buffer.len(),
            RenderFlags {
                older_in_flight: self.pager.older_in_flight(),
                has_more: self.buffer.has_more(),
                unseen: self.buffer.unseen(),
                scroll,
            },
        )
    }
}

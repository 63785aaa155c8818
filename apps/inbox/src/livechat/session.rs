//! Async driver for [`LivechatController`].
//!
//! One task owns the controller. UI input, fetch completions and live inserts
//! all arrive on channels and are handled one at a time by its `select!` loop,
//! so buffer state needs no locking. Network calls run on spawned tasks and
//! report back with the ticket they were issued under.

use std::sync::Arc;

use backend_sdk::{ConversationId, LiveFeed, Message, MessageGateway};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use super::buffer::ViewMode;
use super::controller::{Command, LiveTicket, LivechatController};
use super::live::LiveLink;
use super::pager::{FetchOutcome, FetchRequest};
use super::render::DisplayModel;
use super::viewport::{ScrollDebounce, ScrollMetrics};
use super::LivechatSettings;

#[derive(Clone, Debug, PartialEq)]
pub enum SessionInput {
    Open(ConversationId),
    /// Raw scroll event; evaluated once the position settles.
    Scroll(ScrollMetrics),
    /// Geometry after the surface applied a render.
    Metrics(ScrollMetrics),
    LoadOlder,
    JumpToLatest,
    Refresh,
    Close,
}

/// Snapshot published after every render.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionView {
    pub revision: u64,
    pub conversation: Option<ConversationId>,
    pub model: DisplayModel,
    pub has_more: bool,
    pub view_mode: ViewMode,
    pub unseen: usize,
    /// The first page for the open conversation has not arrived yet.
    pub initial_pending: bool,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            revision: 0,
            conversation: None,
            model: DisplayModel::default(),
            has_more: false,
            view_mode: ViewMode::LiveEdge,
            unseen: 0,
            initial_pending: false,
        }
    }
}

enum SessionEvent {
    Fetched {
        request: FetchRequest,
        outcome: FetchOutcome,
    },
    Inserted {
        ticket: LiveTicket,
        message: Message,
    },
}

pub struct LivechatSession {
    inputs: mpsc::UnboundedSender<SessionInput>,
    view: watch::Receiver<SessionView>,
    task: JoinHandle<()>,
}

impl LivechatSession {
    pub fn spawn(
        gateway: Arc<dyn MessageGateway>,
        feed: Arc<dyn LiveFeed>,
        settings: LivechatSettings,
    ) -> Self {
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(SessionView::default());
        let (events, event_rx) = mpsc::unbounded_channel();
        let worker = SessionLoop {
            controller: LivechatController::new(settings),
            gateway,
            feed,
            link: LiveLink::new(),
            debounce: ScrollDebounce::new(settings.scroll_debounce),
            events,
            view: view_tx,
            revision: 0,
        };
        let task = tokio::spawn(worker.run(input_rx, event_rx));
        Self { inputs, view, task }
    }

    pub fn open(&self, conversation: impl Into<ConversationId>) {
        self.send(SessionInput::Open(conversation.into()));
    }

    pub fn scroll(&self, metrics: ScrollMetrics) {
        self.send(SessionInput::Scroll(metrics));
    }

    pub fn report_metrics(&self, metrics: ScrollMetrics) {
        self.send(SessionInput::Metrics(metrics));
    }

    pub fn load_older(&self) {
        self.send(SessionInput::LoadOlder);
    }

    pub fn jump_to_latest(&self) {
        self.send(SessionInput::JumpToLatest);
    }

    pub fn refresh(&self) {
        self.send(SessionInput::Refresh);
    }

    pub fn close(&self) {
        self.send(SessionInput::Close);
    }

    pub fn send(&self, input: SessionInput) {
        if self.inputs.send(input).is_err() {
            warn!(target: "inbox::livechat::session", "session loop is gone; input dropped");
        }
    }

    pub fn subscribe_view(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn current(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Stops the loop after it drains queued input and detaches the live feed.
    pub async fn shutdown(self) {
        drop(self.inputs);
        if let Err(err) = self.task.await {
            warn!(target: "inbox::livechat::session", error = %err, "session task ended abnormally");
        }
    }
}

struct SessionLoop {
    controller: LivechatController,
    gateway: Arc<dyn MessageGateway>,
    feed: Arc<dyn LiveFeed>,
    link: LiveLink,
    debounce: ScrollDebounce,
    events: mpsc::UnboundedSender<SessionEvent>,
    view: watch::Sender<SessionView>,
    revision: u64,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            let deadline = self.debounce.deadline();
            let commands = tokio::select! {
                biased;
                input = inputs.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    match self.debounce.take_due(Instant::now()) {
                        Some(metrics) => self.controller.on_scroll(metrics),
                        None => Vec::new(),
                    }
                }
            };
            self.execute(commands).await;
        }
        self.link.detach().await;
        debug!(target: "inbox::livechat::session", "session loop stopped");
    }

    fn handle_input(&mut self, input: SessionInput) -> Vec<Command> {
        trace!(target: "inbox::livechat::session", ?input, "input");
        match input {
            SessionInput::Open(conversation) => {
                self.debounce.cancel();
                self.controller.open(conversation)
            }
            SessionInput::Scroll(metrics) => {
                self.controller.note_metrics(metrics);
                self.debounce.push(metrics, Instant::now());
                Vec::new()
            }
            SessionInput::Metrics(metrics) => {
                self.controller.note_metrics(metrics);
                Vec::new()
            }
            SessionInput::LoadOlder => self.controller.load_older(),
            SessionInput::JumpToLatest => self.controller.jump_to_latest(),
            SessionInput::Refresh => self.controller.refresh(),
            SessionInput::Close => {
                self.debounce.cancel();
                self.controller.close()
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) -> Vec<Command> {
        match event {
            SessionEvent::Fetched { request, outcome } => {
                self.controller.on_fetched(&request, outcome)
            }
            SessionEvent::Inserted { ticket, message } => self.controller.on_live(&ticket, message),
        }
    }

    async fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Fetch(request) => {
                    let gateway = Arc::clone(&self.gateway);
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        let outcome = request.execute(gateway.as_ref()).await;
                        let _ = events.send(SessionEvent::Fetched { request, outcome });
                    });
                }
                Command::Subscribe(ticket) => {
                    let events = self.events.clone();
                    let conversation = ticket.conversation.clone();
                    let result = self
                        .link
                        .attach(self.feed.as_ref(), &conversation, move |message| {
                            let _ = events.send(SessionEvent::Inserted {
                                ticket: ticket.clone(),
                                message,
                            });
                        })
                        .await;
                    if let Err(err) = result {
                        warn!(
                            target: "inbox::livechat::session",
                            conversation = %conversation,
                            error = %err,
                            "live subscription failed"
                        );
                    }
                }
                Command::Unsubscribe => self.link.detach().await,
                Command::Render(model) => self.publish(model),
            }
        }
    }

    fn publish(&mut self, model: DisplayModel) {
        self.revision += 1;
        let buffer = self.controller.buffer();
        let view = SessionView {
            revision: self.revision,
            conversation: self.controller.conversation().cloned(),
            model,
            has_more: buffer.has_more(),
            view_mode: buffer.view_mode(),
            unseen: buffer.unseen(),
            initial_pending: self.controller.pager().initial_in_flight(),
        };
        self.view.send_replace(view);
    }
}

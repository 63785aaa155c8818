//! Maps scroll positions onto window moves and older-page requests.

use std::time::Duration;

use tokio::time::Instant;

use super::buffer::{MessageBuffer, Placement};

pub const DEFAULT_SCROLL_THRESHOLD: f64 = 100.0;
pub const DEFAULT_SCROLL_DEBOUNCE: Duration = Duration::from_millis(120);

/// Scroll geometry reported by the rendering surface, in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub client_height: f64,
    pub scroll_height: f64,
}

impl ScrollMetrics {
    pub fn new(scroll_top: f64, client_height: f64, scroll_height: f64) -> Self {
        Self {
            scroll_top,
            client_height,
            scroll_height,
        }
    }

    pub fn near_top(&self, threshold: f64) -> bool {
        self.scroll_top <= threshold
    }

    pub fn near_bottom(&self, threshold: f64) -> bool {
        self.scroll_height - self.client_height - self.scroll_top <= threshold
    }
}

/// How the surface should position its scroll offset after a render.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScrollDirective {
    ToBottom,
    /// Keep the content under the reader in place across the re-render.
    Anchor {
        previous_top: f64,
        previous_height: f64,
    },
    Keep,
}

impl ScrollDirective {
    pub fn anchored_at(metrics: ScrollMetrics) -> Self {
        ScrollDirective::Anchor {
            previous_top: metrics.scroll_top,
            previous_height: metrics.scroll_height,
        }
    }

    /// New scroll offset once the re-rendered content measures `new_height`.
    pub fn resolve(&self, current_top: f64, new_height: f64) -> f64 {
        match *self {
            ScrollDirective::ToBottom => new_height,
            ScrollDirective::Anchor {
                previous_top,
                previous_height,
            } => (previous_top + (new_height - previous_height)).max(0.0),
            ScrollDirective::Keep => current_top,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrollAction {
    ShiftedBack { from: usize, to: usize },
    ShiftedForward { from: usize, to: usize },
    RequestOlder,
    Idle,
}

#[derive(Clone, Copy, Debug)]
pub struct Viewport {
    threshold: f64,
    step: usize,
}

impl Viewport {
    pub fn new(window_size: usize, threshold: f64) -> Self {
        Self {
            threshold,
            step: (window_size / 2).max(1),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Evaluates a settled scroll position. Window shifts are applied to
    /// `buffer` directly; an older-page request is left to the caller.
    pub fn evaluate(
        &self,
        metrics: ScrollMetrics,
        buffer: &mut MessageBuffer,
        older_in_flight: bool,
    ) -> ScrollAction {
        if metrics.near_top(self.threshold) {
            let from = buffer.start();
            if from > 0 {
                let to = from.saturating_sub(self.step);
                buffer.set_start(to);
                buffer.place(Placement::Anchored);
                return ScrollAction::ShiftedBack { from, to };
            }
            if !older_in_flight && buffer.has_more() {
                return ScrollAction::RequestOlder;
            }
        }

        if metrics.near_bottom(self.threshold) {
            let from = buffer.start();
            let max_start = buffer.max_start();
            if from < max_start {
                let to = (from + self.step).min(max_start);
                buffer.set_start(to);
                buffer.place(Placement::Anchored);
                return ScrollAction::ShiftedForward { from, to };
            }
        }
        ScrollAction::Idle
    }
}

/// Trailing-edge debounce: only the last position of a burst is evaluated,
/// once the burst has been quiet for `interval`.
#[derive(Debug)]
pub struct ScrollDebounce {
    interval: Duration,
    pending: Option<(ScrollMetrics, Instant)>,
}

impl ScrollDebounce {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
        }
    }

    pub fn push(&mut self, metrics: ScrollMetrics, now: Instant) {
        self.pending = Some((metrics, now + self.interval));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|(_, due)| due)
    }

    pub fn take_due(&mut self, now: Instant) -> Option<ScrollMetrics> {
        match self.pending {
            Some((metrics, due)) if due <= now => {
                self.pending = None;
                Some(metrics)
            }
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::livechat::buffer::tests::run;
    use crate::livechat::buffer::{LiveOrdering, ViewMode};
    use backend_sdk::ConversationId;

    fn buffer_of(len: i64, window: usize) -> MessageBuffer {
        let mut buffer = MessageBuffer::new(window, LiveOrdering::Append);
        buffer.reset(ConversationId::new("c-1"));
        buffer.prepend_older(run(0, len - 1)).unwrap();
        buffer.place(Placement::FollowTail);
        buffer
    }

    const TOP: ScrollMetrics = ScrollMetrics {
        scroll_top: 40.0,
        client_height: 500.0,
        scroll_height: 2000.0,
    };
    const MIDDLE: ScrollMetrics = ScrollMetrics {
        scroll_top: 700.0,
        client_height: 500.0,
        scroll_height: 2000.0,
    };
    const BOTTOM: ScrollMetrics = ScrollMetrics {
        scroll_top: 1450.0,
        client_height: 500.0,
        scroll_height: 2000.0,
    };

    #[test]
    fn near_top_shifts_the_window_back_by_half() {
        let mut buffer = buffer_of(40, 15);
        buffer.set_start(10);
        buffer.place(Placement::Anchored);
        let viewport = Viewport::new(15, DEFAULT_SCROLL_THRESHOLD);

        let action = viewport.evaluate(TOP, &mut buffer, false);
        assert_eq!(action, ScrollAction::ShiftedBack { from: 10, to: 3 });
        let ids: Vec<i64> = buffer.visible_slice().iter().map(|m| m.id).collect();
        assert_eq!(ids, (3..18).collect::<Vec<_>>());
        assert_eq!(buffer.view_mode(), ViewMode::Browsing);
    }

    #[test]
    fn top_of_buffer_requests_older_unless_in_flight() {
        let mut buffer = buffer_of(40, 15);
        buffer.set_start(0);
        buffer.place(Placement::Anchored);
        let viewport = Viewport::new(15, DEFAULT_SCROLL_THRESHOLD);

        assert_eq!(viewport.evaluate(TOP, &mut buffer, false), ScrollAction::RequestOlder);
        assert_eq!(viewport.evaluate(TOP, &mut buffer, true), ScrollAction::Idle);
        buffer.set_has_more(false);
        assert_eq!(viewport.evaluate(TOP, &mut buffer, false), ScrollAction::Idle);
    }

    #[test]
    fn near_bottom_shifts_forward_clamped() {
        let mut buffer = buffer_of(40, 15);
        buffer.set_start(20);
        buffer.place(Placement::Anchored);
        let viewport = Viewport::new(15, DEFAULT_SCROLL_THRESHOLD);

        assert_eq!(
            viewport.evaluate(BOTTOM, &mut buffer, false),
            ScrollAction::ShiftedForward { from: 20, to: 25 }
        );
        assert_eq!(buffer.view_mode(), ViewMode::LiveEdge);
        assert_eq!(viewport.evaluate(BOTTOM, &mut buffer, false), ScrollAction::Idle);
        assert_eq!(viewport.evaluate(MIDDLE, &mut buffer, false), ScrollAction::Idle);
    }

    #[test]
    fn short_content_falls_through_to_the_bottom_rule() {
        let mut buffer = buffer_of(40, 15);
        buffer.set_start(0);
        buffer.place(Placement::Anchored);
        buffer.set_has_more(false);
        let viewport = Viewport::new(15, DEFAULT_SCROLL_THRESHOLD);
        let both = ScrollMetrics::new(0.0, 500.0, 550.0);

        assert_eq!(
            viewport.evaluate(both, &mut buffer, false),
            ScrollAction::ShiftedForward { from: 0, to: 7 }
        );
    }

    #[test]
    fn anchor_compensates_for_height_change() {
        let directive = ScrollDirective::anchored_at(TOP);
        assert_eq!(directive.resolve(0.0, 2600.0), 640.0);
        assert_eq!(ScrollDirective::ToBottom.resolve(10.0, 900.0), 900.0);
        assert_eq!(ScrollDirective::Keep.resolve(10.0, 900.0), 10.0);
    }

    #[test]
    fn debounce_only_yields_the_settled_position() {
        let start = Instant::now();
        let mut debounce = ScrollDebounce::new(DEFAULT_SCROLL_DEBOUNCE);
        debounce.push(TOP, start);
        debounce.push(MIDDLE, start + Duration::from_millis(50));
        assert_eq!(debounce.take_due(start + Duration::from_millis(150)), None);
        assert_eq!(
            debounce.deadline(),
            Some(start + Duration::from_millis(170))
        );
        assert_eq!(
            debounce.take_due(start + Duration::from_millis(170)),
            Some(MIDDLE)
        );
        assert_eq!(debounce.deadline(), None);
    }
}

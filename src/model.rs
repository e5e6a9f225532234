use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every stored and wire timestamp uses it.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// True if the span lies entirely inside the closed range `[from, to]`.
    pub fn within(&self, from: Ms, to: Ms) -> bool {
        self.start >= from && self.end <= to
    }
}

/// A tutor-published slot a student can claim exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub owner_id: String,
    pub span: Span,
    pub held: bool,
    /// Set together with `held`; the reconciler ages held windows by it.
    pub held_at: Option<Ms>,
}

impl AvailabilityWindow {
    pub fn open(id: Ulid, owner_id: impl Into<String>, span: Span) -> Self {
        Self {
            id,
            owner_id: owner_id.into(),
            span,
            held: false,
            held_at: None,
        }
    }
}

/// The durable record of a successful claim. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub window_id: Ulid,
    pub student_id: String,
    pub tutor_id: String,
    pub span: Span,
    pub booked_at: Ms,
}

/// All windows of one tutor, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct OwnerWindows {
    pub owner_id: String,
    pub windows: Vec<AvailabilityWindow>,
}

impl OwnerWindows {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            windows: Vec::new(),
        }
    }

    /// Insert window maintaining sort order by span.start.
    pub fn insert_window(&mut self, window: AvailabilityWindow) {
        let pos = self
            .windows
            .binary_search_by_key(&window.span.start, |w| w.span.start)
            .unwrap_or_else(|e| e);
        self.windows.insert(pos, window);
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    pub fn window(&self, id: Ulid) -> Option<&AvailabilityWindow> {
        self.windows.iter().find(|w| w.id == id)
    }

    pub fn window_mut(&mut self, id: Ulid) -> Option<&mut AvailabilityWindow> {
        self.windows.iter_mut().find(|w| w.id == id)
    }

    /// Windows fully inside `[from, to]`. Binary search skips everything
    /// starting before `from`; a window starting after `to` can't end by `to`.
    pub fn within(&self, from: Ms, to: Ms) -> impl Iterator<Item = &AvailabilityWindow> {
        let lo = self.windows.partition_point(|w| w.span.start < from);
        let hi = self.windows.partition_point(|w| w.span.start <= to).max(lo);
        self.windows[lo..hi]
            .iter()
            .filter(move |w| w.span.end <= to)
    }

    pub fn open_windows(&self) -> impl Iterator<Item = &AvailabilityWindow> {
        self.windows.iter().filter(|w| !w.held)
    }
}

/// Interval Store log records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowEvent {
    Put {
        window: AvailabilityWindow,
    },
    Held {
        id: Ulid,
        owner_id: String,
        at: Ms,
    },
    Released {
        id: Ulid,
        owner_id: String,
    },
    Removed {
        id: Ulid,
        owner_id: String,
    },
}

impl WindowEvent {
    pub fn owner_id(&self) -> &str {
        match self {
            WindowEvent::Put { window } => &window.owner_id,
            WindowEvent::Held { owner_id, .. }
            | WindowEvent::Released { owner_id, .. }
            | WindowEvent::Removed { owner_id, .. } => owner_id,
        }
    }
}

/// Booking Store log records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingEvent {
    Inserted { booking: Booking },
}

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

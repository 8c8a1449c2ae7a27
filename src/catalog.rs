use std::path::Path;

use crate::limits::MAX_SLOTS_PER_DAY;
use crate::model::{MINUTES_PER_DAY, Minutes, TimeSlot};

/// The institutional grid used when no slot file is configured.
const DEFAULT_GRID: [TimeSlot; 9] = [
    TimeSlot::new(8, 30, 90, true),
    TimeSlot::new(10, 0, 15, false),
    TimeSlot::new(10, 15, 90, true),
    TimeSlot::new(11, 45, 75, false),
    TimeSlot::new(13, 0, 90, true),
    TimeSlot::new(14, 30, 15, false),
    TimeSlot::new(14, 45, 90, true),
    TimeSlot::new(16, 15, 15, false),
    TimeSlot::new(16, 30, 90, true),
];

/// Ordered, immutable sequence of the day's time slots. Identical for every
/// date; shared behind an `Arc` and never mutated after start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCatalog {
    slots: Vec<TimeSlot>,
}

impl Default for SlotCatalog {
    fn default() -> Self {
        Self {
            slots: DEFAULT_GRID.to_vec(),
        }
    }
}

impl SlotCatalog {
    /// Validate and wrap a grid. Starts must be non-decreasing and no two
    /// bookable slots may overlap; breaks may overlap anything.
    pub fn new(slots: Vec<TimeSlot>) -> Result<Self, CatalogError> {
        if slots.is_empty() {
            return Err(CatalogError::Empty);
        }
        if slots.len() > MAX_SLOTS_PER_DAY {
            return Err(CatalogError::TooManySlots(slots.len()));
        }

        let mut prev_start: Minutes = 0;
        let mut bookable_end: Option<(usize, Minutes)> = None;

        for (i, slot) in slots.iter().enumerate() {
            if slot.start_hour >= 24 || slot.start_minute >= 60 {
                return Err(CatalogError::BadStart(i));
            }
            if slot.duration_minutes == 0 {
                return Err(CatalogError::ZeroDuration(i));
            }
            if slot.end_offset() > MINUTES_PER_DAY {
                return Err(CatalogError::PastMidnight(i));
            }
            if slot.start_offset() < prev_start {
                return Err(CatalogError::OutOfOrder(i));
            }
            prev_start = slot.start_offset();

            if slot.bookable {
                if let Some((j, end)) = bookable_end
                    && end > slot.start_offset()
                {
                    return Err(CatalogError::BookableOverlap(j, i));
                }
                // Starts are sorted, so the furthest bookable end is the only one to compare against.
                if bookable_end.is_none_or(|(_, end)| slot.end_offset() > end) {
                    bookable_end = Some((i, slot.end_offset()));
                }
            }
        }

        Ok(Self { slots })
    }

    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let slots: Vec<TimeSlot> =
            serde_json::from_str(json).map_err(|e| CatalogError::Json(e.to_string()))?;
        Self::new(slots)
    }

    /// Load the grid from a JSON array of
    /// `{start_hour, start_minute, duration_minutes, bookable}` objects.
    pub fn from_json_file(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Every slot of the day, breaks included, in catalog order.
    pub fn list_slots(&self) -> &[TimeSlot] {
        &self.slots
    }

    pub fn bookable(&self) -> impl Iterator<Item = &TimeSlot> {
        self.slots.iter().filter(|s| s.bookable)
    }

    /// Slot starting exactly at `start`. A bookable slot wins over a break
    /// sharing the same start.
    pub fn slot_at(&self, start: Minutes) -> Option<&TimeSlot> {
        let mut at = self.slots.iter().filter(|s| s.start_offset() == start);
        let first = at.next()?;
        if first.bookable {
            return Some(first);
        }
        at.find(|s| s.bookable).or(Some(first))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    Empty,
    TooManySlots(usize),
    BadStart(usize),
    ZeroDuration(usize),
    PastMidnight(usize),
    OutOfOrder(usize),
    BookableOverlap(usize, usize),
    Io(String),
    Json(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Empty => write!(f, "slot catalog is empty"),
            CatalogError::TooManySlots(n) => {
                write!(f, "slot catalog has {n} slots (max {MAX_SLOTS_PER_DAY})")
            }
            CatalogError::BadStart(i) => write!(f, "slot {i}: start time out of range"),
            CatalogError::ZeroDuration(i) => write!(f, "slot {i}: zero duration"),
            CatalogError::PastMidnight(i) => write!(f, "slot {i}: ends after midnight"),
            CatalogError::OutOfOrder(i) => {
                write!(f, "slot {i}: starts before the previous slot")
            }
            CatalogError::BookableOverlap(a, b) => {
                write!(f, "bookable slots {a} and {b} overlap")
            }
            CatalogError::Io(e) => write!(f, "cannot read slot catalog: {e}"),
            CatalogError::Json(e) => write!(f, "bad slot catalog: {e}"),
        }
    }
}

impl std::error::Error for CatalogError {}

use chrono::NaiveDate;
use ulid::Ulid;

use crate::catalog::SlotCatalog;
use crate::model::*;

use super::conflict::check_slot;
use super::error::Unavailable;
use super::EngineError;

// ── Availability ──────────────────────────────────────────────────

/// Can `slot` be booked in `room` on `date` given `existing`?
///
/// False when the room is switched off, the slot is a break, or an active
/// (pending or confirmed) reservation overlaps it under the half-open rule.
/// Cancelled reservations never block. Pure: no side effects.
pub fn is_bookable(room: &Room, date: NaiveDate, slot: &TimeSlot, existing: &[Reservation]) -> bool {
    check_slot(room, date, slot, existing, None).is_ok()
}

/// The catalog's bookable slots for `room` on `date`, in catalog order.
pub fn list_bookable_slots(
    catalog: &SlotCatalog,
    room: &Room,
    date: NaiveDate,
    existing: &[Reservation],
) -> Vec<TimeSlot> {
    catalog
        .list_slots()
        .iter()
        .filter(|slot| is_bookable(room, date, slot, existing))
        .copied()
        .collect()
}

/// State of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Taken(Ulid),
    Break,
    RoomDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotView {
    pub slot: TimeSlot,
    pub state: SlotState,
}

/// Every catalog slot for a room/day with the reason it is or is not free.
pub fn day_grid(
    catalog: &SlotCatalog,
    room: &Room,
    date: NaiveDate,
    existing: &[Reservation],
) -> Vec<SlotView> {
    catalog
        .list_slots()
        .iter()
        .map(|slot| {
            let state = match check_slot(room, date, slot, existing, None) {
                Ok(()) => SlotState::Free,
                Err(EngineError::SlotUnavailable(Unavailable::Conflict { with, .. })) => {
                    SlotState::Taken(with)
                }
                Err(EngineError::SlotUnavailable(Unavailable::RoomDisabled(_))) => {
                    SlotState::RoomDisabled
                }
                Err(_) => SlotState::Break,
            };
            SlotView { slot: *slot, state }
        })
        .collect()
}

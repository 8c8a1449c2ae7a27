//! Reservation state machine.
//!
//! ```text
//!   create ──▶ PENDING ──confirm──▶ CONFIRMED
//!                 │                     │
//!                 └──cancel──▶ CANCELLED ◀──cancel──┘
//! ```
//!
//! Every function validates fully before building the new value; the input
//! reservation is never modified. Authorization is checked before state, so
//! an actor without the capability always sees `Forbidden`.

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_slot, normalize_description};
use super::policy::{require, Capability};
use super::EngineError;

/// Only confirmed accounts may request reservations.
pub fn ensure_eligible(requester: &User) -> Result<(), EngineError> {
    if requester.status != AccountStatus::Confirmed {
        return Err(EngineError::RequesterNotEligible(requester.id));
    }
    Ok(())
}

/// Build a new PENDING reservation. `existing` is the room/day snapshot the
/// overlap scan runs against.
pub fn create(
    id: Ulid,
    room: &Room,
    requester: &User,
    date: NaiveDate,
    slot: &TimeSlot,
    description: Option<String>,
    existing: &[Reservation],
) -> Result<Reservation, EngineError> {
    ensure_eligible(requester)?;
    check_slot(room, date, slot, existing, None)?;
    let description = normalize_description(description)?;

    Ok(Reservation {
        id,
        room_id: room.id,
        requester_id: requester.id,
        date,
        span: slot.span(),
        description,
        status: ReservationStatus::Pending,
    })
}

/// PENDING → CONFIRMED, admins only.
pub fn confirm(reservation: &Reservation, actor: &Actor) -> Result<Reservation, EngineError> {
    require(actor, Capability::ConfirmReservation, Some(reservation.requester_id))?;
    if reservation.status != ReservationStatus::Pending {
        return Err(EngineError::InvalidTransition {
            status: reservation.status,
            action: "confirm",
        });
    }
    Ok(Reservation {
        status: ReservationStatus::Confirmed,
        ..reservation.clone()
    })
}

/// PENDING | CONFIRMED → CANCELLED, by an admin or the requester. Cancelling
/// twice is an error, not a no-op.
pub fn cancel(reservation: &Reservation, actor: &Actor) -> Result<Reservation, EngineError> {
    require(actor, Capability::CancelReservation, Some(reservation.requester_id))?;
    if !reservation.is_active() {
        return Err(EngineError::InvalidTransition {
            status: reservation.status,
            action: "cancel",
        });
    }
    Ok(Reservation {
        status: ReservationStatus::Cancelled,
        ..reservation.clone()
    })
}

/// Move a live reservation to another date/slot in the same room, admins
/// only. Runs the same check as `create`, ignoring the reservation itself,
/// and keeps the current status.
pub fn reschedule(
    reservation: &Reservation,
    actor: &Actor,
    room: &Room,
    date: NaiveDate,
    slot: &TimeSlot,
    existing: &[Reservation],
) -> Result<Reservation, EngineError> {
    require(actor, Capability::RescheduleReservation, Some(reservation.requester_id))?;
    if !reservation.is_active() {
        return Err(EngineError::InvalidTransition {
            status: reservation.status,
            action: "reschedule",
        });
    }
    debug_assert_eq!(room.id, reservation.room_id);
    check_slot(room, date, slot, existing, Some(reservation.id))?;

    Ok(Reservation {
        date,
        span: slot.span(),
        ..reservation.clone()
    })
}

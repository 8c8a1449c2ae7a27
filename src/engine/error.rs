use ulid::Ulid;

use crate::model::{AccountStatus, Minutes, ReservationStatus, Span};

use super::policy::Capability;

/// Why a slot cannot be booked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unavailable {
    /// Room switched off by an administrator.
    RoomDisabled(Ulid),
    /// Slot is a break in the grid.
    NotBookable(Span),
    /// No catalog slot starts at this offset.
    UnknownSlot(Minutes),
    /// Overlaps an active reservation.
    Conflict { span: Span, with: Ulid },
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    SlotUnavailable(Unavailable),
    RequesterNotEligible(Ulid),
    /// `action` is not allowed from `status`.
    InvalidTransition {
        status: ReservationStatus,
        action: &'static str,
    },
    /// Account review outside PENDING→CONFIRMED|REJECTED, REJECTED→CONFIRMED.
    InvalidAccountTransition {
        from: AccountStatus,
        to: AccountStatus,
    },
    Forbidden(Capability),
    HasActiveReservations(Ulid),
    /// A room names a location that does not exist.
    UnknownLocation(String),
    /// A location still has rooms.
    LocationInUse(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotUnavailable(reason) => match reason {
                Unavailable::RoomDisabled(id) => write!(f, "slot unavailable: room {id} is disabled"),
                Unavailable::NotBookable(span) => write!(f, "slot unavailable: {span} is not bookable"),
                Unavailable::UnknownSlot(start) => write!(
                    f,
                    "slot unavailable: no slot starts at {:02}:{:02}",
                    start / 60,
                    start % 60
                ),
                Unavailable::Conflict { span, with } => {
                    write!(f, "slot unavailable: {span} conflicts with reservation {with}")
                }
            },
            EngineError::RequesterNotEligible(id) => {
                write!(f, "requester {id} not eligible: account not confirmed")
            }
            EngineError::InvalidTransition { status, action } => {
                write!(f, "invalid transition: cannot {action} a {status} reservation")
            }
            EngineError::InvalidAccountTransition { from, to } => write!(
                f,
                "invalid account transition: {} -> {}",
                from.as_str(),
                to.as_str()
            ),
            EngineError::Forbidden(cap) => {
                write!(f, "forbidden: {} requires {}", cap.as_str(), cap.requirement())
            }
            EngineError::HasActiveReservations(id) => {
                write!(f, "cannot delete room {id}: has active reservations")
            }
            EngineError::UnknownLocation(name) => write!(f, "unknown location: {name}"),
            EngineError::LocationInUse(id) => {
                write!(f, "cannot delete location {id}: rooms are still assigned to it")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

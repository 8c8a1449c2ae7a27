use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;
use super::error::Unavailable;

/// First active reservation of `room_id` on `date` overlapping `span`,
/// skipping `exclude`. Entries for other rooms or dates are ignored so a
/// caller may pass a broader snapshot.
pub fn first_conflict<'a>(
    room_id: Ulid,
    date: NaiveDate,
    span: &Span,
    existing: &'a [Reservation],
    exclude: Option<Ulid>,
) -> Option<&'a Reservation> {
    existing.iter().find(|r| {
        r.room_id == room_id
            && r.date == date
            && r.is_active()
            && Some(r.id) != exclude
            && r.span.overlaps(span)
    })
}

/// The full bookability check shared by create and reschedule.
pub(crate) fn check_slot(
    room: &Room,
    date: NaiveDate,
    slot: &TimeSlot,
    existing: &[Reservation],
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if !room.available {
        return Err(EngineError::SlotUnavailable(Unavailable::RoomDisabled(room.id)));
    }
    let span = slot.span();
    if !slot.bookable {
        return Err(EngineError::SlotUnavailable(Unavailable::NotBookable(span)));
    }
    if let Some(taken) = first_conflict(room.id, date, &span, existing, exclude) {
        return Err(EngineError::SlotUnavailable(Unavailable::Conflict {
            span,
            with: taken.id,
        }));
    }
    Ok(())
}

/// Trim the description; blank becomes `None`.
pub(crate) fn normalize_description(
    description: Option<String>,
) -> Result<Option<String>, EngineError> {
    let Some(text) = description else {
        return Ok(None);
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(Some(trimmed.to_string()))
}

pub(crate) fn validate_location(location: &Location) -> Result<(), EngineError> {
    if location.name.trim().is_empty() {
        return Err(EngineError::LimitExceeded("location name empty"));
    }
    if location.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("location name too long"));
    }
    Ok(())
}

pub(crate) fn validate_room(room: &Room) -> Result<(), EngineError> {
    if room.name.is_empty() {
        return Err(EngineError::LimitExceeded("room name empty"));
    }
    if room.name.len() > MAX_NAME_LEN || room.location.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    if room.description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("room description too long"));
    }
    Ok(())
}

pub(crate) fn validate_user(user: &User) -> Result<(), EngineError> {
    if user.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("user name too long"));
    }
    if user.email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    Ok(())
}

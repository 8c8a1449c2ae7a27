use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since local midnight. The only time-of-day type.
pub type Minutes = u32;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Half-open interval `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> Minutes {
        self.end - self.start
    }

    /// Touching intervals (`self.end == other.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Minutes) -> bool {
        self.start <= t && t < self.end
    }
}

fn write_hhmm(f: &mut fmt::Formatter<'_>, m: Minutes) -> fmt::Result {
    write!(f, "{:02}:{:02}", m / 60, m % 60)
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hhmm(f, self.start)?;
        f.write_str("-")?;
        write_hhmm(f, self.end)
    }
}

/// One entry of the daily booking grid. Breaks are present in the grid
/// but never offered for booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start_hour: u8,
    pub start_minute: u8,
    pub duration_minutes: u16,
    pub bookable: bool,
}

impl TimeSlot {
    pub const fn new(start_hour: u8, start_minute: u8, duration_minutes: u16, bookable: bool) -> Self {
        Self {
            start_hour,
            start_minute,
            duration_minutes,
            bookable,
        }
    }

    pub const fn start_offset(&self) -> Minutes {
        self.start_hour as Minutes * 60 + self.start_minute as Minutes
    }

    pub const fn end_offset(&self) -> Minutes {
        self.start_offset() + self.duration_minutes as Minutes
    }

    pub fn span(&self) -> Span {
        Span::new(self.start_offset(), self.end_offset())
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hhmm(f, self.start_offset())?;
        f.write_str("-")?;
        write_hhmm(f, self.end_offset())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub location: String,
    /// Organization-level switch, independent of bookings.
    pub available: bool,
}

/// Partial room update; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub available: Option<bool>,
}

impl RoomChanges {
    pub fn apply(self, room: &mut Room) {
        if let Some(name) = self.name {
            room.name = name;
        }
        if let Some(description) = self.description {
            room.description = description;
        }
        if let Some(location) = self.location {
            room.location = location;
        }
        if let Some(available) = self.available {
            room.available = available;
        }
    }
}

/// An administrator-managed place rooms are assigned to. Rooms refer to
/// it by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "MEMBER",
            Role::Admin => "ADMIN",
        }
    }

    /// `PROFESSOR` is accepted as the legacy name of `MEMBER`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MEMBER" | "PROFESSOR" => Some(Role::Member),
            "ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Account approval state, distinct from reservation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Pending => "PENDING",
            AccountStatus::Confirmed => "CONFIRMED",
            AccountStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(AccountStatus::Pending),
            "CONFIRMED" => Some(AccountStatus::Confirmed),
            "REJECTED" => Some(AccountStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub status: AccountStatus,
}

impl User {
    pub fn actor(&self) -> Actor {
        Actor {
            id: self.id,
            role: self.role,
        }
    }
}

/// The user invoking a lifecycle operation. Passed explicitly, never read
/// from ambient session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(ReservationStatus::Pending),
            "CONFIRMED" => Some(ReservationStatus::Confirmed),
            "CANCELLED" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }

    /// Active reservations hold their slot; cancelled ones free it.
    pub fn is_active(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    pub requester_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub description: Option<String>,
    pub status: ReservationStatus,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// A room plus its reservations, indexed by date. Each day is kept sorted
/// by `span.start`.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub days: BTreeMap<NaiveDate, Vec<Reservation>>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            days: BTreeMap::new(),
        }
    }

    /// Insert reservation maintaining per-day sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let day = self.days.entry(reservation.date).or_default();
        let pos = day
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        day.insert(pos, reservation);
    }

    /// Remove reservation by id, dropping the day bucket once it is empty.
    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let (date, pos) = self.days.iter().find_map(|(date, day)| {
            day.iter().position(|r| r.id == id).map(|pos| (*date, pos))
        })?;
        let day = self.days.get_mut(&date)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(removed)
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.days
            .values_mut()
            .flat_map(|day| day.iter_mut())
            .find(|r| r.id == id)
    }

    /// All reservations (any status) on `date`, sorted by start.
    pub fn day(&self, date: NaiveDate) -> &[Reservation] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All reservations in (date, start) order.
    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.days.values().flat_map(|day| day.iter())
    }

    pub fn reservation_count(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }

    pub fn active_count(&self) -> usize {
        self.reservations().filter(|r| r.is_active()).count()
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LocationCreated {
        id: Ulid,
        name: String,
    },
    /// Rooms located at `from` move to `to`.
    LocationRenamed {
        id: Ulid,
        from: String,
        to: String,
    },
    LocationDeleted {
        id: Ulid,
    },
    RoomCreated {
        id: Ulid,
        name: String,
        description: String,
        location: String,
        available: bool,
    },
    RoomUpdated {
        id: Ulid,
        name: String,
        description: String,
        location: String,
        available: bool,
    },
    RoomDeleted {
        id: Ulid,
    },
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
        status: AccountStatus,
    },
    AccountReviewed {
        id: Ulid,
        status: AccountStatus,
    },
    ReservationCreated {
        id: Ulid,
        room_id: Ulid,
        requester_id: Ulid,
        date: NaiveDate,
        span: Span,
        description: Option<String>,
    },
    ReservationConfirmed {
        id: Ulid,
        room_id: Ulid,
    },
    ReservationCancelled {
        id: Ulid,
        room_id: Ulid,
    },
    ReservationRescheduled {
        id: Ulid,
        room_id: Ulid,
        date: NaiveDate,
        span: Span,
    },
}

impl Event {
    pub fn room_created(room: &Room) -> Self {
        Event::RoomCreated {
            id: room.id,
            name: room.name.clone(),
            description: room.description.clone(),
            location: room.location.clone(),
            available: room.available,
        }
    }

    pub fn room_updated(room: &Room) -> Self {
        Event::RoomUpdated {
            id: room.id,
            name: room.name.clone(),
            description: room.description.clone(),
            location: room.location.clone(),
            available: room.available,
        }
    }

    pub fn user_registered(user: &User) -> Self {
        Event::UserRegistered {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role,
            status: user.status,
        }
    }

    pub fn reservation_created(r: &Reservation) -> Self {
        Event::ReservationCreated {
            id: r.id,
            room_id: r.room_id,
            requester_id: r.requester_id,
            date: r.date,
            span: r.span,
            description: r.description.clone(),
        }
    }

    /// Room whose channel this event is published on, if any.
    pub fn room_id(&self) -> Option<Ulid> {
        match self {
            Event::RoomCreated { id, .. }
            | Event::RoomUpdated { id, .. }
            | Event::RoomDeleted { id } => Some(*id),
            Event::ReservationCreated { room_id, .. }
            | Event::ReservationConfirmed { room_id, .. }
            | Event::ReservationCancelled { room_id, .. }
            | Event::ReservationRescheduled { room_id, .. } => Some(*room_id),
            Event::LocationCreated { .. }
            | Event::LocationRenamed { .. }
            | Event::LocationDeleted { .. }
            | Event::UserRegistered { .. }
            | Event::AccountReviewed { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Filter for listing reservations across rooms. `None` fields match all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub room_id: Option<Ulid>,
    pub requester_id: Option<Ulid>,
    pub location: Option<String>,
    pub status: Option<ReservationStatus>,
    pub from: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl ReservationFilter {
    pub fn matches(&self, room: &Room, r: &Reservation) -> bool {
        self.room_id.is_none_or(|id| id == r.room_id)
            && self.requester_id.is_none_or(|id| id == r.requester_id)
            && self.location.as_deref().is_none_or(|l| l == room.location)
            && self.status.is_none_or(|s| s == r.status)
            && self.from.is_none_or(|d| r.date >= d)
            && self.until.is_none_or(|d| r.date <= d)
    }
}

/// A reservation with its room and requester resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationDetail {
    pub reservation: Reservation,
    pub room: Room,
    pub requester: User,
}

/// Administrator dashboard counters.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardStats {
    pub pending_reservations: usize,
    pub pending_accounts: usize,
    pub total_rooms: usize,
    /// Rooms switched off (`available == false`).
    pub blocked_rooms: usize,
    /// Rooms with an active reservation covering the reference instant.
    pub occupied_rooms: usize,
    /// Rooms switched on and not occupied right now.
    pub available_rooms: usize,
    pub bookings_today: usize,
    pub bookings_this_week: usize,
    pub bookings_previous_week: usize,
    /// Week-over-week change in percent, one decimal.
    pub percentage_change: f64,
}

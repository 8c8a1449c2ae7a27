use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedRoomState;

/// All organization state. Rooms carry their own lock; locations, users and
/// the reservation index are plain concurrent maps. Rooms and locations
/// remember the order they were created in.
pub struct InMemoryStore {
    rooms: DashMap<Ulid, (u64, SharedRoomState)>,
    locations: DashMap<Ulid, (u64, Location)>,
    users: DashMap<Ulid, User>,
    reservation_to_room: DashMap<Ulid, Ulid>,
    next_seq: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            locations: DashMap::new(),
            users: DashMap::new(),
            reservation_to_room: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    // ── Locations ────────────────────────────────────────────

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    pub fn get_location(&self, id: &Ulid) -> Option<Location> {
        self.locations.get(id).map(|e| e.value().1.clone())
    }

    pub fn location_by_name(&self, name: &str) -> Option<Ulid> {
        self.locations
            .iter()
            .find(|e| e.value().1.name == name)
            .map(|e| *e.key())
    }

    /// Locations in creation order.
    pub fn locations(&self) -> Vec<Location> {
        let mut entries: Vec<(u64, Location)> =
            self.locations.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, l)| l).collect()
    }

    // ── Rooms ────────────────────────────────────────────────

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn contains_room(&self, id: &Ulid) -> bool {
        self.rooms.contains_key(id)
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().1.clone())
    }

    /// Room handles in creation order.
    pub fn rooms(&self) -> Vec<SharedRoomState> {
        let mut entries: Vec<(u64, SharedRoomState)> =
            self.rooms.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, rs)| rs).collect()
    }

    // ── Users ────────────────────────────────────────────────

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    /// Id of the account registered under `email`, compared case-insensitively.
    pub fn user_by_email(&self, email: &str) -> Option<Ulid> {
        self.users
            .iter()
            .find(|e| e.value().email.eq_ignore_ascii_case(email))
            .map(|e| *e.key())
    }

    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    // ── Reservation index ────────────────────────────────────

    pub fn room_for_reservation(&self, id: &Ulid) -> Option<Ulid> {
        self.reservation_to_room.get(id).map(|e| *e.value())
    }

    /// Reserve `id` for a reservation about to be created in `room_id`.
    /// False if the id is already taken.
    pub fn claim_reservation_id(&self, id: Ulid, room_id: Ulid) -> bool {
        match self.reservation_to_room.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(room_id);
                true
            }
        }
    }

    /// Undo a claim whose reservation was never created.
    pub fn release_reservation_id(&self, id: &Ulid, room_id: Ulid) {
        self.reservation_to_room.remove_if(id, |_, claimed| *claimed == room_id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event that changes the set of locations, rooms or users.
    /// Room-scoped events are ignored here; see
    /// [`apply_to_room`](Self::apply_to_room). A rename only updates the
    /// location itself; the caller applies it to each affected room.
    pub fn apply_global(&self, event: &Event) {
        match event {
            Event::LocationCreated { id, name } => {
                let location = Location {
                    id: *id,
                    name: name.clone(),
                };
                self.locations.insert(*id, (self.next_seq(), location));
            }
            Event::LocationRenamed { id, to, .. } => {
                if let Some(mut entry) = self.locations.get_mut(id) {
                    entry.1.name = to.clone();
                }
            }
            Event::LocationDeleted { id } => {
                self.locations.remove(id);
            }
            Event::RoomCreated {
                id,
                name,
                description,
                location,
                available,
            } => {
                let room = Room {
                    id: *id,
                    name: name.clone(),
                    description: description.clone(),
                    location: location.clone(),
                    available: *available,
                };
                let state = Arc::new(RwLock::new(RoomState::new(room)));
                self.rooms.insert(*id, (self.next_seq(), state));
            }
            Event::RoomDeleted { id } => {
                if self.rooms.remove(id).is_some() {
                    // Only cancelled history can remain; drop its index entries.
                    self.reservation_to_room.retain(|_, room_id| room_id != id);
                }
            }
            Event::UserRegistered {
                id,
                name,
                email,
                role,
                status,
            } => {
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                        role: *role,
                        status: *status,
                    },
                );
            }
            Event::AccountReviewed { id, status } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.status = *status;
                }
            }
            _ => {}
        }
    }

    /// Apply a room-scoped event. The caller holds the room's write lock.
    pub fn apply_to_room(&self, rs: &mut RoomState, event: &Event) {
        match event {
            Event::LocationRenamed { from, to, .. } => {
                if rs.room.location == *from {
                    rs.room.location = to.clone();
                }
            }
            Event::RoomUpdated {
                name,
                description,
                location,
                available,
                ..
            } => {
                rs.room.name = name.clone();
                rs.room.description = description.clone();
                rs.room.location = location.clone();
                rs.room.available = *available;
            }
            Event::ReservationCreated {
                id,
                room_id,
                requester_id,
                date,
                span,
                description,
            } => {
                rs.insert_reservation(Reservation {
                    id: *id,
                    room_id: *room_id,
                    requester_id: *requester_id,
                    date: *date,
                    span: *span,
                    description: description.clone(),
                    status: ReservationStatus::Pending,
                });
                self.reservation_to_room.insert(*id, *room_id);
            }
            Event::ReservationConfirmed { id, .. } => {
                if let Some(r) = rs.get_mut(*id) {
                    r.status = ReservationStatus::Confirmed;
                }
            }
            Event::ReservationCancelled { id, .. } => {
                if let Some(r) = rs.get_mut(*id) {
                    r.status = ReservationStatus::Cancelled;
                }
            }
            Event::ReservationRescheduled { id, date, span, .. } => {
                if let Some(mut r) = rs.remove_reservation(*id) {
                    r.date = *date;
                    r.span = *span;
                    rs.insert_reservation(r);
                }
            }
            Event::LocationCreated { .. }
            | Event::LocationDeleted { .. }
            | Event::RoomCreated { .. }
            | Event::RoomDeleted { .. }
            | Event::UserRegistered { .. }
            | Event::AccountReviewed { .. } => {}
        }
    }

    /// Replay one event during startup. The store is not shared yet, so the
    /// room locks are uncontended.
    pub fn replay(&self, event: &Event) {
        match event {
            Event::LocationRenamed { .. } => {
                self.apply_global(event);
                for rs in self.rooms() {
                    if let Ok(mut guard) = rs.try_write() {
                        self.apply_to_room(&mut guard, event);
                    }
                }
            }
            Event::LocationCreated { .. }
            | Event::LocationDeleted { .. }
            | Event::RoomCreated { .. }
            | Event::RoomDeleted { .. }
            | Event::UserRegistered { .. }
            | Event::AccountReviewed { .. } => self.apply_global(event),
            other => {
                let Some(room_id) = other.room_id() else {
                    return;
                };
                let Some(rs) = self.get_room(&room_id) else {
                    tracing::warn!(%room_id, "replay: event for unknown room skipped");
                    return;
                };
                if let Ok(mut guard) = rs.try_write() {
                    self.apply_to_room(&mut guard, other);
                }
            }
        }
    }
}

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, Timelike};
use ulid::Ulid;

use crate::model::*;

use super::availability::{self, SlotView};
use super::policy::{require, Capability};
use super::{Engine, EngineError};

/// Minutes since midnight of `t`.
fn minute_of_day(t: &NaiveDateTime) -> Minutes {
    t.hour() * 60 + t.minute()
}

/// Sunday on or before `date`.
fn week_start(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.weekday().num_days_from_sunday()))
}

/// Week-over-week change in percent, rounded to one decimal.
pub(super) fn percentage_change(this_week: usize, previous_week: usize) -> f64 {
    if previous_week == 0 {
        return if this_week > 0 { 100.0 } else { 0.0 };
    }
    let change = (this_week as f64 - previous_week as f64) / previous_week as f64 * 100.0;
    (change * 10.0).round() / 10.0
}

fn sort_reservations(list: &mut [Reservation]) {
    list.sort_by(|a, b| {
        (a.date, a.span.start, a.room_id).cmp(&(b.date, b.span.start, b.room_id))
    });
}

impl Engine {
    // ── Rooms ────────────────────────────────────────────────

    pub async fn get_room(&self, id: Ulid) -> Option<Room> {
        let rs = self.get_room_state(&id)?;
        let guard = rs.read().await;
        Some(guard.room.clone())
    }

    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut rooms = Vec::with_capacity(self.store.room_count());
        for rs in self.store.rooms() {
            rooms.push(rs.read().await.room.clone());
        }
        rooms
    }

    /// Locations in the order they were created.
    pub fn list_locations(&self) -> Vec<Location> {
        self.store.locations()
    }

    pub fn get_location(&self, id: Ulid) -> Option<Location> {
        self.store.get_location(&id)
    }

    // ── Accounts ─────────────────────────────────────────────

    pub fn get_user(&self, id: Ulid) -> Option<User> {
        self.store.get_user(&id)
    }

    pub fn list_users(&self, status: Option<AccountStatus>) -> Vec<User> {
        self.store
            .users()
            .into_iter()
            .filter(|u| status.is_none_or(|s| s == u.status))
            .collect()
    }

    // ── Reservations ─────────────────────────────────────────

    pub async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        let room_id = self.room_for_reservation(&id)?;
        let rs = self.get_room_state(&room_id)?;
        let guard = rs.read().await;
        guard.get(id).cloned()
    }

    /// The reservation with its room and requester, visible to its requester
    /// and to administrators.
    pub async fn reservation_detail(
        &self,
        id: Ulid,
        viewer_id: Ulid,
    ) -> Result<ReservationDetail, EngineError> {
        let viewer = self.actor(viewer_id)?;
        let room_id = self.room_for_reservation(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.get_room_state(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        let reservation = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        require(&viewer, Capability::ViewReservationDetail, Some(reservation.requester_id))?;

        let requester = self
            .store
            .get_user(&reservation.requester_id)
            .ok_or(EngineError::NotFound(reservation.requester_id))?;
        Ok(ReservationDetail {
            reservation,
            room: guard.room.clone(),
            requester,
        })
    }

    /// PENDING and CONFIRMED reservations of a room on one day, by start.
    pub async fn active_reservations(
        &self,
        room_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        let rs = self.get_room_state(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.day(date).iter().filter(|r| r.is_active()).cloned().collect())
    }

    /// Reservations across rooms matching `filter`, ordered by date, start, room.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let rooms = match filter.room_id {
            Some(id) => self.get_room_state(&id).into_iter().collect(),
            None => self.store.rooms(),
        };
        let mut out = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            out.extend(
                guard
                    .reservations()
                    .filter(|r| filter.matches(&guard.room, r))
                    .cloned(),
            );
        }
        sort_reservations(&mut out);
        out
    }

    /// All reservations requested by `user_id`, any status.
    pub async fn user_reservations(&self, user_id: Ulid) -> Vec<Reservation> {
        let filter = ReservationFilter {
            requester_id: Some(user_id),
            ..Default::default()
        };
        self.list_reservations(&filter).await
    }

    /// The user's earliest active reservation starting at or after `now`.
    pub async fn next_reservation(&self, user_id: Ulid, now: NaiveDateTime) -> Option<Reservation> {
        let today = now.date();
        let minute = minute_of_day(&now);
        let filter = ReservationFilter {
            requester_id: Some(user_id),
            from: Some(today),
            ..Default::default()
        };
        self.list_reservations(&filter)
            .await
            .into_iter()
            .find(|r| r.is_active() && (r.date > today || r.span.start >= minute))
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn list_slots(&self) -> &[TimeSlot] {
        self.catalog.list_slots()
    }

    pub async fn list_bookable_slots(
        &self,
        room_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let rs = self.get_room_state(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(availability::list_bookable_slots(
            &self.catalog,
            &guard.room,
            date,
            guard.day(date),
        ))
    }

    pub async fn day_grid(&self, room_id: Ulid, date: NaiveDate) -> Result<Vec<SlotView>, EngineError> {
        let rs = self.get_room_state(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(availability::day_grid(&self.catalog, &guard.room, date, guard.day(date)))
    }

    // ── Reporting ────────────────────────────────────────────

    /// Administrator dashboard at the instant `now`. Only active
    /// reservations count as bookings or occupy a room.
    pub async fn dashboard(&self, now: NaiveDateTime) -> DashboardStats {
        let today = now.date();
        let minute = minute_of_day(&now);
        let this_week = week_start(today);
        let previous_week = this_week - Days::new(7);
        let next_week = this_week + Days::new(7);

        let mut stats = DashboardStats {
            pending_reservations: 0,
            pending_accounts: self.list_users(Some(AccountStatus::Pending)).len(),
            total_rooms: 0,
            blocked_rooms: 0,
            occupied_rooms: 0,
            available_rooms: 0,
            bookings_today: 0,
            bookings_this_week: 0,
            bookings_previous_week: 0,
            percentage_change: 0.0,
        };

        for rs in self.store.rooms() {
            let guard = rs.read().await;
            stats.total_rooms += 1;

            let occupied = guard
                .day(today)
                .iter()
                .any(|r| r.is_active() && r.span.contains_instant(minute));
            if occupied {
                stats.occupied_rooms += 1;
            }
            if !guard.room.available {
                stats.blocked_rooms += 1;
            } else if !occupied {
                stats.available_rooms += 1;
            }

            for r in guard.reservations().filter(|r| r.is_active()) {
                if r.status == ReservationStatus::Pending {
                    stats.pending_reservations += 1;
                }
                if r.date == today {
                    stats.bookings_today += 1;
                }
                if r.date >= this_week && r.date < next_week {
                    stats.bookings_this_week += 1;
                } else if r.date >= previous_week && r.date < this_week {
                    stats.bookings_previous_week += 1;
                }
            }
        }

        stats.percentage_change =
            percentage_change(stats.bookings_this_week, stats.bookings_previous_week);
        stats
    }
}

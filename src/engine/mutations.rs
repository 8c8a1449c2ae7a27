use chrono::NaiveDate;
use tokio::sync::{oneshot, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{validate_location, validate_room, validate_user};
use super::error::Unavailable;
use super::lifecycle;
use super::policy::{require, Capability};
use super::{Engine, EngineError, WalCommand};

fn record_transition(transition: &'static str) {
    metrics::counter!(observability::RESERVATION_TRANSITIONS_TOTAL, "transition" => transition)
        .increment(1);
}

/// Count a rejected reservation attempt by reason.
fn record_rejection(err: &EngineError) {
    let reason = match err {
        EngineError::SlotUnavailable(Unavailable::Conflict { .. }) => "conflict",
        EngineError::SlotUnavailable(_) => "unavailable",
        EngineError::RequesterNotEligible(_) => "not_eligible",
        EngineError::Forbidden(_) => "forbidden",
        EngineError::InvalidTransition { .. } => "invalid_transition",
        _ => return,
    };
    metrics::counter!(observability::RESERVATION_REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

impl Engine {
    /// Write lock on a room that still exists once the lock is held.
    async fn room_write(&self, room_id: Ulid) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.write_owned().await;
        if !self.store.contains_room(&room_id) {
            return Err(EngineError::NotFound(room_id));
        }
        Ok(guard)
    }

    /// The location a room refers to must exist. Called under `location_lock`.
    fn require_location(&self, name: &str) -> Result<(), EngineError> {
        match self.store.location_by_name(name) {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownLocation(name.to_string())),
        }
    }

    // ── Locations ────────────────────────────────────────────

    pub async fn create_location(&self, actor_id: Ulid, location: Location) -> Result<Location, EngineError> {
        let actor = self.actor(actor_id)?;
        require(&actor, Capability::ManageRooms, None)?;
        validate_location(&location)?;
        let _gate = self.compaction_gate.read().await;
        let _locations = self.location_lock.lock().await;
        if self.store.location_count() >= MAX_LOCATIONS_PER_ORG {
            return Err(EngineError::LimitExceeded("too many locations"));
        }
        if self.store.get_location(&location.id).is_some() {
            return Err(EngineError::AlreadyExists(location.id));
        }
        if let Some(existing) = self.store.location_by_name(&location.name) {
            return Err(EngineError::AlreadyExists(existing));
        }

        let event = Event::LocationCreated {
            id: location.id,
            name: location.name.clone(),
        };
        self.persist_global(&event).await?;
        tracing::info!(location_id = %location.id, name = %location.name, "location created");
        Ok(location)
    }

    /// Rename a location. Every room assigned to it follows the new name.
    pub async fn rename_location(&self, actor_id: Ulid, id: Ulid, name: String) -> Result<Location, EngineError> {
        let actor = self.actor(actor_id)?;
        require(&actor, Capability::ManageRooms, None)?;
        let renamed = Location { id, name };
        validate_location(&renamed)?;
        let _gate = self.compaction_gate.read().await;
        let _locations = self.location_lock.lock().await;
        let current = self.store.get_location(&id).ok_or(EngineError::NotFound(id))?;
        if current.name == renamed.name {
            return Ok(renamed);
        }
        if let Some(existing) = self.store.location_by_name(&renamed.name) {
            return Err(EngineError::AlreadyExists(existing));
        }

        // Hold every affected room so no reader sees a half-applied rename.
        let mut affected = Vec::new();
        for rs in self.store.rooms() {
            let guard = rs.write_owned().await;
            if guard.room.location == current.name {
                affected.push(guard);
            }
        }
        let event = Event::LocationRenamed {
            id,
            from: current.name.clone(),
            to: renamed.name.clone(),
        };
        self.persist_global(&event).await?;
        for guard in &mut affected {
            self.store.apply_to_room(guard, &event);
            self.notify.send(guard.room.id, &event);
        }
        tracing::info!(location_id = %id, from = %current.name, to = %renamed.name, rooms = affected.len(), "location renamed");
        Ok(renamed)
    }

    pub async fn delete_location(&self, actor_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        let actor = self.actor(actor_id)?;
        require(&actor, Capability::ManageRooms, None)?;
        let _gate = self.compaction_gate.read().await;
        let _locations = self.location_lock.lock().await;
        let location = self.store.get_location(&id).ok_or(EngineError::NotFound(id))?;
        for rs in self.store.rooms() {
            if rs.read().await.room.location == location.name {
                return Err(EngineError::LocationInUse(id));
            }
        }

        self.persist_global(&Event::LocationDeleted { id }).await?;
        tracing::info!(location_id = %id, name = %location.name, "location deleted");
        Ok(())
    }

    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(&self, actor_id: Ulid, room: Room) -> Result<Room, EngineError> {
        let actor = self.actor(actor_id)?;
        require(&actor, Capability::ManageRooms, None)?;
        validate_room(&room)?;
        let _gate = self.compaction_gate.read().await;
        let _locations = self.location_lock.lock().await;
        self.require_location(&room.location)?;
        if self.store.room_count() >= MAX_ROOMS_PER_ORG {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.store.contains_room(&room.id) {
            return Err(EngineError::AlreadyExists(room.id));
        }

        self.persist_global(&Event::room_created(&room)).await?;
        tracing::info!(room_id = %room.id, name = %room.name, "room created");
        Ok(room)
    }

    /// Apply `changes` to the room under its write lock; unset fields keep
    /// their current value. Switching `available` off does not touch
    /// existing reservations; it only blocks new ones.
    pub async fn update_room(&self, actor_id: Ulid, id: Ulid, changes: RoomChanges) -> Result<Room, EngineError> {
        let actor = self.actor(actor_id)?;
        require(&actor, Capability::ManageRooms, None)?;
        let _gate = self.compaction_gate.read().await;
        let _locations = match changes.location {
            Some(_) => Some(self.location_lock.lock().await),
            None => None,
        };
        let mut guard = self.room_write(id).await?;

        let mut room = guard.room.clone();
        changes.apply(&mut room);
        validate_room(&room)?;
        if room.location != guard.room.location {
            self.require_location(&room.location)?;
        }

        let event = Event::room_updated(&room);
        self.persist_and_apply(id, &mut guard, &event).await?;
        tracing::info!(room_id = %id, available = room.available, "room updated");
        Ok(guard.room.clone())
    }

    pub async fn delete_room(&self, actor_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        let actor = self.actor(actor_id)?;
        require(&actor, Capability::ManageRooms, None)?;
        let _gate = self.compaction_gate.read().await;
        let guard = self.room_write(id).await?;
        if guard.active_count() > 0 {
            return Err(EngineError::HasActiveReservations(id));
        }

        self.persist_global(&Event::RoomDeleted { id }).await?;
        drop(guard);
        self.notify.remove(&id);
        tracing::info!(room_id = %id, "room deleted");
        Ok(())
    }

    // ── Accounts ─────────────────────────────────────────────

    /// Self-registration. The account always starts as a PENDING member,
    /// whatever role and status were asked for.
    pub async fn register_user(&self, user: User) -> Result<User, EngineError> {
        let user = User {
            role: Role::Member,
            status: AccountStatus::Pending,
            ..user
        };
        validate_user(&user)?;
        let _gate = self.compaction_gate.read().await;
        let _accounts = self.account_lock.lock().await;
        self.insert_user(user).await
    }

    /// Create an account with an explicit role and status. Needs an
    /// administrator, except for the first account of an empty organization.
    pub async fn provision_user(&self, actor_id: Option<Ulid>, user: User) -> Result<User, EngineError> {
        validate_user(&user)?;
        let _gate = self.compaction_gate.read().await;
        let _accounts = self.account_lock.lock().await;
        match actor_id {
            Some(actor_id) => require(&self.actor(actor_id)?, Capability::ReviewAccounts, None)?,
            None if self.store.user_count() == 0 => {
                tracing::info!(user_id = %user.id, "first account of organization");
            }
            None => return Err(EngineError::Forbidden(Capability::ReviewAccounts)),
        }
        self.insert_user(user).await
    }

    /// Uniqueness checks and commit. Called under `account_lock`.
    async fn insert_user(&self, user: User) -> Result<User, EngineError> {
        if self.store.user_count() >= MAX_USERS_PER_ORG {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.store.get_user(&user.id).is_some() {
            return Err(EngineError::AlreadyExists(user.id));
        }
        if let Some(existing) = self.store.user_by_email(&user.email) {
            return Err(EngineError::AlreadyExists(existing));
        }

        self.persist_global(&Event::user_registered(&user)).await?;
        tracing::info!(user_id = %user.id, role = user.role.as_str(), status = user.status.as_str(), "user registered");
        Ok(user)
    }

    /// Approve or reject an account.
    pub async fn review_account(
        &self,
        actor_id: Ulid,
        user_id: Ulid,
        status: AccountStatus,
    ) -> Result<User, EngineError> {
        let actor = self.actor(actor_id)?;
        require(&actor, Capability::ReviewAccounts, Some(user_id))?;
        let _gate = self.compaction_gate.read().await;
        let _accounts = self.account_lock.lock().await;
        let mut user = self
            .store
            .get_user(&user_id)
            .ok_or(EngineError::NotFound(user_id))?;

        let allowed = matches!(
            (user.status, status),
            (AccountStatus::Pending, AccountStatus::Confirmed)
                | (AccountStatus::Pending, AccountStatus::Rejected)
                | (AccountStatus::Rejected, AccountStatus::Confirmed)
        );
        if !allowed {
            return Err(EngineError::InvalidAccountTransition {
                from: user.status,
                to: status,
            });
        }

        self.persist_global(&Event::AccountReviewed { id: user_id, status })
            .await?;
        tracing::info!(%user_id, status = status.as_str(), reviewer = %actor.id, "account reviewed");
        user.status = status;
        Ok(user)
    }

    // ── Reservations ─────────────────────────────────────────

    /// Book the catalog slot starting at `start` for `requester_id`. The
    /// room's write lock spans the id claim, the overlap check and the
    /// commit, so of two racing requests for one slot exactly one succeeds
    /// and a reservation id is used at most once.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        room_id: Ulid,
        requester_id: Ulid,
        date: NaiveDate,
        start: Minutes,
        description: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let requester = self
            .store
            .get_user(&requester_id)
            .ok_or(EngineError::NotFound(requester_id))?;
        lifecycle::ensure_eligible(&requester).inspect_err(record_rejection)?;
        let slot = self.slot_at(start)?;
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.room_write(room_id).await?;
        if !self.store.claim_reservation_id(id, room_id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let created = self
            .commit_new_reservation(&mut guard, id, &requester, date, &slot, description)
            .await;
        if created.is_err() {
            self.store.release_reservation_id(&id, room_id);
        }
        let reservation = created?;
        record_transition("create");
        tracing::info!(
            reservation_id = %id, %room_id, %requester_id, %date, span = %reservation.span,
            "reservation created"
        );
        Ok(reservation)
    }

    async fn commit_new_reservation(
        &self,
        rs: &mut RoomState,
        id: Ulid,
        requester: &User,
        date: NaiveDate,
        slot: &TimeSlot,
        description: Option<String>,
    ) -> Result<Reservation, EngineError> {
        if rs.reservation_count() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }
        let reservation = lifecycle::create(id, &rs.room, requester, date, slot, description, rs.day(date))
            .inspect_err(record_rejection)?;

        let event = Event::reservation_created(&reservation);
        self.persist_and_apply(reservation.room_id, rs, &event).await?;
        Ok(reservation)
    }

    pub async fn confirm_reservation(&self, id: Ulid, actor_id: Ulid) -> Result<Reservation, EngineError> {
        let actor = self.actor(actor_id)?;
        let _gate = self.compaction_gate.read().await;
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        let updated = lifecycle::confirm(&current, &actor).inspect_err(record_rejection)?;

        let event = Event::ReservationConfirmed { id, room_id };
        self.persist_and_apply(room_id, &mut guard, &event).await?;
        record_transition("confirm");
        tracing::info!(reservation_id = %id, actor = %actor.id, "reservation confirmed");
        Ok(updated)
    }

    pub async fn cancel_reservation(&self, id: Ulid, actor_id: Ulid) -> Result<Reservation, EngineError> {
        let actor = self.actor(actor_id)?;
        let _gate = self.compaction_gate.read().await;
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        let updated = lifecycle::cancel(&current, &actor).inspect_err(record_rejection)?;

        let event = Event::ReservationCancelled { id, room_id };
        self.persist_and_apply(room_id, &mut guard, &event).await?;
        record_transition("cancel");
        tracing::info!(reservation_id = %id, actor = %actor.id, "reservation cancelled");
        Ok(updated)
    }

    /// Move a reservation to another date/slot of the same room.
    pub async fn reschedule_reservation(
        &self,
        id: Ulid,
        actor_id: Ulid,
        date: NaiveDate,
        start: Minutes,
    ) -> Result<Reservation, EngineError> {
        let actor = self.actor(actor_id)?;
        let slot = self.slot_at(start)?;
        let _gate = self.compaction_gate.read().await;
        let (room_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        let updated = lifecycle::reschedule(&current, &actor, &guard.room, date, &slot, guard.day(date))
            .inspect_err(record_rejection)?;

        let event = Event::ReservationRescheduled {
            id,
            room_id,
            date,
            span: updated.span,
        };
        self.persist_and_apply(room_id, &mut guard, &event).await?;
        record_transition("reschedule");
        tracing::info!(
            reservation_id = %id, from = %current.span, to = %updated.span, %date,
            "reservation rescheduled"
        );
        Ok(updated)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list recreating current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let mut events: Vec<Event> = self
            .store
            .locations()
            .into_iter()
            .map(|l| Event::LocationCreated { id: l.id, name: l.name })
            .collect();
        events.extend(self.store.users().iter().map(Event::user_registered));

        for rs in self.store.rooms() {
            let guard = rs.read().await;
            events.push(Event::room_created(&guard.room));
            for r in guard.reservations() {
                events.push(Event::reservation_created(r));
                match r.status {
                    ReservationStatus::Pending => {}
                    ReservationStatus::Confirmed => events.push(Event::ReservationConfirmed {
                        id: r.id,
                        room_id: r.room_id,
                    }),
                    ReservationStatus::Cancelled => events.push(Event::ReservationCancelled {
                        id: r.id,
                        room_id: r.room_id,
                    }),
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::debug!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

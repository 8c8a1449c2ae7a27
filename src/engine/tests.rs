use chrono::{NaiveDate, NaiveDateTime};

use super::*;
use crate::limits::*;

const MORNING: Minutes = 8 * 60 + 30; // 08:30-10:00
const LATE_MORNING: Minutes = 10 * 60 + 15; // 10:15-11:45
const AFTERNOON: Minutes = 13 * 60; // 13:00-14:30
const BREAK: Minutes = 10 * 60; // 10:00-10:15, not bookable

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roomgrid_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn monday() -> NaiveDate {
    date(2026, 10, 19)
}

fn at(day: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
    day.and_hms_opt(h, m, 0).unwrap()
}

fn new_engine(path: PathBuf) -> Engine {
    Engine::new(path, Arc::new(SlotCatalog::default()), Arc::new(NotifyHub::new())).unwrap()
}

fn user(name: &str, role: Role, status: AccountStatus) -> User {
    User {
        id: Ulid::new(),
        name: name.into(),
        email: format!("{}@example.org", name.to_lowercase()),
        role,
        status,
    }
}

fn location(name: &str) -> Location {
    Location {
        id: Ulid::new(),
        name: name.into(),
    }
}

fn room(name: &str, location: &str) -> Room {
    Room {
        id: Ulid::new(),
        name: name.into(),
        description: String::new(),
        location: location.into(),
        available: true,
    }
}

/// An organization with one confirmed admin, one confirmed member, the
/// locations "Main" and "Annex", and one room in "Main".
struct Org {
    engine: Arc<Engine>,
    admin: Ulid,
    member: Ulid,
    room: Ulid,
}

async fn setup(wal: &str) -> Org {
    setup_at(test_wal_path(wal)).await
}

async fn setup_at(path: PathBuf) -> Org {
    let engine = Arc::new(new_engine(path));
    let admin = engine
        .provision_user(None, user("Root", Role::Admin, AccountStatus::Confirmed))
        .await
        .unwrap()
        .id;
    let member = engine
        .provision_user(Some(admin), user("Ada", Role::Member, AccountStatus::Confirmed))
        .await
        .unwrap()
        .id;
    for name in ["Main", "Annex"] {
        engine.create_location(admin, location(name)).await.unwrap();
    }
    let room = engine
        .create_room(admin, room("A-101", "Main"))
        .await
        .unwrap()
        .id;
    Org {
        engine,
        admin,
        member,
        room,
    }
}

impl Org {
    async fn book(&self, requester: Ulid, day: NaiveDate, start: Minutes) -> Result<Reservation, EngineError> {
        self.engine
            .create_reservation(Ulid::new(), self.room, requester, day, start, None)
            .await
    }

    async fn extra_member(&self, name: &str) -> Ulid {
        self.engine
            .provision_user(Some(self.admin), user(name, Role::Member, AccountStatus::Confirmed))
            .await
            .unwrap()
            .id
    }
}

// ── Rooms ────────────────────────────────────────────────

#[tokio::test]
async fn create_and_query_room() {
    let org = setup("room_create.wal").await;
    let room = org.engine.get_room(org.room).await.unwrap();
    assert_eq!(room.name, "A-101");
    assert!(room.available);
    assert_eq!(org.engine.list_rooms().await.len(), 1);
}

#[tokio::test]
async fn member_cannot_manage_rooms() {
    let org = setup("room_forbidden.wal").await;
    let err = org
        .engine
        .create_room(org.member, room("B-1", "Annex"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(Capability::ManageRooms)));
    let err = org.engine.delete_room(org.member, org.room).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(Capability::ManageRooms)));
}

#[tokio::test]
async fn duplicate_room_rejected() {
    let org = setup("room_dup.wal").await;
    let mut dup = room("Again", "Main");
    dup.id = org.room;
    let err = org.engine.create_room(org.admin, dup).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == org.room));
}

#[tokio::test]
async fn rooms_listed_in_creation_order() {
    let org = setup("room_order.wal").await;
    // Ids chosen by the client, each smaller than the last.
    for (n, name) in [(3u128, "C-1"), (2, "B-1"), (1, "A-0")] {
        let mut r = room(name, "Annex");
        r.id = Ulid::from(n);
        org.engine.create_room(org.admin, r).await.unwrap();
    }
    let names: Vec<String> = org.engine.list_rooms().await.into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["A-101", "C-1", "B-1", "A-0"]);
}

#[tokio::test]
async fn update_room_changes_only_given_fields() {
    let org = setup("room_update.wal").await;
    let changes = RoomChanges {
        name: Some("A-101 (renovated)".into()),
        location: Some("Annex".into()),
        ..Default::default()
    };
    let updated = org.engine.update_room(org.admin, org.room, changes).await.unwrap();
    assert_eq!(updated.name, "A-101 (renovated)");
    assert_eq!(updated.location, "Annex");
    assert!(updated.available);
    assert_eq!(org.engine.get_room(org.room).await.unwrap(), updated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_partial_updates_both_apply() {
    let org = setup("room_update_race.wal").await;
    for round in 0..20 {
        let rename = {
            let engine = org.engine.clone();
            let (admin, id) = (org.admin, org.room);
            tokio::spawn(async move {
                let changes = RoomChanges {
                    name: Some(format!("A-101 r{round}")),
                    ..Default::default()
                };
                engine.update_room(admin, id, changes).await
            })
        };
        let switch_off = {
            let engine = org.engine.clone();
            let (admin, id) = (org.admin, org.room);
            tokio::spawn(async move {
                let changes = RoomChanges {
                    available: Some(false),
                    ..Default::default()
                };
                engine.update_room(admin, id, changes).await
            })
        };
        rename.await.unwrap().unwrap();
        switch_off.await.unwrap().unwrap();

        let room = org.engine.get_room(org.room).await.unwrap();
        assert_eq!(room.name, format!("A-101 r{round}"));
        assert!(!room.available, "round {round}: switch-off lost");

        let on = RoomChanges {
            available: Some(true),
            ..Default::default()
        };
        org.engine.update_room(org.admin, org.room, on).await.unwrap();
    }
}

#[tokio::test]
async fn room_location_must_exist() {
    let org = setup("room_unknown_location.wal").await;
    let err = org
        .engine
        .create_room(org.admin, room("L-1", "Library"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownLocation(name) if name == "Library"));

    let changes = RoomChanges {
        location: Some("Library".into()),
        ..Default::default()
    };
    let err = org.engine.update_room(org.admin, org.room, changes).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownLocation(_)));
    assert_eq!(org.engine.get_room(org.room).await.unwrap().location, "Main");
}

// ── Locations ────────────────────────────────────────────

#[tokio::test]
async fn locations_listed_in_creation_order() {
    let org = setup("loc_order.wal").await;
    let mut library = location("Library");
    library.id = Ulid::from(1u128);
    org.engine.create_location(org.admin, library).await.unwrap();
    let names: Vec<String> = org.engine.list_locations().into_iter().map(|l| l.name).collect();
    assert_eq!(names, vec!["Main", "Annex", "Library"]);
}

#[tokio::test]
async fn location_names_unique_and_admin_managed() {
    let org = setup("loc_admin.wal").await;
    let err = org
        .engine
        .create_location(org.member, location("Library"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(Capability::ManageRooms)));

    let main = org.engine.list_locations()[0].clone();
    let err = org.engine.create_location(org.admin, location("Main")).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == main.id));
    let err = org
        .engine
        .create_location(org.admin, location("  "))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn rename_location_moves_its_rooms() {
    let org = setup("loc_rename.wal").await;
    let annex_room = org.engine.create_room(org.admin, room("B-1", "Annex")).await.unwrap();
    let main = org.engine.list_locations()[0].clone();

    let renamed = org
        .engine
        .rename_location(org.admin, main.id, "Main building".into())
        .await
        .unwrap();
    assert_eq!(renamed.name, "Main building");
    assert_eq!(org.engine.get_room(org.room).await.unwrap().location, "Main building");
    assert_eq!(org.engine.get_room(annex_room.id).await.unwrap().location, "Annex");

    let err = org
        .engine
        .rename_location(org.admin, main.id, "Annex".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn delete_location_only_when_unused() {
    let org = setup("loc_delete.wal").await;
    let locations = org.engine.list_locations();
    let (main, annex) = (&locations[0], &locations[1]);

    let err = org.engine.delete_location(org.admin, main.id).await.unwrap_err();
    assert!(matches!(err, EngineError::LocationInUse(id) if id == main.id));
    let err = org.engine.delete_location(org.member, annex.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    org.engine.delete_location(org.admin, annex.id).await.unwrap();
    assert_eq!(org.engine.list_locations().len(), 1);
    assert!(org.engine.get_location(annex.id).is_none());
}

#[tokio::test]
async fn delete_room_with_active_reservations_fails() {
    let org = setup("room_delete.wal").await;
    let r = org.book(org.member, monday(), MORNING).await.unwrap();

    let err = org.engine.delete_room(org.admin, org.room).await.unwrap_err();
    assert!(matches!(err, EngineError::HasActiveReservations(id) if id == org.room));

    org.engine.cancel_reservation(r.id, org.member).await.unwrap();
    org.engine.delete_room(org.admin, org.room).await.unwrap();
    assert!(org.engine.get_room(org.room).await.is_none());
    assert!(org.engine.get_reservation(r.id).await.is_none());
}

#[tokio::test]
async fn room_name_limit_enforced() {
    let org = setup("room_limit.wal").await;
    let long = room(&"x".repeat(MAX_NAME_LEN + 1), "Main");
    let err = org.engine.create_room(org.admin, long).await.unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

// ── Accounts ─────────────────────────────────────────────

#[tokio::test]
async fn pending_account_cannot_book_until_confirmed() {
    let org = setup("account_pending.wal").await;
    let newcomer = org
        .engine
        .register_user(user("Grace", Role::Member, AccountStatus::Pending))
        .await
        .unwrap();

    let err = org.book(newcomer.id, monday(), MORNING).await.unwrap_err();
    assert!(matches!(err, EngineError::RequesterNotEligible(id) if id == newcomer.id));

    let reviewed = org
        .engine
        .review_account(org.admin, newcomer.id, AccountStatus::Confirmed)
        .await
        .unwrap();
    assert_eq!(reviewed.status, AccountStatus::Confirmed);
    assert!(org.book(newcomer.id, monday(), MORNING).await.is_ok());
}

#[tokio::test]
async fn review_transitions() {
    let org = setup("account_review.wal").await;
    let u = org
        .engine
        .register_user(user("Linus", Role::Member, AccountStatus::Pending))
        .await
        .unwrap();

    let err = org
        .engine
        .review_account(org.member, u.id, AccountStatus::Confirmed)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(Capability::ReviewAccounts)));

    org.engine
        .review_account(org.admin, u.id, AccountStatus::Rejected)
        .await
        .unwrap();
    let err = org.book(u.id, monday(), MORNING).await.unwrap_err();
    assert!(matches!(err, EngineError::RequesterNotEligible(_)));

    // A rejected account may be approved later, but never sent back.
    org.engine
        .review_account(org.admin, u.id, AccountStatus::Confirmed)
        .await
        .unwrap();
    let err = org
        .engine
        .review_account(org.admin, u.id, AccountStatus::Rejected)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidAccountTransition {
            from: AccountStatus::Confirmed,
            to: AccountStatus::Rejected
        }
    ));
}

#[tokio::test]
async fn duplicate_email_rejected() {
    let org = setup("account_email.wal").await;
    let mut twin = user("Ada", Role::Member, AccountStatus::Pending);
    twin.email = "ADA@example.org".into();
    let err = org.engine.register_user(twin).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == org.member));
}

#[tokio::test]
async fn self_registration_cannot_grant_admin() {
    let org = setup("account_self_admin.wal").await;
    let mallory = org
        .engine
        .register_user(user("Mallory", Role::Admin, AccountStatus::Confirmed))
        .await
        .unwrap();
    assert_eq!((mallory.role, mallory.status), (Role::Member, AccountStatus::Pending));

    let r = org.book(org.member, monday(), MORNING).await.unwrap();
    let err = org.engine.confirm_reservation(r.id, mallory.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(Capability::ConfirmReservation)));
    let err = org
        .engine
        .review_account(mallory.id, mallory.id, AccountStatus::Confirmed)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(Capability::ReviewAccounts)));
}

#[tokio::test]
async fn provisioning_needs_an_admin_once_org_has_users() {
    let org = setup("account_provision.wal").await;
    let err = org
        .engine
        .provision_user(None, user("Eve", Role::Admin, AccountStatus::Confirmed))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(Capability::ReviewAccounts)));
    let err = org
        .engine
        .provision_user(Some(org.member), user("Eve", Role::Admin, AccountStatus::Confirmed))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(Capability::ReviewAccounts)));

    let second_admin = org
        .engine
        .provision_user(Some(org.admin), user("Root2", Role::Admin, AccountStatus::Confirmed))
        .await
        .unwrap();
    assert_eq!(org.engine.get_user(second_admin.id).unwrap().role, Role::Admin);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_registrations_keep_email_unique() {
    let org = setup("account_email_race.wal").await;
    for round in 0..20 {
        let email = format!("twin{round}@example.org");
        let mut handles = Vec::new();
        for i in 0..8 {
            let engine = org.engine.clone();
            let mut u = user(&format!("Twin{i}"), Role::Member, AccountStatus::Pending);
            u.email = email.clone();
            handles.push(tokio::spawn(async move { engine.register_user(u).await }));
        }
        let mut created = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => created += 1,
                Err(EngineError::AlreadyExists(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(created, 1, "round {round}");
    }
}

#[tokio::test]
async fn list_users_by_status() {
    let org = setup("account_list.wal").await;
    org.engine
        .register_user(user("Pending", Role::Member, AccountStatus::Pending))
        .await
        .unwrap();
    assert_eq!(org.engine.list_users(None).len(), 3);
    assert_eq!(org.engine.list_users(Some(AccountStatus::Pending)).len(), 1);
    assert_eq!(org.engine.list_users(Some(AccountStatus::Rejected)).len(), 0);
}

#[tokio::test]
async fn unknown_actor_not_found() {
    let org = setup("account_unknown.wal").await;
    let r = org.book(org.member, monday(), MORNING).await.unwrap();
    let ghost = Ulid::new();
    let err = org.engine.confirm_reservation(r.id, ghost).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == ghost));
}

// ── Reservation lifecycle ────────────────────────────────

#[tokio::test]
async fn create_then_same_slot_unavailable() {
    let org = setup("res_double_book.wal").await;
    let first = org.book(org.member, monday(), MORNING).await.unwrap();
    assert_eq!(first.status, ReservationStatus::Pending);
    assert_eq!(first.span, Span::new(510, 600));

    let other = org.extra_member("Alan").await;
    let err = org.book(other, monday(), MORNING).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::SlotUnavailable(Unavailable::Conflict { with, .. }) if with == first.id
    ));

    // Back-to-back and other days are fine.
    assert!(org.book(other, monday(), LATE_MORNING).await.is_ok());
    assert!(org.book(other, monday().succ_opt().unwrap(), MORNING).await.is_ok());
}

#[tokio::test]
async fn confirm_flow() {
    let org = setup("res_confirm.wal").await;
    let r = org.book(org.member, monday(), MORNING).await.unwrap();

    let err = org.engine.confirm_reservation(r.id, org.member).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(Capability::ConfirmReservation)));

    let confirmed = org.engine.confirm_reservation(r.id, org.admin).await.unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);
    assert_eq!(
        org.engine.get_reservation(r.id).await.unwrap().status,
        ReservationStatus::Confirmed
    );

    let err = org.engine.confirm_reservation(r.id, org.admin).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { status: ReservationStatus::Confirmed, .. }
    ));
}

#[tokio::test]
async fn cancel_frees_slot_and_is_not_repeatable() {
    let org = setup("res_cancel.wal").await;
    let r = org.book(org.member, monday(), MORNING).await.unwrap();

    let cancelled = org.engine.cancel_reservation(r.id, org.member).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);

    let err = org.engine.cancel_reservation(r.id, org.member).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { status: ReservationStatus::Cancelled, .. }
    ));

    let again = org.book(org.member, monday(), MORNING).await.unwrap();
    assert_ne!(again.id, r.id);
    assert_eq!(org.engine.active_reservations(org.room, monday()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn only_owner_or_admin_cancels() {
    let org = setup("res_cancel_owner.wal").await;
    let r = org.book(org.member, monday(), MORNING).await.unwrap();
    let stranger = org.extra_member("Mallory").await;

    let err = org.engine.cancel_reservation(r.id, stranger).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(Capability::CancelReservation)));
    assert_eq!(
        org.engine.get_reservation(r.id).await.unwrap().status,
        ReservationStatus::Pending
    );

    let cancelled = org.engine.cancel_reservation(r.id, org.admin).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn unknown_and_break_slots_rejected() {
    let org = setup("res_slots.wal").await;
    let err = org.book(org.member, monday(), 9 * 60).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotUnavailable(Unavailable::UnknownSlot(540))));

    let err = org.book(org.member, monday(), BREAK).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotUnavailable(Unavailable::NotBookable(_))));
}

#[tokio::test]
async fn disabled_room_blocks_new_bookings_only() {
    let org = setup("res_disabled.wal").await;
    let existing = org.book(org.member, monday(), MORNING).await.unwrap();

    let off = RoomChanges {
        available: Some(false),
        ..Default::default()
    };
    org.engine.update_room(org.admin, org.room, off).await.unwrap();

    let err = org.book(org.member, monday(), AFTERNOON).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotUnavailable(Unavailable::RoomDisabled(_))));
    assert!(org.engine.list_bookable_slots(org.room, monday()).await.unwrap().is_empty());
    assert_eq!(
        org.engine.get_reservation(existing.id).await.unwrap().status,
        ReservationStatus::Pending
    );
}

#[tokio::test]
async fn reschedule_moves_and_keeps_status() {
    let org = setup("res_reschedule.wal").await;
    let r = org.book(org.member, monday(), MORNING).await.unwrap();
    org.engine.confirm_reservation(r.id, org.admin).await.unwrap();
    let tuesday = monday().succ_opt().unwrap();

    let err = org
        .engine
        .reschedule_reservation(r.id, org.member, tuesday, AFTERNOON)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(Capability::RescheduleReservation)));

    let moved = org
        .engine
        .reschedule_reservation(r.id, org.admin, tuesday, AFTERNOON)
        .await
        .unwrap();
    assert_eq!(moved.status, ReservationStatus::Confirmed);
    assert_eq!(moved.date, tuesday);
    assert_eq!(moved.span, Span::new(780, 870));

    // The old slot is free again, the new one is taken.
    assert!(org.book(org.member, monday(), MORNING).await.is_ok());
    let err = org.book(org.member, tuesday, AFTERNOON).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotUnavailable(Unavailable::Conflict { .. })));
}

#[tokio::test]
async fn reschedule_into_taken_slot_leaves_state() {
    let org = setup("res_reschedule_conflict.wal").await;
    let a = org.book(org.member, monday(), MORNING).await.unwrap();
    let b = org.book(org.member, monday(), AFTERNOON).await.unwrap();

    let err = org
        .engine
        .reschedule_reservation(a.id, org.admin, monday(), AFTERNOON)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::SlotUnavailable(Unavailable::Conflict { with, .. }) if with == b.id
    ));
    assert_eq!(org.engine.get_reservation(a.id).await.unwrap().span, a.span);
}

#[tokio::test]
async fn description_trimmed_and_blank_dropped() {
    let org = setup("res_description.wal").await;
    let r = org
        .engine
        .create_reservation(Ulid::new(), org.room, org.member, monday(), MORNING, Some("  Thesis defence ".into()))
        .await
        .unwrap();
    assert_eq!(r.description.as_deref(), Some("Thesis defence"));

    let r = org
        .engine
        .create_reservation(Ulid::new(), org.room, org.member, monday(), AFTERNOON, Some("   ".into()))
        .await
        .unwrap();
    assert_eq!(r.description, None);
}

#[tokio::test]
async fn duplicate_reservation_id_rejected() {
    let org = setup("res_dup_id.wal").await;
    let r = org.book(org.member, monday(), MORNING).await.unwrap();
    let err = org
        .engine
        .create_reservation(r.id, org.room, org.member, monday(), AFTERNOON, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == r.id));
}

#[tokio::test]
async fn eligibility_checked_before_slot() {
    let org = setup("res_eligibility_first.wal").await;
    let newcomer = org
        .engine
        .register_user(user("Grace", Role::Member, AccountStatus::Pending))
        .await
        .unwrap();
    // 09:00 is not the start of any slot.
    let err = org.book(newcomer.id, monday(), 9 * 60).await.unwrap_err();
    assert!(matches!(err, EngineError::RequesterNotEligible(id) if id == newcomer.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creates_share_no_reservation_id() {
    let org = setup("res_id_race.wal").await;
    let mut rooms = vec![org.room];
    for i in 0..7 {
        rooms.push(org.engine.create_room(org.admin, room(&format!("R{i}"), "Main")).await.unwrap().id);
    }

    for round in 0..20u64 {
        let id = Ulid::new();
        let day = monday() + chrono::Days::new(round);
        let mut handles = Vec::new();
        for room_id in rooms.clone() {
            let engine = org.engine.clone();
            let member = org.member;
            handles.push(tokio::spawn(async move {
                engine
                    .create_reservation(id, room_id, member, day, MORNING, None)
                    .await
                    .map(|r| r.room_id)
            }));
        }

        let mut winners = Vec::new();
        for h in handles {
            match h.await.unwrap() {
                Ok(room_id) => winners.push(room_id),
                Err(EngineError::AlreadyExists(dup)) => assert_eq!(dup, id),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners.len(), 1, "round {round}");
        assert_eq!(org.engine.room_for_reservation(&id), Some(winners[0]));
        let filter = ReservationFilter {
            from: Some(day),
            until: Some(day),
            ..Default::default()
        };
        assert_eq!(org.engine.list_reservations(&filter).await.len(), 1);
    }
}

#[tokio::test]
async fn failed_create_releases_its_id() {
    let org = setup("res_id_release.wal").await;
    let id = Ulid::new();
    let err = org
        .engine
        .create_reservation(id, org.room, org.member, monday(), BREAK, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotUnavailable(Unavailable::NotBookable(_))));
    assert_eq!(org.engine.room_for_reservation(&id), None);

    let r = org
        .engine
        .create_reservation(id, org.room, org.member, monday(), MORNING, None)
        .await
        .unwrap();
    assert_eq!(r.id, id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creates_have_one_winner() {
    let org = setup("res_race.wal").await;
    let mut requesters = Vec::new();
    for i in 0..16 {
        requesters.push(org.extra_member(&format!("Racer{i}")).await);
    }

    let mut handles = Vec::new();
    for requester in requesters {
        let engine = org.engine.clone();
        let room = org.room;
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(Ulid::new(), room, requester, monday(), MORNING, None)
                .await
        }));
    }

    let mut winners = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => winners += 1,
            Err(EngineError::SlotUnavailable(Unavailable::Conflict { .. })) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(org.engine.active_reservations(org.room, monday()).await.unwrap().len(), 1);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn detail_visible_to_owner_and_admin() {
    let org = setup("query_detail.wal").await;
    let r = org.book(org.member, monday(), MORNING).await.unwrap();

    let detail = org.engine.reservation_detail(r.id, org.member).await.unwrap();
    assert_eq!(detail.reservation.id, r.id);
    assert_eq!(detail.room.name, "A-101");
    assert_eq!(detail.requester.id, org.member);
    assert!(org.engine.reservation_detail(r.id, org.admin).await.is_ok());

    let stranger = org.extra_member("Eve").await;
    let err = org.engine.reservation_detail(r.id, stranger).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(Capability::ViewReservationDetail)));
}

#[tokio::test]
async fn list_reservations_filters() {
    let org = setup("query_filters.wal").await;
    let annex = org.engine.create_room(org.admin, room("B-1", "Annex")).await.unwrap();
    let tuesday = monday().succ_opt().unwrap();

    let a = org.book(org.member, monday(), MORNING).await.unwrap();
    let b = org
        .engine
        .create_reservation(Ulid::new(), annex.id, org.member, tuesday, MORNING, None)
        .await
        .unwrap();
    let c = org.book(org.member, tuesday, AFTERNOON).await.unwrap();
    org.engine.confirm_reservation(c.id, org.admin).await.unwrap();

    let all = org.engine.list_reservations(&ReservationFilter::default()).await;
    assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a.id, b.id, c.id]);

    let annex_only = ReservationFilter {
        location: Some("Annex".into()),
        ..Default::default()
    };
    assert_eq!(org.engine.list_reservations(&annex_only).await, vec![b.clone()]);

    let confirmed = ReservationFilter {
        status: Some(ReservationStatus::Confirmed),
        ..Default::default()
    };
    let got = org.engine.list_reservations(&confirmed).await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, c.id);

    let tuesday_only = ReservationFilter {
        from: Some(tuesday),
        until: Some(tuesday),
        ..Default::default()
    };
    assert_eq!(org.engine.list_reservations(&tuesday_only).await.len(), 2);
}

#[tokio::test]
async fn user_reservations_and_next() {
    let org = setup("query_user.wal").await;
    let other = org.extra_member("Barbara").await;
    let tuesday = monday().succ_opt().unwrap();

    let early = org.book(org.member, monday(), MORNING).await.unwrap();
    let later = org.book(org.member, monday(), AFTERNOON).await.unwrap();
    let tomorrow = org.book(org.member, tuesday, MORNING).await.unwrap();
    org.book(other, tuesday, AFTERNOON).await.unwrap();

    let mine = org.engine.user_reservations(org.member).await;
    assert_eq!(
        mine.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![early.id, later.id, tomorrow.id]
    );

    let next = org.engine.next_reservation(org.member, at(monday(), 7, 0)).await;
    assert_eq!(next.map(|r| r.id), Some(early.id));
    let next = org.engine.next_reservation(org.member, at(monday(), 9, 0)).await;
    assert_eq!(next.map(|r| r.id), Some(later.id));

    org.engine.cancel_reservation(later.id, org.member).await.unwrap();
    let next = org.engine.next_reservation(org.member, at(monday(), 9, 0)).await;
    assert_eq!(next.map(|r| r.id), Some(tomorrow.id));

    let next = org.engine.next_reservation(org.member, at(tuesday, 12, 0)).await;
    assert!(next.is_none());
}

#[tokio::test]
async fn slots_and_grid_through_engine() {
    let org = setup("query_grid.wal").await;
    assert_eq!(org.engine.list_slots().len(), 9);

    let r = org.book(org.member, monday(), MORNING).await.unwrap();
    let free = org.engine.list_bookable_slots(org.room, monday()).await.unwrap();
    assert_eq!(
        free.iter().map(|s| s.start_offset()).collect::<Vec<_>>(),
        vec![615, 780, 885, 990]
    );

    let grid = org.engine.day_grid(org.room, monday()).await.unwrap();
    assert_eq!(grid.len(), 9);
    assert_eq!(grid[0].state, SlotState::Taken(r.id));
    assert_eq!(grid[1].state, SlotState::Break);
    assert_eq!(grid[2].state, SlotState::Free);

    let missing = Ulid::new();
    assert!(matches!(
        org.engine.day_grid(missing, monday()).await,
        Err(EngineError::NotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn dashboard_counts() {
    let org = setup("query_dashboard.wal").await;
    let engine = &org.engine;
    let wednesday = date(2026, 10, 21);
    let now = at(wednesday, 9, 0);

    let blocked = engine.create_room(org.admin, room("B-1", "Annex")).await.unwrap();
    let spare = engine.create_room(org.admin, room("C-1", "Annex")).await.unwrap();

    // Previous week: one on A, one on B before it was switched off.
    let prev_a = org.book(org.member, date(2026, 10, 14), MORNING).await.unwrap();
    engine.confirm_reservation(prev_a.id, org.admin).await.unwrap();
    engine
        .create_reservation(Ulid::new(), blocked.id, org.member, date(2026, 10, 16), MORNING, None)
        .await
        .unwrap();
    let off = RoomChanges {
        available: Some(false),
        ..Default::default()
    };
    engine.update_room(org.admin, blocked.id, off).await.unwrap();

    // This week: A is occupied at 09:00, C has two pending, one cancelled.
    let now_a = org.book(org.member, wednesday, MORNING).await.unwrap();
    engine.confirm_reservation(now_a.id, org.admin).await.unwrap();
    engine
        .create_reservation(Ulid::new(), spare.id, org.member, wednesday, AFTERNOON, None)
        .await
        .unwrap();
    engine
        .create_reservation(Ulid::new(), spare.id, org.member, date(2026, 10, 23), MORNING, None)
        .await
        .unwrap();
    let dropped = engine
        .create_reservation(Ulid::new(), spare.id, org.member, date(2026, 10, 22), MORNING, None)
        .await
        .unwrap();
    engine.cancel_reservation(dropped.id, org.member).await.unwrap();

    engine
        .register_user(user("Waiting", Role::Member, AccountStatus::Pending))
        .await
        .unwrap();

    let stats = engine.dashboard(now).await;
    assert_eq!(
        stats,
        DashboardStats {
            pending_reservations: 3,
            pending_accounts: 1,
            total_rooms: 3,
            blocked_rooms: 1,
            occupied_rooms: 1,
            available_rooms: 1,
            bookings_today: 2,
            bookings_this_week: 3,
            bookings_previous_week: 2,
            percentage_change: 50.0,
        }
    );
}

#[tokio::test]
async fn dashboard_empty_org() {
    let engine = new_engine(test_wal_path("query_dashboard_empty.wal"));
    let stats = engine.dashboard(at(monday(), 12, 0)).await;
    assert_eq!(stats.total_rooms, 0);
    assert_eq!(stats.bookings_this_week, 0);
    assert_eq!(stats.percentage_change, 0.0);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn room_subscribers_see_transitions() {
    let org = setup("notify_room.wal").await;
    let mut rx = org.engine.notify.subscribe(org.room);

    let r = org.book(org.member, monday(), MORNING).await.unwrap();
    org.engine.confirm_reservation(r.id, org.admin).await.unwrap();

    assert_eq!(rx.recv().await.unwrap(), Event::reservation_created(&r));
    assert_eq!(
        rx.recv().await.unwrap(),
        Event::ReservationConfirmed { id: r.id, room_id: org.room }
    );
}

#[tokio::test]
async fn rejected_mutation_sends_nothing() {
    let org = setup("notify_rejected.wal").await;
    let mut rx = org.engine.notify.subscribe(org.room);
    let _ = org.book(org.member, monday(), BREAK).await.unwrap_err();
    assert!(rx.try_recv().is_err());
}

// ── WAL ──────────────────────────────────────────────────

#[tokio::test]
async fn replay_restores_full_state() {
    let path = test_wal_path("wal_replay.wal");
    let (admin, member, room_id, kept, gone) = {
        let org = setup_at(path.clone()).await;
        let kept = org.book(org.member, monday(), MORNING).await.unwrap();
        org.engine.confirm_reservation(kept.id, org.admin).await.unwrap();
        org.engine
            .reschedule_reservation(kept.id, org.admin, monday(), AFTERNOON)
            .await
            .unwrap();
        let gone = org.book(org.member, monday(), LATE_MORNING).await.unwrap();
        org.engine.cancel_reservation(gone.id, org.member).await.unwrap();
        (org.admin, org.member, org.room, kept.id, gone.id)
    };

    let engine = new_engine(path);
    assert_eq!(engine.get_user(admin).unwrap().role, Role::Admin);
    assert_eq!(engine.get_user(member).unwrap().status, AccountStatus::Confirmed);
    assert_eq!(engine.get_room(room_id).await.unwrap().name, "A-101");

    let kept = engine.get_reservation(kept).await.unwrap();
    assert_eq!(kept.status, ReservationStatus::Confirmed);
    assert_eq!(kept.span, Span::new(780, 870));
    assert_eq!(
        engine.get_reservation(gone).await.unwrap().status,
        ReservationStatus::Cancelled
    );

    // Replayed state still enforces overlaps.
    let err = engine
        .create_reservation(Ulid::new(), room_id, member, monday(), AFTERNOON, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotUnavailable(Unavailable::Conflict { .. })));
}

#[tokio::test]
async fn compact_wal_preserves_state() {
    let path = test_wal_path("wal_compact.wal");
    let org = setup_at(path.clone()).await;
    let mut ids = Vec::new();
    for start in [MORNING, LATE_MORNING, AFTERNOON] {
        let r = org.book(org.member, monday(), start).await.unwrap();
        org.engine.confirm_reservation(r.id, org.admin).await.unwrap();
        ids.push(r.id);
    }
    org.engine.cancel_reservation(ids[1], org.member).await.unwrap();
    let before = org.engine.list_reservations(&ReservationFilter::default()).await;
    let size_before = std::fs::metadata(&path).unwrap().len();

    org.engine.compact_wal().await.unwrap();
    assert_eq!(org.engine.wal_appends_since_compact().await, 0);
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before, "compacted {size_after} >= original {size_before}");

    // Appends after compaction land in the new file.
    let late = org.book(org.member, monday().succ_opt().unwrap(), MORNING).await.unwrap();

    let engine = new_engine(path);
    let mut expected = before;
    expected.push(late);
    assert_eq!(engine.list_reservations(&ReservationFilter::default()).await, expected);
    assert_eq!(engine.list_users(None).len(), 2);
    assert_eq!(engine.list_locations(), org.engine.list_locations());
}

#[tokio::test]
async fn location_rename_survives_replay_and_compaction() {
    let path = test_wal_path("wal_location_rename.wal");
    let org = setup_at(path.clone()).await;
    let main = org.engine.list_locations()[0].clone();
    org.engine
        .rename_location(org.admin, main.id, "Main building".into())
        .await
        .unwrap();

    let replayed = new_engine(path.clone());
    assert_eq!(replayed.get_room(org.room).await.unwrap().location, "Main building");
    assert_eq!(replayed.list_locations(), org.engine.list_locations());

    org.engine.compact_wal().await.unwrap();
    let compacted = new_engine(path);
    assert_eq!(compacted.get_room(org.room).await.unwrap().location, "Main building");
    assert_eq!(compacted.list_locations(), org.engine.list_locations());
}

#[tokio::test]
async fn appends_since_compact_counts_events() {
    let org = setup("wal_counter.wal").await;
    // two registrations, two locations, one room
    assert_eq!(org.engine.wal_appends_since_compact().await, 5);
    let r = org.book(org.member, monday(), MORNING).await.unwrap();
    org.engine.cancel_reservation(r.id, org.member).await.unwrap();
    assert_eq!(org.engine.wal_appends_since_compact().await, 7);

    // Rejected operations write nothing.
    let _ = org.engine.cancel_reservation(r.id, org.member).await.unwrap_err();
    assert_eq!(org.engine.wal_appends_since_compact().await, 7);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("wal_group_commit.wal");
    let org = setup_at(path.clone()).await;

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let engine = org.engine.clone();
        let admin = org.admin;
        handles.push(tokio::spawn(async move {
            engine.create_room(admin, room(&format!("R{i}"), "Main")).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(org.engine.list_rooms().await.len(), n + 1);

    let engine = new_engine(path);
    assert_eq!(engine.list_rooms().await.len(), n + 1);
}

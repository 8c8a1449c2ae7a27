use ulid::Ulid;

use crate::model::{Actor, Role};

use super::EngineError;

/// Everything an actor may be allowed to do. Admins hold every capability;
/// members only those granted to the owner of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ConfirmReservation,
    CancelReservation,
    RescheduleReservation,
    ViewReservationDetail,
    ReviewAccounts,
    ManageRooms,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ConfirmReservation => "confirm reservation",
            Capability::CancelReservation => "cancel reservation",
            Capability::RescheduleReservation => "reschedule reservation",
            Capability::ViewReservationDetail => "view reservation detail",
            Capability::ReviewAccounts => "review accounts",
            Capability::ManageRooms => "manage rooms",
        }
    }

    fn granted_to_owner(&self) -> bool {
        matches!(
            self,
            Capability::CancelReservation | Capability::ViewReservationDetail
        )
    }

    pub fn requirement(&self) -> &'static str {
        if self.granted_to_owner() {
            "admin or owner"
        } else {
            "admin"
        }
    }
}

/// The single role check. `owner` is the user owning the target, if the
/// target has one.
pub fn permits(actor: &Actor, capability: Capability, owner: Option<Ulid>) -> bool {
    match actor.role {
        Role::Admin => true,
        Role::Member => capability.granted_to_owner() && owner == Some(actor.id),
    }
}

pub(crate) fn require(
    actor: &Actor,
    capability: Capability,
    owner: Option<Ulid>,
) -> Result<(), EngineError> {
    if permits(actor, capability, owner) {
        Ok(())
    } else {
        Err(EngineError::Forbidden(capability))
    }
}

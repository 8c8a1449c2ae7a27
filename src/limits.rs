/// Max locations per organization.
pub const MAX_LOCATIONS_PER_ORG: usize = 1_000;

/// Max rooms per organization.
pub const MAX_ROOMS_PER_ORG: usize = 10_000;

/// Max user accounts per organization.
pub const MAX_USERS_PER_ORG: usize = 100_000;

/// Max reservations (any status) stored on one room.
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_DESCRIPTION_LEN: usize = 4096;

/// Slots in a single day grid.
pub const MAX_SLOTS_PER_DAY: usize = 96;

pub const MAX_ORG_NAME_LEN: usize = 256;
pub const MAX_ORGS: usize = 1024;

//! Room reservation service: a slot catalog, an availability checker and a
//! reservation lifecycle behind a per-organization engine, served over the
//! PostgreSQL wire protocol.

pub mod auth;
pub mod catalog;
pub mod compactor;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tenant;
pub mod wal;
pub mod wire;

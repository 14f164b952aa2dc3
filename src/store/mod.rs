//! Tenant-scoped SQL stores. Every query binds a `household_id` so one
//! household can never read another's rows.

pub mod backup_records;
pub mod chores;
pub mod events;
pub mod grocery;
pub mod household;
pub mod notes;
pub mod push;
pub mod rewards;
pub mod settings;

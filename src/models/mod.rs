//! Core data models for the media upload service.
//!
//! Sessions and coverage are in-memory only; `StoredObject` maps to the
//! `objects` catalog table via `sqlx::FromRow` and serializes as JSON via
//! `serde`.

pub mod coverage;
pub mod object;
pub mod session;

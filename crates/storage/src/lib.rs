//! Persistence for graphs, lessons and progress.
//!
//! `repository` holds the contracts and an in-memory backend; `sqlite` is the
//! production backend.

pub mod repository;
pub mod sqlite;

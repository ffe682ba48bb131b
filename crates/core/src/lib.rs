#![forbid(unsafe_code)]
//! Domain core of the lesson prerequisite engine: graph model, progress state
//! machines, cycle detection, prerequisite evaluation and unlock planning.
//!
//! Everything here is synchronous and free of I/O.

pub mod cycle;
pub mod error;
pub mod model;
pub mod prerequisites;
pub mod time;
pub mod unlock;

pub use error::Error;
pub use time::Clock;

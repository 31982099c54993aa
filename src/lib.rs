//! Attendance event pipeline: clock-action sequencing, geofence admission,
//! identity validation and a durable offline queue that replays captures
//! in order once the device is back online.

pub mod capture;
pub mod config;
pub mod db;
pub mod error;
pub mod geofence;
pub mod identity;
pub mod model;
pub mod photo;
pub mod review;
pub mod sequencer;
pub mod submitter;
pub mod sync_queue;
pub mod validation;

pub use error::AttendanceError;

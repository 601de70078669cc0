//! Core functionality shared between the streaming crates: cross-thread
//! notifications and cheap per-phase timing.

pub mod notification;
pub mod perf;

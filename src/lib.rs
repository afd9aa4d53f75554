//! massmigrate - resumable, fan-out bulk data migrations
//!
//! A migration is started once per partition, fanned out across independently
//! scheduled work units, and tracked through a single persistent record whose
//! attempt token lets in-flight units detect that they have been superseded.

pub mod cli;
pub mod config;
pub mod migrations;

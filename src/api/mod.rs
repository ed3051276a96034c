//! REST surface: session CRUD, cron CRUD, filesystem browsing.

pub mod cron;
pub mod fs;
pub mod sessions;

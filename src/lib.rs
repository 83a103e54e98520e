pub mod config;
pub mod controller;
pub mod error;
pub mod schedule;
pub mod storage;
pub mod transfer;
pub mod utils;
pub mod web;
pub mod workdir;

use schedule::LifecycleHandle;

pub struct AppContext {
    pub lifecycle: LifecycleHandle,
    /// `{ipv4}-{hostname}`, as sent with every reservation.
    pub worker: String,
}

#![deny(clippy::expect_used)]
#![deny(clippy::unwrap_used)]

pub mod bridge;
pub mod broadcast;
pub mod camera_registry;
pub mod config;
pub mod constants;
pub mod detector;
pub mod enumerator;
pub mod error;
pub mod hotplug;
pub mod models;
pub mod monitor;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod web_server;

pub use error::{OurError, OurResult};

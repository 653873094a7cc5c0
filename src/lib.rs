//! Keeps a dashboard and a remote-controlled lamp in sync through either an
//! MQTT broker or a Firebase Realtime Database record.

#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod dashboard;
pub mod error;
pub mod states;
pub mod sync;
pub mod view;

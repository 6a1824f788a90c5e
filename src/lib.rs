#[macro_use]
extern crate tracing;

pub mod builder;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod last_applied;
pub mod reconciler;
pub mod retry;
pub mod store;

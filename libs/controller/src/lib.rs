//! # tug-controller
//!
//! Client side of the controller: the authoritative store of apps,
//! releases, formations, deployments and job records.
//!
//! The scheduler and the deployer depend only on the [`ControllerClient`]
//! trait. [`HttpControllerClient`] talks to a running controller;
//! [`MemoryController`] keeps everything in process and backs the test
//! suites.

mod client;
mod error;
mod http;
mod memory;

pub use client::{ControllerClient, ControllerResult, ControllerStream};
pub use error::ControllerError;
pub use http::HttpControllerClient;
pub use memory::MemoryController;

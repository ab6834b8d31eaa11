//! # ocibox-runtime
//!
//! Container lifecycle engine for ocibox.
//!
//! - [`engine`]: CLI-facing operations (create, start, kill, delete, ...).
//! - [`master`]: the per-container master process and its control loop.
//! - [`process`] and [`handshake`]: spawning the container process and
//!   releasing it at the start checkpoint.
//! - [`streams`] and [`logs`]: attach multiplexing and container logs.
//! - [`instance`] and [`sync`]: the on-disk record and state transitions.
//! - [`hooks`]: OCI lifecycle hooks.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod control;
pub mod engine;
pub mod exec;
pub mod handshake;
pub mod hooks;
pub mod instance;
pub mod logs;
pub mod master;
pub mod process;
pub mod streams;
pub mod sync;

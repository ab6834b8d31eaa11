//! # ocibox-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire ocibox workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the foundational primitives that all other
//! crates build upon: the OCI container [`State`](types::State), the
//! lifecycle [`Status`](types::Status) machine, control-socket messages,
//! and the bundle [`Spec`](spec::Spec).

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod spec;
pub mod types;

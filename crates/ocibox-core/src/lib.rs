//! # ocibox-core
//!
//! Low-level Linux primitives for the ocibox runtime.
//!
//! This crate provides safe abstractions over:
//! - **Cgroups v2**: creation, resource limits, live update, freeze/thaw.
//! - **Namespaces**: clone flags, joining existing namespaces, ID mappings.
//! - **Terminals**: pseudo-terminal allocation and resizing.
//! - **Signals**: signal name parsing and exit status descriptions.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! `// SAFETY:` documentation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod namespace;
pub mod signal;
pub mod terminal;

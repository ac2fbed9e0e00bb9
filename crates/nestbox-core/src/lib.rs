//! # nestbox-core
//!
//! Low-level Linux isolation primitives for the Nestbox runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: clone flags for UTS, PID, mount, network and user
//!   isolation, plus write-once UID/GID maps.
//! - **Cgroups v2**: per-container scopes with `pids`, `cpu` and `memory` limits.
//! - **Filesystem**: recursive private bind mounts, chroot jails and `/proc`.
//! - **Network**: bridge, veth and NAT plumbing, the container IP pool, and
//!   in-namespace interface configuration.
//! - **Setup**: the ordered, rollback-capable pipeline the isolated child
//!   runs before executing the user command, and the pipe protocol that
//!   synchronises it with the host side.
//!
//! System calls go through nix's safe wrappers; failures surface as
//! `NestboxError` values.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

#[cfg(not(target_os = "linux"))]
compile_error!("nestbox-core requires Linux namespaces and cgroups v2");

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod network;
pub mod setup;
pub mod sync;

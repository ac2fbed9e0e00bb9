//! Container lifecycle management for the Nestbox runtime.
//!
//! The [`engine::Engine`] is the entry point: it starts containers through
//! the process orchestrator, persists what it learns in the
//! [`state::StateStore`], and owns the host-wide network resources.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod engine;
pub mod init;
pub mod logs;
pub mod network;
pub mod process;
pub mod state;

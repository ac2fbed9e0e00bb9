//! Filesystem management for container isolation.
//!
//! Provides recursive private bind mounts for volumes, the chroot jail,
//! and the container's own `/proc`. Everything here runs inside the
//! isolated child's mount namespace.

pub mod jail;
pub mod mount;

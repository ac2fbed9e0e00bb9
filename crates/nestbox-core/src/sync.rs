//! Parent/child synchronisation over a pair of pipes.
//!
//! Both pipes are created with `O_CLOEXEC` before `clone(2)`, so they never
//! leak into the user command. Each side sends newline-delimited JSON
//! messages; reaching end-of-file means the peer process is gone.
//!
//! The parent sends exactly one [`ParentMessage`] once the host-side setup
//! for the child is complete. The child answers with exactly one
//! [`ChildMessage`] after its own setup has finished or failed.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nestbox_common::error::{NestboxError, Result};
use nix::fcntl::OFlag;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::network::NetworkAssignment;

/// Host to container messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Host-side setup is done; `network` is `None` if it degraded.
    Ready {
        /// Interface assignment for the child.
        network: Option<NetworkAssignment>,
    },
    /// Host-side setup failed; the child must exit without running anything.
    Abort {
        /// Human-readable cause.
        reason: String,
    },
}

/// Container to host messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// Isolation is in place and the user command is running.
    Started,
    /// A fatal setup step failed.
    SetupFailed {
        /// Name of the failed step.
        step: String,
        /// Description of the failure.
        message: String,
    },
}

/// Creates the two pipes and splits them into per-process ends.
///
/// # Errors
///
/// Returns an error if `pipe2(2)` fails.
pub fn channel() -> Result<(ParentEnd, ChildEnd)> {
    let (to_child_read, to_child_write) = pipe()?;
    let (to_parent_read, to_parent_write) = pipe()?;

    let peer_fds = [to_child_write.as_raw_fd(), to_parent_read.as_raw_fd()];
    let parent = ParentEnd {
        writer: File::from(to_child_write),
        reader: BufReader::new(File::from(to_parent_read)),
    };
    let child = ChildEnd {
        reader: BufReader::new(File::from(to_child_read)),
        writer: File::from(to_parent_write),
        peer_fds,
    };
    Ok((parent, child))
}

fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| NestboxError::setup("pipe", e))
}

/// The orchestrator's side of the channel.
#[derive(Debug)]
pub struct ParentEnd {
    writer: File,
    reader: BufReader<File>,
}

impl ParentEnd {
    /// Sends a message to the child.
    ///
    /// # Errors
    ///
    /// Returns an error if the child has already exited or the write fails.
    pub fn send(&mut self, msg: &ParentMessage) -> Result<()> {
        send(&mut self.writer, msg)
    }

    /// Waits for the child's report. `None` means the child exited first.
    ///
    /// # Errors
    ///
    /// Returns an error on a read failure or a malformed message.
    pub fn recv(&mut self) -> Result<Option<ChildMessage>> {
        recv(&mut self.reader)
    }
}

/// The isolated child's side of the channel.
#[derive(Debug)]
pub struct ChildEnd {
    reader: BufReader<File>,
    writer: File,
    peer_fds: [RawFd; 2],
}

impl ChildEnd {
    /// Closes the copies of the parent's descriptors inherited by `clone(2)`.
    ///
    /// Must be called once, first thing in the child, so that the parent's
    /// death is observable as end-of-file.
    /// The `ParentEnd` copy in this process must never be used or dropped
    /// afterwards.
    pub fn close_inherited(&mut self) {
        for fd in self.peer_fds {
            if let Err(e) = nix::unistd::close(fd) {
                tracing::debug!(fd, error = %e, "inherited descriptor not closed");
            }
        }
    }

    /// Blocks until the parent's go-ahead. `None` means the parent exited.
    ///
    /// # Errors
    ///
    /// Returns an error on a read failure or a malformed message.
    pub fn recv(&mut self) -> Result<Option<ParentMessage>> {
        recv(&mut self.reader)
    }

    /// Reports the outcome of setup to the parent.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent is gone or the write fails.
    pub fn send(&mut self, msg: &ChildMessage) -> Result<()> {
        send(&mut self.writer, msg)
    }
}

fn send<T: Serialize>(writer: &mut File, msg: &T) -> Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .and_then(|()| writer.flush())
        .map_err(|e| NestboxError::setup("sync", e))
}

fn recv<T: DeserializeOwned>(reader: &mut impl BufRead) -> Result<Option<T>> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|e| NestboxError::setup("sync", e))?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}

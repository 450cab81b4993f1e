// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.


//! Data directory ownership.
//!
//! One process at a time may write a data directory. The owner holds a
//! `LOCK` file created with `create_new` and holding its process id; the
//! file is removed when the [`DataDirLock`] is dropped. A lock left behind
//! by a process that no longer exists is taken over. Liveness can only be
//! checked where `/proc` is available; elsewhere an existing lock is always
//! treated as held.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use trialhub_core::Result;

pub const LOCK_FILE: &str = "LOCK";

/// Outcome of [`DataDirLock::try_acquire`].
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(DataDirLock),
    /// Another live process owns the directory. `None` when the owner's id
    /// could not be read.
    HeldBy(Option<u32>),
}

#[derive(Debug)]
pub struct DataDirLock {
    path: PathBuf,
    pid: u32,
}

impl DataDirLock {
    pub fn try_acquire(root: impl AsRef<Path>) -> Result<LockAttempt> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE);
        let pid = std::process::id();

        // Second pass only after removing a stale lock.
        for _ in 0..2 {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(pid.to_string().as_bytes())?;
                    file.sync_all()?;
                    debug!(path = %path.display(), pid, "acquired data directory lock");
                    return Ok(LockAttempt::Acquired(DataDirLock { path, pid }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let owner = read_owner(&path);
                    match owner {
                        Some(owner) if !process_alive(owner) => {
                            warn!(path = %path.display(), owner, "removing stale data directory lock");
                            match fs::remove_file(&path) {
                                Ok(()) => continue,
                                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                                Err(e) => return Err(e.into()),
                            }
                        }
                        _ => return Ok(LockAttempt::HeldBy(owner)),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(LockAttempt::HeldBy(read_owner(&path)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        // Leave the file alone if someone else took it over.
        if read_owner(&self.path) == Some(self.pid) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to release data directory lock");
            }
        }
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if !proc_root.join("self").exists() {
        return true;
    }
    pid == std::process::id() || proc_root.join(pid.to_string()).exists()
}

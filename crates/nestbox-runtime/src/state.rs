//! Persistent state management.
//!
//! One JSON file per container under `<state_dir>/containers/<id>.json`,
//! plus the singleton IP pool at `<state_dir>/ipam.json`. Every access to a
//! file holds an advisory `flock(2)` for its whole read-modify-write, so
//! concurrent `nbx` invocations never lose an update.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nestbox_common::config::RuntimeConfig;
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::{ContainerId, ContainerStatus};
use nestbox_core::network::IpPool;
use nix::fcntl::{Flock, FlockArg};

use crate::container::ContainerRecord;

const RECORD_EXT: &str = "json";

/// File-backed repository of container records and the IP pool.
#[derive(Debug, Clone)]
pub struct StateStore {
    containers_dir: PathBuf,
    ipam_path: PathBuf,
}

impl StateStore {
    /// Opens the store described by `config`, creating its directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directories cannot be created.
    pub fn open(config: &RuntimeConfig) -> Result<Self> {
        for dir in [config.containers_dir(), config.logs_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| NestboxError::io(&dir, e))?;
        }
        Ok(Self {
            containers_dir: config.containers_dir(),
            ipam_path: config.ipam_file(),
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.containers_dir.join(format!("{id}.{RECORD_EXT}"))
    }

    /// Writes a record, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be locked or written.
    pub fn save(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.record_path(record.id.as_str());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| NestboxError::io(&path, e))?;
        let mut file = lock(file, FlockArg::LockExclusive, &path)?;
        write_json(&mut file, record, &path)?;
        tracing::debug!(id = %record.id, status = %record.status, "record saved");
        Ok(())
    }

    /// Resolves an id or unambiguous id prefix to a full id.
    ///
    /// An exact match always wins over prefix matches.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::NotFound`] if nothing matches and
    /// [`NestboxError::AmbiguousId`] if several ids share the prefix.
    pub fn resolve(&self, id_or_prefix: &str) -> Result<ContainerId> {
        if id_or_prefix.is_empty() {
            return Err(NestboxError::invalid("container ID cannot be empty"));
        }
        let ids = self.ids()?;
        if ids.iter().any(|id| id == id_or_prefix) {
            return Ok(ContainerId::new(id_or_prefix));
        }
        let matches: Vec<&String> = ids.iter().filter(|id| id.starts_with(id_or_prefix)).collect();
        match matches.as_slice() {
            [] => Err(NestboxError::NotFound {
                kind: "container",
                id: id_or_prefix.to_string(),
            }),
            [only] => Ok(ContainerId::new(only.as_str())),
            many => Err(NestboxError::AmbiguousId {
                prefix: id_or_prefix.to_string(),
                matches: many.len(),
            }),
        }
    }

    /// Loads a record by id or unambiguous prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not resolve or the file is unreadable.
    pub fn load(&self, id_or_prefix: &str) -> Result<ContainerRecord> {
        let id = self.resolve(id_or_prefix)?;
        read_record(&self.record_path(id.as_str()))
    }

    /// Applies `change` to a stored record under an exclusive lock.
    ///
    /// Nothing is written if `change` fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not exist, `change` fails, or
    /// the file cannot be rewritten.
    pub fn update<F>(&self, id: &ContainerId, change: F) -> Result<ContainerRecord>
    where
        F: FnOnce(&mut ContainerRecord) -> Result<()>,
    {
        let path = self.record_path(id.as_str());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| not_found_or_io(e, id.as_str(), &path))?;
        let mut file = lock(file, FlockArg::LockExclusive, &path)?;
        let mut record: ContainerRecord = read_json(&mut file, &path)?;
        change(&mut record)?;
        write_json(&mut file, &record, &path)?;
        Ok(record)
    }

    /// Moves a record to `status`.
    ///
    /// # Errors
    ///
    /// Returns [`NestboxError::InvalidInput`] if the transition would leave
    /// a terminal status, or an error from [`update`](Self::update).
    pub fn update_status(&self, id: &ContainerId, status: ContainerStatus) -> Result<ContainerRecord> {
        self.update(id, |record| {
            if !record.status.can_transition_to(status) {
                return Err(NestboxError::invalid(format!(
                    "container {} cannot go from {} to {status}",
                    record.id.short(),
                    record.status
                )));
            }
            record.status = status;
            Ok(())
        })
    }

    /// Returns every stored record, oldest first.
    ///
    /// This is a pure read; see `Engine::list` for the reconciling variant.
    /// Unreadable records are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the containers directory cannot be read.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let mut records = Vec::new();
        for id in self.ids()? {
            let path = self.record_path(&id);
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(NestboxError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Deletes a record; deleting a missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn delete(&self, id: &ContainerId) -> Result<()> {
        let path = self.record_path(id.as_str());
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(id = %id, "record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NestboxError::io(path, e)),
        }
    }

    /// Runs `f` on the IP pool while holding its exclusive lock.
    ///
    /// The pool is written back only if `f` succeeds. A missing or empty
    /// pool file starts as an empty pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool file cannot be locked, parsed, or
    /// written, or whatever `f` returns.
    pub fn with_ipam<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut IpPool) -> Result<T>,
    {
        let path = &self.ipam_path;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| NestboxError::io(path, e))?;
        let mut file = lock(file, FlockArg::LockExclusive, path)?;

        let mut content = String::new();
        let _ = file
            .read_to_string(&mut content)
            .map_err(|e| NestboxError::io(path, e))?;
        let mut pool = if content.trim().is_empty() {
            IpPool::default()
        } else {
            serde_json::from_str(&content)?
        };

        let out = f(&mut pool)?;
        write_json(&mut file, &pool, path)?;
        Ok(out)
    }

    fn ids(&self) -> Result<Vec<String>> {
        let dir = &self.containers_dir;
        let entries = std::fs::read_dir(dir).map_err(|e| NestboxError::io(dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| NestboxError::io(dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }
}

fn read_record(path: &Path) -> Result<ContainerRecord> {
    let file = File::open(path).map_err(|e| NestboxError::io(path, e))?;
    let mut file = lock(file, FlockArg::LockShared, path)?;
    read_json(&mut file, path)
}

fn lock(file: File, arg: FlockArg, path: &Path) -> Result<Flock<File>> {
    Flock::lock(file, arg).map_err(|(_, errno)| NestboxError::io(path, errno.into()))
}

fn read_json<T: serde::de::DeserializeOwned>(file: &mut File, path: &Path) -> Result<T> {
    let mut content = String::new();
    let _ = file
        .read_to_string(&mut content)
        .map_err(|e| NestboxError::io(path, e))?;
    Ok(serde_json::from_str(&content)?)
}

fn write_json<T: serde::Serialize>(file: &mut File, value: &T, path: &Path) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    file.set_len(0)
        .and_then(|()| file.seek(SeekFrom::Start(0)).map(drop))
        .and_then(|()| file.write_all(&bytes))
        .and_then(|()| file.flush())
        .map_err(|e| NestboxError::io(path, e))
}

fn not_found_or_io(e: std::io::Error, id: &str, path: &Path) -> NestboxError {
    if e.kind() == std::io::ErrorKind::NotFound {
        NestboxError::NotFound {
            kind: "container",
            id: id.to_string(),
        }
    } else {
        NestboxError::io(path, e)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::container::fixtures::record;

    fn store(dir: &Path) -> StateStore {
        StateStore::open(&RuntimeConfig::with_state_dir(dir)).expect("open store")
    }

    #[test]
    fn save_then_load_roundtrips_every_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let mut r = record("0123456789abcdef", dir.path());
        r.container_ip = Some(Ipv4Addr::new(10, 0, 0, 5));
        r.veth_host_name = Some("veth01234567".into());
        store.save(&r).expect("save");
        assert_eq!(store.load(r.id.as_str()).expect("load"), r);
    }

    #[test]
    fn saving_shorter_record_leaves_no_trailing_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let mut r = record("abc", dir.path());
        r.command = vec!["x".repeat(500)];
        store.save(&r).expect("save long");
        r.command = vec!["y".into()];
        store.save(&r).expect("save short");
        assert_eq!(store.load("abc").expect("load").command, ["y"]);
    }

    #[test]
    fn prefix_lookup_resolves_unique_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        store.save(&record("abc111", dir.path())).expect("save");
        store.save(&record("abd222", dir.path())).expect("save");

        assert_eq!(store.load("abc").expect("load").id.as_str(), "abc111");
        assert!(matches!(
            store.load("ab").unwrap_err(),
            NestboxError::AmbiguousId { matches: 2, .. }
        ));
        assert!(matches!(
            store.load("zzz").unwrap_err(),
            NestboxError::NotFound { .. }
        ));
        assert!(matches!(
            store.load("").unwrap_err(),
            NestboxError::InvalidInput { .. }
        ));
    }

    #[test]
    fn exact_id_wins_over_longer_prefix_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        store.save(&record("abc", dir.path())).expect("save");
        store.save(&record("abcdef", dir.path())).expect("save");
        assert_eq!(store.resolve("abc").expect("resolve").as_str(), "abc");
    }

    #[test]
    fn status_never_moves_backwards() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let r = record("abc", dir.path());
        store.save(&r).expect("save");

        let updated = store
            .update_status(&r.id, ContainerStatus::Exited)
            .expect("running -> exited");
        assert_eq!(updated.status, ContainerStatus::Exited);
        assert!(store.update_status(&r.id, ContainerStatus::Running).is_err());
        assert_eq!(store.load("abc").expect("load").status, ContainerStatus::Exited);
    }

    #[test]
    fn update_of_missing_record_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let err = store
            .update_status(&ContainerId::new("nope"), ContainerStatus::Stopped)
            .unwrap_err();
        assert!(matches!(err, NestboxError::NotFound { .. }));
    }

    #[test]
    fn list_is_pure_and_ordered_by_creation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let mut older = record("b-older", dir.path());
        older.created_at -= chrono::TimeDelta::seconds(10);
        store.save(&record("a-newer", dir.path())).expect("save");
        store.save(&older).expect("save");
        std::fs::write(dir.path().join("containers/broken.json"), "{").expect("write");

        let ids: Vec<String> = store
            .list()
            .expect("list")
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, ["b-older", "a-newer"]);
        assert!(store.list().expect("list").iter().all(ContainerRecord::is_running));
    }

    #[test]
    fn delete_removes_record_and_tolerates_repeats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let r = record("abc", dir.path());
        store.save(&r).expect("save");
        store.delete(&r.id).expect("delete");
        store.delete(&r.id).expect("delete again");
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn ipam_changes_persist_only_on_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let net = nestbox_common::config::NetworkConfig::default();

        let ip = store
            .with_ipam(|pool| pool.allocate("a", &net))
            .expect("allocate");
        let failed: Result<()> = store.with_ipam(|pool| {
            let _ = pool.allocate("b", &net)?;
            Err(NestboxError::invalid("abort"))
        });
        assert!(failed.is_err());

        let pool = store.with_ipam(|pool| Ok(pool.clone())).expect("read");
        assert_eq!(pool.get("a"), Some(ip));
        assert_eq!(pool.get("b"), None);
    }
}

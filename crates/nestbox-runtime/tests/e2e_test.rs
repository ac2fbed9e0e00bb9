//! End-to-end tests for the Nestbox runtime.
//!
//! The first group drives the state repository, IP pool and lifecycle policy
//! across crates without privileges. The second group launches real
//! containers; it only runs as root with `NBX_TEST_ROOTFS` pointing at a
//! prepared root filesystem and returns early otherwise.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use chrono::Utc;
use nestbox_common::config::RuntimeConfig;
use nestbox_common::error::NestboxError;
use nestbox_common::limits::{CpuLimit, MemoryLimit, cpu_limit_to_cgroup, memory_limit_to_bytes};
use nestbox_common::types::{ContainerId, ContainerStatus, ResourceLimits, VolumeSpec};
use nestbox_runtime::container::ContainerRecord;
use nestbox_runtime::engine::{Engine, StopOutcome};
use nestbox_runtime::process::RunRequest;
use nestbox_runtime::state::StateStore;

fn config(dir: &Path) -> RuntimeConfig {
    let mut config = RuntimeConfig::with_state_dir(dir.join("state"));
    config.cgroup_root = dir.join("cgroup");
    config
}

fn record(id: &str, pid: u32, dir: &Path) -> ContainerRecord {
    ContainerRecord {
        id: ContainerId::new(id),
        pid,
        status: ContainerStatus::Running,
        created_at: Utc::now(),
        command: vec!["/bin/sleep".into(), "100".into()],
        veth_host_name: None,
        veth_peer_name: None,
        container_ip: None,
        log_file_path: dir.join(format!("{id}.log")),
        detached: true,
        cgroup_path: dir.join("cgroup").join(id),
        rootfs_path: dir.join("rootfs"),
        limits: ResourceLimits::default(),
        volumes: Vec::new(),
        exit_code: None,
    }
}

fn exited_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().expect("spawn");
    let pid = child.id();
    let _ = child.wait().expect("wait");
    pid
}

// ── State repository ────────────────────────────────────────────────

#[test]
fn record_survives_a_fresh_store_instance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let mut r = record("3f2a9c1b0d4e5f60718293a4b5c6d7e8", 77, dir.path());
    r.container_ip = Some(Ipv4Addr::new(10, 0, 0, 9));
    r.limits = ResourceLimits::parse(Some("0.5"), Some("512M")).expect("limits");
    r.volumes = vec![VolumeSpec::parse("/srv/data:/data").expect("volume")];
    StateStore::open(&cfg).expect("open").save(&r).expect("save");

    let reopened = StateStore::open(&cfg).expect("reopen");
    assert_eq!(reopened.load("3f2a").expect("load"), r);
}

#[test]
fn prefixes_resolve_uniquely_or_report_ambiguity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = StateStore::open(&config(dir.path())).expect("open");
    for id in ["abc123", "abd456", "xyz789"] {
        store.save(&record(id, 1, dir.path())).expect("save");
    }

    assert_eq!(store.resolve("abc").expect("unique").as_str(), "abc123");
    assert_eq!(store.resolve("x").expect("unique").as_str(), "xyz789");
    assert!(matches!(
        store.resolve("ab").unwrap_err(),
        NestboxError::AmbiguousId { .. }
    ));
    assert!(matches!(
        store.resolve("q").unwrap_err(),
        NestboxError::NotFound { .. }
    ));
}

// ── IP pool ─────────────────────────────────────────────────────────

#[test]
fn concurrent_allocations_from_separate_stores_are_distinct() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let _ = StateStore::open(&cfg).expect("init");

    let handles: Vec<_> = (0..16)
        .map(|n| {
            let cfg = cfg.clone();
            std::thread::spawn(move || {
                let store = StateStore::open(&cfg).expect("open");
                let net = cfg.network.clone();
                store
                    .with_ipam(|pool| pool.allocate(&format!("c{n}"), &net))
                    .expect("allocate")
            })
        })
        .collect();
    let addrs: HashSet<Ipv4Addr> = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .collect();

    assert_eq!(addrs.len(), 16);
    for addr in &addrs {
        let [a, b, c, d] = addr.octets();
        assert_eq!((a, b, c), (10, 0, 0));
        assert!((2..=254).contains(&d), "{addr} outside the container range");
    }
}

#[test]
fn concurrent_updates_to_one_record_are_all_kept() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let mut r = record("shared", 1, dir.path());
    r.command.clear();
    StateStore::open(&cfg).expect("open").save(&r).expect("save");

    let handles: Vec<_> = (0..16)
        .map(|n| {
            let cfg = cfg.clone();
            let id = r.id.clone();
            std::thread::spawn(move || {
                let store = StateStore::open(&cfg).expect("open");
                for round in 0..4 {
                    let _ = store
                        .update(&id, |rec| {
                            rec.command.push(format!("w{n}-{round}"));
                            Ok(())
                        })
                        .expect("update");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("thread");
    }

    let stored = StateStore::open(&cfg).expect("reopen").load("shared").expect("load");
    let writes: HashSet<&str> = stored.command.iter().map(String::as_str).collect();
    assert_eq!(stored.command.len(), 64);
    assert_eq!(writes.len(), 64);
    assert!(writes.contains("w0-0") && writes.contains("w15-3"));
}

#[test]
fn repeated_allocation_for_one_container_is_stable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let store = StateStore::open(&cfg).expect("open");
    let net = cfg.network.clone();

    let first = store
        .with_ipam(|pool| pool.allocate("same", &net))
        .expect("first");
    let second = store
        .with_ipam(|pool| pool.allocate("same", &net))
        .expect("second");
    assert_eq!(first, second);
    assert_eq!(first, Ipv4Addr::new(10, 0, 0, 2));
}

// ── Lifecycle policy ────────────────────────────────────────────────

#[test]
fn listing_marks_dead_processes_exited() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::new(config(dir.path())).expect("engine");
    engine
        .store()
        .save(&record("stale", exited_pid(), dir.path()))
        .expect("save");

    let listed = engine.list().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, ContainerStatus::Exited);
}

#[test]
fn removing_a_live_container_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::new(config(dir.path())).expect("engine");
    engine
        .store()
        .save(&record("alive", std::process::id(), dir.path()))
        .expect("save");

    assert!(matches!(
        engine.remove("alive").unwrap_err(),
        NestboxError::StillRunning { .. }
    ));
    assert!(engine.inspect("alive").is_ok());
}

#[test]
fn stopping_an_already_exited_process_is_not_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::new(config(dir.path())).expect("engine");
    engine
        .store()
        .save(&record("quiet", exited_pid(), dir.path()))
        .expect("save");

    let outcome = engine.stop("quiet").expect("stop");
    assert_eq!(outcome, StopOutcome::Stopped);
    assert!(engine.inspect("quiet").expect("load").status.is_terminal());
}

// ── Resource limit codec ────────────────────────────────────────────

#[test]
fn limit_strings_translate_to_kernel_values() {
    assert_eq!(cpu_limit_to_cgroup("0.5").expect("cpu"), "50000 100000");
    assert_eq!(cpu_limit_to_cgroup("unlimited").expect("cpu"), "max 100000");
    assert_eq!(memory_limit_to_bytes("512M").expect("mem"), Some(536_870_912));
    assert_eq!(memory_limit_to_bytes("1G").expect("mem"), Some(1_073_741_824));
    assert_eq!(memory_limit_to_bytes("max").expect("mem"), None);
    assert!(CpuLimit::parse("-1").is_err());
    assert!(MemoryLimit::parse("").is_err());
}

// ── Privileged scenarios ────────────────────────────────────────────

fn privileged_rootfs() -> Option<PathBuf> {
    if !nix::unistd::geteuid().is_root() {
        return None;
    }
    std::env::var_os("NBX_TEST_ROOTFS")
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
}

fn privileged_engine(dir: &Path) -> Engine {
    let mut cfg = RuntimeConfig::with_state_dir(dir.join("state"));
    cfg.cgroup_root = PathBuf::from("/sys/fs/cgroup/nestbox-e2e");
    Engine::new(cfg).expect("engine")
}

fn request(rootfs: &Path, command: &[&str], detached: bool) -> RunRequest {
    RunRequest {
        command: command.iter().map(ToString::to_string).collect(),
        limits: ResourceLimits::default(),
        volumes: Vec::new(),
        rootfs: rootfs.to_path_buf(),
        detached,
    }
}

#[test]
fn foreground_success_ends_terminal() {
    let Some(rootfs) = privileged_rootfs() else { return };
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = privileged_engine(dir.path());

    let running = engine
        .run(request(&rootfs, &["/bin/true"], false))
        .expect("run");
    let id = running.id().clone();
    let code = running.wait(&AtomicBool::new(false)).expect("wait");
    assert_eq!(code, 0);

    let listed = engine.list().expect("list");
    let r = listed.iter().find(|r| r.id == id).expect("listed");
    assert!(r.status.is_terminal());
    let _ = engine.remove(id.as_str()).expect("cleanup");
}

#[test]
fn detached_container_stops_and_is_removed() {
    let Some(rootfs) = privileged_rootfs() else { return };
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = privileged_engine(dir.path());

    let id = engine
        .run(request(&rootfs, &["/bin/sleep", "100"], true))
        .expect("run")
        .id()
        .clone();
    let r = engine.inspect(id.as_str()).expect("inspect");
    assert_eq!(r.status, ContainerStatus::Running);
    if let Some(ip) = r.container_ip {
        assert_eq!(&ip.octets()[..3], &[10, 0, 0]);
    }

    let started = Instant::now();
    assert_eq!(engine.stop(id.as_str()).expect("stop"), StopOutcome::Stopped);
    assert!(started.elapsed() < engine.config().stop_grace_period + Duration::from_secs(2));
    assert_eq!(
        engine.inspect(id.as_str()).expect("inspect").status,
        ContainerStatus::Stopped
    );

    let _ = engine.remove(id.as_str()).expect("remove");
    assert!(engine.inspect(id.as_str()).is_err());
    assert!(!r.log_file_path.exists());
}

#[test]
fn concurrent_detached_runs_get_distinct_resources() {
    let Some(rootfs) = privileged_rootfs() else { return };
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = privileged_engine(dir.path());

    let a = engine
        .run(request(&rootfs, &["/bin/sleep", "100"], true))
        .expect("run a")
        .record()
        .clone();
    let b = engine
        .run(request(&rootfs, &["/bin/sleep", "100"], true))
        .expect("run b")
        .record()
        .clone();
    let a = engine.inspect(a.id.as_str()).expect("a");
    let b = engine.inspect(b.id.as_str()).expect("b");

    assert_ne!(a.cgroup_path, b.cgroup_path);
    if let (Some(ip_a), Some(ip_b)) = (a.container_ip, b.container_ip) {
        assert_ne!(ip_a, ip_b);
    }
    for r in [a, b] {
        let _ = engine.stop(r.id.as_str()).expect("stop");
        let _ = engine.remove(r.id.as_str()).expect("remove");
    }
}

#[test]
fn memory_limit_reaches_the_cgroup() {
    let Some(rootfs) = privileged_rootfs() else { return };
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = privileged_engine(dir.path());

    let mut req = request(&rootfs, &["/bin/sleep", "100"], true);
    req.limits = ResourceLimits::parse(None, Some("512M")).expect("limits");
    let r = engine.run(req).expect("run").record().clone();

    let max = std::fs::read_to_string(r.cgroup_path.join("memory.max")).expect("memory.max");
    assert_eq!(max.trim(), "536870912");
    let _ = engine.stop(r.id.as_str()).expect("stop");
    let _ = engine.remove(r.id.as_str()).expect("remove");
}

#[test]
fn volume_is_shared_both_ways() {
    let Some(rootfs) = privileged_rootfs() else { return };
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = privileged_engine(dir.path());
    let host = dir.path().join("shared");
    std::fs::create_dir(&host).expect("mkdir");
    std::fs::write(host.join("in.txt"), "from host\n").expect("write");

    let mut req = request(
        &rootfs,
        &["/bin/sh", "-c", "cat /data/in.txt && echo from container > /data/out.txt"],
        false,
    );
    req.volumes = vec![VolumeSpec::parse(&format!("{}:/data", host.display())).expect("volume")];
    let running = engine.run(req).expect("run");
    let id = running.id().clone();
    assert_eq!(running.wait(&AtomicBool::new(false)).expect("wait"), 0);

    let mut log = Vec::new();
    let _ = engine.logs(id.as_str(), &mut log).expect("logs");
    assert!(String::from_utf8_lossy(&log).contains("from host"));
    let out = std::fs::read_to_string(host.join("out.txt")).expect("out.txt");
    assert_eq!(out, "from container\n");
    let _ = engine.remove(id.as_str()).expect("remove");
}

//! End-to-end lifecycle tests for the Palisade runtime.
//!
//! These run without privileges: the specs request no namespaces, no
//! cgroups, and no chroot, so the fork/barrier/supervision machinery is
//! exercised against plain processes. Scenarios that need root (PID
//! namespaces, uid mapping) are marked ignored.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use palisade_common::types::ExitStatus;
use palisade_core::rlimit::{LimitValue, ResourceKind, RlimitEntry};
use palisade_runtime::create::run_container;
use palisade_runtime::hooks::HookPoint;
use palisade_runtime::reload::{ReloadTarget, reload};
use palisade_runtime::spec::ContainerSpec;
use palisade_runtime::sync::Barrier;

/// Serializes the tests that fork, so no other test thread is mid-fork
/// at the same time.
static FORK_LOCK: Mutex<()> = Mutex::new(());

fn plain_spec(name: &str, dir: &tempfile::TempDir, argv: &[&str]) -> ContainerSpec {
    let mut spec = ContainerSpec::new(name, name);
    spec.pid_file = dir.path().join(format!("{name}.pid"));
    spec.command.argv = argv.iter().map(ToString::to_string).collect();
    spec.wait_interval = Duration::from_millis(10);
    spec
}

fn counter_hook(spec: &mut ContainerSpec, point: HookPoint) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    spec.hooks.on(point, move |_| {
        let _ = seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    count
}

// ── Creation and supervision ─────────────────────────────────────────

#[test]
fn successful_container_fires_teardown_but_not_after_failure() {
    let _forks = FORK_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().expect("tempdir");
    let mut spec = plain_spec("lifecycle-ok", &dir, &["/bin/true"]);
    let teardown = counter_hook(&mut spec, HookPoint::TeardownContainer);
    let after_failure = counter_hook(&mut spec, HookPoint::AfterFailure);

    let status = run_container(&mut spec).expect("run");

    assert!(status.success());
    assert_eq!(spec.exit_status, Some(ExitStatus::Exited(0)));
    assert!(spec.pid.is_some());
    assert!(spec.supervisor_pid.is_some());
    assert!(spec.created_at.is_some());
    assert!(spec.is_cleaned());
    assert_eq!(teardown.load(Ordering::SeqCst), 1);
    assert_eq!(after_failure.load(Ordering::SeqCst), 0);
    assert!(!spec.pid_file.exists());
}

#[test]
fn failing_container_fires_after_failure_once() {
    let _forks = FORK_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().expect("tempdir");
    let mut spec = plain_spec("lifecycle-fail", &dir, &["/bin/false"]);
    let teardown = counter_hook(&mut spec, HookPoint::TeardownContainer);
    let after_failure = counter_hook(&mut spec, HookPoint::AfterFailure);

    let status = run_container(&mut spec).expect("run");

    assert_eq!(status, ExitStatus::Exited(1));
    assert_eq!(teardown.load(Ordering::SeqCst), 1);
    assert_eq!(after_failure.load(Ordering::SeqCst), 1);
    assert!(spec.is_cleaned());
}

#[test]
fn child_that_cannot_exec_exits_with_the_reserved_status() {
    let _forks = FORK_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().expect("tempdir");
    let mut spec = plain_spec("lifecycle-noexec", &dir, &["/definitely/not/a/command"]);

    let status = run_container(&mut spec).expect("run");

    // Setup failure before exec is confined to the child and surfaces
    // as the reserved exit status, never as a parent-side error.
    assert_eq!(status, ExitStatus::Exited(127));
    assert_eq!(spec.exit_status, Some(ExitStatus::Exited(127)));
}

#[test]
fn pid_is_recorded_exactly_once_per_creation() {
    let _forks = FORK_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().expect("tempdir");
    let mut spec = plain_spec("lifecycle-pid", &dir, &["/bin/true"]);

    let _ = run_container(&mut spec).expect("run");
    let first = spec.pid.expect("pid recorded");

    spec.record_pid(Pid::from_raw(1));
    assert_eq!(spec.pid, Some(first));
}

// ── Barrier ordering (id-mapping handshake) ──────────────────────────

#[test]
fn id_map_handshake_orders_map_write_between_unshared_and_mapped() {
    let mut unshared = Barrier::new().expect("barrier");
    let mut unshared_child = unshared.try_clone().expect("clone");
    let mut mapped = Barrier::new().expect("barrier");
    let mut mapped_child = mapped.try_clone().expect("clone");

    let (tx, rx) = mpsc::channel::<&'static str>();

    let child_tx = tx.clone();
    let child = thread::spawn(move || {
        child_tx.send("unshared-signalled").expect("send");
        unshared_child.signal().expect("signal unshared");
        mapped_child.wait().expect("wait mapped");
        child_tx.send("root-assumed").expect("send");
    });

    unshared.wait().expect("wait unshared");
    tx.send("maps-written").expect("send");
    mapped.signal().expect("signal mapped");
    child.join().expect("join");

    let order: Vec<&str> = rx.try_iter().collect();
    assert_eq!(
        order,
        vec!["unshared-signalled", "maps-written", "root-assumed"]
    );
}

// ── Kill ─────────────────────────────────────────────────────────────

#[test]
fn kill_with_negative_timeout_returns_immediately_after_delivery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut spec = plain_spec("kill-nowait", &dir, &[]);

    let child = std::process::Command::new("sleep")
        .arg("10")
        .spawn()
        .expect("spawn");
    spec.record_pid(Pid::from_raw(child.id() as i32));

    let start = std::time::Instant::now();
    palisade_runtime::kill::kill(&mut spec, Signal::SIGKILL, -1).expect("kill");
    assert!(start.elapsed() < Duration::from_secs(1));

    let status = nix::sys::wait::waitpid(Pid::from_raw(child.id() as i32), None).expect("reap");
    assert!(matches!(
        status,
        nix::sys::wait::WaitStatus::Signaled(_, Signal::SIGKILL, _)
    ));
}

#[test]
fn kill_with_timeout_succeeds_once_the_lock_is_released() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut spec = plain_spec("kill-wait", &dir, &[]);

    let child = std::process::Command::new("sleep")
        .arg("10")
        .spawn()
        .expect("spawn");
    spec.record_pid(Pid::from_raw(child.id() as i32));

    // No supervisor holds the pid-file lock, so release is immediate.
    palisade_runtime::kill::kill(&mut spec, Signal::SIGKILL, 5).expect("kill");

    let _ = nix::sys::wait::waitpid(Pid::from_raw(child.id() as i32), None);
}

// ── Reload ───────────────────────────────────────────────────────────

#[test]
fn resource_only_reload_touches_rlimits_and_no_cgroups() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut spec = plain_spec("reload-res", &dir, &[]);
    let after_reload = counter_hook(&mut spec, HookPoint::AfterReload);

    let child = std::process::Command::new("sleep")
        .arg("10")
        .spawn()
        .expect("spawn");
    let pid = Pid::from_raw(child.id() as i32);
    spec.record_pid(pid);

    let limits = [RlimitEntry {
        resource: ResourceKind::Nofile,
        soft: LimitValue::Value(512),
        hard: LimitValue::Value(512),
    }];
    reload(
        &mut spec,
        None,
        None,
        Some(&limits),
        &[ReloadTarget::Resource],
    )
    .expect("reload");

    let limits_file =
        std::fs::read_to_string(format!("/proc/{pid}/limits")).expect("read limits");
    let nofile = limits_file
        .lines()
        .find(|l| l.starts_with("Max open files"))
        .expect("nofile line");
    assert!(nofile.contains("512"));
    assert_eq!(after_reload.load(Ordering::SeqCst), 1);

    nix::sys::signal::kill(pid, Signal::SIGKILL).expect("kill");
    let _ = nix::sys::wait::waitpid(pid, None);
}

// ── Root-only scenarios ──────────────────────────────────────────────

#[test]
#[ignore = "requires root"]
fn pid_namespace_leaves_the_supervisor_namespace_unchanged() {
    let _forks = FORK_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    use palisade_core::namespace::Namespace;

    let before = std::fs::read_link("/proc/self/ns/pid").expect("own pidns");

    let dir = tempfile::tempdir().expect("tempdir");
    let mut spec = plain_spec("lifecycle-pidns", &dir, &["/bin/true"]);
    spec.namespaces.create(Namespace::Pid);

    let status = run_container(&mut spec).expect("run");
    assert!(status.success());

    let after = std::fs::read_link("/proc/self/ns/pid").expect("own pidns");
    assert_eq!(before, after);
}

#[test]
#[ignore = "requires root"]
fn uid_map_content_matches_the_configured_range() {
    let _forks = FORK_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    use std::sync::Mutex;

    use palisade_core::namespace::{IdMapping, Namespace};

    let dir = tempfile::tempdir().expect("tempdir");
    let mut spec = plain_spec("lifecycle-uidmap", &dir, &["/bin/sleep", "2"]);
    spec.namespaces.create(Namespace::User);
    spec.namespaces.uid_mapping = Some(IdMapping {
        min: 0,
        offset: 100_000,
        max: 65_536,
    });

    let observed = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&observed);
    spec.hooks.on(HookPoint::BeforeStartWait, move |spec| {
        let pid = spec.pid.expect("pid recorded before the wait");
        let map = std::fs::read_to_string(format!("/proc/{pid}/uid_map"))
            .unwrap_or_default();
        *sink.lock().expect("lock") = map;
        Ok(())
    });

    let _ = run_container(&mut spec).expect("run");

    let map = observed.lock().expect("lock").clone();
    let fields: Vec<&str> = map.split_whitespace().collect();
    assert_eq!(fields, vec!["0", "100000", "65536"]);
}

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::{coordinator_for, fixture, settings, Fixture};
use crate::config::GcSettings;
use crate::gc::{AutoGcOutcome, GcCoordinator};
use crate::lock::{lock_file, open_lock_file, LockType};
use crate::store::Store;

fn auto_fixture(free: u64) -> Result<(Fixture, Arc<GcCoordinator>)> {
    let fx = fixture()?;
    let free_space_file = fx.temp.path().join("free-bytes");
    fs::write(&free_space_file, free.to_string())?;
    let auto_settings = GcSettings {
        min_free: 100,
        max_free: 1000,
        min_free_check_interval: Duration::ZERO,
        free_space_file: Some(free_space_file),
        ..settings()
    };
    let coordinator = coordinator_for(
        Arc::clone(&fx.store) as Arc<dyn Store>,
        &fx.config,
        auto_settings,
    );
    Ok((fx, Arc::new(coordinator)))
}

fn wait_idle(coordinator: &GcCoordinator) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while coordinator.auto_gc_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn enough_free_space_skips_collection() -> Result<()> {
    let (fx, coordinator) = auto_fixture(500)?;
    let orphan = fx.add("orphan", "orphan", &[])?;

    assert_eq!(coordinator.auto_gc(true)?, AutoGcOutcome::Skipped);
    assert!(fx.exists(&orphan));
    Ok(())
}

#[test]
fn low_free_space_runs_a_bounded_sweep() -> Result<()> {
    let (fx, coordinator) = auto_fixture(50)?;
    let orphan = fx.add("orphan", "orphan", &[])?;

    assert_eq!(coordinator.auto_gc(true)?, AutoGcOutcome::Started);
    assert!(!coordinator.auto_gc_running());
    assert!(!fx.exists(&orphan));
    Ok(())
}

#[test]
fn no_progress_since_the_last_run_skips_collection() -> Result<()> {
    let (fx, coordinator) = auto_fixture(50)?;
    assert_eq!(coordinator.auto_gc(true)?, AutoGcOutcome::Started);

    // Free space did not move, so another run would only thrash.
    let orphan = fx.add("orphan", "orphan", &[])?;
    assert_eq!(coordinator.auto_gc(true)?, AutoGcOutcome::Skipped);
    assert!(fx.exists(&orphan));
    Ok(())
}

#[test]
fn callers_join_the_running_sweep() -> Result<()> {
    let (fx, coordinator) = auto_fixture(50)?;
    let orphan = fx.add("orphan", "orphan", &[])?;
    let gc_lock = open_lock_file(&fx.config.gc_lock_path(), true)?.expect("gc lock file");
    assert!(lock_file(&gc_lock, LockType::Write, false)?);

    assert_eq!(coordinator.auto_gc(false)?, AutoGcOutcome::Started);
    assert!(coordinator.auto_gc_running());
    assert_eq!(coordinator.auto_gc(false)?, AutoGcOutcome::Joined);
    assert!(fx.exists(&orphan));

    drop(gc_lock);
    wait_idle(&coordinator);
    assert!(!coordinator.auto_gc_running());
    assert!(!fx.exists(&orphan));
    Ok(())
}

#[test]
fn unreadable_free_space_is_an_error() -> Result<()> {
    let (_fx, coordinator) = auto_fixture(50)?;
    let file = coordinator
        .settings()
        .free_space_file
        .clone()
        .expect("free space file");
    fs::write(&file, "lots")?;

    let err = coordinator.auto_gc(false).expect_err("unparseable");
    assert!(format!("{err:#}").contains("byte count"));
    assert!(!coordinator.auto_gc_running());
    Ok(())
}

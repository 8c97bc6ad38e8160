use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::symlink;
use std::sync::Arc;

use anyhow::Result;

use super::{coordinator_for, fixture, settings};
use crate::gc::{GcError, GcOptions, PlatformRoots, TempRoots, UncheckedRoots, CENSORED};
use crate::store::Store;
use crate::store_path::{StoreDir, StorePath};

#[derive(Debug)]
struct FixedRoots(UncheckedRoots);

impl PlatformRoots for FixedRoots {
    fn find_platform_roots(&self, _store_dir: &StoreDir) -> Result<UncheckedRoots> {
        Ok(self.0.clone())
    }
}

#[test]
fn finds_links_and_indirect_roots() -> Result<()> {
    let fx = fixture()?;
    let lib = fx.add("lib", "lib", &[])?;
    let app = fx.add("app", "app", &[&lib])?;
    let direct = fx.root(&lib, "lib")?;
    let result = fx.temp.path().join("result");

    fx.coordinator.add_perm_root(&app, &result)?;
    let roots = fx.coordinator.find_roots(false)?;

    assert_eq!(
        roots.get(&lib),
        Some(&BTreeSet::from([direct.display().to_string()]))
    );
    assert_eq!(
        roots.get(&app).map(|links| links.contains(&result.display().to_string())),
        Some(true)
    );
    assert_eq!(fs::read_link(&result)?, fx.real(&app));
    Ok(())
}

#[test]
fn profiles_and_plain_files_count_as_roots() -> Result<()> {
    let fx = fixture()?;
    let profile = fx.add("profile", "profile", &[])?;
    let marker = fx.add("marker", "marker", &[])?;
    let nested = fx.config.profiles_dir().join("per-user/alice");
    fs::create_dir_all(&nested)?;
    symlink(fx.real(&profile), nested.join("profile-1-link"))?;
    fs::write(fx.config.gc_roots_dir().join(marker.base_name()), "")?;

    let roots = fx.coordinator.find_roots(false)?;
    assert!(roots.contains_key(&profile));
    assert!(roots.contains_key(&marker));
    Ok(())
}

#[test]
fn dangling_auto_roots_are_removed() -> Result<()> {
    let fx = fixture()?;
    let app = fx.add("app", "app", &[])?;
    let result = fx.temp.path().join("result");
    fx.coordinator.add_perm_root(&app, &result)?;
    let auto_link = fx.coordinator.add_indirect_root(&result)?;
    assert_eq!(fs::read_link(&auto_link)?, result);

    fs::remove_file(&result)?;
    let roots = fx.coordinator.find_roots(false)?;

    // Only the temp root taken while adding the link remains.
    assert_eq!(
        roots.get(&app),
        Some(&BTreeSet::from(["{temp:1}".to_string()]))
    );
    assert_eq!(fs::read_dir(fx.config.auto_roots_dir())?.count(), 0);
    Ok(())
}

#[test]
fn links_to_unregistered_paths_are_ignored() -> Result<()> {
    let fx = fixture()?;
    let ghost = StorePath::from_digest("ghost", b"ghost")?;
    symlink(fx.real(&ghost), fx.config.gc_roots_dir().join("ghost"))?;
    symlink("/nowhere", fx.config.gc_roots_dir().join("outside"))?;

    assert!(fx.coordinator.find_roots(false)?.is_empty());
    assert!(fs::symlink_metadata(fx.config.gc_roots_dir().join("outside")).is_ok());
    Ok(())
}

#[test]
fn perm_roots_are_refused_inside_the_store_or_over_files() -> Result<()> {
    let fx = fixture()?;
    let app = fx.add("app", "app", &[])?;

    let inside = fx.config.store_dir.join("my-root");
    let err = fx
        .coordinator
        .add_perm_root(&app, &inside)
        .expect_err("roots inside the store are forbidden");
    assert!(err.to_string().contains("forbidden"));

    let occupied = fx.temp.path().join("occupied");
    fs::write(&occupied, "data")?;
    let err = fx
        .coordinator
        .add_perm_root(&app, &occupied)
        .expect_err("regular files are not replaced");
    assert!(err.to_string().contains("already exists"));
    assert_eq!(fs::read_to_string(&occupied)?, "data");
    Ok(())
}

#[test]
fn temp_roots_are_reported_and_censored() -> Result<()> {
    let fx = fixture()?;
    let pinned = fx.add("pinned", "pinned", &[])?;
    fx.coordinator.temp_roots().add_temp_root(&pinned)?;

    let roots = fx.coordinator.find_roots(false)?;
    assert_eq!(
        roots.get(&pinned),
        Some(&BTreeSet::from(["{temp:1}".to_string()]))
    );
    let censored = fx.coordinator.find_roots(true)?;
    assert_eq!(
        censored.get(&pinned),
        Some(&BTreeSet::from([CENSORED.to_string()]))
    );

    fx.coordinator.collect_garbage(&GcOptions::default())?;
    assert!(fx.exists(&pinned));
    Ok(())
}

#[test]
fn dropped_temp_roots_stop_protecting_paths() -> Result<()> {
    let fx = fixture()?;
    let pinned = fx.add("pinned", "pinned", &[])?;
    let client = TempRoots::with_id(&fx.config, 77);
    client.add_temp_root(&pinned)?;
    let file = client.file_path();
    assert!(file.exists());

    drop(client);
    assert!(!file.exists());
    fx.coordinator.collect_garbage(&GcOptions::default())?;
    assert!(!fx.exists(&pinned));
    Ok(())
}

#[test]
fn stale_temp_roots_files_are_deleted() -> Result<()> {
    let fx = fixture()?;
    let path = fx.add("left-behind", "left-behind", &[])?;
    let stale = fx.config.temp_roots_dir().join("4242");
    fs::write(&stale, format!("{}\0", fx.printed(&path)))?;

    let roots = fx.coordinator.find_roots(false)?;

    assert!(!roots.contains_key(&path));
    assert!(!stale.exists());
    Ok(())
}

#[test]
fn unexpected_temp_roots_entries_are_corruption() -> Result<()> {
    let fx = fixture()?;
    fs::write(fx.config.temp_roots_dir().join("not-a-pid"), "")?;
    fs::write(fx.config.temp_roots_dir().join(".hidden"), "")?;

    let err = fx.coordinator.find_roots(false).expect_err("corrupt");
    let gc_err = err.downcast_ref::<GcError>().expect("gc error");
    assert_eq!(gc_err.code(), "SX902");
    Ok(())
}

#[test]
fn runtime_roots_are_validated_and_censored() -> Result<()> {
    let fx = fixture()?;
    let running = fx.add("running", "running", &[])?;
    let ghost = StorePath::from_digest("ghost", b"ghost")?;
    let mut unchecked = UncheckedRoots::new();
    unchecked.insert(
        format!("{}/bin/daemon", fx.printed(&running)),
        BTreeSet::from(["/proc/7/exe".to_string()]),
    );
    unchecked.insert(fx.printed(&ghost), BTreeSet::from(["/proc/8/cwd".to_string()]));
    unchecked.insert("/usr/lib/libc.so".to_string(), BTreeSet::from(["/proc/9/maps".to_string()]));

    let coordinator = coordinator_for(
        Arc::clone(&fx.store) as Arc<dyn Store>,
        &fx.config,
        settings(),
    )
    .with_platform_roots(Arc::new(FixedRoots(unchecked)));

    let roots = coordinator.find_roots(false)?;
    assert_eq!(roots.len(), 1);
    assert_eq!(
        roots.get(&running),
        Some(&BTreeSet::from(["/proc/7/exe".to_string()]))
    );
    let censored = coordinator.find_roots(true)?;
    assert_eq!(
        censored.get(&running),
        Some(&BTreeSet::from([CENSORED.to_string()]))
    );

    coordinator.collect_garbage(&GcOptions::default())?;
    assert!(fx.exists(&running));
    Ok(())
}

use std::fs;

use anyhow::Result;

use super::fixture;
use crate::gc::{GcAction, GcOptions};

#[test]
fn unshared_links_are_pruned() -> Result<()> {
    let fx = fixture()?;
    let lib = fx.add("lib", "shared contents", &[])?;
    fx.root(&lib, "lib")?;
    let links = fx.config.links_dir();
    fs::create_dir_all(&links)?;
    fs::hard_link(fx.real(&lib), links.join("shared"))?;
    fs::write(links.join("unused"), "nobody links here")?;

    let report = fx.coordinator.remove_unused_links()?;

    assert_eq!(report.removed, 1);
    assert!(links.join("shared").exists());
    assert!(!links.join("unused").exists());
    Ok(())
}

#[test]
fn sweeps_skip_the_links_directory_and_prune_it() -> Result<()> {
    let fx = fixture()?;
    let orphan = fx.add("orphan", "orphan", &[])?;
    let links = fx.config.links_dir();
    fs::create_dir_all(&links)?;
    fs::hard_link(fx.real(&orphan), links.join("orphan-contents"))?;

    let results = fx.coordinator.collect_garbage(&GcOptions::default())?;

    assert!(links.is_dir());
    assert!(!fx.exists(&orphan));
    // The pool held the only other link, so the bytes count as freed.
    assert_eq!(results.bytes_freed, 6);
    assert!(!links.join("orphan-contents").exists());
    Ok(())
}

#[test]
fn only_full_deleting_sweeps_prune_the_pool() -> Result<()> {
    let fx = fixture()?;
    let first = fx.add("first", "first", &[])?;
    let second = fx.add("second", "second", &[])?;
    let links = fx.config.links_dir();
    fs::create_dir_all(&links)?;
    fs::write(links.join("unused"), "nobody links here")?;

    let mut options = GcOptions::new(GcAction::TryDeleteSpecific);
    options.paths_to_delete.insert(first.clone());
    fx.coordinator.collect_garbage(&options)?;
    assert!(!fx.exists(&first));
    assert!(links.join("unused").exists());

    let mut options = GcOptions::new(GcAction::DeleteSpecific);
    options.paths_to_delete.insert(second.clone());
    fx.coordinator.collect_garbage(&options)?;
    assert!(!fx.exists(&second));
    assert!(!links.join("unused").exists());
    Ok(())
}

#[test]
fn missing_pool_is_not_an_error() -> Result<()> {
    let fx = fixture()?;
    assert_eq!(fx.coordinator.remove_unused_links()?.removed, 0);
    Ok(())
}

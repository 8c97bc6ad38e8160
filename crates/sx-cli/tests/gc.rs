use std::collections::BTreeSet;
use std::os::unix::fs::symlink;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use sx_core::{GcSettings, LocalStore, StoreConfig, StorePath};

struct TestStore {
    temp: tempfile::TempDir,
    config: StoreConfig,
    store: LocalStore,
}

fn test_store() -> TestStore {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = StoreConfig::new(temp.path().join("store"), temp.path().join("var"));
    let settings = GcSettings {
        reserved_size: 0,
        ..GcSettings::default()
    };
    let store = LocalStore::open(&config, &settings).expect("open store");
    TestStore {
        temp,
        config,
        store,
    }
}

impl TestStore {
    fn add(&self, name: &str, references: &[&StorePath]) -> StorePath {
        let references: BTreeSet<StorePath> = references.iter().map(|p| (*p).clone()).collect();
        self.store
            .add_text_to_store(name, name.as_bytes(), &references)
            .expect("add path")
    }

    fn printed(&self, path: &StorePath) -> String {
        self.config.store_dir().print(path)
    }

    fn sx(&self) -> assert_cmd::Command {
        let mut cmd = cargo_bin_cmd!("sx");
        cmd.env("SX_STORE_DIR", &self.config.store_dir)
            .env("SX_STATE_DIR", &self.config.state_dir)
            .env("SX_RESERVED_SIZE", "0")
            .env_remove("SX_MIN_FREE");
        cmd
    }

    fn json(&self, args: &[&str]) -> (Option<i32>, Value) {
        let output = self.sx().arg("--json").args(args).output().expect("run sx");
        let payload = serde_json::from_slice(&output.stdout).expect("json envelope");
        (output.status.code(), payload)
    }
}

fn exists(path: &str) -> bool {
    Path::new(path).symlink_metadata().is_ok()
}

#[test]
fn help_lists_the_commands() {
    let assert = cargo_bin_cmd!("sx").arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 help");
    for command in ["gc", "add-root", "auto-gc"] {
        assert!(output.contains(command), "{command} missing from help: {output}");
    }
}

#[test]
fn gc_deletes_unreachable_paths() {
    let fx = test_store();
    let lib = fx.add("lib", &[]);
    let app = fx.add("app", &[&lib]);
    let orphan = fx.add("orphan", &[]);
    symlink(
        fx.printed(&app),
        fx.config.gc_roots_dir().join("app"),
    )
    .expect("root");

    let (code, payload) = fx.json(&["gc"]);

    assert_eq!(code, Some(0), "{payload}");
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["details"]["deleted"], serde_json::json!([fx.printed(&orphan)]));
    assert_eq!(payload["details"]["bytes_freed"], 6);
    assert!(exists(&fx.printed(&app)) && exists(&fx.printed(&lib)));
    assert!(!exists(&fx.printed(&orphan)));
}

#[test]
fn print_dead_lists_paths_without_deleting() {
    let fx = test_store();
    let orphan = fx.add("orphan", &[]);

    let assert = fx.sx().args(["gc", "--print-dead"]).assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");

    assert_eq!(stdout.trim(), fx.printed(&orphan));
    assert!(exists(&fx.printed(&orphan)));
}

#[test]
fn deleting_a_live_path_is_a_user_error() {
    let fx = test_store();
    let lib = fx.add("lib", &[]);
    symlink(fx.printed(&lib), fx.config.gc_roots_dir().join("lib")).expect("root");

    let (code, payload) = fx.json(&["gc", "--delete", &fx.printed(&lib)]);

    assert_eq!(code, Some(1), "{payload}");
    assert_eq!(payload["status"], "user-error");
    assert_eq!(payload["details"]["code"], "SX901");
    assert!(exists(&fx.printed(&lib)));

    let (code, payload) = fx.json(&["gc", "--delete", "--skip-alive", &fx.printed(&lib)]);
    assert_eq!(code, Some(0), "{payload}");
    assert_eq!(payload["details"]["kept"], serde_json::json!([fx.printed(&lib)]));
}

#[test]
fn add_root_protects_the_path() {
    let fx = test_store();
    let app = fx.add("app", &[]);
    let link = fx.temp.path().join("result");

    fx.sx()
        .args(["add-root", &fx.printed(&app)])
        .arg(&link)
        .assert()
        .success();
    assert_eq!(
        std::fs::read_link(&link).expect("link"),
        Path::new(&fx.printed(&app))
    );

    let assert = fx.sx().args(["gc", "--print-roots"]).assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    assert!(
        stdout.contains(&format!("{} -> {}", link.display(), fx.printed(&app))),
        "{stdout}"
    );

    fx.sx().arg("gc").assert().success();
    assert!(exists(&fx.printed(&app)));
}

#[test]
fn add_root_rejects_invalid_paths() {
    let fx = test_store();
    let (code, payload) = fx.json(&["add-root", "/not/the/store/x", "result"]);
    assert_eq!(code, Some(1), "{payload}");
    assert_eq!(payload["status"], "user-error");
}

#[test]
fn auto_gc_reports_when_disabled() {
    let fx = test_store();
    let (code, payload) = fx.json(&["auto-gc"]);
    assert_eq!(code, Some(0), "{payload}");
    assert_eq!(payload["details"]["outcome"], "disabled");
}

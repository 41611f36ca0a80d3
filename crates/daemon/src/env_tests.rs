// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serial_test::serial;

fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with("SBX_") {
            std::env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn defaults_are_sane() {
    clear_env();
    let settings = Settings::default();
    assert_eq!(settings.mode().unwrap(), Mode::Combined);
    assert_eq!(settings.region(), Region::new("default"));
    assert_eq!(settings.max_capacity(), 16);
    assert_eq!(settings.sandbox_domain(), "sandboxes.localhost");
    assert_eq!(settings.org_limit(), 32);
    assert_eq!(settings.scale_cooldown(), std::time::Duration::from_secs(300));
}

#[test]
#[serial]
fn env_overrides_file_values() {
    clear_env();
    let mut settings = Settings {
        mode: Some("server".to_string()),
        max_capacity: Some(4),
        ..Settings::default()
    };
    std::env::set_var("SBX_MODE", "worker");
    std::env::set_var("SBX_MAX_CAPACITY", "9");
    settings.apply_env();
    clear_env();

    assert_eq!(settings.mode().unwrap(), Mode::Worker);
    assert_eq!(settings.max_capacity(), 9);
}

#[test]
#[serial]
fn config_file_round_trips() {
    clear_env();
    let toml_text = r#"
        mode = "server"
        region = "eu-1"
        sandbox_domain = "boxes.example"
        max_capacity = 32
        scale_cooldown_sec = 60
    "#;
    let settings: Settings = toml::from_str(toml_text).unwrap();
    assert_eq!(settings.mode().unwrap(), Mode::Server);
    assert_eq!(settings.region(), Region::new("eu-1"));
    assert_eq!(settings.sandbox_domain(), "boxes.example");
    assert_eq!(settings.max_capacity(), 32);
    assert_eq!(settings.scale_cooldown(), std::time::Duration::from_secs(60));
}

#[test]
#[serial]
fn bad_mode_is_rejected() {
    clear_env();
    let settings = Settings { mode: Some("sideways".to_string()), ..Settings::default() };
    assert!(settings.mode().is_err());
}

#[test]
#[serial]
fn explicit_worker_identity_wins() {
    clear_env();
    let settings = Settings {
        worker_id: Some("w-explicit".to_string()),
        machine_id: Some("mch-pinned".to_string()),
        ..Settings::default()
    };
    assert_eq!(settings.worker_id(), WorkerId::new("w-explicit"));
    assert_eq!(settings.machine_id(), MachineId::from_string("mch-pinned"));
}

#[test]
#[serial]
fn derived_machine_id_follows_worker_id() {
    clear_env();
    let settings = Settings { worker_id: Some("w9".to_string()), ..Settings::default() };
    assert_eq!(settings.machine_id(), MachineId::from_string("mch-w9"));
}

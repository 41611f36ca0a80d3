// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use sbx_core::ResourceLimits;
use yare::parameterized;

#[parameterized(
    plain_percent = { "0.15%", 0.15 },
    whole = { "97%", 97.0 },
    empty = { "", 0.0 },
    garbage = { "n/a", 0.0 },
)]
fn pct_parsing(input: &str, expected: f32) {
    assert!((parse_pct(input) - expected).abs() < f32::EPSILON);
}

#[parameterized(
    bytes = { "796B", 796 },
    kilo = { "1.2kB", 1_200 },
    mebi = { "7.27MiB", 7_623_147 },
    gibi = { "1.944GiB", 2_087_354_695 },
    bare = { "12", 12 },
)]
fn byte_parsing(input: &str, expected: u64) {
    assert_eq!(parse_bytes(input), expected);
}

#[test]
fn pair_parsing_splits_on_slash() {
    assert_eq!(parse_pair("7.27MiB / 1.944GiB").0, parse_bytes("7.27MiB"));
    assert_eq!(parse_pair("796B / 0B"), (796, 0));
    assert_eq!(parse_pair("broken"), (0, 0));
}

#[test]
fn stats_row_parses_docker_json() {
    let row = r#"{"CPUPerc":"0.15%","MemUsage":"7.27MiB / 1.944GiB","MemPerc":"0.37%","NetIO":"796B / 124B","PIDs":"4"}"#;
    let stats = parse_stats(row).unwrap();
    assert!((stats.cpu_pct - 0.15).abs() < f32::EPSILON);
    assert_eq!(stats.pids, 4);
    assert_eq!(stats.net_in, 796);
    assert_eq!(stats.net_out, 124);
    assert!(stats.mem_limit > stats.mem_bytes);
}

#[test]
fn stats_garbage_is_an_error() {
    assert!(parse_stats("not json").is_err());
}

#[test]
fn create_args_carry_limits_env_and_image() {
    let mut spec = SandboxSpec {
        sandbox_id: SandboxId::from_string("sbx-args"),
        image: "sbx-base:latest".to_string(),
        limits: ResourceLimits { memory_mb: 2048, cpus: 2, disk_mb: 8192 },
        env: Default::default(),
    };
    spec.env.insert("FOO".to_string(), "bar".to_string());

    let args = create_args(&spec, 9105);
    let joined = args.join(" ");
    assert!(joined.contains("--name sbx-sbx-args"));
    assert!(joined.contains("-p 9105:8080"));
    assert!(joined.contains("--memory 2048m"));
    assert!(joined.contains("--cpus 2"));
    assert!(joined.contains("-e FOO=bar"));
    assert_eq!(args.last().map(String::as_str), Some("sbx-base:latest"));
}

#[test]
fn missing_container_classifies_as_not_found() {
    let id = SandboxId::from_string("sbx-x");
    let output = std::process::Command::new("sh")
        .args(["-c", "echo 'Error: No such container: sbx-sbx-x' >&2; exit 1"])
        .output()
        .unwrap();
    let err = classify(&id, &["start"], &output);
    assert!(matches!(err, RuntimeError::NotFound(_)));
}

// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Configuration store tests (§6): unknown keys are rejected at load time,
//! and a handful of structural invariants (non-empty stream list, unique
//! well-formed ids, a sane priority range) are enforced before a `Config`
//! is ever handed to the rest of the system.

use nvr::config::Config;
use tempfile::TempDir;

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("nvr.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn a_minimal_valid_config_parses_with_defaults_filled_in() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [storage]
        storage_path = "/var/lib/nvr"

        [[streams]]
        id = "cam1"
        url = "rtsp://10.0.0.5/stream1"
        "#,
    );

    let config = Config::from_file(&path).expect("minimal config must parse");
    assert_eq!(config.streams.len(), 1);
    let cam = config.stream("cam1").expect("stream must be reachable by id");
    assert!(cam.enabled, "enabled must default to true");
    assert!(cam.record, "record must default to true");
    assert_eq!(cam.priority, 5, "priority must default to 5");
    assert_eq!(config.storage.retention_days, 30);
    assert_eq!(config.storage.segment_duration_seconds, 900);
    assert!(config.api.enabled);
    assert_eq!(config.api.web_port, 8080);
}

#[test]
fn unknown_top_level_keys_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [storage]
        storage_path = "/var/lib/nvr"
        this_key_does_not_exist = true

        [[streams]]
        id = "cam1"
        url = "rtsp://10.0.0.5/stream1"
        "#,
    );

    let err = Config::from_file(&path).expect_err("unrecognized keys must fail to load, not be silently ignored");
    let message = format!("{err}");
    assert!(message.to_lowercase().contains("invalid") || message.to_lowercase().contains("unknown"));
}

#[test]
fn an_empty_stream_list_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [storage]
        storage_path = "/var/lib/nvr"
        "#,
    );

    let err = Config::from_file(&path).expect_err("a config with no streams must fail validation");
    assert!(format!("{err}").contains("No streams"));
}

#[test]
fn duplicate_stream_ids_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [storage]
        storage_path = "/var/lib/nvr"

        [[streams]]
        id = "cam1"
        url = "rtsp://10.0.0.5/a"

        [[streams]]
        id = "cam1"
        url = "rtsp://10.0.0.5/b"
        "#,
    );

    let err = Config::from_file(&path).expect_err("duplicate ids must fail validation");
    assert!(format!("{err}").contains("Duplicate"));
}

#[test]
fn stream_ids_with_invalid_characters_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [storage]
        storage_path = "/var/lib/nvr"

        [[streams]]
        id = "front door!"
        url = "rtsp://10.0.0.5/a"
        "#,
    );

    let err = Config::from_file(&path).expect_err("an id with spaces/punctuation must fail validation");
    assert!(format!("{err}").contains("must match"));
}

#[test]
fn priority_outside_one_to_ten_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [storage]
        storage_path = "/var/lib/nvr"

        [[streams]]
        id = "cam1"
        url = "rtsp://10.0.0.5/a"
        priority = 0
        "#,
    );

    let err = Config::from_file(&path).expect_err("priority 0 is out of the 1..=10 range");
    assert!(format!("{err}").contains("priority"));
}

#[test]
fn legacy_aliases_for_streams_and_storage_path_are_accepted() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [storage]
        base_path = "/var/lib/nvr"

        [[cameras]]
        id = "cam1"
        url = "rtsp://10.0.0.5/a"
        "#,
    );

    let config = Config::from_file(&path).expect("legacy aliases must still load");
    assert_eq!(config.streams.len(), 1);
    assert_eq!(config.storage.storage_path, std::path::PathBuf::from("/var/lib/nvr"));
}

#[test]
fn save_to_file_round_trips_through_from_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
        [storage]
        storage_path = "/var/lib/nvr"

        [[streams]]
        id = "cam1"
        url = "rtsp://10.0.0.5/a"
        priority = 7
        "#,
    );

    let config = Config::from_file(&path).unwrap();
    let saved_path = dir.path().join("nvr-saved.toml");
    config.save_to_file(&saved_path).unwrap();

    let reloaded = Config::from_file(&saved_path).expect("a config we wrote ourselves must load back");
    assert_eq!(reloaded.streams.len(), 1);
    assert_eq!(reloaded.stream("cam1").unwrap().priority, 7);
}

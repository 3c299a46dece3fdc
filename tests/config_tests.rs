//! Loading configuration files from disk and layering CLI flags on top.

use std::io::Write;

use clap::Parser;
use roomsync::cli::{Args, Command};
use roomsync::gateway::Provider;
use roomsync::{SyncConfig, SyncError};

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_file() {
    let file = write_config(
        r#"
        hub_url = "ws://hub.internal:8787"
        room = "design"
        username = "ada"

        [presence]
        quiet_period_ms = 400

        [assistant]
        provider = "openai"
        model = "gpt-4o-mini"
        display_name = "Helper"
        trigger = "@bot"

        [timestamps]
        format = "%H:%M"
        utc_offset_minutes = 60
        "#,
    );
    let cfg = SyncConfig::load(file.path()).unwrap();
    assert_eq!(cfg.hub_url, "ws://hub.internal:8787");
    assert_eq!(cfg.room, "design");
    assert_eq!(cfg.presence.quiet_period_ms, 400);
    assert_eq!(cfg.assistant.provider, Provider::Openai);
    assert_eq!(cfg.assistant.resolved_model(), "gpt-4o-mini");
    assert_eq!(cfg.assistant.trigger, "@bot");
    assert_eq!(cfg.timestamps.utc_offset_minutes, 60);
    assert_eq!(cfg.room_url(), "ws://hub.internal:8787/ws/design?name=ada");
}

#[test]
fn test_empty_file_is_valid() {
    let file = write_config("");
    assert_eq!(SyncConfig::load(file.path()).unwrap(), SyncConfig::default());
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = SyncConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, SyncError::Io(_)));
}

#[test]
fn test_wrong_type_is_config_error() {
    let file = write_config("[presence]\nquiet_period_ms = \"soon\"\n");
    assert!(matches!(SyncConfig::load(file.path()), Err(SyncError::Config(_))));
}

#[test]
fn test_flags_override_file_values() {
    let file = write_config("room = \"from-file\"\nusername = \"file-user\"\n");
    let path = file.path().to_string_lossy().to_string();
    let args = Args::parse_from(["roomsync", "join", "from-flag", "--config", &path]);

    let mut cfg = args.load_config().unwrap();
    let Command::Join(join) = &args.command else {
        panic!("expected join");
    };
    join.apply(&mut cfg);
    assert_eq!(cfg.room, "from-flag");
    assert_eq!(cfg.username, "file-user");
}

//! Logging initialization (one global subscriber per test binary)

#![allow(clippy::expect_used, clippy::unwrap_used)]

use packet_mux::config::LoggingConfig;
use packet_mux::utils::logging::init_logging;
use packet_mux::SocketHandler;
use tracing::Level;

#[test]
fn test_init_logging_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("packet-mux.log");
    let config = LoggingConfig {
        log_level: Level::DEBUG,
        log_to_console: false,
        log_to_file: true,
        log_file_path: Some(path.to_string_lossy().into_owned()),
        ..LoggingConfig::default()
    };

    init_logging(&config).expect("First initialization should succeed");
    assert!(init_logging(&config).is_err(), "Second initialization must fail");

    let mut handler = SocketHandler::new().unwrap();
    handler.initialize(3).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("Logging initialized"));
    assert!(contents.contains("Socket handler initialized"));
    assert!(contents.contains("max_connections=3"));

    handler.close_all();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("Closed all sockets"));
    assert!(contents.contains("Transport metrics snapshot"));
}

#[test]
fn test_file_logging_requires_path() {
    let config = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };
    assert!(init_logging(&config).is_err());
}

#[test]
fn test_logging_requires_an_output() {
    let config = LoggingConfig {
        log_to_console: false,
        log_to_file: false,
        ..LoggingConfig::default()
    };
    assert!(!config.validate().is_empty());
    assert!(init_logging(&config).is_err());
}

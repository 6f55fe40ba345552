use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use live_view_proxy::config::ProxyConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "LIVE_VIEW_CONFIG",
        "LIVE_VIEW_SOURCE_ENDPOINTS",
        "LIVE_VIEW_DEST_ENDPOINT",
        "LIVE_VIEW_QUEUE_LENGTH",
        "LIVE_VIEW_DROP_WARN_CUTOFF",
        "LIVE_VIEW_API_ADDR",
        "LIVE_VIEW_DRAIN_INTERVAL_MS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ProxyConfig::load().expect("load config");
    assert_eq!(cfg.sources.len(), 1);
    assert_eq!(cfg.sources[0].name, "node_1");
    assert_eq!(cfg.sources[0].endpoint.to_string(), "tcp://127.0.0.1:5010");
    assert_eq!(cfg.destination.to_string(), "tcp://127.0.0.1:5020");
    assert_eq!(cfg.queue_length, 10);
    assert!((cfg.drop_warn_cutoff - 0.5).abs() < 1e-12);
    assert_eq!(cfg.api_addr, "127.0.0.1:8888");
    assert_eq!(cfg.drain_interval, Duration::from_millis(1));
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "source_endpoints": "cam_a=tcp://127.0.0.1:6000, cam_b=tcp://127.0.0.1:6001",
            "destination_endpoint": "tcp://*:6100",
            "queue_length": 32,
            "dropped_frame_warning_cutoff": 0.25,
            "api": { "addr": "127.0.0.1:9100" }
        }"#,
    );
    std::env::set_var("LIVE_VIEW_CONFIG", file.path());
    std::env::set_var("LIVE_VIEW_QUEUE_LENGTH", "64");

    let cfg = ProxyConfig::load().expect("load config");
    let names: Vec<&str> = cfg.sources.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["cam_a", "cam_b"]);
    assert_eq!(cfg.destination.host, "0.0.0.0");
    assert_eq!(cfg.destination.port, 6100);
    assert_eq!(cfg.queue_length, 64);
    assert!((cfg.drop_warn_cutoff - 0.25).abs() < 1e-12);
    assert_eq!(cfg.api_addr, "127.0.0.1:9100");

    let settings = cfg.combiner_settings();
    assert_eq!(settings.queue_length, 64);
    assert_eq!(settings.destination, "tcp://0.0.0.0:6100");

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
source_endpoints = "left=tcp://127.0.0.1:7000"
queue_length = 5
drain_interval_ms = 4

[api]
addr = "127.0.0.1:0"
"#,
    );
    let cfg = ProxyConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.sources[0].name, "left");
    assert_eq!(cfg.queue_length, 5);
    assert_eq!(cfg.drain_interval, Duration::from_millis(4));
    assert_eq!(cfg.api_addr, "127.0.0.1:0");
}

#[test]
fn malformed_source_entries_are_skipped() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var(
        "LIVE_VIEW_SOURCE_ENDPOINTS",
        "not_even_parsable,bad_node=not.a.real.socket,good=tcp://127.0.0.1:5011",
    );
    let cfg = ProxyConfig::load().expect("load config");
    assert_eq!(cfg.sources.len(), 1);
    assert_eq!(cfg.sources[0].name, "good");

    std::env::set_var("LIVE_VIEW_SOURCE_ENDPOINTS", "nothing_usable");
    let err = ProxyConfig::load().unwrap_err();
    assert!(err.to_string().contains("no usable source endpoints"));

    clear_env();
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("LIVE_VIEW_QUEUE_LENGTH", "0");
    assert!(ProxyConfig::load().is_err());
    std::env::remove_var("LIVE_VIEW_QUEUE_LENGTH");

    std::env::set_var("LIVE_VIEW_DROP_WARN_CUTOFF", "1.5");
    assert!(ProxyConfig::load().is_err());
    std::env::set_var("LIVE_VIEW_DROP_WARN_CUTOFF", "lots");
    assert!(ProxyConfig::load().is_err());
    std::env::remove_var("LIVE_VIEW_DROP_WARN_CUTOFF");

    std::env::set_var("LIVE_VIEW_DEST_ENDPOINT", "udp://127.0.0.1:5020");
    assert!(ProxyConfig::load().is_err());
    std::env::remove_var("LIVE_VIEW_DEST_ENDPOINT");

    let file = write_config(".json", "{ not json");
    assert!(ProxyConfig::load_from(Some(file.path())).is_err());

    clear_env();
}

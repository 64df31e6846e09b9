use std::fs;

use scanward_config::EngineConfig;

#[test]
fn toml_overrides_only_what_it_names() {
    let config = EngineConfig::parse_from_str(
        r#"
log_filter = "debug"

[orchestrator.scheduler]
lookahead = 4

[orchestrator.timeouts.per_scanner]
trivy = 1200

[orchestrator.bundles]
ci = ["secret", "semgrep"]
"#,
        "inline",
    )
    .expect("valid toml");

    assert_eq!(config.log_filter.as_deref(), Some("debug"));
    assert_eq!(config.orchestrator.scheduler.lookahead, 4);
    assert_eq!(config.orchestrator.scheduler.poll_interval_ms, 100);
    assert_eq!(
        config.orchestrator.timeouts.for_scanner("trivy").as_secs(),
        1200
    );
    assert_eq!(
        config.orchestrator.timeouts.for_scanner("secret").as_secs(),
        600
    );
    assert_eq!(
        config.orchestrator.bundles.get("ci").map(Vec::len),
        Some(2)
    );
}

#[test]
fn json_is_accepted_as_a_fallback() {
    let config = EngineConfig::parse_from_str(
        r#"{ "orchestrator": { "cache": { "path_components": 2 } }, "work_dir": "/srv/scanward" }"#,
        "inline",
    )
    .expect("valid json");
    assert_eq!(config.orchestrator.cache.path_components, 2);
    assert_eq!(
        config.effective_work_dir(),
        std::path::PathBuf::from("/srv/scanward")
    );
}

#[test]
fn out_of_range_values_are_rejected() {
    let err = EngineConfig::parse_from_str(
        "[orchestrator.resources]\nmin_admission_score = 1.5\n",
        "inline",
    )
    .expect_err("score above one");
    assert!(format!("{err:#}").contains("min_admission_score"));

    let err = EngineConfig::parse_json(r#"{ "orchestrator": { "profiles": { "ema_alpha": 0.0 } } }"#)
        .expect_err("alpha of zero");
    assert!(format!("{err:#}").contains("ema_alpha"));
}

#[test]
fn garbage_reports_both_parsers() {
    let err = EngineConfig::parse_from_str("this is = = not config", "broken.conf")
        .expect_err("unparseable");
    let message = err.to_string();
    assert!(message.contains("broken.conf"));
    assert!(message.contains("toml error"));
    assert!(message.contains("json error"));
}

#[test]
fn files_are_parsed_by_extension() {
    let dir = tempfile::tempdir().expect("tempdir");
    let toml_path = dir.path().join("scanward.toml");
    fs::write(&toml_path, "[orchestrator.workers]\nmax_workers_per_pool = 4\n").expect("write");
    let json_path = dir.path().join("scanward.json");
    fs::write(
        &json_path,
        r#"{ "orchestrator": { "workers": { "max_workers_per_pool": 6 } } }"#,
    )
    .expect("write");

    let from_toml = EngineConfig::load_from_file(&toml_path).expect("toml file");
    let from_json = EngineConfig::load_from_file(&json_path).expect("json file");
    assert_eq!(from_toml.orchestrator.workers.max_workers_per_pool, 4);
    assert_eq!(from_json.orchestrator.workers.max_workers_per_pool, 6);

    let missing = EngineConfig::load_from_file(&dir.path().join("absent.toml"))
        .expect_err("missing file");
    assert!(missing.to_string().contains("absent.toml"));
}

use anyhow::Result;
use snapflow::{AppConfig, ConfigError, ErrorPolicy, LogFormat, LogLevel};
use std::fs;
use std::path::PathBuf;

#[test]
fn loads_every_section_from_toml() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("snapflow.toml");
    fs::write(
        &path,
        r#"
        [log]
        level = "debug"
        format = "json"

        [etl]
        in_dir = "/data/snapshot"
        out_dir = "/data/out"
        batch_size = 16
        max_batches = 4
        error_policy = "abort"
        expected_items = ["works"]
        extract = { workers = 2, queue_capacity = 3 }
        transform = { workers = 4 }

        [[schema.fields]]
        name = "doi"
        type = "utf8"
        nullable = false

        [sync]
        workers = 8
        chunk_size = 500
        staggered_start = true

        [client]
        url = "https://index.example.org:9200"
        username = "loader"
        "#,
    )?;

    let cfg = AppConfig::from_toml_file(&path)?;

    assert_eq!(cfg.log.level, LogLevel::Debug);
    assert_eq!(cfg.log.format, LogFormat::Json);
    assert_eq!(cfg.etl.in_dir, PathBuf::from("/data/snapshot"));
    assert_eq!(cfg.etl.batch_size, 16);
    assert_eq!(cfg.etl.max_batches, Some(4));
    assert_eq!(cfg.etl.error_policy, ErrorPolicy::Abort);
    assert_eq!((cfg.etl.extract.workers, cfg.etl.extract.queue_capacity), (2, 3));
    assert_eq!((cfg.etl.transform.workers, cfg.etl.transform.queue_capacity), (4, 0));
    assert_eq!(cfg.etl.cleanup.workers, 1);
    assert_eq!(cfg.schema.to_arrow()?.fields().len(), 1);
    assert_eq!(cfg.sync.workers, 8);
    assert_eq!(cfg.sync.max_retries, 10, "unset keys keep their defaults");
    assert!(cfg.sync.staggered_start);
    assert_eq!(cfg.client.username.as_deref(), Some("loader"));
    cfg.sync.validate()?;
    cfg.client.validate()?;
    Ok(())
}

#[test]
fn unreadable_or_invalid_files_are_config_errors() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    assert!(matches!(
        AppConfig::from_toml_file(tmp.path().join("missing.toml")),
        Err(ConfigError::File { .. })
    ));

    let bad = tmp.path().join("bad.toml");
    fs::write(&bad, "[sync]\nworkers = \"many\"\n")?;
    assert!(matches!(AppConfig::from_toml_file(&bad), Err(ConfigError::File { .. })));
    Ok(())
}

#[test]
fn zero_values_are_rejected() {
    let mut cfg = AppConfig::default();
    cfg.sync.workers = 0;
    assert_eq!(cfg.sync.validate(), Err(ConfigError::Zero { field: "workers" }));

    let mut cfg = AppConfig::default();
    cfg.sync.chunk_size = 0;
    assert_eq!(cfg.sync.validate(), Err(ConfigError::Zero { field: "chunk_size" }));

    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = AppConfig::default();
    cfg.etl.in_dir = tmp.path().to_path_buf();
    cfg.etl.transform.workers = 0;
    assert_eq!(cfg.etl.validate(), Err(ConfigError::Zero { field: "transform.workers" }));
}

#[test]
fn client_url_must_be_http() {
    let mut cfg = AppConfig::default();
    cfg.client.url = "localhost:9200".into();
    assert!(matches!(cfg.client.validate(), Err(ConfigError::OutOfRange { field: "url", .. })));
}

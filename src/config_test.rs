use std::path::PathBuf;

use super::{AppConfig, AppContext};

#[test]
fn test_missing_file_uses_defaults() {
    let config = AppConfig::load(&PathBuf::from("/definitely/missing/config.json"));
    assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
    assert_eq!(config.jpeg_quality, 2);
    assert_eq!(config.excluded_codecs, vec!["dvd_subtitle", "bin_data"]);
}

#[test]
fn test_partial_file_keeps_other_defaults() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{ "ffmpeg_path": "/opt/ffmpeg/bin/ffmpeg", "progress_interval_ms": 250 }"#)?;

    let config = AppConfig::load(&path);
    assert_eq!(config.ffmpeg_path, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
    assert_eq!(config.progress_interval().as_millis(), 250);
    assert_eq!(config.ffprobe_path, PathBuf::from("ffprobe"));
    Ok(())
}

#[test]
fn test_invalid_file_uses_defaults() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json")?;

    let config = AppConfig::load(&path);
    assert_eq!(config.bind, "127.0.0.1:8080");
    Ok(())
}

#[test]
fn test_upscayl_root_derives_transform_paths() {
    let config = AppConfig {
        upscayl_path: Some(PathBuf::from("/opt/upscayl")),
        ..AppConfig::default()
    };
    let (binary, models) = config.transform_paths();
    assert!(binary.starts_with("/opt/upscayl/resources/bin"));
    assert_eq!(models, PathBuf::from("/opt/upscayl/resources/models"));

    let ctx = AppContext::new(config);
    assert_eq!(ctx.transform.model_dir(), models.as_path());
}

use lumen_logger::{FileFormat, LevelFilter, Logger};
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn json_file_sink_writes_structured_lines() -> Result<(), Box<dyn std::error::Error>> {
    let tmp_dir = tempdir()?;
    let log_dir = tmp_dir.path().join("logs");

    let logger = Logger::builder()
        .name("lumen-file-logging")
        .console(false)
        .path(&log_dir)
        .format(FileFormat::Json)
        .level(LevelFilter::INFO)
        .init()?;
    assert!(logger.has_file_sink());

    tracing::info!(backend = "memory", "storage ready");

    std::thread::sleep(Duration::from_millis(30));
    drop(logger);

    let log_file = fs::read_dir(&log_dir)?
        .flatten()
        .map(|entry| entry.path())
        .find(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .expect("log file should be created");

    let contents = fs::read_to_string(&log_file)?;
    let line = contents.lines().find(|l| l.contains("storage ready")).expect("event logged");
    assert!(line.starts_with('{'), "json sink should emit objects: {line}");
    assert!(line.contains("\"backend\":\"memory\""));

    Ok(())
}

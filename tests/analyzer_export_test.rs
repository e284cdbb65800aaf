//! Analyzers, data table exports and capture files.

mod common;

use std::path::Path;

use logic2_automation::{
    AnalyzerSettings, AutomationError, Capture, DataTableExportConfiguration,
    DataTableExportOptions, DataTableFilter, ErrorKind, HighLevelAnalyzerSettings, Manager,
    RadixType,
};

use common::{digital, setup, timed};

async fn finished_capture(manager: &Manager) -> Capture {
    let mut capture = manager
        .start_capture(None, &digital([0, 1, 2, 3], 10_000_000), &timed(0.1))
        .await
        .unwrap();
    capture.wait().await.unwrap();
    capture
}

fn spi_settings() -> AnalyzerSettings {
    let mut settings = AnalyzerSettings::new();
    settings.insert("MISO".into(), 0.into());
    settings.insert("Clock".into(), 1.into());
    settings.insert("Enable".into(), 2.into());
    settings.insert("Bits per Transfer".into(), "8 Bits per Transfer (Standard)".into());
    settings
}

fn serial_settings() -> AnalyzerSettings {
    let mut settings = AnalyzerSettings::new();
    settings.insert("Input Channel".into(), 3.into());
    settings.insert("Bit Rate (Bits/s)".into(), 115_200.into());
    settings
}

fn write_extension(dir: &Path) {
    std::fs::write(
        dir.join("extension.json"),
        r#"{
            "name": "Message Decoder",
            "apiVersion": "1.0.0",
            "extensions": {
                "Message Decoder": {
                    "type": "HighLevelAnalyzer",
                    "entryPoint": "HighLevelAnalyzer.Hla"
                }
            }
        }"#,
    )
    .unwrap();
}

fn read_rows(path: &Path) -> (csv::StringRecord, Vec<csv::StringRecord>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let headers = reader.headers().unwrap().clone();
    let rows = reader.records().map(Result::unwrap).collect();
    (headers, rows)
}

#[tokio::test]
async fn test_add_and_remove_analyzers() {
    let (_sim, manager) = setup().await;
    let mut capture = finished_capture(&manager).await;

    let spi = capture
        .add_analyzer("SPI", Some("flash"), &spi_settings())
        .await
        .unwrap();
    let serial = capture
        .add_analyzer("Async Serial", None, &serial_settings())
        .await
        .unwrap();
    assert_ne!(spi, serial);
    assert_eq!(capture.analyzers().len(), 2);

    let err = capture
        .add_analyzer("I2C", Some("flash"), &AnalyzerSettings::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest, "Duplicate label");

    capture.remove_analyzer(serial).await.unwrap();
    assert_eq!(capture.analyzers().len(), 1);
    let err = capture.remove_analyzer(serial).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest, "Already removed");

    capture.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_analyzer_settings_are_validated() {
    let (_sim, manager) = setup().await;
    let mut capture = finished_capture(&manager).await;

    let mut settings = spi_settings();
    settings.insert("Clock".into(), 7.into());
    let err = capture.add_analyzer("SPI", None, &settings).await.unwrap_err();
    assert!(matches!(err, AutomationError::InvalidRequest(_)), "Channel 7 was not recorded");

    let mut settings = spi_settings();
    settings.insert("Bits per Transfer".into(), "Lots".into());
    let err = capture.add_analyzer("SPI", None, &settings).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let err = capture
        .add_analyzer("Morse", None, &AnalyzerSettings::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(capture.analyzers().is_empty(), "Failed adds leave nothing behind");

    capture.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_data_table_export() {
    let (_sim, manager) = setup().await;
    let mut capture = finished_capture(&manager).await;
    let spi = capture
        .add_analyzer("SPI", Some("flash"), &spi_settings())
        .await
        .unwrap();
    let serial = capture
        .add_analyzer("Async Serial", None, &serial_settings())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let table = dir.path().join("table.csv");
    capture
        .export_data_table(
            &table,
            &[
                DataTableExportConfiguration::new(spi, RadixType::Hexadecimal),
                DataTableExportConfiguration::new(serial, RadixType::Decimal),
            ],
            &DataTableExportOptions::default(),
        )
        .await
        .unwrap();

    let (headers, rows) = read_rows(&table);
    assert_eq!(headers, vec!["name", "type", "start_time", "duration", "data"]);
    assert!(rows.iter().any(|r| &r[0] == "flash" && &r[1] == "result"));
    assert!(rows.iter().any(|r| &r[0] == "Async Serial" && &r[1] == "data"));
    assert!(rows.iter().filter(|r| &r[0] == "flash").all(|r| r[4].starts_with("0x")));
    let starts: Vec<f64> = rows.iter().map(|r| r[2].parse().unwrap()).collect();
    assert!(starts.windows(2).all(|w| w[0] <= w[1]), "Rows are ordered by time");

    // Column subset and filter
    let filtered = dir.path().join("filtered.csv");
    let options = DataTableExportOptions {
        columns: vec!["name".into(), "data".into()],
        filter: Some(DataTableFilter {
            columns: vec!["data".into()],
            query: "0x0A".into(),
        }),
        iso8601_timestamp: false,
    };
    capture
        .export_data_table(&filtered, &[DataTableExportConfiguration::new(spi, RadixType::Hexadecimal)], &options)
        .await
        .unwrap();
    let (headers, rows) = read_rows(&filtered);
    assert_eq!(headers, vec!["name", "data"]);
    assert!(!rows.is_empty());
    assert!(rows.iter().all(|r| &r[1] == "0x0A"));

    let err = capture
        .export_data_table(&table, &[], &DataTableExportOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Export, "No analyzers selected");

    capture.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_high_level_analyzer() {
    let (_sim, manager) = setup().await;
    let mut capture = finished_capture(&manager).await;
    let extension = tempfile::tempdir().unwrap();
    write_extension(extension.path());

    let serial = capture
        .add_analyzer("Async Serial", None, &serial_settings())
        .await
        .unwrap();
    let mut hla_settings = HighLevelAnalyzerSettings::new();
    hla_settings.insert("Delimiter".into(), "\n".into());
    hla_settings.insert("Timeout".into(), 0.5.into());

    let hla = capture
        .add_high_level_analyzer(extension.path(), "Message Decoder", serial, Some("messages"), &hla_settings)
        .await
        .unwrap();
    assert!(capture.analyzers().iter().any(|a| a.handle == hla && a.high_level));

    let err = capture
        .add_high_level_analyzer(extension.path(), "Not Declared", serial, None, &hla_settings)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    // The input analyzer cannot go while the HLA depends on it.
    let err = capture.remove_analyzer(serial).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let dir = tempfile::tempdir().unwrap();
    let table = dir.path().join("hla.csv");
    capture
        .export_data_table(&table, &[hla.into()], &DataTableExportOptions::default())
        .await
        .unwrap();
    let (_, rows) = read_rows(&table);
    assert!(!rows.is_empty());
    assert!(rows.iter().all(|r| &r[0] == "messages" && &r[1] == "Message Decoder"));

    let err = capture
        .legacy_export_analyzer(dir.path().join("legacy.csv"), hla, RadixType::Ascii)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Export, "HLAs have no legacy exporter");

    capture.remove_high_level_analyzer(hla).await.unwrap();
    capture.remove_analyzer(serial).await.unwrap();
    assert!(capture.analyzers().is_empty());

    capture.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_legacy_export() {
    let (_sim, manager) = setup().await;
    let mut capture = finished_capture(&manager).await;
    let spi = capture.add_analyzer("SPI", None, &spi_settings()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spi.csv");
    capture
        .legacy_export_analyzer(&path, spi, RadixType::Binary)
        .await
        .unwrap();

    let (headers, rows) = read_rows(&path);
    assert_eq!(headers, vec!["Time [s]", "Value"]);
    assert_eq!(&rows[0][1], "0b00000000");
    assert_eq!(&rows[1][1], "0b00000001");

    capture.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_save_and_load_round_trip() {
    let (_sim, manager) = setup().await;
    let mut capture = finished_capture(&manager).await;
    capture
        .add_analyzer("SPI", Some("flash"), &spi_settings())
        .await
        .unwrap();
    let serial = capture
        .add_analyzer("Async Serial", None, &serial_settings())
        .await
        .unwrap();
    let extension = tempfile::tempdir().unwrap();
    write_extension(extension.path());
    capture
        .add_high_level_analyzer(
            extension.path(),
            "Message Decoder",
            serial,
            None,
            &HighLevelAnalyzerSettings::new(),
        )
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("capture.sal");
    capture.save_capture(&file).await.unwrap();
    let original_channels = capture.channels().clone();
    let mut original: Vec<(String, Option<String>, bool)> = capture
        .analyzers()
        .iter()
        .map(|a| (a.name.clone(), a.label.clone(), a.high_level))
        .collect();
    capture.close().await.unwrap();

    let mut loaded = manager.load_capture(&file).await.unwrap();
    assert_eq!(loaded.state(), logic2_automation::CaptureState::Loaded);
    assert_eq!(loaded.channels(), &original_channels);
    let mut restored: Vec<(String, Option<String>, bool)> = loaded
        .analyzers()
        .iter()
        .map(|a| (a.name.clone(), a.label.clone(), a.high_level))
        .collect();
    original.sort();
    restored.sort();
    assert_eq!(restored, original);

    // Restored analyzers are usable under their new handles.
    let flash = loaded
        .analyzers()
        .iter()
        .find(|a| a.label.as_deref() == Some("flash"))
        .map(|a| a.handle)
        .unwrap();
    let table = dir.path().join("table.csv");
    loaded
        .export_data_table(&table, &[flash.into()], &DataTableExportOptions::default())
        .await
        .unwrap();
    let (_, rows) = read_rows(&table);
    assert!(!rows.is_empty());

    loaded.close().await.unwrap();
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_load_rejects_newer_file_version() {
    let (_sim, manager) = setup().await;
    let mut capture = finished_capture(&manager).await;
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("capture.sal");
    capture.save_capture(&file).await.unwrap();
    capture.close().await.unwrap();

    let mut json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
    json["version"]["major"] = serde_json::json!(2);
    std::fs::write(&file, serde_json::to_string(&json).unwrap()).unwrap();

    let err = manager.load_capture(&file).await.unwrap_err();
    assert!(matches!(err, AutomationError::LoadCaptureFailed(_)), "got {err:?}");
    assert_eq!(err.kind(), ErrorKind::Load);

    let err = manager
        .load_capture(dir.path().join("missing.sal"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Load);

    manager.close().await.unwrap();
}

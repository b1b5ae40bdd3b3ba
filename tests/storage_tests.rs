// Integration tests for the output tree: index rebuilding, chunk
// post-processing and session concatenation.
//
// Directory trees are laid out by hand so every case controls exactly which
// chunk files exist.

use anyhow::{bail, Result};
use chrono::Utc;
use rgbd_recorder::storage::naming::ChunkName;
use rgbd_recorder::storage::{
    CompletionMarker, ConcatOutcome, DeferReason, DeviceLayout, FileIndexBuilder,
    PassthroughTool, SessionConcatenator, StorageConfig, StoragePipeline, StreamKind,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const SESSION: &str = "ab12cd34";
const INTERVAL_MS: i64 = 15_000;

fn write_file(dir: &Path, name: &str, contents: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    fs::write(&path, contents)?;
    Ok(path)
}

fn chunk(index: u32, timestamp_ms: i64, extension: &str) -> String {
    ChunkName::new(SESSION, index, timestamp_ms, extension).file_name()
}

fn mark_complete(layout: &DeviceLayout, last_chunk_index: u32) -> Result<()> {
    CompletionMarker {
        device_id: layout.device_id().to_string(),
        session_id: SESSION.to_string(),
        last_chunk_index,
        disconnected: false,
        ended_at: Utc::now(),
    }
    .write(layout)?;
    Ok(())
}

fn concatenator(layout: &DeviceLayout) -> SessionConcatenator {
    SessionConcatenator::new(layout.clone(), Arc::new(PassthroughTool), INTERVAL_MS)
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

// ============================================================================
// Index builder
// ============================================================================

#[test]
fn test_index_recognises_layout() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let layout = DeviceLayout::new(temp_dir.path(), "cam1");

    write_file(
        &layout.session_dir(StreamKind::Color),
        &format!("device_cam1_session_{}_start_1000_end_31000.mp4", SESSION),
        b"video",
    )?;
    write_file(
        &layout.session_dir(StreamKind::Pose),
        &format!("device_cam1_session_{}.json", SESSION),
        b"[]",
    )?;
    for index in [10, 2, 0] {
        write_file(
            &layout.processed_dir(StreamKind::Color),
            &chunk(index, 1000 + index as i64, "mp4"),
            b"x",
        )?;
    }
    write_file(
        &layout.unprocessed_dir(StreamKind::Depth),
        &chunk(0, 900, "mp4"),
        b"x",
    )?;
    write_file(
        &layout.unprocessed_dir(StreamKind::Pose),
        &chunk(0, 950, "json"),
        b"[]",
    )?;

    let index = FileIndexBuilder::new(temp_dir.path(), "index.json").scan()?;
    let Some(record) = index.session("cam1", SESSION) else {
        bail!("Session missing from index");
    };

    assert_eq!(
        record.color.as_deref(),
        Some("device_cam1_session_ab12cd34_start_1000_end_31000.mp4")
    );
    assert!(record.depth.is_none());
    assert_eq!(record.pose.as_deref(), Some("device_cam1_session_ab12cd34.json"));
    assert_eq!(
        record.processed_chunks,
        vec![
            format!("color/{}", chunk(0, 1000, "mp4")),
            format!("color/{}", chunk(2, 1002, "mp4")),
            format!("color/{}", chunk(10, 1010, "mp4")),
        ]
    );
    assert_eq!(
        record.unprocessed_chunks,
        vec![
            format!("depth/{}", chunk(0, 900, "mp4")),
            format!("pose/{}", chunk(0, 950, "json")),
        ]
    );
    assert_eq!(index.session_count(), 1);

    Ok(())
}

#[test]
fn test_index_ignores_malformed_names() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let layout = DeviceLayout::new(temp_dir.path(), "cam1");

    let color = layout.unprocessed_dir(StreamKind::Color);
    write_file(&color, "notes.txt", b"")?;
    write_file(&color, "chunk_short_0_1.mp4", b"")?;
    write_file(&color, "chunk_ab12cd3_0_1.mp4", b"")?;
    write_file(
        &layout.session_dir(StreamKind::Color),
        "device_cam1_session_toolong123_start_1_end_2.mp4",
        b"",
    )?;
    write_file(&color, &chunk(0, 1, "mp4"), b"")?;

    let index = FileIndexBuilder::new(temp_dir.path(), "index.json").scan()?;
    let Some(sessions) = index.devices.get("cam1") else {
        bail!("Device missing from index");
    };

    assert_eq!(sessions.keys().cloned().collect::<Vec<_>>(), vec![SESSION.to_string()]);
    assert_eq!(sessions[SESSION].unprocessed_chunks.len(), 1);
    assert!(sessions[SESSION].color.is_none());

    Ok(())
}

#[test]
fn test_index_rebuild_is_idempotent() -> Result<()> {
    let temp_dir = TempDir::new()?;
    for device in ["cam2", "cam1"] {
        let layout = DeviceLayout::new(temp_dir.path(), device);
        for index in 0..3 {
            write_file(
                &layout.unprocessed_dir(StreamKind::Color),
                &chunk(index, 100 * index as i64, "mp4"),
                b"x",
            )?;
        }
    }

    let builder = FileIndexBuilder::new(temp_dir.path(), "index.json");
    let first = builder.rebuild()?;
    let first_bytes = fs::read(builder.index_path())?;
    let second = builder.rebuild()?;
    let second_bytes = fs::read(builder.index_path())?;

    assert_eq!(first, second);
    assert_eq!(first_bytes, second_bytes);
    assert_eq!(first.devices.keys().cloned().collect::<Vec<_>>(), vec!["cam1", "cam2"]);

    // The cache file never becomes a device
    assert!(!second.devices.contains_key("index.json"));

    Ok(())
}

#[test]
fn test_concurrent_rebuilds_all_succeed() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let layout = DeviceLayout::new(temp_dir.path(), "cam1");
    write_file(
        &layout.unprocessed_dir(StreamKind::Color),
        &chunk(0, 100, "mp4"),
        b"x",
    )?;

    let builder = FileIndexBuilder::new(temp_dir.path(), "index.json");
    let failures: usize = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    (0..25)
                        .filter(|_| builder.rebuild().is_err())
                        .count()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap_or(25)).sum()
    });
    assert_eq!(failures, 0);

    // Only the cache itself is left at the root, no staging files
    let leftovers: Vec<_> = fs::read_dir(temp_dir.path())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("index.json")]);

    let cached: serde_json::Value = serde_json::from_slice(&fs::read(builder.index_path())?)?;
    assert!(cached.is_object());

    Ok(())
}

// ============================================================================
// Concatenation
// ============================================================================

fn write_processed_video(layout: &DeviceLayout, indices: &[u32]) -> Result<()> {
    for kind in StreamKind::VIDEO {
        for &index in indices {
            write_file(
                &layout.processed_dir(kind),
                &chunk(index, 115_000 + 15_000 * index as i64, "mp4"),
                format!("{}{}", kind, index).as_bytes(),
            )?;
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_concatenation_orders_by_embedded_index() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let layout = DeviceLayout::new(temp_dir.path(), "cam1");

    // Created out of order on purpose
    write_processed_video(&layout, &[2, 0, 1])?;
    mark_complete(&layout, 2)?;

    let report = concatenator(&layout).concatenate_if_ready(SESSION).await?;
    let ConcatOutcome::Concatenated { output } = &report.color else {
        bail!("Color not concatenated: {:?}", report.color);
    };

    assert_eq!(fs::read(output)?, b"color0color1color2");
    // start = earliest chunk end − interval
    assert_eq!(
        files_in(&layout.session_dir(StreamKind::Color)),
        vec![format!("device_cam1_session_{}_start_100000_end_145000.mp4", SESSION)]
    );

    let ConcatOutcome::Concatenated { output } = &report.depth else {
        bail!("Depth not concatenated: {:?}", report.depth);
    };
    assert_eq!(fs::read(output)?, b"depth0depth1depth2");

    Ok(())
}

#[tokio::test]
async fn test_concatenation_runs_once_when_complete() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let layout = DeviceLayout::new(temp_dir.path(), "cam1");
    let concatenator = concatenator(&layout);

    write_processed_video(&layout, &[0, 1])?;

    // No marker: the session may still be recording
    let report = concatenator.concatenate_if_ready(SESSION).await?;
    assert_eq!(report.color, ConcatOutcome::NoMarker);

    // Marker says three chunks, only two processed and none waiting
    mark_complete(&layout, 2)?;
    let report = concatenator.concatenate_if_ready(SESSION).await?;
    assert!(matches!(
        report.color,
        ConcatOutcome::Deferred {
            reason: DeferReason::MissingChunks,
            processed: 2,
            unprocessed: 0,
            expected: 3,
            ..
        }
    ));
    assert!(files_in(&layout.session_dir(StreamKind::Color)).is_empty());

    write_processed_video(&layout, &[2])?;
    let report = concatenator.concatenate_if_ready(SESSION).await?;
    assert!(matches!(report.color, ConcatOutcome::Concatenated { .. }));
    assert!(matches!(report.depth, ConcatOutcome::Concatenated { .. }));

    let report = concatenator.concatenate_if_ready(SESSION).await?;
    assert_eq!(report.color, ConcatOutcome::AlreadyFinished);
    assert_eq!(report.depth, ConcatOutcome::AlreadyFinished);
    assert_eq!(files_in(&layout.session_dir(StreamKind::Color)).len(), 1);
    assert_eq!(files_in(&layout.session_dir(StreamKind::Depth)).len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_concatenation_ignores_chunks_past_marker() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let layout = DeviceLayout::new(temp_dir.path(), "cam1");

    write_processed_video(&layout, &[0, 1, 2])?;
    mark_complete(&layout, 1)?;

    let report = concatenator(&layout).concatenate_if_ready(SESSION).await?;
    let ConcatOutcome::Concatenated { output } = &report.color else {
        bail!("Color not concatenated: {:?}", report.color);
    };
    assert_eq!(fs::read(output)?, b"color0color1");

    Ok(())
}

#[tokio::test]
async fn test_pose_chunks_flatten_in_order() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let layout = DeviceLayout::new(temp_dir.path(), "cam1");
    let pose_dir = layout.unprocessed_dir(StreamKind::Pose);

    for index in [1u32, 0] {
        let samples = serde_json::json!([
            { "data": { "chunk": index, "n": 0 }, "timestamp": index * 10 },
            { "data": { "chunk": index, "n": 1 }, "timestamp": index * 10 + 1 },
        ]);
        write_file(
            &pose_dir,
            &chunk(index, 1000 + index as i64, "json"),
            &serde_json::to_vec(&samples)?,
        )?;
    }
    // Another session's poses stay out
    write_file(
        &pose_dir,
        &ChunkName::new("zz99yy88", 0, 5, "json").file_name(),
        br#"[{"data":{},"timestamp":5}]"#,
    )?;
    mark_complete(&layout, 1)?;

    let report = concatenator(&layout).concatenate_if_ready(SESSION).await?;
    let ConcatOutcome::Concatenated { output } = &report.pose else {
        bail!("Pose not concatenated: {:?}", report.pose);
    };
    assert_eq!(
        output.file_name().map(|f| f.to_string_lossy().to_string()),
        Some(format!("device_cam1_session_{}.json", SESSION))
    );

    let samples: Vec<serde_json::Value> = serde_json::from_slice(&fs::read(output)?)?;
    let timestamps: Vec<i64> = samples
        .iter()
        .filter_map(|s| s["timestamp"].as_i64())
        .collect();
    assert_eq!(timestamps, vec![0, 1, 10, 11]);

    // Video had nothing at all
    assert!(matches!(
        report.color,
        ConcatOutcome::Deferred {
            reason: DeferReason::MissingChunks,
            ..
        }
    ));

    Ok(())
}

// ============================================================================
// Post-processing
// ============================================================================

#[tokio::test]
async fn test_small_chunks_are_skipped_and_defer_concatenation() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage = StorageConfig {
        min_chunk_bytes: 1024,
        ..StorageConfig::new(temp_dir.path())
    };
    let pipeline = StoragePipeline::new(storage, INTERVAL_MS, Arc::new(PassthroughTool));
    let layout = pipeline.layout("cam1");

    for kind in StreamKind::VIDEO {
        let dir = layout.unprocessed_dir(kind);
        write_file(&dir, &chunk(0, 1000, "mp4"), &[7u8; 2048])?;
        write_file(&dir, &chunk(1, 2000, "mp4"), b"")?;
    }
    mark_complete(&layout, 1)?;

    let processing = pipeline.process_pending("cam1").await?;
    assert_eq!(processing.processed.len(), 2);
    assert_eq!(processing.skipped_small.len(), 2);
    assert!(processing.failed.is_empty());

    // The zero-byte chunk stays where it was
    assert_eq!(files_in(&layout.unprocessed_dir(StreamKind::Color)).len(), 2);
    assert_eq!(files_in(&layout.processed_dir(StreamKind::Color)).len(), 1);

    let report = pipeline.concatenate_if_ready("cam1", SESSION).await?;
    assert!(matches!(
        report.color,
        ConcatOutcome::Deferred {
            reason: DeferReason::Processing,
            processed: 1,
            unprocessed: 2,
            expected: 2,
            ..
        }
    ));

    Ok(())
}

#[tokio::test]
async fn test_open_chunk_is_not_processed() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage = StorageConfig {
        min_chunk_bytes: 1,
        ..StorageConfig::new(temp_dir.path())
    };
    let pipeline = StoragePipeline::new(storage, INTERVAL_MS, Arc::new(PassthroughTool));
    let layout = pipeline.layout("cam1");

    let dir = layout.unprocessed_dir(StreamKind::Color);
    write_file(&dir, &chunk(0, 1000, "mp4"), b"first")?;
    write_file(&dir, &chunk(1, 2000, "mp4"), b"second")?;

    // Without a marker only chunks followed by a later one are closed
    let processing = pipeline.process_pending("cam1").await?;
    assert_eq!(processing.processed.len(), 1);

    // Processing again does not duplicate
    let processing = pipeline.process_pending("cam1").await?;
    assert!(processing.processed.is_empty());

    mark_complete(&layout, 1)?;
    let processing = pipeline.process_pending("cam1").await?;
    assert_eq!(processing.processed.len(), 1);

    let processed = files_in(&layout.processed_dir(StreamKind::Color));
    assert_eq!(processed.len(), 2);
    let Some(first) = ChunkName::parse(&processed[0]) else {
        bail!("Unparseable processed chunk {}", processed[0]);
    };
    assert_eq!(first.session_id, SESSION);

    Ok(())
}

#[tokio::test]
async fn test_sweep_finishes_marked_sessions() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let storage = StorageConfig {
        min_chunk_bytes: 1,
        ..StorageConfig::new(temp_dir.path())
    };
    let pipeline = StoragePipeline::new(storage, INTERVAL_MS, Arc::new(PassthroughTool));
    let layout = pipeline.layout("cam1");

    for kind in StreamKind::VIDEO {
        let dir = layout.unprocessed_dir(kind);
        write_file(&dir, &chunk(0, 1000, "mp4"), b"a")?;
        write_file(&dir, &chunk(1, 2000, "mp4"), b"b")?;
    }
    for index in 0..2 {
        write_file(
            &layout.unprocessed_dir(StreamKind::Pose),
            &chunk(index, 1000, "json"),
            b"[]",
        )?;
    }
    mark_complete(&layout, 1)?;

    let (reports, index) = pipeline.sweep_all().await?;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].processing.processed.len(), 4);

    let Some(record) = index.session("cam1", SESSION) else {
        bail!("Session missing from index");
    };
    assert!(record.color.is_some());
    assert!(record.depth.is_some());
    assert!(record.pose.is_some());
    assert!(pipeline.index_path().exists());

    Ok(())
}

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

use super::model::{DataPiece, Segment, Track};
use crate::recording::pose::read_pose_samples;
use crate::storage::naming::SessionVideoName;
use crate::storage::{DeviceLayout, PersistentIndex, SessionRecord, StreamKind};

pub const COLOR_VIDEO: &str = "colorVideo";
pub const DEPTH_VIDEO: &str = "depthVideo";
pub const POSES: &str = "poses";

const SEGMENT_TYPE: &str = "rgbd";

/// Build one track per device from the finished sessions in the index
///
/// Sessions without a finished video never become segments; an unfinished
/// recording simply does not appear.
pub fn load_tracks(root: &Path, index: &PersistentIndex) -> Result<Vec<Track>> {
    let mut tracks = Vec::new();

    for (device_id, sessions) in &index.devices {
        let layout = DeviceLayout::new(root, device_id);
        let segments: Vec<Segment> = sessions
            .iter()
            .filter_map(|(session_id, record)| build_segment(&layout, session_id, record))
            .collect();

        if !segments.is_empty() {
            tracks.push(Track::new(device_id.clone(), segments));
        }
    }

    Ok(tracks)
}

fn build_segment(layout: &DeviceLayout, session_id: &str, record: &SessionRecord) -> Option<Segment> {
    let bounds_source = record.color.as_deref().or(record.depth.as_deref())?;
    let Some(name) = SessionVideoName::parse(bounds_source) else {
        warn!("Cannot read session bounds from {}", bounds_source);
        return None;
    };
    if name.start_ms >= name.end_ms {
        warn!(
            "Session {} has empty bounds {}..{}",
            session_id, name.start_ms, name.end_ms
        );
        return None;
    }

    let mut pieces = BTreeMap::new();
    for (kind, piece_name) in [(StreamKind::Color, COLOR_VIDEO), (StreamKind::Depth, DEPTH_VIDEO)] {
        if let Some(file) = record.finished(kind) {
            pieces.insert(
                piece_name.to_string(),
                DataPiece::Media {
                    resource: layout.session_dir(kind).join(file),
                },
            );
        }
    }

    if let Some(file) = record.pose.as_deref() {
        let path = layout.session_dir(StreamKind::Pose).join(file);
        match read_pose_samples(&path) {
            Ok(mut samples) => {
                samples.sort_by_key(|s| s.timestamp);
                pieces.insert(POSES.to_string(), DataPiece::Samples { samples });
            }
            Err(e) => warn!("Skipping poses of session {}: {:#}", session_id, e),
        }
    }

    Some(Segment {
        id: session_id.to_string(),
        track_id: layout.device_id().to_string(),
        start: name.start_ms,
        end: name.end_ms,
        kind: SEGMENT_TYPE.to_string(),
        pieces,
    })
}

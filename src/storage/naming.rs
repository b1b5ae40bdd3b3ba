//! Filename grammar shared by the recorder, index builder and concatenator
//!
//! - `chunk_<sessionId8>_<chunkIndex>_<timestampMs>.<ext>` for chunks
//! - `device_<deviceId>_session_<sessionId8>_start_<tsMs>_end_<tsMs>.<ext>` for finished videos
//! - `device_<deviceId>_session_<sessionId8>.json` for finished pose records

use chrono::Utc;

pub const SESSION_ID_LEN: usize = 8;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate an 8 character session ID
///
/// Six base-36 digits of the current time in seconds followed by two random
/// characters. Not globally unique, but two sessions on one device would have
/// to start within the same second and draw the same padding to collide.
pub fn generate_session_id() -> String {
    let secs = (now_ms() / 1000).max(0) as u64;
    let mut id = Vec::with_capacity(SESSION_ID_LEN);

    let mut rest = secs;
    for _ in 0..6 {
        id.push(ALPHABET[(rest % 36) as usize]);
        rest /= 36;
    }
    id.reverse();

    let random = uuid::Uuid::new_v4();
    for byte in random.as_bytes().iter().take(SESSION_ID_LEN - 6) {
        id.push(ALPHABET[(*byte as usize) % ALPHABET.len()]);
    }

    String::from_utf8(id).unwrap_or_default()
}

pub fn is_session_id(value: &str) -> bool {
    value.len() == SESSION_ID_LEN && value.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Extract the embedded session ID from any recognised filename
///
/// Matches `session_XXXXXXXX` or `chunk_XXXXXXXX` where the marker starts the
/// name or follows an underscore and the ID is exactly eight alphanumerics.
/// Anything else yields `None`.
pub fn extract_session_id(file_name: &str) -> Option<&str> {
    for marker in ["chunk_", "session_"] {
        let mut search_from = 0;
        while let Some(found) = file_name[search_from..].find(marker) {
            let start = search_from + found;
            search_from = start + marker.len();

            if start > 0 && file_name.as_bytes()[start - 1] != b'_' {
                continue;
            }

            let id_start = start + marker.len();
            let id_end = id_start + SESSION_ID_LEN;
            let Some(candidate) = file_name.get(id_start..id_end) else {
                continue;
            };
            let terminated = file_name
                .as_bytes()
                .get(id_end)
                .map(|b| !b.is_ascii_alphanumeric())
                .unwrap_or(true);

            if terminated && is_session_id(candidate) {
                return Some(candidate);
            }
        }
    }

    None
}

/// Name of one chunk file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkName {
    pub session_id: String,
    pub chunk_index: u32,
    pub timestamp_ms: i64,
    pub extension: String,
}

impl ChunkName {
    pub fn new(
        session_id: impl Into<String>,
        chunk_index: u32,
        timestamp_ms: i64,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            chunk_index,
            timestamp_ms,
            extension: extension.into(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "chunk_{}_{}_{}.{}",
            self.session_id, self.chunk_index, self.timestamp_ms, self.extension
        )
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, extension) = file_name.rsplit_once('.')?;
        let rest = stem.strip_prefix("chunk_")?;

        let mut parts = rest.split('_');
        let session_id = parts.next()?;
        let chunk_index = parts.next()?.parse().ok()?;
        let timestamp_ms = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !is_session_id(session_id) {
            return None;
        }

        Some(Self::new(session_id, chunk_index, timestamp_ms, extension))
    }
}

/// Name of a finished session video file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionVideoName {
    pub device_id: String,
    pub session_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub extension: String,
}

impl SessionVideoName {
    pub fn file_name(&self) -> String {
        format!(
            "device_{}_session_{}_start_{}_end_{}.{}",
            self.device_id, self.session_id, self.start_ms, self.end_ms, self.extension
        )
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, extension) = file_name.rsplit_once('.')?;
        let rest = stem.strip_prefix("device_")?;
        let (device_id, rest) = rest.rsplit_once("_session_")?;

        let (session_id, rest) = rest.split_once("_start_")?;
        let (start, end) = rest.split_once("_end_")?;
        if device_id.is_empty() || !is_session_id(session_id) {
            return None;
        }

        Some(Self {
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            start_ms: start.parse().ok()?,
            end_ms: end.parse().ok()?,
            extension: extension.to_string(),
        })
    }
}

pub fn session_pose_file_name(device_id: &str, session_id: &str) -> String {
    format!("device_{}_session_{}.json", device_id, session_id)
}

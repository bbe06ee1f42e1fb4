//! Synchronized frame acquisition.
//!
//! The capture source writes frames to
//! `<recordings_root>/Recording_<timestamp>/<CameraName>/frame_<N>.jpg` with
//! a sibling `frame_timestamps.txt`. [`RecordingWatcher`] polls this
//! hierarchy and emits a [`FrameBundle`] whenever every monitored camera has
//! a frame file newer than the one previously emitted. Intermediate frames a
//! slow consumer missed are discarded; only the newest unemitted frame per
//! camera is offered. When a new recording session appears the watcher
//! resets and follows it.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use bds_types::{epoch_now, CamId, FrameBundle};

const RECORDING_PREFIX: &str = "Recording_";
const FRAME_PREFIX: &str = "frame_";
const TIMESTAMPS_FILE: &str = "frame_timestamps.txt";

#[derive(thiserror::Error, Debug)]
pub enum FrameSourceError {
    /// No camera produced a new frame file for the configured idle timeout.
    #[error("frame source stalled: no new frames for {0:.1?}")]
    Stalled(Duration),
    #[error("IO error: {}", error)]
    Io {
        #[from]
        error: std::io::Error,
    },
}

pub type Result<M> = std::result::Result<M, FrameSourceError>;

/// The newest `Recording_*` directory under `root`, by modification time
/// (directory name breaks ties).
pub fn latest_recording_dir(root: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
    let mut best: Option<(std::time::SystemTime, Utf8PathBuf)> = None;
    for entry in root.read_dir_utf8()? {
        let entry = entry?;
        if !entry.file_name().starts_with(RECORDING_PREFIX) {
            continue;
        }
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        let path = entry.path().to_owned();
        let candidate = (mtime, path);
        if best
            .as_ref()
            .map(|b| candidate > *b)
            .unwrap_or(true)
        {
            best = Some(candidate);
        }
    }
    Ok(best.map(|(_, path)| path))
}

fn frame_index(file_name: &str) -> Option<u64> {
    let stem = file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_name);
    stem.strip_prefix(FRAME_PREFIX)?.parse().ok()
}

fn is_frame_image(file_name: &str) -> bool {
    (file_name.ends_with(".jpg") || file_name.ends_with(".png"))
        && file_name.starts_with(FRAME_PREFIX)
}

/// The newest frame file in one camera directory, by frame index.
fn newest_frame(camera_dir: &Utf8Path) -> Result<Option<(u64, Utf8PathBuf)>> {
    let mut best: Option<(u64, Utf8PathBuf)> = None;
    for entry in camera_dir.read_dir_utf8()? {
        let entry = entry?;
        let name = entry.file_name();
        if !is_frame_image(name) {
            continue;
        }
        let Some(idx) = frame_index(name) else {
            continue;
        };
        if best.as_ref().map(|(b, _)| idx > *b).unwrap_or(true) {
            best = Some((idx, entry.path().to_owned()));
        }
    }
    Ok(best)
}

fn load_timestamps(recording_dir: &Utf8Path) -> BTreeMap<u64, f64> {
    let path = recording_dir.join(TIMESTAMPS_FILE);
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return BTreeMap::new();
    };
    let mut map = BTreeMap::new();
    for line in contents.lines() {
        let Some((idx, ts)) = line.split_once(',') else {
            continue;
        };
        if let (Ok(idx), Ok(ts)) = (idx.trim().parse::<u64>(), ts.trim().parse::<f64>()) {
            map.insert(idx, ts);
        }
    }
    map
}

/// Polls a recordings root and yields synchronized frame bundles.
pub struct RecordingWatcher {
    root: Utf8PathBuf,
    cameras: Vec<CamId>,
    idle_timeout: Duration,
    current_recording: Option<Utf8PathBuf>,
    last_emitted: BTreeMap<CamId, u64>,
    timestamps: BTreeMap<u64, f64>,
    next_frame_id: u64,
    last_progress: Instant,
}

impl RecordingWatcher {
    pub fn new(root: Utf8PathBuf, cameras: Vec<CamId>, idle_timeout: Duration) -> Self {
        Self {
            root,
            cameras,
            idle_timeout,
            current_recording: None,
            last_emitted: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            next_frame_id: 0,
            last_progress: Instant::now(),
        }
    }

    /// Check the recording hierarchy once.
    ///
    /// `Ok(Some(_))` when every camera has advanced to a new frame;
    /// `Ok(None)` when at least one camera has nothing new yet;
    /// [`FrameSourceError::Stalled`] when nothing has advanced for the idle
    /// timeout (the watcher keeps working afterwards, so the caller may
    /// treat this as a warning and keep polling).
    pub fn poll(&mut self) -> Result<Option<FrameBundle>> {
        let bundle = self.poll_inner()?;
        match bundle {
            Some(bundle) => {
                self.last_progress = Instant::now();
                Ok(Some(bundle))
            }
            None => {
                if self.last_progress.elapsed() >= self.idle_timeout {
                    // restart the clock so the stall is reported once per
                    // timeout period, not on every poll
                    self.last_progress = Instant::now();
                    Err(FrameSourceError::Stalled(self.idle_timeout))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn poll_inner(&mut self) -> Result<Option<FrameBundle>> {
        let Some(recording) = latest_recording_dir(&self.root)? else {
            return Ok(None);
        };

        if self.current_recording.as_deref() != Some(recording.as_path()) {
            info!("following new recording session {recording}");
            self.last_emitted.clear();
            self.timestamps = load_timestamps(&recording);
            self.current_recording = Some(recording.clone());
        }

        // Offer the newest unemitted frame per camera; all cameras must
        // have advanced for a bundle to be emitted.
        let mut new_frames: BTreeMap<CamId, (u64, Utf8PathBuf)> = BTreeMap::new();
        for camera in &self.cameras {
            let camera_dir = recording.join(camera.as_str());
            if !camera_dir.is_dir() {
                return Ok(None);
            }
            let Some((idx, path)) = newest_frame(&camera_dir)? else {
                return Ok(None);
            };
            match self.last_emitted.get(camera) {
                Some(last) if *last >= idx => return Ok(None),
                _ => {}
            }
            new_frames.insert(camera.clone(), (idx, path));
        }
        if new_frames.len() < 2 {
            return Ok(None);
        }

        let source_index = new_frames.values().map(|(idx, _)| *idx).min();
        let timestamp = source_index
            .and_then(|idx| self.timestamps.get(&idx).copied())
            .unwrap_or_else(epoch_now);

        let mut images = BTreeMap::new();
        for (camera, (idx, path)) in new_frames {
            self.last_emitted.insert(camera.clone(), idx);
            images.insert(camera, path);
        }

        let bundle = FrameBundle {
            frame_id: self.next_frame_id,
            timestamp,
            images,
            recording_session: recording
                .file_name()
                .unwrap_or(recording.as_str())
                .to_string(),
        };
        self.next_frame_id += 1;
        debug!(
            "bundle {} from {} ({} cameras)",
            bundle.frame_id,
            bundle.recording_session,
            bundle.images.len()
        );
        Ok(Some(bundle))
    }

    /// Cameras this watcher monitors.
    pub fn cameras(&self) -> &[CamId] {
        &self.cameras
    }
}

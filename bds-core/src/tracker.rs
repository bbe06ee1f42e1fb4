//! Session-based trajectory tracking.
//!
//! A session is a contiguous episode during which an airplane is
//! continuously observed. The tracker opens a session when an airplane first
//! appears, extends it frame by frame, absorbs short position jumps as
//! noise, splits on sustained jumps and closes on absence. Only one worker
//! drives the tracker; it is not re-entrant.

use serde::Serialize;
use tracing::{debug, info};

use bds_types::{ObjectClass, TriangulatedPoint, NOMINAL_FPS};

use crate::{ActiveTrack, ActiveTracks, AIRPLANE_TRACK_ID, FLOCK_TRACK_ID};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Per-frame airplane movement beyond this many metres counts as a
    /// position jump.
    pub position_jump_threshold: f64,
    /// Jumps sustained for fewer frames than this are absorbed as noise.
    pub jump_duration_threshold: u32,
    /// Sessions shorter than this many frames are discarded on close.
    pub min_session_length: u64,
    /// Cleaning pass: interior points moving faster than this (m/frame) to
    /// both neighbours are dropped.
    pub clean_jump_threshold: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            position_jump_threshold: 50.0,
            jump_duration_threshold: 5,
            min_session_length: 50,
            clean_jump_threshold: 120.0,
        }
    }
}

/// Time series entry `(frame, x, z)` or `(frame, vx, vz)`.
pub type SeriesEntry = (u64, f64, f64);

/// A completed (or in-progress) observation episode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub session_id: u32,
    pub start_frame: u64,
    pub last_frame: u64,
    pub airplane_positions: Vec<SeriesEntry>,
    pub flock_positions: Vec<SeriesEntry>,
    /// Velocities in m/s assuming the nominal capture rate.
    pub airplane_velocities: Vec<SeriesEntry>,
    pub flock_velocities: Vec<SeriesEntry>,
}

impl Session {
    fn new(session_id: u32, start_frame: u64) -> Self {
        Self {
            session_id,
            start_frame,
            last_frame: start_frame,
            airplane_positions: Vec::new(),
            flock_positions: Vec::new(),
            airplane_velocities: Vec::new(),
            flock_velocities: Vec::new(),
        }
    }

    pub fn len_frames(&self) -> u64 {
        self.last_frame - self.start_frame + 1
    }

    /// Outlier removal, smoothing and velocity recomputation, for
    /// downstream consumers of the trajectory.
    pub fn cleaned(&self, clean_jump_threshold: f64, smoothing_window: usize) -> Session {
        let mut out = self.clone();
        out.airplane_positions =
            remove_position_outliers(&self.airplane_positions, clean_jump_threshold);
        out.airplane_positions = smooth_positions(&out.airplane_positions, smoothing_window);
        out.airplane_velocities = recalculate_velocities(&out.airplane_positions);

        out.flock_positions = remove_position_outliers(&self.flock_positions, clean_jump_threshold);
        out.flock_positions = smooth_positions(&out.flock_positions, smoothing_window);
        out.flock_velocities = recalculate_velocities(&out.flock_positions);
        out
    }
}

/// Drop interior points whose per-frame speed to either neighbour exceeds
/// `threshold`. The first and last points are always kept.
fn remove_position_outliers(positions: &[SeriesEntry], threshold: f64) -> Vec<SeriesEntry> {
    if positions.len() < 3 {
        return positions.to_vec();
    }
    let mut cleaned = Vec::with_capacity(positions.len());
    for i in 0..positions.len() {
        if i == 0 || i == positions.len() - 1 {
            cleaned.push(positions[i]);
            continue;
        }
        let (pf, px, pz) = positions[i - 1];
        let (cf, cx, cz) = positions[i];
        let (nf, nx, nz) = positions[i + 1];
        let gap_prev = cf.saturating_sub(pf).max(1) as f64;
        let gap_next = nf.saturating_sub(cf).max(1) as f64;
        let speed_prev = ((cx - px).hypot(cz - pz)) / gap_prev;
        let speed_next = ((nx - cx).hypot(nz - cz)) / gap_next;
        if speed_prev <= threshold && speed_next <= threshold {
            cleaned.push(positions[i]);
        }
    }
    cleaned
}

/// Centred moving average over positions; frames are unchanged.
fn smooth_positions(positions: &[SeriesEntry], window: usize) -> Vec<SeriesEntry> {
    if positions.len() < window || window < 2 {
        return positions.to_vec();
    }
    let half = window / 2;
    let mut smoothed = Vec::with_capacity(positions.len());
    for i in 0..positions.len() {
        let start = i.saturating_sub(half);
        let end = (i + half + 1).min(positions.len());
        let n = (end - start) as f64;
        let x = positions[start..end].iter().map(|p| p.1).sum::<f64>() / n;
        let z = positions[start..end].iter().map(|p| p.2).sum::<f64>() / n;
        smoothed.push((positions[i].0, x, z));
    }
    smoothed
}

/// Finite-difference velocities in m/s at the nominal frame rate.
fn recalculate_velocities(positions: &[SeriesEntry]) -> Vec<SeriesEntry> {
    let mut velocities = Vec::new();
    for pair in positions.windows(2) {
        let (pf, px, pz) = pair[0];
        let (cf, cx, cz) = pair[1];
        let dt = (cf.saturating_sub(pf)) as f64 / NOMINAL_FPS;
        if dt > 0.0 {
            velocities.push((cf, (cx - px) / dt, (cz - pz) / dt));
        }
    }
    velocities
}

/// Tracks sessions over triangulated frames.
pub struct SessionTracker {
    config: TrackerConfig,
    sessions: Vec<Session>,
    current: Option<Session>,
    next_session_id: u32,
    /// Last airplane position accepted as part of the current trajectory.
    /// Jumped positions do not move the anchor, so a teleport that persists
    /// keeps counting against it.
    anchor_position: Option<(f64, f64)>,
    jump_frames: u32,
}

impl SessionTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            sessions: Vec::new(),
            current: None,
            next_session_id: 0,
            anchor_position: None,
            jump_frames: 0,
        }
    }

    /// Process one frame of triangulated points.
    ///
    /// Frames must arrive in increasing `frame_id` order; a frame with no
    /// airplane closes the current session.
    pub fn update(&mut self, frame: u64, points: &[TriangulatedPoint]) {
        let airplane = points.iter().find(|p| p.class == ObjectClass::Airplane);
        let flock = points.iter().find(|p| p.class == ObjectClass::Flock);

        let Some(airplane) = airplane else {
            self.end_current_session();
            self.jump_frames = 0;
            return;
        };
        let airplane_pos = (airplane.position.x, airplane.position.z);

        if self.current.is_none() {
            self.start_new_session(frame);
            self.anchor_position = Some(airplane_pos);
        } else {
            match self.anchor_position {
                Some((ax, az))
                    if (airplane_pos.0 - ax).hypot(airplane_pos.1 - az)
                        > self.config.position_jump_threshold =>
                {
                    self.jump_frames += 1;
                }
                _ => {
                    self.anchor_position = Some(airplane_pos);
                    self.jump_frames = 0;
                }
            }
            if self.jump_frames >= self.config.jump_duration_threshold {
                // the airplane has genuinely moved elsewhere: split here
                // and restart from the jumped position
                self.end_current_session();
                self.start_new_session(frame);
                self.anchor_position = Some(airplane_pos);
            }
        }

        if let Some(session) = self.current.as_mut() {
            session.last_frame = frame;

            if let Some(&(pf, px, pz)) = session.airplane_positions.last() {
                let dt = frame.saturating_sub(pf) as f64 / NOMINAL_FPS;
                if dt > 0.0 {
                    session.airplane_velocities.push((
                        frame,
                        (airplane_pos.0 - px) / dt,
                        (airplane_pos.1 - pz) / dt,
                    ));
                }
            }
            session
                .airplane_positions
                .push((frame, airplane_pos.0, airplane_pos.1));

            if let Some(flock) = flock {
                let flock_pos = (flock.position.x, flock.position.z);
                if let Some(&(pf, px, pz)) = session.flock_positions.last() {
                    let dt = frame.saturating_sub(pf) as f64 / NOMINAL_FPS;
                    if dt > 0.0 {
                        session.flock_velocities.push((
                            frame,
                            (flock_pos.0 - px) / dt,
                            (flock_pos.1 - pz) / dt,
                        ));
                    }
                }
                session
                    .flock_positions
                    .push((frame, flock_pos.0, flock_pos.1));
            }
        }
    }

    fn start_new_session(&mut self, frame: u64) {
        self.next_session_id += 1;
        debug!("session {} opened at frame {frame}", self.next_session_id);
        self.current = Some(Session::new(self.next_session_id, frame));
        self.jump_frames = 0;
    }

    fn end_current_session(&mut self) {
        let Some(session) = self.current.take() else {
            return;
        };
        if session.len_frames() < self.config.min_session_length {
            debug!(
                "session {} discarded: {} frames < {}",
                session.session_id,
                session.len_frames(),
                self.config.min_session_length
            );
            return;
        }
        info!(
            "session {} closed: frames {}..={} ({} airplane points)",
            session.session_id,
            session.start_frame,
            session.last_frame,
            session.airplane_positions.len()
        );
        self.sessions.push(session);
    }

    /// Close any in-progress session, e.g. at shutdown.
    pub fn finalize(&mut self) {
        self.end_current_session();
    }

    /// Completed sessions that met the minimum length.
    pub fn completed_sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Cleaned copy of the completed sessions.
    pub fn cleaned_sessions(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .map(|s| s.cleaned(self.config.clean_jump_threshold, 3))
            .collect()
    }

    /// Immutable snapshot of the in-progress session as virtual tracks.
    pub fn active_tracks(&self) -> ActiveTracks {
        let Some(session) = self.current.as_ref() else {
            return ActiveTracks::default();
        };
        let project = |positions: &[SeriesEntry],
                       velocities: &[SeriesEntry],
                       track_id: u8,
                       class: ObjectClass| {
            positions.last().map(|&(frame, x, z)| ActiveTrack {
                track_id,
                class,
                position: (x, z),
                velocity: velocities.last().map(|&(_, vx, vz)| (vx, vz)),
                session_id: session.session_id,
                last_frame: frame,
            })
        };
        ActiveTracks {
            airplane: project(
                &session.airplane_positions,
                &session.airplane_velocities,
                AIRPLANE_TRACK_ID,
                ObjectClass::Airplane,
            ),
            flock: project(
                &session.flock_positions,
                &session.flock_velocities,
                FLOCK_TRACK_ID,
                ObjectClass::Flock,
            ),
        }
    }
}

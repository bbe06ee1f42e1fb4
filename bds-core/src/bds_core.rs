//! Core of the bird-strike risk pipeline: multi-view triangulation of
//! detections, session-based trajectory tracking and the hybrid risk
//! calculator.
//!
//! Everything here is pure over its inputs; the orchestrator owns queues and
//! scheduling. The tracker and the risk engine each hold the only mutable
//! state in the pipeline and are driven by exactly one worker in
//! `frame_id` order.

use serde::Serialize;

use bds_types::ObjectClass;

mod triangulate;
pub use crate::triangulate::{Triangulator, TriangulatorConfig};

mod tracker;
pub use crate::tracker::{Session, SessionTracker, SeriesEntry, TrackerConfig};

mod risk;
pub use crate::risk::{RiskAssessment, RiskConfig, RiskEngine};

/// Virtual track id of the airplane in an active-tracks snapshot.
pub const AIRPLANE_TRACK_ID: u8 = 1;
/// Virtual track id of the flock in an active-tracks snapshot.
pub const FLOCK_TRACK_ID: u8 = 2;

/// Latest state of one tracked object, projected out of the current session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveTrack {
    pub track_id: u8,
    pub class: ObjectClass,
    /// Most recent ground-plane position `(x, z)` in metres.
    pub position: (f64, f64),
    /// Most recent velocity `(vx, vz)` in m/s, absent until a second
    /// observation exists.
    pub velocity: Option<(f64, f64)>,
    pub session_id: u32,
    pub last_frame: u64,
}

/// Immutable per-frame snapshot of the current session for the risk engine.
///
/// The tracker never lends out its internal session; this value is built
/// fresh each frame and consumed immediately.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActiveTracks {
    pub airplane: Option<ActiveTrack>,
    pub flock: Option<ActiveTrack>,
}

//! Hybrid bird-strike risk calculation.
//!
//! Risk is fused from the flock's distance to the airplane and to the
//! airplane's assigned route, the closing speed, and the time to collision,
//! then stabilized with a downgrade hysteresis so the reported level does
//! not flicker.

use nalgebra::{Point3, Vector3};
use serde::Serialize;
use tracing::{debug, info};

use bds_routes::{RouteAssigner, RouteStore};
use bds_types::RiskLevel;

use crate::ActiveTracks;

const EPS: f64 = 1e-6;
const TTC_MIN_S: f64 = 0.1;
const TTC_MAX_S: f64 = 300.0;
/// Waypoint span used when computing the route tangent.
const ROUTE_SEGMENT_SPAN: usize = 5;

/// Representative scores reported while a floor or a pending downgrade
/// pins the level.
const HIGH_FLOOR_SCORE: f64 = 180.0;
const MEDIUM_FLOOR_SCORE: f64 = 120.0;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Consecutive frames at the same lower level required before a
    /// downgrade is reported.
    pub downgrade_threshold: u32,
    /// Assumed altitude separation between airplane and flock, metres.
    /// Used both as the Y component of 3D distances and as the flock's
    /// height when measuring against routes.
    pub nominal_altitude_m: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            downgrade_threshold: 5,
            nominal_altitude_m: 50.0,
        }
    }
}

/// Full per-frame risk output. `level`/`score` are hysteresis-stabilized;
/// the `raw_*` fields carry the unstabilized values.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub frame: u64,
    pub direct_distance: f64,
    pub route_distance: Option<f64>,
    pub hybrid_distance: f64,
    pub assigned_route: Option<String>,
    pub relative_speed: f64,
    pub ttc: f64,
    pub score: f64,
    pub level: RiskLevel,
    pub raw_score: f64,
    pub raw_level: RiskLevel,
    pub airplane_position: (f64, f64),
    pub flock_position: Option<(f64, f64)>,
    pub route_direction: Option<Vector3<f64>>,
}

/// Hysteresis state: the only mutable state this component owns.
#[derive(Debug)]
struct RiskState {
    current_level: RiskLevel,
    /// Lower level waiting to be accepted, with its consecutive-frame count.
    pending_downgrade: Option<(RiskLevel, u32)>,
}

pub struct RiskEngine {
    config: RiskConfig,
    state: RiskState,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            state: RiskState {
                current_level: RiskLevel::Low,
                pending_downgrade: None,
            },
        }
    }

    /// The currently reported (stabilized) level.
    pub fn current_level(&self) -> RiskLevel {
        self.state.current_level
    }

    /// Assess one frame. `None` when no airplane is tracked.
    pub fn assess(
        &mut self,
        frame: u64,
        tracks: &ActiveTracks,
        routes: &RouteStore,
        assigner: &dyn RouteAssigner,
    ) -> Option<RiskAssessment> {
        let airplane = tracks.airplane.as_ref()?;

        let Some(flock) = tracks.flock.as_ref() else {
            // Airplane alone in the sky: the raw level is Low, still routed
            // through the hysteresis so a reported High cannot vanish in one
            // frame.
            let (score, level) = self.stabilize(0.0, RiskLevel::Low);
            return Some(RiskAssessment {
                frame,
                direct_distance: f64::INFINITY,
                route_distance: None,
                hybrid_distance: f64::INFINITY,
                assigned_route: None,
                relative_speed: 0.0,
                ttc: f64::INFINITY,
                score,
                level,
                raw_score: 0.0,
                raw_level: RiskLevel::Low,
                airplane_position: airplane.position,
                flock_position: None,
                route_direction: None,
            });
        };

        let (ax, az) = airplane.position;
        let (fx, fz) = flock.position;
        let xz_distance = (ax - fx).hypot(az - fz);
        let direct_distance = xz_distance.hypot(self.config.nominal_altitude_m);

        // route-based distance for the assigned route
        let assigned_route = assigner.assign(airplane.position).map(str::to_owned);
        let flock_3d = Point3::new(fx, self.config.nominal_altitude_m, fz);
        let (route_distance, route_direction) = match assigned_route.as_deref() {
            Some(route) => {
                let d = routes.distance(route, &flock_3d);
                let dir = routes
                    .closest(route, &flock_3d)
                    .and_then(|c| routes.segment_direction(route, &c.point, ROUTE_SEGMENT_SPAN));
                (d.is_finite().then_some(d), dir)
            }
            None => (None, None),
        };

        let hybrid_distance = match route_distance {
            Some(route) => 0.7 * route + 0.3 * direct_distance,
            None => direct_distance,
        };

        let relative_speed = relative_speed(airplane, flock);
        let ttc = time_to_collision(airplane, flock);

        let (raw_score, raw_level) = compute_raw_level(hybrid_distance, relative_speed, ttc);
        let (score, level) = self.stabilize(raw_score, raw_level);

        debug!(
            "frame {frame}: hybrid {hybrid_distance:.1} m, rel speed {relative_speed:.1} m/s, \
             ttc {ttc:.1} s -> {level} ({score:.0})"
        );

        Some(RiskAssessment {
            frame,
            direct_distance,
            route_distance,
            hybrid_distance,
            assigned_route,
            relative_speed,
            ttc,
            score,
            level,
            raw_score,
            raw_level,
            airplane_position: airplane.position,
            flock_position: Some(flock.position),
            route_direction,
        })
    }

    /// Upgrades take effect immediately; a downgrade only after
    /// `downgrade_threshold` consecutive frames at the same lower level.
    /// A different lower level restarts the count.
    fn stabilize(&mut self, raw_score: f64, raw_level: RiskLevel) -> (f64, RiskLevel) {
        let current = self.state.current_level;
        if raw_level > current {
            info!("risk level raised: {current} -> {raw_level}");
            self.state.current_level = raw_level;
            self.state.pending_downgrade = None;
            return (raw_score, raw_level);
        }
        if raw_level < current {
            let count = match self.state.pending_downgrade {
                Some((pending, n)) if pending == raw_level => n + 1,
                _ => 1,
            };
            if count >= self.config.downgrade_threshold {
                info!("risk level lowered: {current} -> {raw_level} after {count} frames");
                self.state.current_level = raw_level;
                self.state.pending_downgrade = None;
                return (raw_score, raw_level);
            }
            self.state.pending_downgrade = Some((raw_level, count));
            let held_score = match current {
                RiskLevel::High => HIGH_FLOOR_SCORE,
                RiskLevel::Medium => MEDIUM_FLOOR_SCORE,
                RiskLevel::Low => raw_score,
            };
            return (held_score, current);
        }
        self.state.pending_downgrade = None;
        (raw_score, raw_level)
    }
}

/// Closing speed between airplane and flock along their ground-plane
/// separation direction. Positive means approaching.
fn relative_speed(airplane: &crate::ActiveTrack, flock: &crate::ActiveTrack) -> f64 {
    let (Some(av), Some(fv)) = (airplane.velocity, flock.velocity) else {
        return 0.0;
    };
    let dx = airplane.position.0 - flock.position.0;
    let dz = airplane.position.1 - flock.position.1;
    let distance = dx.hypot(dz);
    if distance < EPS {
        return 0.0;
    }
    let (ux, uz) = (dx / distance, dz / distance);
    // relative velocity projected onto flock-to-airplane, negated so that
    // closing motion is positive
    -((av.0 - fv.0) * ux + (av.1 - fv.1) * uz)
}

/// Ground-plane separation divided by closing speed, clamped to
/// `[0.1, 300]` seconds. Infinite when separated or receding.
fn time_to_collision(airplane: &crate::ActiveTrack, flock: &crate::ActiveTrack) -> f64 {
    let dx = airplane.position.0 - flock.position.0;
    let dz = airplane.position.1 - flock.position.1;
    let distance = dx.hypot(dz);
    if distance < EPS {
        return f64::INFINITY;
    }
    let closing_speed = relative_speed(airplane, flock);
    if closing_speed <= EPS {
        return f64::INFINITY;
    }
    (distance / closing_speed).clamp(TTC_MIN_S, TTC_MAX_S)
}

/// Floors first, scored path otherwise. Returns `(score, level)`.
fn compute_raw_level(distance: f64, relative_speed: f64, ttc: f64) -> (f64, RiskLevel) {
    // immediate-danger floors; the strongest triggered floor wins
    let distance_floor = if distance <= 50.0 {
        Some(RiskLevel::High)
    } else if distance < 100.0 {
        Some(RiskLevel::Medium)
    } else {
        None
    };
    let ttc_floor = if ttc.is_finite() {
        if ttc < 5.0 {
            Some(RiskLevel::High)
        } else if ttc < 12.0 {
            Some(RiskLevel::Medium)
        } else {
            None
        }
    } else {
        None
    };
    match distance_floor.into_iter().chain(ttc_floor).max() {
        Some(RiskLevel::High) => return (HIGH_FLOOR_SCORE, RiskLevel::High),
        Some(RiskLevel::Medium) => return (MEDIUM_FLOOR_SCORE, RiskLevel::Medium),
        _ => {}
    }

    let distance_score = if distance <= 50.0 {
        100.0
    } else if distance <= 100.0 {
        80.0 - (distance - 50.0) * 0.6
    } else if distance <= 200.0 {
        50.0 - (distance - 100.0) * 0.3
    } else {
        (20.0 - (distance - 200.0) * 0.05).max(0.0)
    };

    let speed_score = if relative_speed <= 0.0 {
        0.0
    } else if relative_speed <= 10.0 {
        relative_speed * 3.0
    } else if relative_speed <= 30.0 {
        30.0 + (relative_speed - 10.0) * 2.5
    } else {
        (80.0 + (relative_speed - 30.0)).min(100.0)
    };

    let ttc_score = if !ttc.is_finite() {
        0.0
    } else if ttc <= 5.0 {
        100.0
    } else if ttc <= 15.0 {
        100.0 - (ttc - 5.0) * 5.0
    } else if ttc <= 30.0 {
        50.0 - (ttc - 15.0) * 2.0
    } else {
        (20.0 - (ttc - 30.0) * 0.5).max(0.0)
    };

    let score = (distance_score * 0.4 + speed_score * 0.3 + ttc_score * 0.3) * 2.0;
    let level = if score >= 80.0 {
        RiskLevel::High
    } else if score >= 60.0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    (score, level)
}

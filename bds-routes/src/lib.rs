//! Named flight routes.
//!
//! A route is an ordered polyline of 3D waypoints representing a canonical
//! average flight path. The store loads every route file in a directory and
//! answers closest-point, minimum-distance and tangent-direction queries for
//! the risk engine. Routes are immutable after load.

use std::collections::BTreeMap;

use nalgebra::{Point3, Vector3};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(thiserror::Error, Debug)]
pub enum RouteError {
    #[error("route file {path} has no waypoints")]
    EmptyRoute { path: String },
    #[error("IO error: {}", error)]
    Io {
        #[from]
        error: std::io::Error,
    },
    #[error("serde_json error: {}", error)]
    SerdeJson {
        #[from]
        error: serde_json::Error,
    },
}

pub type Result<M> = std::result::Result<M, RouteError>;

#[derive(Debug, Clone, Deserialize)]
struct RawPoint {
    x: f64,
    y: f64,
    z: f64,
}

/// On-disk route schema. `routePoints` is the dense sampled polyline and is
/// preferred; `waypoints` is the sparse fallback.
#[derive(Debug, Deserialize)]
struct RouteFile {
    #[serde(rename = "pathName")]
    path_name: String,
    #[serde(default)]
    waypoints: Vec<RawPoint>,
    #[serde(rename = "routePoints", default)]
    route_points: Vec<RawPoint>,
}

/// One named flight path.
#[derive(Debug, Clone)]
pub struct FlightRoute {
    name: String,
    points: Vec<Point3<f64>>,
}

impl FlightRoute {
    pub fn new(name: String, points: Vec<Point3<f64>>) -> Self {
        Self { name, points }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    /// Index and distance of the waypoint closest to `p`.
    fn closest_index(&self, p: &Point3<f64>) -> (usize, f64) {
        let mut best = (0, f64::INFINITY);
        for (i, wp) in self.points.iter().enumerate() {
            let d = nalgebra::distance(wp, p);
            if d < best.1 {
                best = (i, d);
            }
        }
        best
    }
}

/// The closest waypoint of a route to a query point.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosestPoint {
    pub distance: f64,
    pub point: Point3<f64>,
    pub index: usize,
}

/// All loaded routes, keyed by path name.
#[derive(Debug, Clone, Default)]
pub struct RouteStore {
    routes: BTreeMap<String, FlightRoute>,
}

impl RouteStore {
    /// Load every `*.json` route file in `dir`.
    ///
    /// Files that fail to parse are logged and skipped; collector state
    /// files (`auto_processor_state*`) are ignored. The returned store may
    /// be empty.
    pub fn load_dir<P: AsRef<std::path::Path>>(dir: P) -> Result<Self> {
        let mut routes = BTreeMap::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let entry = entry?;
            let path = entry.path();
            let fname = entry.file_name();
            let fname = fname.to_string_lossy();
            if !fname.ends_with(".json") || fname.starts_with("auto_processor_state") {
                continue;
            }
            match Self::load_route_file(&path) {
                Ok(route) => {
                    info!("loaded route {} ({} points)", route.name, route.points.len());
                    routes.insert(route.name.clone(), route);
                }
                Err(e) => {
                    warn!("skipping route file {}: {e}", path.display());
                }
            }
        }
        Ok(Self { routes })
    }

    fn load_route_file(path: &std::path::Path) -> Result<FlightRoute> {
        let reader = std::fs::File::open(path)?;
        let file: RouteFile = serde_json::from_reader(reader)?;
        let raw = if !file.route_points.is_empty() {
            file.route_points
        } else {
            file.waypoints
        };
        if raw.is_empty() {
            return Err(RouteError::EmptyRoute {
                path: path.display().to_string(),
            });
        }
        let points = raw
            .into_iter()
            .map(|p| Point3::new(p.x, p.y, p.z))
            .collect();
        Ok(FlightRoute::new(file.path_name, points))
    }

    pub fn insert(&mut self, route: FlightRoute) {
        self.routes.insert(route.name.clone(), route);
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FlightRoute> {
        self.routes.get(name)
    }

    pub fn route_names(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(|s| s.as_str())
    }

    /// Minimum Euclidean distance from `p` to any waypoint of the route.
    ///
    /// Unknown routes are infinitely far away.
    pub fn distance(&self, route_name: &str, p: &Point3<f64>) -> f64 {
        match self.routes.get(route_name) {
            Some(route) => route.closest_index(p).1,
            None => f64::INFINITY,
        }
    }

    /// The closest waypoint of the route to `p`, or `None` for an unknown
    /// route.
    pub fn closest(&self, route_name: &str, p: &Point3<f64>) -> Option<ClosestPoint> {
        let route = self.routes.get(route_name)?;
        let (index, distance) = route.closest_index(p);
        Some(ClosestPoint {
            distance,
            point: route.points[index],
            index,
        })
    }

    /// Normalized route tangent near `near_point`, computed over waypoints
    /// spanning `span/2` neighbours on each side of the closest index.
    ///
    /// Returns `None` for unknown routes and degenerate segments.
    pub fn segment_direction(
        &self,
        route_name: &str,
        near_point: &Point3<f64>,
        span: usize,
    ) -> Option<Vector3<f64>> {
        let route = self.routes.get(route_name)?;
        let (closest_idx, _) = route.closest_index(near_point);

        let start = closest_idx.saturating_sub(span / 2);
        let end = (closest_idx + span / 2).min(route.points.len() - 1);
        if start == end {
            return None;
        }

        let direction = route.points[end] - route.points[start];
        let norm = direction.norm();
        if norm > 0.0 {
            Some(direction / norm)
        } else {
            None
        }
    }
}

/// Strategy deciding which route an airplane is flying.
///
/// The production assignment is a single fixed route; keeping it behind a
/// trait lets position-based selection replace it without touching the risk
/// engine.
pub trait RouteAssigner: Send + Sync {
    /// Route assigned to an airplane currently at `position_xz`.
    fn assign(&self, position_xz: (f64, f64)) -> Option<&str>;
}

/// Assigns every airplane to one configured route.
#[derive(Debug, Clone)]
pub struct FixedRouteAssigner {
    route_name: String,
}

impl FixedRouteAssigner {
    pub fn new<S: Into<String>>(route_name: S) -> Self {
        Self {
            route_name: route_name.into(),
        }
    }
}

impl RouteAssigner for FixedRouteAssigner {
    fn assign(&self, _position_xz: (f64, f64)) -> Option<&str> {
        Some(&self.route_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn straight_route() -> FlightRoute {
        // Along +Z at x=100, y=50.
        let points = (0..20)
            .map(|i| Point3::new(100.0, 50.0, i as f64 * 10.0))
            .collect();
        FlightRoute::new("Path_A".to_string(), points)
    }

    fn store() -> RouteStore {
        let mut store = RouteStore::default();
        store.insert(straight_route());
        store
    }

    #[test]
    fn distance_to_known_route() {
        let store = store();
        let d = store.distance("Path_A", &Point3::new(100.0, 50.0, 95.0));
        assert_relative_eq!(d, 5.0);
    }

    #[test]
    fn unknown_route_is_infinitely_far() {
        let store = store();
        assert!(store
            .distance("Path_Z", &Point3::new(0.0, 0.0, 0.0))
            .is_infinite());
        assert!(store.closest("Path_Z", &Point3::new(0.0, 0.0, 0.0)).is_none());
        assert!(store
            .segment_direction("Path_Z", &Point3::new(0.0, 0.0, 0.0), 5)
            .is_none());
    }

    #[test]
    fn closest_point_is_idempotent() {
        let store = store();
        let p = Point3::new(130.0, 40.0, 77.0);
        let first = store.closest("Path_A", &p).unwrap();
        let second = store.closest("Path_A", &first.point).unwrap();
        assert_eq!(first.point, second.point);
        assert_eq!(second.distance, 0.0);
    }

    #[test]
    fn segment_direction_follows_route() {
        let store = store();
        let dir = store
            .segment_direction("Path_A", &Point3::new(100.0, 50.0, 100.0), 5)
            .unwrap();
        assert_relative_eq!(dir, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn segment_direction_degenerate_single_point() {
        let mut store = RouteStore::default();
        store.insert(FlightRoute::new(
            "Dot".to_string(),
            vec![Point3::new(1.0, 2.0, 3.0)],
        ));
        assert!(store
            .segment_direction("Dot", &Point3::new(0.0, 0.0, 0.0), 5)
            .is_none());
    }

    #[test]
    fn load_dir_prefers_route_points_and_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("path_a.json"),
            r#"{
                "pathName": "Path_A",
                "exportTime": "2024-01-01T00:00:00",
                "totalWaypoints": 2,
                "waypoints": [{"x": 0, "y": 0, "z": 0}, {"x": 0, "y": 0, "z": 1}],
                "routePoints": [{"x": 5, "y": 50, "z": 0}, {"x": 5, "y": 50, "z": 10}]
            }"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("waypoints_only.json"),
            r#"{"pathName": "Path_B", "waypoints": [{"x": 1, "y": 2, "z": 3}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(
            dir.path().join("auto_processor_state.json"),
            r#"{"anything": true}"#,
        )
        .unwrap();

        let store = RouteStore::load_dir(dir.path()).unwrap();
        let names: Vec<_> = store.route_names().collect();
        assert_eq!(names, vec!["Path_A", "Path_B"]);

        // routePoints preferred over waypoints
        let route = store.get("Path_A").unwrap();
        assert_eq!(route.points()[0], Point3::new(5.0, 50.0, 0.0));
        // waypoints fallback
        let route = store.get("Path_B").unwrap();
        assert_eq!(route.points(), &[Point3::new(1.0, 2.0, 3.0)]);
    }

    #[test]
    fn fixed_assigner_always_assigns() {
        let assigner = FixedRouteAssigner::new("Path_A");
        assert_eq!(assigner.assign((123.0, -77.0)), Some("Path_A"));
    }
}

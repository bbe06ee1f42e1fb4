//! Configuration types for the bird detection system.
//!
//! The pipeline is configured with a single TOML file. All tuning knobs
//! have defaults; only the recordings root and the routes directory must be
//! given. Relative paths are interpreted relative to the config file
//! location and may contain shell variables such as `~`, `$A` or `${B}`.

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, Error>;

fn default_frame_skip() -> u32 {
    2
}
fn default_confidence_threshold() -> f32 {
    0.40
}
fn default_distance_threshold() -> f64 {
    100.0
}
fn default_pixel_merge_distance() -> f32 {
    100.0
}
fn default_fps_target() -> f64 {
    30.0
}
fn default_idle_timeout_secs() -> f64 {
    10.0
}
fn default_nominal_altitude() -> f64 {
    50.0
}
fn default_assigned_route() -> String {
    "Path_A".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BdsConfig {
    /// Root directory the capture source writes `Recording_*` sessions to.
    ///
    /// Can contain shell variables such as `~`, `$A`, or `${B}`.
    pub recordings_dir: std::path::PathBuf,
    /// Directory of route JSON files. Can contain shell variables.
    pub routes_dir: std::path::PathBuf,
    /// Process 1 of every N synchronized bundles.
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u32,
    /// Minimum detector confidence.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// 3D flock merge distance in the ground plane, metres.
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f64,
    /// Per-camera flock merge distance, pixels.
    #[serde(default = "default_pixel_merge_distance")]
    pub pixel_merge_distance: f32,
    /// Frame-source polling rate, Hz.
    #[serde(default = "default_fps_target")]
    pub fps_target: f64,
    /// Seconds without new frames before the source reports a stall.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: f64,
    /// Assumed airplane/flock altitude separation, metres.
    #[serde(default = "default_nominal_altitude")]
    pub nominal_altitude_m: f64,
    /// Route every airplane is assigned to.
    #[serde(default = "default_assigned_route")]
    pub assigned_route: String,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub risk: RiskSection,
    #[serde(default)]
    pub tcp: TcpSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Per-frame airplane movement tolerance for session continuity, metres.
    #[serde(default = "SessionConfig::default_position_jump_threshold")]
    pub position_jump_threshold: f64,
    /// Jumps sustained for fewer frames than this are absorbed.
    #[serde(default = "SessionConfig::default_jump_duration_threshold")]
    pub jump_duration_threshold: u32,
    /// Discard sessions shorter than this many frames.
    #[serde(default = "SessionConfig::default_min_session_length")]
    pub min_session_length: u64,
    /// Cleaning pass outlier threshold, metres per frame.
    #[serde(default = "SessionConfig::default_clean_jump_threshold")]
    pub clean_jump_threshold: f64,
}

impl SessionConfig {
    fn default_position_jump_threshold() -> f64 {
        50.0
    }
    fn default_jump_duration_threshold() -> u32 {
        5
    }
    fn default_min_session_length() -> u64 {
        50
    }
    fn default_clean_jump_threshold() -> f64 {
        120.0
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            position_jump_threshold: Self::default_position_jump_threshold(),
            jump_duration_threshold: Self::default_jump_duration_threshold(),
            min_session_length: Self::default_min_session_length(),
            clean_jump_threshold: Self::default_clean_jump_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskSection {
    /// Consecutive lower-level frames required before a downgrade.
    #[serde(default = "RiskSection::default_downgrade_threshold")]
    pub downgrade_threshold: u32,
}

impl RiskSection {
    fn default_downgrade_threshold() -> u32 {
        5
    }
}

impl Default for RiskSection {
    fn default() -> Self {
        Self {
            downgrade_threshold: Self::default_downgrade_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpSection {
    #[serde(default = "TcpSection::default_host")]
    pub host: String,
    #[serde(default = "TcpSection::default_port")]
    pub port: u16,
    /// Minimum interval between identical risk-level events, seconds.
    #[serde(default = "TcpSection::default_min_send_interval")]
    pub min_send_interval: f64,
    #[serde(default = "TcpSection::default_enabled")]
    pub enabled: bool,
}

impl TcpSection {
    fn default_host() -> String {
        "localhost".to_string()
    }
    fn default_port() -> u16 {
        5200
    }
    fn default_min_send_interval() -> f64 {
        1.0
    }
    fn default_enabled() -> bool {
        true
    }
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            min_send_interval: Self::default_min_send_interval(),
            enabled: Self::default_enabled(),
        }
    }
}

impl BdsConfig {
    fn validate(&self) -> Result<()> {
        if self.frame_skip < 1 {
            return Err(Error::Invalid("frame_skip must be >= 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::Invalid(
                "confidence_threshold must be within 0..=1".to_string(),
            ));
        }
        if self.fps_target <= 0.0 {
            return Err(Error::Invalid("fps_target must be positive".to_string()));
        }
        Ok(())
    }

    /// For all paths which are relative, make them relative to the config
    /// file location.
    fn fixup_relative_paths(&mut self, orig_path: &std::path::Path) -> Result<()> {
        let dirname = orig_path.parent().unwrap_or(std::path::Path::new("."));
        fixup_relative_path(&mut self.recordings_dir, dirname)?;
        fixup_relative_path(&mut self.routes_dir, dirname)?;
        Ok(())
    }
}

/// If `path` is relative, make it relative to `dirname`.
///
/// `path` must be utf-8 encoded and can start with a tilde, which is
/// expanded to the home directory.
fn fixup_relative_path(path: &mut std::path::PathBuf, dirname: &std::path::Path) -> Result<()> {
    let pathstr = path
        .as_os_str()
        .to_str()
        .ok_or_else(|| Error::Invalid(format!("non-utf8 path: {}", path.display())))?;
    let expanded = shellexpand::full(&pathstr)?;
    *path = std::path::PathBuf::from(expanded.to_string());

    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

pub fn parse_config_file<P: AsRef<std::path::Path>>(fname: P) -> Result<BdsConfig> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    let mut cfg: BdsConfig = toml::from_str(&contents)?;
    cfg.fixup_relative_paths(fname.as_ref())?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        recordings_dir = "recordings"
        routes_dir = "/data/routes"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bds.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let cfg = parse_config_file(&path).unwrap();
        assert_eq!(cfg.frame_skip, 2);
        assert_eq!(cfg.confidence_threshold, 0.40);
        assert_eq!(cfg.distance_threshold, 100.0);
        assert_eq!(cfg.nominal_altitude_m, 50.0);
        assert_eq!(cfg.assigned_route, "Path_A");
        assert_eq!(cfg.session.position_jump_threshold, 50.0);
        assert_eq!(cfg.session.jump_duration_threshold, 5);
        assert_eq!(cfg.session.min_session_length, 50);
        assert_eq!(cfg.risk.downgrade_threshold, 5);
        assert_eq!(cfg.tcp.host, "localhost");
        assert_eq!(cfg.tcp.port, 5200);
        assert_eq!(cfg.tcp.min_send_interval, 1.0);
        assert!(cfg.tcp.enabled);

        // relative recordings_dir resolved against the config location
        assert_eq!(cfg.recordings_dir, dir.path().join("recordings"));
        // absolute routes_dir untouched
        assert_eq!(cfg.routes_dir, std::path::Path::new("/data/routes"));
    }

    #[test]
    fn sections_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bds.toml");
        std::fs::write(
            &path,
            r#"
            recordings_dir = "/rec"
            routes_dir = "/routes"
            frame_skip = 3

            [session]
            position_jump_threshold = 200.0
            min_session_length = 10

            [risk]
            downgrade_threshold = 8

            [tcp]
            host = "10.0.0.7"
            port = 6000
            enabled = false
            "#,
        )
        .unwrap();

        let cfg = parse_config_file(&path).unwrap();
        assert_eq!(cfg.frame_skip, 3);
        assert_eq!(cfg.session.position_jump_threshold, 200.0);
        assert_eq!(cfg.session.min_session_length, 10);
        // untouched session keys keep defaults
        assert_eq!(cfg.session.jump_duration_threshold, 5);
        assert_eq!(cfg.risk.downgrade_threshold, 8);
        assert_eq!(cfg.tcp.host, "10.0.0.7");
        assert!(!cfg.tcp.enabled);
    }

    #[test]
    fn unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bds.toml");
        std::fs::write(
            &path,
            r#"
            recordings_dir = "/rec"
            routes_dir = "/routes"
            no_such_option = true
            "#,
        )
        .unwrap();
        assert!(matches!(
            parse_config_file(&path),
            Err(Error::TomlDeError { .. })
        ));
    }

    #[test]
    fn invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bds.toml");
        std::fs::write(
            &path,
            r#"
            recordings_dir = "/rec"
            routes_dir = "/routes"
            frame_skip = 0
            "#,
        )
        .unwrap();
        assert!(matches!(parse_config_file(&path), Err(Error::Invalid(_))));
    }
}

//! Driver configuration – reads `~/.urlink/config.toml`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use urlink_driver::program::SERVO_PROGRAM_TEMPLATE;
use urlink_types::{JointOffsets, UrError};

/// Persisted driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Controller hostname or IP. The command-line argument wins over this.
    #[serde(default)]
    pub robot_host: String,

    #[serde(default = "default_primary_port")]
    pub primary_port: u16,

    /// Port of the reverse server the uploaded program connects back to.
    #[serde(default = "default_reverse_port")]
    pub reverse_port: u16,

    /// Address templated into the servo program. Defaults to the local
    /// address of the primary connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_host: Option<String>,

    /// Prepended to every joint name.
    #[serde(default)]
    pub joint_prefix: String,

    #[serde(default)]
    pub prevent_programming: bool,

    /// Upper bound on joint velocity for move-joint commands (rad/s).
    #[serde(default = "default_max_velocity")]
    pub max_velocity: f64,

    /// Replaces the built-in servo program.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_path: Option<PathBuf>,

    /// Calibration offsets in radians, keyed by prefixed joint name.
    #[serde(default)]
    pub joint_offsets: HashMap<String, f64>,
}

fn default_primary_port() -> u16 {
    30002
}
fn default_reverse_port() -> u16 {
    50001
}
fn default_max_velocity() -> f64 {
    2.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            robot_host: String::new(),
            primary_port: default_primary_port(),
            reverse_port: default_reverse_port(),
            driver_host: None,
            joint_prefix: String::new(),
            prevent_programming: false,
            max_velocity: default_max_velocity(),
            program_path: None,
            joint_offsets: HashMap::new(),
        }
    }
}

impl Config {
    pub fn offsets(&self) -> JointOffsets {
        JointOffsets::new(&self.joint_prefix, &self.joint_offsets)
    }

    /// Joint names without a configured calibration offset.
    pub fn uncalibrated_joints(&self) -> Vec<String> {
        self.offsets()
            .names()
            .iter()
            .filter(|name| !self.joint_offsets.contains_key(*name))
            .cloned()
            .collect()
    }

    /// The servo program template, from `program_path` or built in.
    pub fn program_template(&self) -> Result<String, UrError> {
        match &self.program_path {
            Some(path) => fs::read_to_string(path).map_err(|e| {
                UrError::Config(format!("Failed to read program at {}: {e}", path.display()))
            }),
            None => Ok(SERVO_PROGRAM_TEMPLATE.to_string()),
        }
    }
}

/// Return the path to `~/.urlink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".urlink").join("config.toml")
}

/// Load the config from `path`, or from [`config_path`] when `None`, then
/// apply environment overrides. A missing file yields the defaults.
pub fn load(path: Option<&Path>) -> Result<Config, UrError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let mut cfg = load_from(&path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path. Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, UrError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| UrError::Config(format!("Failed to read config at {}: {e}", path.display())))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| UrError::Config(format!("Failed to parse config: {e}")))?;
    Ok(Some(cfg))
}

/// Apply `URLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `URLINK_ROBOT_HOST` | `robot_host` |
/// | `URLINK_PRIMARY_PORT` | `primary_port` |
/// | `URLINK_REVERSE_PORT` | `reverse_port` |
/// | `URLINK_JOINT_PREFIX` | `joint_prefix` |
/// | `URLINK_PREVENT_PROGRAMMING` | `prevent_programming` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("URLINK_ROBOT_HOST") {
        cfg.robot_host = v;
    }
    if let Ok(v) = std::env::var("URLINK_PRIMARY_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.primary_port = port;
    }
    if let Ok(v) = std::env::var("URLINK_REVERSE_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.reverse_port = port;
    }
    if let Ok(v) = std::env::var("URLINK_JOINT_PREFIX") {
        cfg.joint_prefix = v;
    }
    if let Ok(v) = std::env::var("URLINK_PREVENT_PROGRAMMING")
        && let Ok(flag) = v.parse::<bool>()
    {
        cfg.prevent_programming = flag;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = config_path_for_home(&dir.path().to_string_lossy());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_file_yields_none() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(
            &dir,
            r#"
robot_host = "ur5.local"
joint_prefix = "left_"

[joint_offsets]
left_elbow_joint = 0.0125
"#,
        );
        let cfg = load_from(&path).unwrap().unwrap();
        assert_eq!(cfg.robot_host, "ur5.local");
        assert_eq!(cfg.primary_port, 30002);
        assert_eq!(cfg.reverse_port, 50001);
        assert_eq!(cfg.max_velocity, 2.0);
        assert!(!cfg.prevent_programming);

        let offsets = cfg.offsets();
        assert_eq!(offsets.names()[2], "left_elbow_joint");
        assert_eq!(offsets.offsets()[2], 0.0125);
        assert_eq!(cfg.uncalibrated_joints().len(), 5);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(&dir, "primary_port = \"thirty\"");
        assert!(matches!(load_from(&path), Err(UrError::Config(_))));
    }

    #[test]
    fn default_round_trips_through_toml() {
        let cfg = Config::default();
        let raw = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&raw).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn program_template_prefers_the_configured_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let program = dir.path().join("prog_servo");
        fs::write(&program, "def custom():\nend\n").unwrap();

        let mut cfg = Config::default();
        assert_eq!(cfg.program_template().unwrap(), SERVO_PROGRAM_TEMPLATE);
        cfg.program_path = Some(program);
        assert_eq!(cfg.program_template().unwrap(), "def custom():\nend\n");
        cfg.program_path = Some(dir.path().join("missing"));
        assert!(matches!(cfg.program_template(), Err(UrError::Config(_))));
    }

    #[test]
    fn config_path_points_to_urlink_dir() {
        let p = config_path_for_home("/home/operator");
        assert!(p.to_string_lossy().contains(".urlink"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        // SAFETY: only this test touches these variables.
        unsafe {
            std::env::set_var("URLINK_ROBOT_HOST", "10.0.0.2");
            std::env::set_var("URLINK_REVERSE_PORT", "50101");
            std::env::set_var("URLINK_PRIMARY_PORT", "not-a-port");
            std::env::set_var("URLINK_PREVENT_PROGRAMMING", "true");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.robot_host, "10.0.0.2");
        assert_eq!(cfg.reverse_port, 50101);
        assert_eq!(cfg.primary_port, 30002);
        assert!(cfg.prevent_programming);
        unsafe {
            std::env::remove_var("URLINK_ROBOT_HOST");
            std::env::remove_var("URLINK_REVERSE_PORT");
            std::env::remove_var("URLINK_PRIMARY_PORT");
            std::env::remove_var("URLINK_PREVENT_PROGRAMMING");
        }
    }
}

//! Tool defaults from `edgetune.toml`.
//!
//! Every binary takes explicit path flags, but a repository usually pins its
//! layout once. An optional `edgetune.toml` at the working directory (or any
//! ancestor) supplies those defaults:
//!
//! ```toml
//! [paths]
//! exe = "build/Release/backtest-engine"
//! build-config = "build/Release/config/config.json"
//! data-dirs = ["data/backtest", "data/backtest_real"]
//!
//! [matrix]
//! max-workers = 4
//! retry-count = 2
//! ```
//!
//! A missing or unparseable file is never an error; built-in defaults match
//! the standard deployment layout.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Resolved tool defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Where these settings came from (None = built-in defaults).
    pub source: Option<PathBuf>,
    pub exe_path: PathBuf,
    pub build_config: PathBuf,
    pub source_config: PathBuf,
    pub data_dirs: Vec<PathBuf>,
    pub logs_dir: PathBuf,
    pub lock_path: PathBuf,
    pub matrix_max_workers: usize,
    pub backtest_retry_count: u32,
}

impl Default for Settings {
    fn default() -> Self {
        let logs = PathBuf::from("build/Release/logs");
        Self {
            source: None,
            exe_path: PathBuf::from("build/Release/backtest-engine"),
            build_config: PathBuf::from("build/Release/config/config.json"),
            source_config: PathBuf::from("config/config.json"),
            data_dirs: vec![
                PathBuf::from("data/backtest"),
                PathBuf::from("data/backtest_curated"),
                PathBuf::from("data/backtest_real"),
            ],
            lock_path: logs.join("verification_run.lock"),
            logs_dir: logs,
            matrix_max_workers: 1,
            backtest_retry_count: 2,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawPaths {
    exe: Option<PathBuf>,
    build_config: Option<PathBuf>,
    source_config: Option<PathBuf>,
    data_dirs: Option<Vec<PathBuf>>,
    logs_dir: Option<PathBuf>,
    lock: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawMatrix {
    max_workers: Option<usize>,
    retry_count: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RawSettings {
    #[serde(default)]
    paths: RawPaths,
    #[serde(default)]
    matrix: RawMatrix,
}

impl Settings {
    /// Load settings for a directory: `edgetune.toml` there, else walking up
    /// to the filesystem root, else defaults.
    pub fn load(directory: &Path) -> Self {
        let mut current = Some(directory.to_path_buf());
        while let Some(dir) = current {
            let candidate = dir.join("edgetune.toml");
            if candidate.exists() {
                if let Some(settings) = Self::load_file(&candidate) {
                    return settings;
                }
            }
            current = dir.parent().map(Path::to_path_buf);
        }
        Self::default()
    }

    fn load_file(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        let raw: RawSettings = toml::from_str(&content).ok()?;
        let defaults = Self::default();
        Some(Self {
            source: Some(path.to_path_buf()),
            exe_path: raw.paths.exe.unwrap_or(defaults.exe_path),
            build_config: raw.paths.build_config.unwrap_or(defaults.build_config),
            source_config: raw.paths.source_config.unwrap_or(defaults.source_config),
            data_dirs: raw.paths.data_dirs.unwrap_or(defaults.data_dirs),
            logs_dir: raw.paths.logs_dir.clone().unwrap_or(defaults.logs_dir),
            lock_path: raw.paths.lock.unwrap_or_else(|| {
                raw.paths
                    .logs_dir
                    .map(|logs| logs.join("verification_run.lock"))
                    .unwrap_or(defaults.lock_path)
            }),
            matrix_max_workers: raw.matrix.max_workers.unwrap_or(defaults.matrix_max_workers),
            backtest_retry_count: raw
                .matrix
                .retry_count
                .unwrap_or(defaults.backtest_retry_count),
        })
    }
}

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use time::UtcOffset;

const APP_DOMAIN: &str = "io";
const APP_ORG: &str = "Letters";
const APP_NAME: &str = "letters";

pub const CONFIG_ENV: &str = "LETTERS_CONFIG";
pub const DATA_ENV: &str = "LETTERS_DATA";

pub struct ConfigLoader {
    paths: ConfigPaths,
}

impl ConfigLoader {
    pub fn discover() -> Result<Self> {
        let paths = ConfigPaths::discover()?;
        Ok(Self { paths })
    }

    pub fn with_paths(paths: ConfigPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        self.paths.ensure_directories()?;
        if !self.paths.config_file.exists() {
            let mut default_cfg = AppConfig::default();
            default_cfg.post_load(&self.paths)?;
            self.write_default_config(&default_cfg)?;
            tracing::info!(path = %self.paths.config_file.display(), "wrote default config");
            return Ok(default_cfg);
        }

        self.load()
    }

    pub fn load(&self) -> Result<AppConfig> {
        let raw = fs::read_to_string(&self.paths.config_file)
            .with_context(|| format!("reading config {}", self.paths.config_file.display()))?;
        let mut cfg: AppConfig = toml::from_str(&raw).context("parsing config toml")?;
        cfg.post_load(&self.paths)?;
        Ok(cfg)
    }

    fn write_default_config(&self, cfg: &AppConfig) -> Result<()> {
        let toml = toml::to_string_pretty(cfg).context("serializing default config")?;
        if let Some(parent) = self.paths.config_file.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = fs::File::create(&self.paths.config_file)
            .with_context(|| format!("creating config {}", self.paths.config_file.display()))?;
        file.write_all(toml.as_bytes())
            .context("writing default config")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub session_file: PathBuf,
    pub log_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl ConfigPaths {
    pub fn discover() -> Result<Self> {
        let override_config = env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let override_data = env::var(DATA_ENV).ok().map(PathBuf::from);

        let project_dirs = ProjectDirs::from(APP_DOMAIN, APP_ORG, APP_NAME)
            .context("resolving XDG project directories")?;

        let config_dir = override_config
            .clone()
            .map(|p| {
                if p.is_dir() {
                    p
                } else {
                    p.parent().map(Path::to_path_buf).unwrap_or(p)
                }
            })
            .unwrap_or_else(|| project_dirs.config_dir().to_path_buf());

        let config_file = override_config
            .filter(|p| p.is_file() || p.extension().is_some())
            .unwrap_or_else(|| config_dir.join("config.toml"));

        let data_root = override_data.unwrap_or_else(|| project_dirs.data_dir().to_path_buf());
        let state_dir = project_dirs
            .state_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_root.join("state"));

        Ok(Self::from_roots(config_dir, config_file, data_root, state_dir))
    }

    /// Lays every path out under a single directory.
    pub fn rooted_at(root: &Path) -> Self {
        let config_dir = root.join("config");
        let config_file = config_dir.join("config.toml");
        Self::from_roots(config_dir, config_file, root.join("data"), root.join("state"))
    }

    fn from_roots(
        config_dir: PathBuf,
        config_file: PathBuf,
        data_dir: PathBuf,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            database_path: data_dir.join("letters.db"),
            session_file: state_dir.join("session.json"),
            log_dir: state_dir.join("logs"),
            config_dir,
            config_file,
            data_dir,
            state_dir,
        }
    }

    /// Points the database at a different data directory, as `--data-dir` does.
    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
        self.database_path = data_dir.join("letters.db");
        self.data_dir = data_dir;
        self
    }

    /// Reads settings from an explicit file, as `--config` does.
    pub fn with_config_file(mut self, config_file: PathBuf) -> Self {
        if let Some(parent) = config_file.parent() {
            self.config_dir = parent.to_path_buf();
        }
        self.config_file = config_file;
        self
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.log_dir,
            &self.state_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating application directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Event loop poll interval; also how often the store is checked for changes.
    pub tick_ms: u64,
    /// How long a notice stays on screen.
    pub notice_ms: u64,
    /// Offset used to display times and to read typed delivery times, e.g. "+02:00".
    /// Empty means the local offset, falling back to UTC.
    pub display_offset: String,
    pub storage: StorageOptions,
    pub clock: ClockOptions,
    pub export: ExportOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tick_ms: 250,
            notice_ms: 2_500,
            display_offset: String::new(),
            storage: StorageOptions::default(),
            clock: ClockOptions::default(),
            export: ExportOptions::default(),
        }
    }
}

impl AppConfig {
    fn post_load(&mut self, paths: &ConfigPaths) -> Result<()> {
        self.storage
            .resolve(paths)
            .context("resolving storage paths")?;
        if self.tick_ms == 0 {
            tracing::warn!("tick_ms must be positive, using 250");
            self.tick_ms = 250;
        }
        if !self.display_offset.is_empty() && parse_offset(&self.display_offset).is_none() {
            tracing::warn!(offset = %self.display_offset, "invalid display_offset, using local time");
            self.display_offset.clear();
        }
        Ok(())
    }

    pub fn tick_rate(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn notice_ttl(&self) -> Duration {
        Duration::from_millis(self.notice_ms)
    }

    pub fn utc_offset(&self) -> UtcOffset {
        parse_offset(&self.display_offset)
            .or_else(|| UtcOffset::current_local_offset().ok())
            .unwrap_or(UtcOffset::UTC)
    }
}

fn parse_offset(raw: &str) -> Option<UtcOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("utc") || raw == "Z" {
        return Some(UtcOffset::UTC);
    }
    let format = time::macros::format_description!("[offset_hour sign:mandatory]:[offset_minute]");
    UtcOffset::parse(raw, &format).ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    #[serde(skip)]
    pub database_path: PathBuf,
    pub wal_autocheckpoint: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            database_path: PathBuf::new(),
            wal_autocheckpoint: 1000,
            busy_timeout_ms: 2_000,
        }
    }
}

impl StorageOptions {
    fn resolve(&mut self, paths: &ConfigPaths) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            self.database_path = paths.database_path.clone();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockOptions {
    /// Derive "now" from the store instead of the local clock.
    pub use_store_clock: bool,
    pub resync_secs: u64,
}

impl Default for ClockOptions {
    fn default() -> Self {
        Self {
            use_store_clock: true,
            resync_secs: 60,
        }
    }
}

impl ClockOptions {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_secs.max(1))
    }
}

/// Page geometry for the inbox export, in points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub directory: PathBuf,
    pub file_name: String,
    pub top: f32,
    pub header_advance: f32,
    pub line_height: f32,
    pub item_gap: f32,
    pub wrap_width: f32,
    pub font_size: f32,
    pub page_limit: f32,
}

impl ExportOptions {
    pub fn output_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            file_name: "inbox-messages.txt".into(),
            top: 40.0,
            header_advance: 16.0,
            line_height: 14.0,
            item_gap: 20.0,
            wrap_width: 500.0,
            font_size: 12.0,
            page_limit: 720.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_or_init_writes_defaults_on_first_run() -> Result<()> {
        let temp = TempDir::new()?;
        let loader = ConfigLoader::with_paths(ConfigPaths::rooted_at(temp.path()));
        let cfg = loader.load_or_init()?;
        assert!(loader.paths().config_file.exists());
        assert_eq!(cfg.notice_ms, 2_500);
        assert_eq!(cfg.storage.database_path, loader.paths().database_path);
        assert_eq!(cfg.export.file_name, "inbox-messages.txt");

        let reloaded = loader.load_or_init()?;
        assert_eq!(reloaded.tick_ms, cfg.tick_ms);
        Ok(())
    }

    #[test]
    fn partial_config_keeps_defaults_and_sanitizes() -> Result<()> {
        let temp = TempDir::new()?;
        let paths = ConfigPaths::rooted_at(temp.path());
        paths.ensure_directories()?;
        fs::write(
            &paths.config_file,
            "tick_ms = 0\ndisplay_offset = \"bogus\"\n[clock]\nuse_store_clock = false\n",
        )?;
        let cfg = ConfigLoader::with_paths(paths).load()?;
        assert_eq!(cfg.tick_ms, 250);
        assert!(cfg.display_offset.is_empty());
        assert!(!cfg.clock.use_store_clock);
        assert_eq!(cfg.clock.resync_secs, 60);
        assert_eq!(cfg.storage.busy_timeout_ms, 2_000);
        Ok(())
    }

    #[test]
    fn explicit_offsets_parse() {
        assert_eq!(parse_offset("UTC"), Some(UtcOffset::UTC));
        assert_eq!(
            parse_offset("+02:30"),
            UtcOffset::from_hms(2, 30, 0).ok()
        );
        assert_eq!(parse_offset("2"), None);
    }

    #[test]
    fn data_dir_override_moves_database() {
        let paths = ConfigPaths::rooted_at(Path::new("/tmp/x"))
            .with_data_dir(PathBuf::from("/srv/shared"));
        assert_eq!(paths.database_path, PathBuf::from("/srv/shared/letters.db"));
    }
}

//! Configuration for the presentation runtime
//!
//! Loads configuration from TOML file at `~/.config/area/present.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backend::Fourcc;
use crate::compositor::swapchain::MIN_SLOTS;
use crate::render::RenderPath;
use crate::shared::Transform;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub render: RenderConfig,
    pub swapchain: SwapchainConfig,
    pub damage: DamageConfig,
    pub scheduler: SchedulerConfig,
    pub outputs: Vec<OutputConfig>,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    /// Load and validate a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("area");

        Ok(config_dir.join("present.toml"))
    }

    /// Save default configuration to file
    pub fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.swapchain.slots >= MIN_SLOTS,
            "swapchain.slots must be at least {} (got {})",
            MIN_SLOTS,
            self.swapchain.slots
        );
        ensure!(
            self.damage.ring_capacity >= 2,
            "damage.ring_capacity must be at least 2 (got {})",
            self.damage.ring_capacity
        );
        ensure!(
            self.scheduler.max_commit_failures >= 1,
            "scheduler.max_commit_failures must be at least 1"
        );
        ensure!(
            self.scheduler.fallback_interval_ms > 0,
            "scheduler.fallback_interval_ms must be positive"
        );

        let mut names = HashSet::new();
        for output in &self.outputs {
            ensure!(
                names.insert(output.name.as_str()),
                "duplicate output name {:?}",
                output.name
            );
            ensure!(
                output.width > 0 && output.height > 0,
                "output {:?} has an empty mode",
                output.name
            );
            ensure!(output.scale > 0.0, "output {:?} has a non-positive scale", output.name);
            ensure!(output.refresh_mhz > 0, "output {:?} has no refresh rate", output.name);
        }

        for output in &self.outputs {
            let Some(primary) = &output.mirror_of else {
                continue;
            };
            ensure!(*primary != output.name, "output {:?} mirrors itself", output.name);
            let target = self.outputs.iter().find(|o| o.name == *primary);
            ensure!(
                target.is_some_and(|o| o.mirror_of.is_none()),
                "output {:?} mirrors {:?}, which is not a primary output",
                output.name,
                primary
            );
        }
        Ok(())
    }
}

/// Renderer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// "software" (partial repaint) or "accelerated" (full redraw)
    pub path: RenderPath,
    pub preferred_format: Fourcc,
    /// Scene background (hex: 0xAARRGGBB)
    pub clear_color: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            path: RenderPath::Software,
            preferred_format: Fourcc::Xrgb8888,
            clear_color: 0xff1e1e2e,
        }
    }
}

/// Buffer pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapchainConfig {
    /// Buffers per output; one is always held on screen
    pub slots: usize,
    /// Negotiate explicit modifiers before falling back to implicit ones
    pub use_modifiers: bool,
    /// Test-commit each new swapchain before using it
    pub test_buffers: bool,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            slots: 3,
            use_modifiers: true,
            test_buffers: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DamageConfig {
    /// Frames of damage history kept per output
    pub ring_capacity: usize,
}

impl Default for DamageConfig {
    fn default() -> Self {
        Self { ring_capacity: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Consecutive failed commits before renegotiating buffers
    pub max_commit_failures: u32,
    /// Vblank period used for outputs without a refresh rate
    pub fallback_interval_ms: u64,
    /// How often frame statistics are logged (0 disables)
    pub stats_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_commit_failures: 3,
            fallback_interval_ms: 16,
            stats_interval_ms: 5000,
        }
    }
}

/// Headless output description
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    /// Refresh rate in mHz
    pub refresh_mhz: u32,
    pub transform: Transform,
    /// Position in the scene
    pub x: i32,
    pub y: i32,
    /// Name of the output this one mirrors
    pub mirror_of: Option<String>,
    /// Refuse explicit modifiers on scanout
    pub reject_modifiers: bool,
    pub overlay_planes: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            name: "HEADLESS-1".to_string(),
            width: 1280,
            height: 720,
            scale: 1.0,
            refresh_mhz: 60_000,
            transform: Transform::Normal,
            x: 0,
            y: 0,
            mirror_of: None,
            reject_modifiers: false,
            overlay_planes: 1,
        }
    }
}

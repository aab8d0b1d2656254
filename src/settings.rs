//! Persistent removal settings.
//!
//! Stored as a plain `key=value` file (`erasefe_settings.cfg`) in the platform
//! config directory. Unknown keys are ignored and unparseable values keep
//! their defaults, so older or hand-edited files always load.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::ops::inpaint::PatchMatchParams;
use crate::ops::region_fill::FillConfig;
use crate::ops::stroke_mask::MaskConfig;

pub const SETTINGS_FILE_NAME: &str = "erasefe_settings.cfg";

#[derive(Debug)]
pub enum SettingsError {
    Io(std::io::Error),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::Io(e) => write!(f, "Settings I/O error: {}", e),
        }
    }
}

impl std::error::Error for SettingsError {}

impl From<std::io::Error> for SettingsError {
    fn from(e: std::io::Error) -> Self {
        SettingsError::Io(e)
    }
}

// ============================================================================
// REMOTE
// ============================================================================

/// Quality tier of the remote service; higher tiers get a longer time box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RemoteTier {
    Fast,
    #[default]
    Standard,
    Quality,
}

impl RemoteTier {
    pub fn timeout(&self) -> Duration {
        match self {
            RemoteTier::Fast => Duration::from_secs(5),
            RemoteTier::Standard => Duration::from_secs(15),
            RemoteTier::Quality => Duration::from_secs(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteTier::Fast => "fast",
            RemoteTier::Standard => "standard",
            RemoteTier::Quality => "quality",
        }
    }
}

impl FromStr for RemoteTier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(RemoteTier::Fast),
            "standard" => Ok(RemoteTier::Standard),
            "quality" => Ok(RemoteTier::Quality),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteSettings {
    /// Networked context: remote calls are only attempted when set.
    pub enabled: bool,
    pub endpoint: String,
    pub tier: RemoteTier,
    pub daily_limit: u32,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            tier: RemoteTier::Standard,
            daily_limit: 5,
        }
    }
}

impl RemoteSettings {
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.endpoint.trim().is_empty()
    }
}

// ============================================================================
// REMOVAL SETTINGS
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct RemovalSettings {
    pub mask: MaskConfig,
    pub patch: PatchMatchParams,
    pub fill: FillConfig,
    /// Membrane relaxation sweeps after a local content-aware fill.
    pub blend_iterations: usize,
    /// Masks with fewer pixels than this skip relaxation.
    pub blend_min_area: usize,
    /// Bounds area (px²) under which the spot-removal fast path is used.
    pub small_area_threshold: u64,
    pub fast_path_budget_ms: u64,
    pub fast_path_radius: u32,
    pub remote: RemoteSettings,
}

impl Default for RemovalSettings {
    fn default() -> Self {
        Self {
            mask: MaskConfig::default(),
            patch: PatchMatchParams::default(),
            fill: FillConfig::default(),
            blend_iterations: 50,
            blend_min_area: 64,
            small_area_threshold: 500,
            fast_path_budget_ms: 500,
            fast_path_radius: 3,
            remote: RemoteSettings::default(),
        }
    }
}

/// Parse `val` or keep `current`, logging the rejected value.
fn parse_or<T: FromStr + Copy>(key: &str, val: &str, current: T) -> T {
    match val.parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            crate::log_warn!("Settings: ignoring invalid value '{}' for '{}'", val, key);
            current
        }
    }
}

impl RemovalSettings {
    pub fn fast_path_budget(&self) -> Duration {
        Duration::from_millis(self.fast_path_budget_ms)
    }

    /// Default settings file location, `None` if no config directory can be found.
    pub fn settings_path() -> Option<PathBuf> {
        let dir = config_dir();
        if dir.as_os_str().is_empty() {
            return None;
        }
        Some(dir.join(SETTINGS_FILE_NAME))
    }

    /// Load from the default location; defaults if missing or unreadable.
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else { return Self::default() };
        let Ok(content) = std::fs::read_to_string(&path) else { return Self::default() };
        Self::parse(&content)
    }

    /// Load from an explicit path. Unlike [`load`](Self::load), a missing
    /// file is an error.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "closed_min_points" => {
                    s.mask.closed_min_points = parse_or(key, val, s.mask.closed_min_points).max(3);
                }
                "closing_distance_factor" => {
                    s.mask.closing_distance_factor = parse_or(key, val, s.mask.closing_distance_factor).max(0.0);
                }
                "simplify_tolerance_factor" => {
                    s.mask.simplify_tolerance_factor =
                        parse_or(key, val, s.mask.simplify_tolerance_factor).max(0.0);
                }
                "patch_size" => {
                    // Odd, at least 3.
                    s.patch.patch_size = parse_or(key, val, s.patch.patch_size).max(3) | 1;
                }
                "patch_iterations" => s.patch.iterations = parse_or(key, val, s.patch.iterations),
                "search_radius" => {
                    s.patch.search_radius = match val {
                        "" | "auto" => None,
                        _ => Some(parse_or(key, val, 0.0f32)).filter(|r| *r >= 1.0),
                    };
                }
                "seed" => s.patch.seed = parse_or(key, val, s.patch.seed),
                "ring_low" => s.fill.ring_low = parse_or(key, val, s.fill.ring_low).clamp(0.0, 1.0),
                "ring_high" => s.fill.ring_high = parse_or(key, val, s.fill.ring_high).clamp(0.0, 1.0),
                "heal_edge_gain" => s.fill.heal_edge_gain = parse_or(key, val, s.fill.heal_edge_gain),
                "search_rings" => s.fill.search_rings = parse_or(key, val, s.fill.search_rings),
                "search_samples" => s.fill.search_samples = parse_or(key, val, s.fill.search_samples).max(1),
                "blend_iterations" => s.blend_iterations = parse_or(key, val, s.blend_iterations),
                "blend_min_area" => s.blend_min_area = parse_or(key, val, s.blend_min_area),
                "small_area_threshold" => s.small_area_threshold = parse_or(key, val, s.small_area_threshold),
                "fast_path_budget_ms" => s.fast_path_budget_ms = parse_or(key, val, s.fast_path_budget_ms),
                "fast_path_radius" => s.fast_path_radius = parse_or(key, val, s.fast_path_radius).max(1),
                "remote_enabled" => s.remote.enabled = parse_or(key, val, s.remote.enabled),
                "remote_endpoint" => s.remote.endpoint = val.to_string(),
                "remote_tier" => s.remote.tier = parse_or(key, val, s.remote.tier),
                "daily_limit" => s.remote.daily_limit = parse_or(key, val, s.remote.daily_limit),
                _ => {}
            }
        }
        if s.fill.ring_low > s.fill.ring_high {
            std::mem::swap(&mut s.fill.ring_low, &mut s.fill.ring_high);
        }
        s
    }

    pub fn to_config_string(&self) -> String {
        let radius = self
            .patch
            .search_radius
            .map(|r| r.to_string())
            .unwrap_or_else(|| "auto".to_string());
        format!(
            "closed_min_points={}\n\
             closing_distance_factor={}\n\
             simplify_tolerance_factor={}\n\
             patch_size={}\n\
             patch_iterations={}\n\
             search_radius={radius}\n\
             seed={}\n\
             ring_low={}\n\
             ring_high={}\n\
             heal_edge_gain={}\n\
             search_rings={}\n\
             search_samples={}\n\
             blend_iterations={}\n\
             blend_min_area={}\n\
             small_area_threshold={}\n\
             fast_path_budget_ms={}\n\
             fast_path_radius={}\n\
             remote_enabled={}\n\
             remote_endpoint={}\n\
             remote_tier={}\n\
             daily_limit={}\n",
            self.mask.closed_min_points,
            self.mask.closing_distance_factor,
            self.mask.simplify_tolerance_factor,
            self.patch.patch_size,
            self.patch.iterations,
            self.patch.seed,
            self.fill.ring_low,
            self.fill.ring_high,
            self.fill.heal_edge_gain,
            self.fill.search_rings,
            self.fill.search_samples,
            self.blend_iterations,
            self.blend_min_area,
            self.small_area_threshold,
            self.fast_path_budget_ms,
            self.fast_path_radius,
            self.remote.enabled,
            self.remote.endpoint,
            self.remote.tier.as_str(),
            self.remote.daily_limit,
        )
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_string())?;
        Ok(())
    }

}

/// Per-user config directory for EraseFE.
/// On Linux:   ~/.config/erasefe  (XDG_CONFIG_HOME respected)
/// On Windows: %APPDATA%\EraseFE
/// On macOS:   ~/Library/Application Support/EraseFE
/// Fallback:   the executable's directory.
pub fn config_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        return std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                PathBuf::from(home).join(".config")
            })
            .join("erasefe");
    }
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_default();
        return PathBuf::from(appdata).join("EraseFE");
    }
    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
        return PathBuf::from(home)
            .join("Library")
            .join("Application Support")
            .join("EraseFE");
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_config_text() {
        let mut s = RemovalSettings::default();
        s.patch.patch_size = 9;
        s.patch.search_radius = Some(40.0);
        s.remote.enabled = true;
        s.remote.endpoint = "https://example.test/api/inpaint".into();
        s.remote.tier = RemoteTier::Quality;
        s.fast_path_budget_ms = 250;

        assert_eq!(RemovalSettings::parse(&s.to_config_string()), s);
    }

    #[test]
    fn unknown_keys_and_bad_values_fall_back() {
        let s = RemovalSettings::parse(
            "# comment\n\
             theme_mode=dark\n\
             patch_iterations=lots\n\
             blend_iterations=12\n\
             not a pair\n\
             remote_tier=ultra\n",
        );
        assert_eq!(s.patch.iterations, 5);
        assert_eq!(s.blend_iterations, 12);
        assert_eq!(s.remote.tier, RemoteTier::Standard);
    }

    #[test]
    fn patch_size_is_forced_odd() {
        assert_eq!(RemovalSettings::parse("patch_size=8").patch.patch_size, 9);
        assert_eq!(RemovalSettings::parse("patch_size=1").patch.patch_size, 3);
        assert_eq!(RemovalSettings::parse("search_radius=auto").patch.search_radius, None);
    }

    #[test]
    fn tiers_map_to_time_boxes() {
        assert_eq!(RemoteTier::Fast.timeout(), Duration::from_secs(5));
        assert_eq!(RemoteTier::Standard.timeout(), Duration::from_secs(15));
        assert_eq!(RemoteTier::Quality.timeout(), Duration::from_secs(30));
        assert_eq!("QUALITY".parse::<RemoteTier>(), Ok(RemoteTier::Quality));
    }

    #[test]
    fn remote_needs_flag_and_endpoint() {
        let mut r = RemoteSettings::default();
        assert!(!r.is_usable());
        r.enabled = true;
        assert!(!r.is_usable());
        r.endpoint = "http://localhost:8080".into();
        assert!(r.is_usable());
    }

    #[test]
    fn save_and_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join(SETTINGS_FILE_NAME);
        let mut s = RemovalSettings::default();
        s.small_area_threshold = 1234;
        s.save_to(&path).unwrap();
        assert_eq!(RemovalSettings::load_from(&path).unwrap(), s);
        assert!(RemovalSettings::load_from(&dir.path().join("missing.cfg")).is_err());
    }
}

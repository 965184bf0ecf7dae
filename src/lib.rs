//! Boardshot
//!
//! Keeps a set of headless browser pages pointed at live transit departure
//! boards and turns region captures of them into e-ink ready bitmaps.
//!
//! # Architecture
//!
//! - [`manager::SessionManager`] owns one session per configured slot,
//!   initializes it with retry and backoff, and swaps in a fresh session on a
//!   fixed cadence without disturbing requests in flight.
//! - [`pipeline::Pipeline`] runs a fixed chain of external image transforms
//!   over scratch files and always cleans those files up afterwards.
//! - [`server`] exposes both over HTTP.
//!
//! # Example
//!
//! ```no_run
//! use boardshot::BoardConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BoardConfig::default();
//! config.validate()?;
//! println!("primary slot: {}", config.primary_slot()?.url);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod manager;
pub mod pipeline;
pub mod retry;
pub mod scratch;
pub mod server;
pub mod session;
pub mod source;
pub mod transform;

// Headless Chrome backed page source
#[cfg(feature = "cdp")]
pub mod cdp;

pub use manager::SessionManager;
pub use pipeline::{Pipeline, PipelineSpec};
pub use retry::RetryPolicy;
pub use scratch::{ScratchBroker, ScratchSet};
pub use session::{Session, SessionLease, SessionStatus};
pub use source::{Capture, PageHandle, TargetSource};
pub use transform::{ProcessRunner, TransformRunner};

const DEFAULT_PRIMARY_URL: &str = "https://www.bart.gov/schedules/eta?stn=CIVC";
const DEFAULT_SELECTOR: &str = ".real-time-departures";

/// Service configuration
///
/// The defaults reproduce the single-board setup: one BART station page,
/// captured at `.real-time-departures`, refreshed hourly. Extra `West` and
/// `East` groups enable the composite `/muni` board.
///
/// # Examples
///
/// ```
/// let cfg = boardshot::BoardConfig::default();
/// assert_eq!(cfg.refresh_interval.as_secs(), 3600);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Browser viewport used for every page
    pub viewport: Viewport,
    /// Slot groups, each refreshed on its own schedule
    pub groups: Vec<GroupConfig>,
    /// Initialization retry schedule
    pub retry: RetryPolicy,
    /// Default cadence for re-creating sessions
    #[serde(with = "retry::millis")]
    pub refresh_interval: Duration,
    /// How long a request waits for the ready selector
    #[serde(with = "retry::millis")]
    pub ready_timeout: Duration,
    /// External transform settings
    pub render: RenderSettings,
    /// Where full-page diagnostic screenshots go, if anywhere
    pub debug_captures: Option<PathBuf>,
    /// Scratch directory for pipeline files (system temp dir when unset)
    pub scratch_dir: Option<PathBuf>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            groups: vec![GroupConfig {
                name: "primary".to_string(),
                kind: GroupKind::Primary,
                refresh_interval: None,
                slots: vec![SlotConfig {
                    id: "primary".to_string(),
                    url: DEFAULT_PRIMARY_URL.to_string(),
                    selector: DEFAULT_SELECTOR.to_string(),
                }],
            }],
            retry: RetryPolicy::default(),
            refresh_interval: Duration::from_secs(60 * 60),
            ready_timeout: Duration::from_secs(30),
            render: RenderSettings::default(),
            debug_captures: None,
            scratch_dir: None,
        }
    }
}

impl BoardConfig {
    /// Load a JSON config; missing fields fall back to the defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("cannot read {}: {}", path.display(), e)))?;
        let config: BoardConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::ConfigError(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the manager and server rely on.
    pub fn validate(&self) -> Result<()> {
        let primaries = self.groups.iter().filter(|g| g.kind == GroupKind::Primary).count();
        if primaries != 1 {
            return Err(Error::ConfigError(format!(
                "exactly one primary group is required, found {}",
                primaries
            )));
        }
        let has_west = self.groups.iter().any(|g| g.kind == GroupKind::West);
        let has_east = self.groups.iter().any(|g| g.kind == GroupKind::East);
        if has_west != has_east {
            return Err(Error::ConfigError("west and east groups must be configured together".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::ConfigError("retry.max_attempts must be at least 1".into()));
        }
        if self.refresh_interval.is_zero() {
            return Err(Error::ConfigError("refresh_interval must be positive".into()));
        }

        let mut group_names = HashSet::new();
        let mut slot_ids = HashSet::new();
        for group in &self.groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(Error::ConfigError(format!("duplicate group '{}'", group.name)));
            }
            if group.slots.is_empty() {
                return Err(Error::ConfigError(format!("group '{}' has no slots", group.name)));
            }
            if group.kind == GroupKind::Primary && group.slots.len() != 1 {
                return Err(Error::ConfigError("the primary group must hold exactly one slot".into()));
            }
            if matches!(group.refresh_interval, Some(d) if d.is_zero()) {
                return Err(Error::ConfigError(format!("group '{}' has a zero refresh interval", group.name)));
            }
            for slot in &group.slots {
                if !slot_ids.insert(slot.id.as_str()) {
                    return Err(Error::ConfigError(format!("duplicate slot '{}'", slot.id)));
                }
                slot.validate()?;
            }
        }
        Ok(())
    }

    /// Anchor relative scratch and debug directories at `base`.
    ///
    /// Transforms may run in another working directory, so every path
    /// handed to them has to be absolute.
    pub fn resolve_paths(&mut self, base: &Path) {
        for dir in [&mut self.scratch_dir, &mut self.debug_captures].into_iter().flatten() {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    /// The slot behind `GET /`.
    pub fn primary_slot(&self) -> Result<&SlotConfig> {
        self.groups
            .iter()
            .find(|g| g.kind == GroupKind::Primary)
            .and_then(|g| g.slots.first())
            .ok_or_else(|| Error::ConfigError("no primary slot configured".into()))
    }

    /// Whether the composite board can be served.
    pub fn has_directional_groups(&self) -> bool {
        self.groups.iter().any(|g| g.kind == GroupKind::West) && self.groups.iter().any(|g| g.kind == GroupKind::East)
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 1200,
        }
    }
}

/// Role of a slot group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    /// The single board behind `GET /`
    Primary,
    /// Left column of the composite board
    West,
    /// Right column of the composite board
    East,
}

/// A named set of slots refreshed together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub kind: GroupKind,
    /// Overrides [`BoardConfig::refresh_interval`] for this group
    #[serde(default, with = "opt_millis")]
    pub refresh_interval: Option<Duration>,
    /// Slots in display order
    pub slots: Vec<SlotConfig>,
}

/// One target page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub id: String,
    pub url: String,
    /// Selector that marks the page as ready and bounds the capture
    #[serde(default = "default_selector")]
    pub selector: String,
}

fn default_selector() -> String {
    DEFAULT_SELECTOR.to_string()
}

impl SlotConfig {
    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::ConfigError("slot id must not be empty".into()));
        }
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| Error::ConfigError(format!("slot '{}' has an invalid url: {}", self.id, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::ConfigError(format!(
                "slot '{}' must use http or https, got {}",
                self.id,
                parsed.scheme()
            )));
        }
        if self.selector.trim().is_empty() {
            return Err(Error::ConfigError(format!("slot '{}' has an empty selector", self.id)));
        }
        Ok(())
    }
}

/// Parameters for the external image transforms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// ImageMagick `convert`
    pub convert_program: String,
    /// Letterboxing helper taking `WxH -g <gravity> -c <color> in out`
    pub aspect_program: String,
    /// Fill color for padding and tile gaps
    pub background: String,
    /// Final portrait width in pixels
    pub width: u32,
    /// Final portrait height in pixels
    pub height: u32,
    /// Horizontal gap between the west and east strips
    pub tile_gap: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            convert_program: "convert".to_string(),
            aspect_program: "./aspect".to_string(),
            background: "#f1f5e3".to_string(),
            width: 758,
            height: 1024,
            tile_gap: 20,
        }
    }
}

impl RenderSettings {
    /// `WxH` of the final portrait image.
    pub fn target_geometry(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// `HxW`, the same frame before the final quarter turn.
    pub fn landscape_geometry(&self) -> String {
        format!("{}x{}", self.height, self.width)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BoardConfig::default();
        assert_eq!(config.viewport.width, 1200);
        assert_eq!(config.viewport.height, 1200);
        assert_eq!(config.retry.max_attempts, 5);
        config.validate().unwrap();
        assert_eq!(config.primary_slot().unwrap().selector, ".real-time-departures");
        assert!(!config.has_directional_groups());
    }

    #[test]
    fn test_render_geometry() {
        let render = RenderSettings::default();
        assert_eq!(render.target_geometry(), "758x1024");
        assert_eq!(render.landscape_geometry(), "1024x758");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let raw = r##"{
            "refresh_interval": 600000,
            "groups": [
                {"name": "primary", "kind": "primary",
                 "slots": [{"id": "primary", "url": "https://example.com/board"}]},
                {"name": "muni-west", "kind": "west", "refresh_interval": 1800000,
                 "slots": [{"id": "muni-west-1", "url": "https://example.com/w1", "selector": "#stop"}]},
                {"name": "muni-east", "kind": "east",
                 "slots": [{"id": "muni-east-1", "url": "https://example.com/e1"}]}
            ]
        }"##;
        let config: BoardConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.refresh_interval, Duration::from_secs(600));
        assert_eq!(config.groups[1].refresh_interval, Some(Duration::from_secs(1800)));
        assert_eq!(config.groups[2].slots[0].selector, ".real-time-departures");
        assert_eq!(config.render.background, "#f1f5e3");
        assert!(config.has_directional_groups());
    }

    #[test]
    fn rejects_duplicate_slots_and_bad_urls() {
        let mut config = BoardConfig::default();
        config.groups.push(GroupConfig {
            name: "muni-west".into(),
            kind: GroupKind::West,
            refresh_interval: None,
            slots: vec![SlotConfig {
                id: "primary".into(),
                url: "https://example.com".into(),
                selector: "#x".into(),
            }],
        });
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let mut config = BoardConfig::default();
        config.groups[0].slots[0].url = "ftp://example.com".into();
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn relative_dirs_are_anchored_at_base() {
        let mut config = BoardConfig {
            scratch_dir: Some(PathBuf::from("scratch")),
            debug_captures: Some(PathBuf::from("/var/tmp/boards")),
            ..BoardConfig::default()
        };
        config.resolve_paths(Path::new("/srv/boardshot"));
        assert_eq!(config.scratch_dir, Some(PathBuf::from("/srv/boardshot/scratch")));
        assert_eq!(config.debug_captures, Some(PathBuf::from("/var/tmp/boards")));
    }

    #[test]
    fn example_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/boards.example.json");
        let config = BoardConfig::from_json_file(&path).unwrap();
        assert_eq!(config.primary_slot().unwrap().id, "bart-civic-center");
        assert_eq!(config.groups.len(), 3);
        assert_eq!(config.ready_timeout, Duration::from_secs(30));
    }

    #[test]
    fn rejects_one_sided_composite() {
        let mut config = BoardConfig::default();
        config.groups.push(GroupConfig {
            name: "muni-east".into(),
            kind: GroupKind::East,
            refresh_interval: None,
            slots: vec![SlotConfig {
                id: "muni-east-1".into(),
                url: "https://example.com/e1".into(),
                selector: "#x".into(),
            }],
        });
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }
}

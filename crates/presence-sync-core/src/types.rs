//! Core types for Presence Sync

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::SyncError;

/// Open JSON mapping used for `viewParams`, `metadata` and action payloads.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Identity of a participant on the transport.
///
/// Envelopes carry the sender's id so a participant can ignore its own
/// broadcasts when the transport echoes them back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    /// Generate a fresh, time-ordered client id
    pub fn generate() -> Self {
        Self(format!("client_{}", Ulid::new()))
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier shared by every participant of one synchronized session
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a fresh session id
    pub fn generate() -> Self {
        Self(format!("session_{}", Ulid::new()))
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of a participant.
///
/// Exactly one Authority drives the state; every Replica mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Local mutations are ground truth and get sequenced
    Authority,
    /// Mirrors authoritative state via deltas and snapshots
    Replica,
}

impl Role {
    /// Whether this role may sequence state
    pub fn is_authority(self) -> bool {
        matches!(self, Role::Authority)
    }

    /// Wire/display name
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Authority => "authority",
            Role::Replica => "replica",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allow-listed views the Authority can navigate to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewName {
    /// Landing view
    #[default]
    Home,
    /// Package catalog listing
    Catalog,
    /// Single package detail page
    PackageDetail,
    /// Side-by-side comparison of the compare set
    Compare,
    /// Payment flow
    Payment,
    /// Closing summary
    Summary,
}

impl ViewName {
    /// Every navigable view, in display order
    pub const ALL: [ViewName; 6] = [
        ViewName::Home,
        ViewName::Catalog,
        ViewName::PackageDetail,
        ViewName::Compare,
        ViewName::Payment,
        ViewName::Summary,
    ];

    /// Wire name of the view
    pub fn as_str(self) -> &'static str {
        match self {
            ViewName::Home => "home",
            ViewName::Catalog => "catalog",
            ViewName::PackageDetail => "package-detail",
            ViewName::Compare => "compare",
            ViewName::Payment => "payment",
            ViewName::Summary => "summary",
        }
    }
}

impl FromStr for ViewName {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ViewName::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| SyncError::UnknownView(s.to_string()))
    }
}

impl fmt::Display for ViewName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selection slice of the shared state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    /// Per-role selected ids
    #[serde(default)]
    pub user_selections: BTreeMap<Role, BTreeSet<String>>,
    /// Ordered, deduplicated ids chosen for comparison
    #[serde(default)]
    pub compare_set: Vec<String>,
}

/// Scroll offset of one named container, as a fraction of its scrollable range
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollPosition {
    /// Vertical fraction (not clamped)
    pub percent_y: f64,
    /// Horizontal fraction (not clamped)
    pub percent_x: f64,
    /// Epoch milliseconds of the last update
    pub timestamp: i64,
}

impl ScrollPosition {
    /// Fraction of the scrollable range covered by `offset`.
    ///
    /// Returns 0 when the content does not overflow the viewport.
    pub fn fraction(offset: f64, content_size: f64, viewport_size: f64) -> f64 {
        let range = content_size - viewport_size;
        if range <= 0.0 {
            0.0
        } else {
            offset / range
        }
    }
}

/// Last known pointer of one participant
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    /// Horizontal fraction of the target element (not clamped)
    pub x_percent: f64,
    /// Vertical fraction of the target element (not clamped)
    pub y_percent: f64,
    /// Envelope sequence observed with this position
    pub last_seen_seq: u64,
    /// Epoch milliseconds when this entry was last refreshed
    pub timestamp: i64,
}

/// Bounding box of the element a pointer is tracked against
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Express an absolute point as fractions of this box.
    ///
    /// Degenerate axes map to 0. Points outside the box yield values
    /// outside `[0, 1]`.
    pub fn fraction_of(&self, x: f64, y: f64) -> (f64, f64) {
        let fx = if self.width > 0.0 {
            (x - self.left) / self.width
        } else {
            0.0
        };
        let fy = if self.height > 0.0 {
            (y - self.top) / self.height
        } else {
            0.0
        };
        (fx, fy)
    }
}

/// The single owned, versioned document mirrored between participants
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedState {
    pub session_id: SessionId,
    /// Version of the authoritative state
    pub seq: u64,
    pub last_updated_by: Option<Role>,
    pub view: ViewName,
    #[serde(default)]
    pub view_params: JsonMap,
    #[serde(default)]
    pub shared_packages: Vec<String>,
    #[serde(default)]
    pub selection: Selection,
    #[serde(default)]
    pub scroll_positions: BTreeMap<String, ScrollPosition>,
    #[serde(default)]
    pub cursors: BTreeMap<String, CursorPosition>,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl SharedState {
    /// Empty state bound to a session
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            ..Default::default()
        }
    }

    /// Current payment step, if any
    pub fn payment_step(&self) -> Option<&str> {
        self.metadata.get("paymentStep").and_then(|v| v.as_str())
    }

    /// Current detail-view state, if any
    pub fn detail(&self) -> Option<&JsonMap> {
        self.metadata.get("detail").and_then(|v| v.as_object())
    }
}

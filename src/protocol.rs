//! Wire-level event types for room synchronization.
//!
//! Everything that crosses the channel is one of three events:
//!
//! ```text
//! ┌───────────┬──────────────────────────────────────────────┐
//! │ sync      │ full encoded document state (catch-up)       │
//! │ update    │ incremental document delta                   │
//! │ awareness │ per-client presence state (or None = clear)  │
//! └───────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Events are a closed tagged enum so handlers pattern-match exhaustively
//! instead of branching on string tags. Serialized with bincode.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a board element (shape, sticky note, connector, ...).
pub type ElementId = Uuid;

/// Process-unique identifier for one provider instance.
///
/// Assigned once at provider construction and stable for its lifetime.
/// Used as the presence-map key and to filter self-originated echoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Generate a random client id.
    ///
    /// Random 64-bit ids make collisions between independent processes
    /// vanishingly unlikely without any coordination.
    pub fn generate() -> Self {
        Self(rand::random::<u64>())
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 2D cursor position in board (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// RGBA color tag for rendering a collaborator's cursor and selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollabColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CollabColor {
    /// Derive a stable, vivid color from an id.
    ///
    /// Hue comes from the id hash; saturation/lightness are fixed so every
    /// collaborator gets a distinct but comparable tone.
    pub fn from_id(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for CollabColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 } // Default blue
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Identity and display metadata for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub display_name: String,
    /// Reference to an avatar image (URL or asset key).
    pub avatar: Option<String>,
    pub color: CollabColor,
}

impl UserProfile {
    pub fn new(display_name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            display_name: display_name.into(),
            avatar: None,
            color: CollabColor::from_id(id),
        }
    }

    /// Create with an explicit id (stable color follows the id).
    pub fn with_id(id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            avatar: None,
            color: CollabColor::from_id(id),
        }
    }
}

/// Ephemeral per-participant state. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorState {
    pub user: UserProfile,
    /// Cursor position, None while the pointer is off the board.
    pub cursor: Option<Point>,
    /// Ids of the elements this participant has selected.
    pub selection: Vec<ElementId>,
}

impl CollaboratorState {
    pub fn new(user: UserProfile) -> Self {
        Self {
            user,
            cursor: None,
            selection: Vec::new(),
        }
    }
}

/// One broadcast on the room channel.
///
/// `Sync` and `Update` both carry opaque document bytes and are applied
/// identically by receivers; `Sync` is simply the full state used for
/// catch-up after (re)connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomEvent {
    /// Full encoded document state.
    Sync { state: Vec<u8> },
    /// Incremental document delta.
    Update { update: Vec<u8> },
    /// Presence state for one client; None clears the entry.
    Awareness {
        client_id: ClientId,
        state: Option<CollaboratorState>,
    },
}

impl RoomEvent {
    /// Transport-level event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            RoomEvent::Sync { .. } => "sync",
            RoomEvent::Update { .. } => "update",
            RoomEvent::Awareness { .. } => "awareness",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(event)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::Decode(e) => write!(f, "Decode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

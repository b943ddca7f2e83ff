//! Core types for feedpipe

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a download item
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl ItemId {
    /// Create a new ItemId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for ItemId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<ItemId> for i64 {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl PartialEq<i64> for ItemId {
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl PartialEq<ItemId> for i64 {
    fn eq(&self, other: &ItemId) -> bool {
        *self == other.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for ItemId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ItemId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ItemId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Download item status
///
/// The status machine is `Pending -> Active -> {Success | Failed}`, with
/// `Active <-> Paused` permitted only while not yet terminal. `Success` and
/// `Failed` are terminal and accept no further transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Admitted, backend task not yet created
    Pending,
    /// Backend task created and running
    Active,
    /// Paused by user command
    Paused,
    /// Terminal: all files produced and pipelined
    Success,
    /// Terminal: backend reported an error (retained in `error_message`)
    Failed,
}

impl DownloadStatus {
    /// Convert integer status code to DownloadStatus enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => DownloadStatus::Pending,
            1 => DownloadStatus::Active,
            2 => DownloadStatus::Paused,
            3 => DownloadStatus::Success,
            4 => DownloadStatus::Failed,
            _ => DownloadStatus::Failed, // Default to Failed for unknown status
        }
    }

    /// Convert DownloadStatus enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            DownloadStatus::Pending => 0,
            DownloadStatus::Active => 1,
            DownloadStatus::Paused => 2,
            DownloadStatus::Success => 3,
            DownloadStatus::Failed => 4,
        }
    }

    /// Whether the status is terminal (Success or Failed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Success | DownloadStatus::Failed)
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Enforced before every persisted status change so that stray backend
    /// events can never resurrect a terminal item.
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        match (self, next) {
            (Pending, Active) | (Pending, Failed) => true,
            (Active, Paused) | (Active, Success) | (Active, Failed) => true,
            (Paused, Active) | (Paused, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Active => "active",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Success => "success",
            DownloadStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Fetch/parse log status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    /// Attempt started, terminal status not yet written
    Pending,
    /// Attempt completed
    Success,
    /// Attempt failed; error text is retained on the row
    Failed,
}

impl LogStatus {
    /// Convert integer status code to LogStatus enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => LogStatus::Pending,
            1 => LogStatus::Success,
            _ => LogStatus::Failed,
        }
    }

    /// Convert LogStatus enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            LogStatus::Pending => 0,
            LogStatus::Success => 1,
            LogStatus::Failed => 2,
        }
    }
}

/// One normalized item parsed from a subscription feed
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    /// Stable identifier (GUID for RSS, id for Atom; falls back to link, then title)
    pub id: String,

    /// Item link/URL (the download candidate)
    pub link: Option<String>,

    /// Item title
    pub title: Option<String>,

    /// Item description
    pub description: Option<String>,

    /// Publication date
    pub published: Option<DateTime<Utc>>,
}

/// A file produced by a completed download, as presented to `describe`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadedFile {
    /// Absolute path of the file in the content store
    pub path: PathBuf,

    /// File name without directory
    pub name: String,

    /// Lowercased extension, empty if none
    pub ext: String,

    /// Size in bytes
    pub size_bytes: u64,
}

/// Media metadata portion of a file descriptor
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MediaDescriptor {
    /// Display name
    pub name: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// Whether the media should be publicly visible
    #[serde(default)]
    pub is_public: bool,
}

/// Series portion of a file descriptor
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeriesDescriptor {
    /// Series name; identity key together with `season`
    pub name: String,
    /// Season label (e.g. "01")
    pub season: String,
}

/// Episode portion of a file descriptor
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpisodeDescriptor {
    /// Episode title; identity key together with `no` within a series
    pub title: String,
    /// Episode number label
    pub no: String,
    /// Publication timestamp
    pub pub_at: Option<DateTime<Utc>>,
}

/// Structured classification a rule's `describe` hook produces for a file.
///
/// Advisory only: Series/Episode identity is always resolved by natural key,
/// never trusted as an opaque id from the sandbox.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Media metadata (defaults are used when absent)
    pub media: Option<MediaDescriptor>,
    /// Series classification
    pub series: Option<SeriesDescriptor>,
    /// Episode classification (requires `series` to take effect)
    pub episode: Option<EpisodeDescriptor>,
    /// Replace an existing episode's fields and file linkage on key collision
    #[serde(default)]
    pub overwrite_episode: bool,
    /// Preferred save path hint, relative to the library root
    pub save_path: Option<String>,
}

/// Live, non-persisted projection of a download item's backend state.
///
/// Fetched on demand from the owning task; absence of a live task yields a
/// minimal projection built from the persisted terminal status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadItemState {
    /// Current status
    pub status: DownloadStatus,
    /// Progress percentage (0.0 to 100.0)
    pub progress_percent: f32,
    /// Current speed in bytes per second
    pub speed_bps: u64,
    /// Backend connection count (peers for a swarm engine, connections otherwise)
    pub connections: u32,
    /// Backend-assigned task identifier, if any
    pub backend_id: Option<String>,
}

impl DownloadItemState {
    /// Minimal projection for an item with no live task
    pub fn terminal(status: DownloadStatus) -> Self {
        Self {
            status,
            progress_percent: if status == DownloadStatus::Success {
                100.0
            } else {
                0.0
            },
            speed_bps: 0,
            connections: 0,
            backend_id: None,
        }
    }
}

/// Event emitted by a backend download task
#[derive(Clone, Debug)]
pub enum TaskEvent {
    /// Backend confirmed the task started (or resumed from pause)
    Started,
    /// Progress update
    Progress {
        /// Progress percentage (0.0 to 100.0)
        percent: f32,
        /// Current speed in bytes per second
        speed_bps: u64,
        /// Backend connection count
        connections: u32,
    },
    /// Backend confirmed the task paused
    Paused,
    /// Backend confirmed the task was removed
    Removed,
    /// Task finished; all produced files listed
    Complete {
        /// Paths of the produced files, in the task's destination directory
        files: Vec<PathBuf>,
    },
    /// Task failed
    Error {
        /// Serialized backend status
        message: String,
    },
}

/// Event emitted on the pipeline's broadcast channel
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A source fetch cycle started
    FetchStarted {
        /// Source ID
        source_id: i64,
    },

    /// A source fetch cycle completed
    FetchComplete {
        /// Source ID
        source_id: i64,
        /// Number of entries parsed from the feed
        entries: usize,
        /// Number of items admitted this cycle
        admitted: usize,
    },

    /// A source fetch cycle failed at the fetch/parse stage
    FetchFailed {
        /// Source ID
        source_id: i64,
        /// Error text written to the fetch/parse log
        error: String,
    },

    /// A candidate passed validation and dedup and was persisted
    ItemAdmitted {
        /// Item ID
        id: ItemId,
        /// Candidate URL
        url: String,
    },

    /// A candidate was skipped because its URL hash already exists
    ItemDuplicate {
        /// Existing item ID for the hash
        existing_id: ItemId,
        /// Candidate URL
        url: String,
    },

    /// Backend task was created for an item
    ItemStarted {
        /// Item ID
        id: ItemId,
        /// Adapter that owns the task
        adapter: String,
    },

    /// Progress update for an item
    ItemProgress {
        /// Item ID
        id: ItemId,
        /// Progress percentage (0.0 to 100.0)
        percent: f32,
        /// Current speed in bytes per second
        speed_bps: u64,
    },

    /// An item was paused (backend-confirmed)
    ItemPaused {
        /// Item ID
        id: ItemId,
    },

    /// An item was resumed (backend-confirmed)
    ItemResumed {
        /// Item ID
        id: ItemId,
    },

    /// An item was removed (backend-confirmed when a live task existed)
    ItemRemoved {
        /// Item ID
        id: ItemId,
    },

    /// An item reached Success; produced files have been registered
    ItemComplete {
        /// Item ID
        id: ItemId,
        /// Number of files produced
        files: usize,
    },

    /// An item reached Failed
    ItemFailed {
        /// Item ID
        id: ItemId,
        /// Error text retained on the item
        error: String,
    },

    /// The descriptor pipeline materialized catalog records for a file
    FileDescribed {
        /// Item the file belongs to
        id: ItemId,
        /// Media record created for the file
        media_id: i64,
        /// Episode the file was linked to, if any
        episode_id: Option<i64>,
    },
}

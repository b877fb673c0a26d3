use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An upstream playlist provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSource {
    pub id: i64,
    pub name: String,
    /// Remote URL, or a filesystem path when `is_local` is set
    pub location: String,
    pub is_local: bool,
    /// Operator text, one literal group title per line
    pub group_exclusions: String,
    pub user_agent: Option<String>,
    pub refresh_interval_hours: i64,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    /// 0 means unlimited
    pub max_concurrent_streams: i64,
    pub active_stream_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UpstreamSource {
    /// Exclusion list parsed from operator text
    pub fn exclusions(&self) -> Vec<String> {
        parse_operator_lines(&self.group_exclusions)
    }

    pub fn has_capacity(&self) -> bool {
        self.max_concurrent_streams == 0 || self.active_stream_count < self.max_concurrent_streams
    }

    /// Whether the scheduler should run reconciliation for this source
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_reconciled_at {
            None => true,
            Some(last) => now.signed_duration_since(last).num_hours() >= self.refresh_interval_hours,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSourceCreateRequest {
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub is_local: bool,
    #[serde(default)]
    pub group_exclusions: String,
    pub user_agent: Option<String>,
    #[serde(default = "default_refresh_interval_hours")]
    pub refresh_interval_hours: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub max_concurrent_streams: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceUpdateRequest {
    pub enabled: bool,
}

fn default_refresh_interval_hours() -> i64 {
    24
}

fn default_true() -> bool {
    true
}

/// Channel grouping, scoped per upstream source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub id: i64,
    pub name: String,
    pub source_id: i64,
    pub enabled: bool,
}

/// Group joined with its source name, rendered as `group@source`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupListing {
    pub id: i64,
    pub name: String,
    pub source_name: String,
    pub enabled: bool,
    pub channel_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Icon {
    pub id: i64,
    pub url: String,
    pub local_name: Option<String>,
    pub mime_hint: Option<String>,
    pub size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub stream_url: String,
    pub group_id: i64,
    pub source_id: i64,
    pub enabled: bool,
    /// Operator override: `enabled` is never recomputed for protected channels
    pub protected: bool,
    pub tvg_id: Option<String>,
    pub tvg_name: Option<String>,
    pub icon_id: Option<i64>,
    /// Verbatim tag lines that followed the metadata line, newline joined
    pub extra_tag_lines: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelUpdateRequest {
    pub enabled: Option<bool>,
    pub protected: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupUpdateRequest {
    pub enabled: bool,
}

/// An enabled channel with everything needed to emit a downstream entry
#[derive(Debug, Clone)]
pub struct PlaylistChannel {
    pub name: String,
    pub stream_url: String,
    pub tvg_id: Option<String>,
    pub tvg_name: Option<String>,
    pub icon_url: Option<String>,
    pub group_name: String,
}

/// A stream proxy instance known to the management plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRegistration {
    pub name: String,
    pub internal_url: String,
    pub internal_port: u16,
    pub external_url: String,
    pub external_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Substring match
    Any,
    Exact,
    Prefix,
    Suffix,
}

impl FilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterMode::Any => "any",
            FilterMode::Exact => "exact",
            FilterMode::Prefix => "prefix",
            FilterMode::Suffix => "suffix",
        }
    }
}

impl std::str::FromStr for FilterMode {
    type Err = String;

    /// Accepts the long names as well as the single letter codes `A`, `E`,
    /// `P` and `S`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" | "any" => Ok(FilterMode::Any),
            "e" | "exact" => Ok(FilterMode::Exact),
            "p" | "prefix" => Ok(FilterMode::Prefix),
            "s" | "suffix" => Ok(FilterMode::Suffix),
            other => Err(format!("unknown filter mode '{}'", other)),
        }
    }
}

/// A named downstream playlist definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamPlaylist {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    /// Operator text, one `group@source` reference per line
    pub groups: String,
    /// Operator text, one channel name filter per line
    pub channel_filter: String,
    pub filter_mode: FilterMode,
    pub proxy_name: Option<String>,
}

impl DownstreamPlaylist {
    /// Parsed `group@source` references. Lines without an `@` are skipped.
    pub fn group_refs(&self) -> Vec<GroupRef> {
        parse_operator_lines(&self.groups)
            .into_iter()
            .filter_map(|line| GroupRef::parse(&line))
            .collect()
    }

    pub fn name_filters(&self) -> Vec<String> {
        parse_operator_lines(&self.channel_filter)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamPlaylistCreateRequest {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub groups: String,
    #[serde(default)]
    pub channel_filter: String,
    #[serde(default = "default_filter_mode")]
    pub filter_mode: FilterMode,
    pub proxy_name: Option<String>,
}

fn default_filter_mode() -> FilterMode {
    FilterMode::Any
}

/// A `group@source` reference from a downstream definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    pub group: String,
    pub source: String,
}

impl GroupRef {
    /// Split on the last `@` so group titles may themselves contain one
    pub fn parse(line: &str) -> Option<Self> {
        let (group, source) = line.rsplit_once('@')?;
        if group.is_empty() || source.is_empty() {
            return None;
        }
        Some(Self {
            group: group.to_string(),
            source: source.to_string(),
        })
    }
}

/// A live session as recorded by the management plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSession {
    pub id: i64,
    pub session_key: String,
    pub stream_url: String,
    pub client_address: String,
    pub user_agent: Option<String>,
    pub channel_id: Option<i64>,
    pub source_id: Option<i64>,
    pub proxy_name: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchStat {
    pub channel_id: i64,
    pub channel_name: String,
    pub client_address: String,
    pub cumulative_watch_ms: i64,
    pub last_session_ms: i64,
    pub last_accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionAction {
    Begin,
    End,
}

impl SessionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionAction::Begin => "Begin",
            SessionAction::End => "End",
        }
    }
}

impl std::str::FromStr for SessionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Begin" => Ok(SessionAction::Begin),
            "End" => Ok(SessionAction::End),
            other => Err(format!("unknown session action '{}'", other)),
        }
    }
}

/// Begin/End notification sent by a proxy after admission and on close
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub action: SessionAction,
    pub client: String,
    pub user_agent: Option<String>,
    /// Decoded upstream stream URL
    pub stream_url: String,
    pub proxy: ProxyRegistration,
}

impl SessionReport {
    pub fn session_key(&self) -> String {
        session_key(&self.stream_url, &self.client)
    }
}

/// A proxy asking to start a stream for one client. An admitted request
/// holds one slot of the source's stream capacity until the matching End.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub stream_url: String,
    pub client: String,
    pub proxy_name: String,
}

impl AdmissionRequest {
    pub fn session_key(&self) -> String {
        session_key(&self.stream_url, &self.client)
    }
}

/// Session identity: decoded stream URL and client address
pub fn session_key(stream_url: &str, client: &str) -> String {
    format!("{}|{}", stream_url, client)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    UnknownChannel,
    CapacityExhausted,
    SourceDisabled,
    ChannelDisabled,
    GroupDisabled,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::UnknownChannel => "unknown_channel",
            DenyReason::CapacityExhausted => "capacity_exhausted",
            DenyReason::SourceDisabled => "source_disabled",
            DenyReason::ChannelDisabled => "channel_disabled",
            DenyReason::GroupDisabled => "group_disabled",
        }
    }
}

impl std::str::FromStr for DenyReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown_channel" => Ok(DenyReason::UnknownChannel),
            "capacity_exhausted" => Ok(DenyReason::CapacityExhausted),
            "source_disabled" => Ok(DenyReason::SourceDisabled),
            "channel_disabled" => Ok(DenyReason::ChannelDisabled),
            "group_disabled" => Ok(DenyReason::GroupDisabled),
            other => Err(format!("unknown deny reason '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionDecision {
    Admitted,
    Denied(DenyReason),
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Found,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionState {
    Fetching,
    Filtering,
    Importing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionProgress {
    pub source_id: i64,
    pub source_name: String,
    pub state: IngestionState,
    pub current_step: String,
    pub entries_imported: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Result of a reconciliation trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Completed {
        entries: usize,
        created: usize,
        updated: usize,
        fetched: bool,
    },
    /// Another run for the same source was in flight; this trigger was coalesced
    AlreadyRunning,
}

/// Split operator text into trimmed non-empty lines
pub fn parse_operator_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_ref_parsing() {
        assert_eq!(
            GroupRef::parse("News@provider-a"),
            Some(GroupRef {
                group: "News".to_string(),
                source: "provider-a".to_string()
            })
        );
        assert_eq!(
            GroupRef::parse("a@b@src").map(|g| g.group),
            Some("a@b".to_string())
        );
        assert_eq!(GroupRef::parse("no-separator"), None);
        assert_eq!(GroupRef::parse("@src"), None);
    }

    #[test]
    fn test_filter_mode_accepts_letter_codes() {
        assert_eq!("P".parse::<FilterMode>().unwrap(), FilterMode::Prefix);
        assert_eq!("suffix".parse::<FilterMode>().unwrap(), FilterMode::Suffix);
        assert!("x".parse::<FilterMode>().is_err());
    }

    #[test]
    fn test_operator_lines_strip_carriage_returns() {
        assert_eq!(
            parse_operator_lines("News\r\n\r\n Sports \n"),
            vec!["News".to_string(), "Sports".to_string()]
        );
    }

    #[test]
    fn test_capacity() {
        let mut source = UpstreamSource {
            id: 1,
            name: "a".into(),
            location: "http://x".into(),
            is_local: false,
            group_exclusions: String::new(),
            user_agent: None,
            refresh_interval_hours: 24,
            last_reconciled_at: None,
            enabled: true,
            max_concurrent_streams: 0,
            active_stream_count: 10,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(source.has_capacity());
        source.max_concurrent_streams = 1;
        source.active_stream_count = 1;
        assert!(!source.has_capacity());
        assert!(source.is_due(Utc::now()));
    }
}

//! Wire enums shared by replication tasks and DLQ requests.
//!
//! Every enum is a closed set of named variants plus an `Unknown(code)`
//! variant, so a cluster running a newer version can send us a code we do not
//! know yet without breaking decoding. Serde goes through the numeric code;
//! text goes through `Display`/`FromStr`, which accept either the symbolic
//! name (any case) or the raw integer.

use crate::error::ReplError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

fn parse_code(enum_name: &'static str, text: &str) -> Result<i32, ReplError> {
    text.trim()
        .parse::<i32>()
        .map_err(|_| ReplError::UnknownEnumValue {
            enum_name,
            value: text.to_string(),
        })
}

/// Type of a replication task, selecting which payload it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ReplicationTaskType {
    /// Domain metadata replication.
    Domain,
    /// Legacy history replication (no longer produced).
    History,
    /// Shard liveness heartbeat.
    SyncShardStatus,
    /// Point-in-time activity state sync.
    SyncActivity,
    /// Legacy history metadata replication (no longer produced).
    HistoryMetadata,
    /// Versioned history replication.
    HistoryV2,
    /// Domain failover barrier.
    FailoverMarker,
    /// A code this build does not recognise.
    Unknown(i32),
}

impl ReplicationTaskType {
    /// Returns the numeric wire code.
    pub fn code(&self) -> i32 {
        match self {
            Self::Domain => 0,
            Self::History => 1,
            Self::SyncShardStatus => 2,
            Self::SyncActivity => 3,
            Self::HistoryMetadata => 4,
            Self::HistoryV2 => 5,
            Self::FailoverMarker => 6,
            Self::Unknown(code) => *code,
        }
    }

    /// Returns true if the code is not part of the known enumeration.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl From<i32> for ReplicationTaskType {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Domain,
            1 => Self::History,
            2 => Self::SyncShardStatus,
            3 => Self::SyncActivity,
            4 => Self::HistoryMetadata,
            5 => Self::HistoryV2,
            6 => Self::FailoverMarker,
            other => Self::Unknown(other),
        }
    }
}

impl From<ReplicationTaskType> for i32 {
    fn from(value: ReplicationTaskType) -> Self {
        value.code()
    }
}

impl fmt::Display for ReplicationTaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain => write!(f, "Domain"),
            Self::History => write!(f, "History"),
            Self::SyncShardStatus => write!(f, "SyncShardStatus"),
            Self::SyncActivity => write!(f, "SyncActivity"),
            Self::HistoryMetadata => write!(f, "HistoryMetadata"),
            Self::HistoryV2 => write!(f, "HistoryV2"),
            Self::FailoverMarker => write!(f, "FailoverMarker"),
            Self::Unknown(code) => write!(f, "{}", code),
        }
    }
}

impl FromStr for ReplicationTaskType {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DOMAIN" => Ok(Self::Domain),
            "HISTORY" => Ok(Self::History),
            "SYNCSHARDSTATUS" => Ok(Self::SyncShardStatus),
            "SYNCACTIVITY" => Ok(Self::SyncActivity),
            "HISTORYMETADATA" => Ok(Self::HistoryMetadata),
            "HISTORYV2" => Ok(Self::HistoryV2),
            "FAILOVERMARKER" => Ok(Self::FailoverMarker),
            _ => parse_code("ReplicationTaskType", s).map(Self::from),
        }
    }
}

/// Operation carried by a domain replication task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "i32", into = "i32")]
pub enum DomainOperation {
    /// Domain was created at the source.
    #[default]
    Create,
    /// Domain was updated at the source.
    Update,
    /// A code this build does not recognise.
    Unknown(i32),
}

impl DomainOperation {
    /// Returns the numeric wire code.
    pub fn code(&self) -> i32 {
        match self {
            Self::Create => 0,
            Self::Update => 1,
            Self::Unknown(code) => *code,
        }
    }
}

impl From<i32> for DomainOperation {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Create,
            1 => Self::Update,
            other => Self::Unknown(other),
        }
    }
}

impl From<DomainOperation> for i32 {
    fn from(value: DomainOperation) -> Self {
        value.code()
    }
}

impl fmt::Display for DomainOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "Create"),
            Self::Update => write!(f, "Update"),
            Self::Unknown(code) => write!(f, "{}", code),
        }
    }
}

impl FromStr for DomainOperation {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            _ => parse_code("DomainOperation", s).map(Self::from),
        }
    }
}

/// Which logical dead-letter queue an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(from = "i32", into = "i32")]
pub enum DlqType {
    /// Per-shard replication task queue.
    #[default]
    Replication,
    /// Global domain metadata queue.
    Domain,
    /// A code this build does not recognise.
    Unknown(i32),
}

impl DlqType {
    /// Returns the numeric wire code.
    pub fn code(&self) -> i32 {
        match self {
            Self::Replication => 0,
            Self::Domain => 1,
            Self::Unknown(code) => *code,
        }
    }
}

impl From<i32> for DlqType {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Replication,
            1 => Self::Domain,
            other => Self::Unknown(other),
        }
    }
}

impl From<DlqType> for i32 {
    fn from(value: DlqType) -> Self {
        value.code()
    }
}

impl fmt::Display for DlqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replication => write!(f, "Replication"),
            Self::Domain => write!(f, "Domain"),
            Self::Unknown(code) => write!(f, "{}", code),
        }
    }
}

impl FromStr for DlqType {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "REPLICATION" => Ok(Self::Replication),
            "DOMAIN" => Ok(Self::Domain),
            _ => parse_code("DLQType", s).map(Self::from),
        }
    }
}

/// Encoding of an opaque event blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "i32", into = "i32")]
pub enum EncodingType {
    /// Thrift binary encoding.
    #[default]
    ThriftRw,
    /// JSON encoding.
    Json,
    /// Protobuf encoding.
    Proto,
    /// A code this build does not recognise.
    Unknown(i32),
}

impl EncodingType {
    /// Returns the numeric wire code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ThriftRw => 0,
            Self::Json => 1,
            Self::Proto => 2,
            Self::Unknown(code) => *code,
        }
    }
}

impl From<i32> for EncodingType {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::ThriftRw,
            1 => Self::Json,
            2 => Self::Proto,
            other => Self::Unknown(other),
        }
    }
}

impl From<EncodingType> for i32 {
    fn from(value: EncodingType) -> Self {
        value.code()
    }
}

impl fmt::Display for EncodingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThriftRw => write!(f, "ThriftRW"),
            Self::Json => write!(f, "JSON"),
            Self::Proto => write!(f, "Proto"),
            Self::Unknown(code) => write!(f, "{}", code),
        }
    }
}

impl FromStr for EncodingType {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "THRIFTRW" => Ok(Self::ThriftRw),
            "JSON" => Ok(Self::Json),
            "PROTO" => Ok(Self::Proto),
            _ => parse_code("EncodingType", s).map(Self::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TASK_TYPES: [ReplicationTaskType; 7] = [
        ReplicationTaskType::Domain,
        ReplicationTaskType::History,
        ReplicationTaskType::SyncShardStatus,
        ReplicationTaskType::SyncActivity,
        ReplicationTaskType::HistoryMetadata,
        ReplicationTaskType::HistoryV2,
        ReplicationTaskType::FailoverMarker,
    ];

    mod task_type {
        use super::*;

        #[test]
        fn test_display_parse_roundtrip() {
            for t in ALL_TASK_TYPES {
                let parsed: ReplicationTaskType = t.to_string().parse().unwrap();
                assert_eq!(parsed, t);
            }
        }

        #[test]
        fn test_parse_is_case_insensitive() {
            assert_eq!(
                "historyv2".parse::<ReplicationTaskType>().unwrap(),
                ReplicationTaskType::HistoryV2
            );
            assert_eq!(
                "FAILOVERMARKER".parse::<ReplicationTaskType>().unwrap(),
                ReplicationTaskType::FailoverMarker
            );
            assert_eq!(
                "SyncShardStatus".parse::<ReplicationTaskType>().unwrap(),
                ReplicationTaskType::SyncShardStatus
            );
        }

        #[test]
        fn test_parse_known_integer() {
            assert_eq!(
                "3".parse::<ReplicationTaskType>().unwrap(),
                ReplicationTaskType::SyncActivity
            );
        }

        #[test]
        fn test_unknown_integer_roundtrip() {
            let parsed: ReplicationTaskType = "99".parse().unwrap();
            assert_eq!(parsed, ReplicationTaskType::Unknown(99));
            assert!(parsed.is_unknown());
            assert_eq!(parsed.to_string(), "99");
            assert_eq!(parsed.code(), 99);
        }

        #[test]
        fn test_garbage_is_rejected() {
            let err = "not-a-type".parse::<ReplicationTaskType>().unwrap_err();
            assert!(matches!(
                err,
                ReplError::UnknownEnumValue {
                    enum_name: "ReplicationTaskType",
                    ..
                }
            ));
        }

        #[test]
        fn test_codes_match_wire_values() {
            let codes: Vec<i32> = ALL_TASK_TYPES.iter().map(|t| t.code()).collect();
            assert_eq!(codes, vec![0, 1, 2, 3, 4, 5, 6]);
        }

        #[test]
        fn test_bincode_keeps_unknown_code() {
            let bytes = bincode::serialize(&ReplicationTaskType::Unknown(-7)).unwrap();
            let decoded: ReplicationTaskType = bincode::deserialize(&bytes).unwrap();
            assert_eq!(decoded, ReplicationTaskType::Unknown(-7));
        }
    }

    mod dlq_type {
        use super::*;

        #[test]
        fn test_roundtrip_and_case() {
            for t in [DlqType::Replication, DlqType::Domain] {
                assert_eq!(t.to_string().parse::<DlqType>().unwrap(), t);
                assert_eq!(t.to_string().to_lowercase().parse::<DlqType>().unwrap(), t);
            }
        }

        #[test]
        fn test_unknown_code() {
            let t: DlqType = "12".parse().unwrap();
            assert_eq!(t, DlqType::Unknown(12));
            assert_eq!(i32::from(t), 12);
        }

        #[test]
        fn test_json_uses_code() {
            let json = serde_json::to_string(&DlqType::Domain).unwrap();
            assert_eq!(json, "1");
            let back: DlqType = serde_json::from_str("5").unwrap();
            assert_eq!(back, DlqType::Unknown(5));
        }
    }

    mod domain_operation {
        use super::*;

        #[test]
        fn test_roundtrip() {
            for op in [DomainOperation::Create, DomainOperation::Update] {
                assert_eq!(op.to_string().parse::<DomainOperation>().unwrap(), op);
            }
            assert_eq!(
                "update".parse::<DomainOperation>().unwrap(),
                DomainOperation::Update
            );
        }

        #[test]
        fn test_default_is_create() {
            assert_eq!(DomainOperation::default(), DomainOperation::Create);
        }
    }

    mod encoding_type {
        use super::*;

        #[test]
        fn test_roundtrip() {
            for e in [
                EncodingType::ThriftRw,
                EncodingType::Json,
                EncodingType::Proto,
                EncodingType::Unknown(8),
            ] {
                assert_eq!(e.to_string().parse::<EncodingType>().unwrap(), e);
            }
        }

        #[test]
        fn test_proto_code() {
            assert_eq!(EncodingType::from(2), EncodingType::Proto);
            assert_eq!(EncodingType::Proto.code(), 2);
            assert_eq!("proto".parse::<EncodingType>().unwrap(), EncodingType::Proto);
            assert_eq!(EncodingType::from(3), EncodingType::Unknown(3));
        }
    }
}

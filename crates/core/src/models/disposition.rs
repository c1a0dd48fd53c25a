use std::fmt;

use serde::{Deserialize, Serialize};

/// 死信原因
///
/// 原因字符串是对外契约的一部分，运维和下游消费者依赖它区分根因，不得改写。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    ParsingFailed,
    IdentityTypeNotSupported,
    IdentityFormatMismatch,
    MultipleMatches,
    UnknownResolutionFault,
    NoMatch,
    ActionNotSupported,
    SaveFailed,
}

impl DeadLetterReason {
    pub const ALL: [DeadLetterReason; 8] = [
        DeadLetterReason::ParsingFailed,
        DeadLetterReason::IdentityTypeNotSupported,
        DeadLetterReason::IdentityFormatMismatch,
        DeadLetterReason::MultipleMatches,
        DeadLetterReason::UnknownResolutionFault,
        DeadLetterReason::NoMatch,
        DeadLetterReason::ActionNotSupported,
        DeadLetterReason::SaveFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::ParsingFailed => "Parsing failed",
            DeadLetterReason::IdentityTypeNotSupported => "Identity type not supported",
            DeadLetterReason::IdentityFormatMismatch => {
                "Failure to resolve identity (identity format mismatch)"
            }
            DeadLetterReason::MultipleMatches => {
                "Failure to uniquely resolve identity (multiple matches)"
            }
            DeadLetterReason::UnknownResolutionFault => {
                "Failure to resolve identity (unknown exception)"
            }
            DeadLetterReason::NoMatch => "Failure to resolve identity (no match)",
            DeadLetterReason::ActionNotSupported => "Action not supported",
            DeadLetterReason::SaveFailed => "Failed to save changes",
        }
    }

    /// 按契约字符串反查（用于检查死信队列中的消息）
    pub fn from_reason(reason: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == reason)
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条消息的终态处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    DeadLettered(DeadLetterReason),
}

impl Disposition {
    pub fn is_completed(&self) -> bool {
        matches!(self, Disposition::Completed)
    }

    pub fn dead_letter_reason(&self) -> Option<DeadLetterReason> {
        match self {
            Disposition::DeadLettered(reason) => Some(*reason),
            Disposition::Completed => None,
        }
    }
}

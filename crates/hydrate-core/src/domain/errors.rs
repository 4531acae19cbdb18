//! Errors - 失敗の分類と構造化エラー
//!
//! `last_error` は常に `<ERROR_CODE>::<human message>` の形で保存します。
//! 下流の監視・集計が自由文の文字列マッチに頼らなくて済むように、
//! 生のエラーメッセージからコードを推定する `infer_code` も提供します。

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Canonical failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Target entity or parent content does not exist.
    DependencyMissing,
    /// Generation output could not be parsed as the expected JSON.
    ParseFailed,
    /// Output parsed but violates the content contract.
    ValidationFailed,
    /// Output is a deferral / non-answer ("will be covered in a future class").
    PlaceholderContent,
    /// Generation call exceeded its hard timeout.
    Timeout,
    /// Network / backend transport failure.
    Transport,
    /// Handler reported success but no domain evidence was found.
    NoEvidence,
    /// No handler is registered for the job type.
    UnknownJobType,
    /// Delivery routing could not be resolved at submission.
    EnqueueUnresolvable,
    /// Root finalized with failed or cancelled descendants.
    DescendantsFailed,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::DependencyMissing => "DEPENDENCY_MISSING",
            ErrorCode::ParseFailed => "PARSE_FAILED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::PlaceholderContent => "PLACEHOLDER_CONTENT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Transport => "TRANSPORT",
            ErrorCode::NoEvidence => "NO_EVIDENCE",
            ErrorCode::UnknownJobType => "UNKNOWN_JOB_TYPE",
            ErrorCode::EnqueueUnresolvable => "ENQUEUE_UNRESOLVABLE",
            ErrorCode::DescendantsFailed => "DESCENDANTS_FAILED",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Transient failures may be resubmitted automatically up to `max_attempts`.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::Transport)
    }

    /// Output-contract failures (audited as VALIDATION_FAILED).
    pub fn is_validation(self) -> bool {
        matches!(
            self,
            ErrorCode::ParseFailed | ErrorCode::ValidationFailed | ErrorCode::PlaceholderContent
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [ErrorCode; 11] = [
            ErrorCode::DependencyMissing,
            ErrorCode::ParseFailed,
            ErrorCode::ValidationFailed,
            ErrorCode::PlaceholderContent,
            ErrorCode::Timeout,
            ErrorCode::Transport,
            ErrorCode::NoEvidence,
            ErrorCode::UnknownJobType,
            ErrorCode::EnqueueUnresolvable,
            ErrorCode::DescendantsFailed,
            ErrorCode::Unknown,
        ];
        ALL.into_iter().find(|c| c.as_str() == s).ok_or(())
    }
}

/// A job-level failure: what gets written to `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}::{message}")]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Classify a raw error message with `infer_code`.
    pub fn infer(raw: impl Into<String>) -> Self {
        let message = raw.into();
        Self {
            code: infer_code(&message),
            message,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Parse a stored `<CODE>::<message>`. Unstructured text is inferred.
    pub fn parse(stored: &str) -> Self {
        if let Some((code, message)) = stored.split_once("::")
            && let Ok(code) = code.parse::<ErrorCode>()
        {
            return Self::new(code, message);
        }
        Self::infer(stored)
    }
}

static DEPENDENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(not found|no such|missing (parent|chapter|topic|subject|notes?)|does not exist)\b")
        .expect("static pattern compiles")
});
static PARSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(json|parse|deserializ|expected value|eof while|trailing characters)")
        .expect("static pattern compiles")
});
static VALIDATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(validation|invalid|must (have|contain|be)|too (short|few|many)|placeholder)")
        .expect("static pattern compiles")
});
static TIMEOUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(timed? ?out|deadline exceeded|elapsed)")
        .expect("static pattern compiles")
});

/// Map raw error text to a canonical code.
///
/// Order matters: timeouts often mention parsing of a partial body, so they
/// are checked first.
pub fn infer_code(raw: &str) -> ErrorCode {
    if TIMEOUT.is_match(raw) {
        ErrorCode::Timeout
    } else if DEPENDENCY.is_match(raw) {
        ErrorCode::DependencyMissing
    } else if PARSE.is_match(raw) {
        ErrorCode::ParseFailed
    } else if VALIDATION.is_match(raw) {
        ErrorCode::ValidationFailed
    } else {
        ErrorCode::Unknown
    }
}

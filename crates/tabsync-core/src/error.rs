use thiserror::Error;

use crate::model::TabId;
use crate::sync_ipc::ErrorInfo;

pub const CODE_NOT_CONNECTED: &str = "not_connected";
pub const CODE_STALE_TARGET: &str = "stale_target";
pub const CODE_LAST_TAB: &str = "last_tab";
pub const CODE_VALIDATION: &str = "validation_error";
pub const CODE_ACK_TIMEOUT: &str = "ack_timeout";
pub const CODE_TRANSPORT: &str = "transport_error";
pub const CODE_REJECTED: &str = "rejected";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("target no longer exists: {target}")]
    StaleTarget { target: String },
    #[error("cannot delete the last project tab {tab_id}")]
    LastTab { tab_id: TabId },
    #[error("invalid mutation: {0}")]
    Validation(String),
    #[error("no ack within {timeout_ms}ms")]
    AckTimeout { timeout_ms: u64 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn stale(target: impl ToString) -> Self {
        Self::StaleTarget {
            target: target.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotConnected => CODE_NOT_CONNECTED,
            Self::StaleTarget { .. } => CODE_STALE_TARGET,
            Self::LastTab { .. } => CODE_LAST_TAB,
            Self::Validation(_) => CODE_VALIDATION,
            Self::AckTimeout { .. } => CODE_ACK_TIMEOUT,
            Self::Transport(_) => CODE_TRANSPORT,
            Self::Rejected { .. } => CODE_REJECTED,
        }
    }

    /// Only delivery failures are worth another attempt; anything the store
    /// decided will be decided the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::AckTimeout { .. } | Self::Transport(_)
        )
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        let target = match self {
            Self::StaleTarget { target } => Some(target.clone()),
            Self::LastTab { tab_id } => Some(tab_id.to_string()),
            _ => None,
        };
        let message = match self {
            Self::Validation(message) | Self::Transport(message) => message.clone(),
            Self::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorInfo {
            code: self.code().to_string(),
            message,
            target,
        }
    }

    pub fn from_error_info(info: ErrorInfo) -> Self {
        match info.code.as_str() {
            CODE_NOT_CONNECTED => Self::NotConnected,
            CODE_STALE_TARGET => Self::StaleTarget {
                target: info.target.unwrap_or(info.message),
            },
            CODE_LAST_TAB => Self::LastTab {
                tab_id: TabId::new(info.target.unwrap_or(info.message)),
            },
            CODE_VALIDATION => Self::Validation(info.message),
            CODE_TRANSPORT => Self::Transport(info.message),
            _ => Self::Rejected {
                code: info.code,
                message: info.message,
            },
        }
    }
}

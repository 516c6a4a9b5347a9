//! Error types for dockhand
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// dockhand 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // ========================================================================
    // 저장소 관련
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // 외부 명령 실행
    // ========================================================================
    #[error("Command failed: {program} - {message}")]
    Command { program: String, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    // ========================================================================
    // 리소스 수명 관리
    // ========================================================================
    #[error("Failed to create {kind} for {key}: {message}")]
    Creation {
        kind: String,
        key: String,
        message: String,
    },

    #[error("Context setup failed for {key} at {step}: {message}")]
    Setup {
        key: String,
        step: String,
        message: String,
    },

    // ========================================================================
    // 자격 증명
    // ========================================================================
    #[error("Credential error: {id} - {message}")]
    Credential { id: String, message: String },

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// 사용자에게 보여줄 수 있는 에러인지 확인
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::InvalidInput(_)
                | Error::Creation { .. }
                | Error::Credential { .. }
                | Error::Setup { .. }
        )
    }

    /// 명령 실행 에러 생성 헬퍼
    pub fn command(program: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Command {
            program: program.into(),
            message: message.into(),
        }
    }

    /// 리소스 생성 에러 생성 헬퍼
    pub fn creation(
        kind: impl Into<String>,
        key: impl std::fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Error::Creation {
            kind: kind.into(),
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// 컨텍스트 설정 에러 생성 헬퍼
    pub fn setup(
        key: impl std::fmt::Display,
        step: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Error::Setup {
            key: key.to_string(),
            step: step.into(),
            message: message.to_string(),
        }
    }

    /// 자격 증명 에러 생성 헬퍼
    pub fn credential(id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Credential {
            id: id.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

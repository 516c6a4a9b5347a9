//! Storage module for dockhand
//!
//! - `json`: JSON - 설정, 환경 카탈로그, 자격 증명 파일 저장/로드

mod json;

pub use json::JsonStore;

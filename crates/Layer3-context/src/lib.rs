//! dockhand-context: 복합 실행 컨텍스트
//!
//! Layer3 - 컨테이너 + ssh-agent + 체크아웃 + 비밀 파일을 하나의 수명 단위로 묶는다
//!
//! # 주요 모듈
//!
//! - `context`: (node, project, version) 단위 컨텍스트와 관리자
//! - `scope`: 역순 해제 스택 (롤백 / 정리)
//! - `checkout`: 컨테이너 내부 git clone-or-fetch
//! - `secrets`: 작업 단위 vault 비밀 파일
//! - `files`: stdin 기반 파일 쓰기
//! - `ansible`: Ansible 명령 직렬화와 `ansible.cfg`
//!
//! # 사용 예시
//!
//! ```ignore
//! use dockhand_context::{AnsibleCommand, CheckoutRequest, ContextManager, ContextRequest};
//!
//! let contexts = ContextManager::new(pools, credentials);
//! let request = ContextRequest::new(node, "infra", CheckoutRequest::new(repo_url, "v1.4.0"));
//! let environment = catalog.get("production")?.clone();
//!
//! let outcome = contexts
//!     .with_context(&request, |context| async move {
//!         context
//!             .with_environment(&environment, |op| async move {
//!                 op.run(&AnsibleCommand::playbook("site.yml")).await
//!             })
//!             .await
//!     })
//!     .await?;
//! ```

pub mod ansible;
pub mod checkout;
pub mod context;
pub mod files;
pub mod scope;
pub mod secrets;

// Re-exports: Context
pub use context::{
    ContextKey, ContextLifecycle, ContextManager, ContextRequest, ExecutionContext, Operation,
};
pub use scope::ReleaseStack;

// Re-exports: Steps
pub use ansible::{AnsibleCommand, AnsibleConfig, Invocation, StepOutcome, ANSIBLE_CONFIG_FILE};
pub use checkout::{working_dir, CheckoutOutcome, CheckoutRequest, Git};
pub use secrets::{SecretFile, SecretFiles, SECRETS_DIR};

//! Scoped release stack
//!
//! Setup code pushes one release step per acquired sub-resource. Unwinding
//! runs the steps in reverse push order and always runs all of them; a step
//! logs its own failures. A stack dropped with steps still pending (cancelled
//! task, panic) unwinds them on a spawned task.

use futures::future::BoxFuture;
use std::future::Future;
use tracing::{debug, warn};

type Step = (&'static str, BoxFuture<'static, ()>);

/// LIFO list of pending release steps
pub struct ReleaseStack {
    scope: String,
    steps: Vec<Step>,
}

impl ReleaseStack {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            steps: Vec::new(),
        }
    }

    /// Register a release step. It does not run until [`unwind`](Self::unwind).
    pub fn push<F>(&mut self, label: &'static str, release: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.steps.push((label, Box::pin(release)));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Labels in the order they will be released
    pub fn pending(&self) -> Vec<&'static str> {
        self.steps.iter().rev().map(|(label, _)| *label).collect()
    }

    /// Run every step, newest first. The steps run on their own task, so
    /// dropping this future part way still completes them.
    pub async fn unwind(mut self) {
        let (scope, steps) = (self.scope.clone(), std::mem::take(&mut self.steps));
        if let Err(e) = tokio::spawn(run_steps(scope, steps)).await {
            warn!("[{}] release task failed: {}", self.scope, e);
        }
    }

    /// Drop every step without running it; ownership moved elsewhere
    pub fn dismiss(mut self) {
        debug!("[{}] setup complete, {} release step(s) handed over", self.scope, self.steps.len());
        self.steps.clear();
    }
}

impl Drop for ReleaseStack {
    fn drop(&mut self) {
        if self.steps.is_empty() {
            return;
        }
        let (scope, steps) = (self.scope.clone(), std::mem::take(&mut self.steps));
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("[{}] abandoned with {} release step(s) pending, unwinding in background", scope, steps.len());
                runtime.spawn(run_steps(scope, steps));
            }
            Err(_) => warn!("[{}] abandoned outside a runtime, {} release step(s) skipped", scope, steps.len()),
        }
    }
}

async fn run_steps(scope: String, mut steps: Vec<Step>) {
    while let Some((label, release)) = steps.pop() {
        debug!("[{}] releasing {}", scope, label);
        release.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unwind_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ReleaseStack::new("test");
        for label in ["agent", "container", "secrets"] {
            let order = Arc::clone(&order);
            stack.push(label, async move { order.lock().push(label) });
        }

        assert_eq!(stack.pending(), vec!["secrets", "container", "agent"]);
        stack.unwind().await;
        assert_eq!(*order.lock(), vec!["secrets", "container", "agent"]);
    }

    #[tokio::test]
    async fn test_steps_do_not_run_until_unwind() {
        let ran = Arc::new(Mutex::new(false));
        let mut stack = ReleaseStack::new("test");
        {
            let ran = Arc::clone(&ran);
            stack.push("flag", async move { *ran.lock() = true });
        }
        tokio::task::yield_now().await;
        assert!(!*ran.lock());
        stack.unwind().await;
        assert!(*ran.lock());
    }

    #[tokio::test]
    async fn test_dropped_stack_unwinds_in_background() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ReleaseStack::new("test");
        for label in ["keys", "files"] {
            let order = Arc::clone(&order);
            stack.push(label, async move { order.lock().push(label) });
        }

        drop(stack);
        for _ in 0..100 {
            if order.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(*order.lock(), vec!["files", "keys"]);
    }

    #[tokio::test]
    async fn test_dismiss_runs_nothing() {
        let ran = Arc::new(Mutex::new(false));
        let mut stack = ReleaseStack::new("test");
        {
            let ran = Arc::clone(&ran);
            stack.push("flag", async move { *ran.lock() = true });
        }
        stack.dismiss();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!*ran.lock());
    }
}

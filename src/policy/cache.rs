use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::sync::{Mutex, PoisonError};

use super::PolicyError;
use crate::resources::ResourceMetadata;

type SharedDecision = Shared<BoxFuture<'static, Result<bool, PolicyError>>>;

/// Identity of one decision: the policy plus its fully resolved arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyCacheKey {
    pub policy: ResourceMetadata,
    pub args: Option<Value>,
}

/// Per-request memo of policy decisions, compared by deep equality.
///
/// The future is stored before it is first polled, so concurrent callers with an
/// equal key await one evaluation.
#[derive(Default)]
pub struct PolicyResultCache {
    entries: Mutex<Vec<(PolicyCacheKey, SharedDecision)>>,
}

impl PolicyResultCache {
    pub async fn get_or_evaluate<F>(&self, key: PolicyCacheKey, evaluate: F) -> Result<bool, PolicyError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<bool, PolicyError>>,
    {
        let decision = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            match entries.iter().find(|(existing, _)| *existing == key) {
                Some((_, decision)) => decision.clone(),
                None => {
                    let decision = evaluate().shared();
                    entries.push((key, decision.clone()));
                    decision
                }
            }
        };
        decision.await
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use nodeflow::condition::Evaluation;
use nodeflow::mutate::{MutationRequest, ParamMutator, PatchFuture};
use nodeflow::types::Params;

/// A recorded mutation request.
#[derive(Debug, Clone)]
pub struct MutationCall {
    pub node_id: String,
    pub error: String,
    pub base_params: Params,
}

/// A fake mutator that hands out scripted suggestions in order and records
/// what it was asked. Once the script runs out it suggests nothing.
#[derive(Clone, Default)]
pub struct FakeMutator {
    suggestions: Arc<Mutex<VecDeque<Evaluation<Params>>>>,
    calls: Arc<Mutex<Vec<MutationCall>>>,
}

impl FakeMutator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suggest(self, suggestion: Evaluation<Params>) -> Self {
        self.suggestions.lock().unwrap().push_back(suggestion);
        self
    }

    pub fn calls(&self) -> Vec<MutationCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl ParamMutator for FakeMutator {
    fn suggest_patch<'a>(&'a self, request: MutationRequest<'a>) -> PatchFuture<'a> {
        self.calls.lock().unwrap().push(MutationCall {
            node_id: request.node_id.to_string(),
            error: request.error.to_string(),
            base_params: request.base_params.clone(),
        });
        let next = self
            .suggestions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Evaluation::Ok(Params::new()));
        Box::pin(async move { next })
    }
}

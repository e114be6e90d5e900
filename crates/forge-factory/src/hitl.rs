//! Human-in-the-loop gate.
//!
//! Requests return immediately; answers arrive through [`HumanGate::resolve`]
//! from another caller. Deadlines are checked lazily whenever an entry is
//! polled or resolved, so an unanswered question never blocks anything.

use crate::FactoryError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Modify,
    Reject,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Modify => "modify",
            Self::Reject => "reject",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Value>,
}

impl Resolution {
    pub fn approve() -> Self {
        Self {
            decision: Decision::Approve,
            clarification: None,
        }
    }

    pub fn modify(clarification: Value) -> Self {
        Self {
            decision: Decision::Modify,
            clarification: Some(clarification),
        }
    }

    pub fn reject() -> Self {
        Self {
            decision: Decision::Reject,
            clarification: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PollState {
    Pending,
    Resolved(Resolution),
    Expired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveOutcome {
    Accepted,
    /// Already resolved, expired, or withdrawn; the resolution had no effect.
    Ignored,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingInputInfo {
    pub id: String,
    pub run_id: String,
    pub stage: String,
    pub question: Value,
    pub remaining_ms: u64,
}

#[derive(Clone, Debug)]
enum EntryState {
    Pending,
    Resolved(Resolution),
    Expired,
}

#[derive(Clone, Debug)]
struct Entry {
    run_id: String,
    stage: String,
    question: Value,
    deadline: Instant,
    state: EntryState,
}

impl Entry {
    fn expire_if_due(&mut self, now: Instant) {
        if matches!(self.state, EntryState::Pending) && now >= self.deadline {
            self.state = EntryState::Expired;
        }
    }

    fn poll_state(&self) -> PollState {
        match &self.state {
            EntryState::Pending => PollState::Pending,
            EntryState::Resolved(resolution) => PollState::Resolved(resolution.clone()),
            EntryState::Expired => PollState::Expired,
        }
    }
}

const RETIRED_CAPACITY: usize = 4096;

/// Open entries plus the ids of settled ones that were dropped. Resolving a
/// retired id is a no-op rather than an unknown-id error.
#[derive(Debug, Default)]
struct GateTable {
    open: HashMap<String, Entry>,
    retired: HashSet<String>,
    retired_order: VecDeque<String>,
}

impl GateTable {
    fn retire(&mut self, id: &str) {
        if self.open.remove(id).is_none() || !self.retired.insert(id.to_string()) {
            return;
        }
        self.retired_order.push_back(id.to_string());
        while self.retired_order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut Entry, FactoryError> {
        self.open
            .get_mut(id)
            .ok_or_else(|| FactoryError::UnknownPendingInput(id.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct HumanGate {
    table: Mutex<GateTable>,
}

impl HumanGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_input(
        &self,
        run_id: &str,
        stage: &str,
        question: Value,
        deadline: Duration,
    ) -> Result<String, FactoryError> {
        let id = uuid::Uuid::new_v4().to_string();
        let entry = Entry {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            question,
            deadline: Instant::now() + deadline,
            state: EntryState::Pending,
        };
        self.lock()?.open.insert(id.clone(), entry);
        tracing::info!(run_id, stage, pending_id = %id, deadline_ms = deadline.as_millis() as u64, "human input requested");
        Ok(id)
    }

    pub fn resolve(&self, id: &str, resolution: Resolution) -> Result<ResolveOutcome, FactoryError> {
        let mut table = self.lock()?;
        if table.retired.contains(id) {
            tracing::debug!(pending_id = id, "resolution for a settled input ignored");
            return Ok(ResolveOutcome::Ignored);
        }
        let entry = table.entry_mut(id)?;
        entry.expire_if_due(Instant::now());
        if !matches!(entry.state, EntryState::Pending) {
            tracing::debug!(pending_id = id, state = ?entry.state, "late resolution ignored");
            return Ok(ResolveOutcome::Ignored);
        }
        tracing::info!(
            run_id = %entry.run_id,
            stage = %entry.stage,
            pending_id = id,
            decision = resolution.decision.as_str(),
            "human input resolved"
        );
        entry.state = EntryState::Resolved(resolution);
        Ok(ResolveOutcome::Accepted)
    }

    /// Current state without consuming it.
    pub fn poll(&self, id: &str) -> Result<PollState, FactoryError> {
        let mut table = self.lock()?;
        let entry = table.entry_mut(id)?;
        entry.expire_if_due(Instant::now());
        Ok(entry.poll_state())
    }

    /// Like [`HumanGate::poll`], but a resolved or expired entry is removed
    /// once returned. The engine calls this when it applies the outcome.
    pub fn take(&self, id: &str) -> Result<PollState, FactoryError> {
        let mut table = self.lock()?;
        let entry = table.entry_mut(id)?;
        entry.expire_if_due(Instant::now());
        let state = entry.poll_state();
        if state != PollState::Pending {
            table.retire(id);
        }
        Ok(state)
    }

    /// Drops an entry without a decision; later resolutions are ignored.
    pub fn withdraw(&self, id: &str) -> Result<(), FactoryError> {
        self.lock()?.retire(id);
        Ok(())
    }

    pub fn run_of(&self, id: &str) -> Result<Option<String>, FactoryError> {
        Ok(self.lock()?.open.get(id).map(|entry| entry.run_id.clone()))
    }

    pub fn info(&self, id: &str) -> Result<Option<PendingInputInfo>, FactoryError> {
        let now = Instant::now();
        Ok(self.lock()?.open.get(id).map(|entry| PendingInputInfo {
            id: id.to_string(),
            run_id: entry.run_id.clone(),
            stage: entry.stage.clone(),
            question: entry.question.clone(),
            remaining_ms: entry.deadline.saturating_duration_since(now).as_millis() as u64,
        }))
    }

    pub fn open_count(&self) -> Result<usize, FactoryError> {
        Ok(self.lock()?.open.len())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, GateTable>, FactoryError> {
        self.table
            .lock()
            .map_err(|_| FactoryError::Runtime("human gate lock poisoned".to_string()))
    }
}

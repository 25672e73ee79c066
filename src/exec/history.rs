//! Result retention and execution statistics.

use crate::config::types::ConnectionId;
use crate::exec::request::CommandResult;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Aggregate statistics over retained results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandHistory {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub average_execution_ms: f64,
    pub by_command: BTreeMap<String, usize>,
    pub by_exit_code: BTreeMap<i32, usize>,
}

/// Results keyed by request id, evicted oldest-completed first
#[derive(Debug)]
pub struct ResultStore {
    results: HashMap<String, CommandResult>,
    max_size: usize,
    eviction_slack: usize,
}

impl ResultStore {
    pub fn new(max_size: usize, eviction_slack: usize) -> Self {
        Self {
            results: HashMap::new(),
            max_size: max_size.max(1),
            eviction_slack,
        }
    }

    /// Store `result`; once over capacity, evict the overage plus the slack
    /// so eviction does not run on every insert
    pub fn insert(&mut self, result: CommandResult) -> usize {
        self.results.insert(result.request_id.clone(), result);
        if self.results.len() <= self.max_size {
            return 0;
        }

        let overage = self.results.len() - self.max_size;
        // Never evict below half the capacity
        let evict = (overage + self.eviction_slack).min(self.results.len() - self.max_size / 2);
        let mut by_age: Vec<(std::time::SystemTime, String)> = self
            .results
            .values()
            .map(|r| (r.end_time, r.request_id.clone()))
            .collect();
        by_age.sort();
        for (_, id) in by_age.into_iter().take(evict) {
            self.results.remove(&id);
        }
        debug!("Evicted {} stored command results", evict);
        evict
    }

    pub fn get(&self, request_id: &str) -> Option<&CommandResult> {
        self.results.get(request_id)
    }

    pub fn remove(&mut self, request_id: &str) -> Option<CommandResult> {
        self.results.remove(request_id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn clear(&mut self) {
        self.results.clear();
    }

    /// Results of one connection, oldest first
    pub fn for_connection(&self, conn: ConnectionId) -> Vec<CommandResult> {
        let mut results: Vec<CommandResult> = self
            .results
            .values()
            .filter(|r| r.connection_id == conn)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.end_time);
        results
    }

    /// Longest-running `n` results, slowest first
    pub fn slowest(&self, n: usize) -> Vec<CommandResult> {
        let mut results: Vec<&CommandResult> = self.results.values().collect();
        results.sort_by(|a, b| b.execution_time_ms.cmp(&a.execution_time_ms));
        results.into_iter().take(n).cloned().collect()
    }

    pub fn history(&self) -> CommandHistory {
        let mut history = CommandHistory {
            total: self.results.len(),
            ..CommandHistory::default()
        };
        let mut total_ms = 0u64;
        for result in self.results.values() {
            if result.success {
                history.succeeded += 1;
            } else {
                history.failed += 1;
            }
            total_ms += result.execution_time_ms;
            *history.by_command.entry(result.command.clone()).or_insert(0) += 1;
            *history.by_exit_code.entry(result.exit_code).or_insert(0) += 1;
        }
        if history.total > 0 {
            history.average_execution_ms = total_ms as f64 / history.total as f64;
        }
        history
    }
}

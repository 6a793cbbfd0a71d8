//! Durable snapshots of instance state.
//!
//! A snapshot is the serialized form of an [`ExecutionContext`], taken at a
//! stable or terminal point and indexed by state names rather than arena
//! ids, so it survives process restarts as long as the chart definition is
//! byte-identical. The chart checksum and a crc32c over the snapshot body
//! guard against mixing snapshots with changed definitions or truncated
//! files.

use crate::datamodel::{ExecutionContext, InvocationRecord, PendingTimer, Status};
use crate::error::CoreError;
use crate::event::Message;
use chrono::{DateTime, Utc};
use rscharts_model::{StateChart, StateId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

/// Bumped when the snapshot layout changes incompatibly.
pub const SNAPSHOT_FORMAT: u32 = 1;

/// Serialized instance state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub format: u32,
    pub chart_name: String,
    pub chart_version: u32,
    pub chart_checksum: u32,
    pub instance_id: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    /// Active state names in document order, root excluded.
    pub configuration: Vec<String>,
    pub data: Value,
    pub internal_queue: Vec<Message>,
    /// History state name to the state names it recorded.
    pub history: BTreeMap<String, Vec<String>>,
    /// Invocations that were running; re-issued on resume.
    pub invocations: Vec<InvocationRecord>,
    /// Timers with their absolute deadlines; re-armed on resume with the
    /// remaining delay.
    pub timers: Vec<PendingTimer>,
    pub done_data: Option<Value>,
    /// crc32c over the snapshot body, with this field zeroed.
    pub integrity: u32,
}

impl ExecutionSnapshot {
    /// Captures the context of a stable or terminal instance.
    pub fn capture(chart: &StateChart, ctx: &ExecutionContext) -> Self {
        let mut history: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (&id, recorded) in &ctx.history {
            history.insert(
                chart.state(id).name.clone(),
                recorded.iter().map(|&r| chart.state(r).name.clone()).collect(),
            );
        }

        let mut invocations: Vec<InvocationRecord> = ctx.invocations.values().cloned().collect();
        invocations.sort_by(|a, b| a.invoke_id.cmp(&b.invoke_id));

        let mut timers: Vec<PendingTimer> = ctx.timers.values().cloned().collect();
        timers.sort_by(|a, b| a.key.cmp(&b.key));

        let mut snapshot = Self {
            format: SNAPSHOT_FORMAT,
            chart_name: chart.name().to_string(),
            chart_version: chart.version(),
            chart_checksum: chart.checksum(),
            instance_id: ctx.instance_id.clone(),
            status: ctx.status,
            created_at: Utc::now(),
            configuration: ctx.configuration.names(chart),
            data: ctx.data.clone(),
            internal_queue: ctx.internal_queue.iter().cloned().collect(),
            history,
            invocations,
            timers,
            done_data: ctx.done_data.clone(),
            integrity: 0,
        };
        snapshot.seal();
        snapshot
    }

    /// Rebuilds an execution context against the same chart definition.
    pub fn restore(&self, chart: &StateChart) -> Result<ExecutionContext, CoreError> {
        if self.format != SNAPSHOT_FORMAT {
            return Err(CoreError::corrupt_snapshot(format!(
                "unsupported format {}",
                self.format
            )));
        }
        if self.integrity != self.body_crc() {
            return Err(CoreError::corrupt_snapshot("integrity check failed"));
        }
        if self.chart_checksum != chart.checksum() {
            return Err(CoreError::ChecksumMismatch {
                snapshot: self.chart_checksum,
                chart: chart.checksum(),
            });
        }
        if matches!(self.status, Status::NotStarted | Status::Running) {
            return Err(CoreError::corrupt_snapshot(format!(
                "captured while {}",
                self.status.as_str()
            )));
        }

        let mut configuration = crate::configuration::Configuration::new();
        if !self.configuration.is_empty() {
            configuration.insert(chart.root());
            for name in &self.configuration {
                configuration.insert(self.state_id(chart, name)?);
            }
        }
        // Only resumable snapshots must still satisfy the configuration
        // invariant; terminal ones are archival.
        if self.status == Status::WaitingForEvent {
            if let Err(reason) = configuration.check_legal(chart) {
                return Err(CoreError::corrupt_snapshot(reason));
            }
        }

        let mut history: HashMap<StateId, Vec<StateId>> = HashMap::new();
        for (name, recorded) in &self.history {
            let id = self.state_id(chart, name)?;
            let recorded = recorded
                .iter()
                .map(|r| self.state_id(chart, r))
                .collect::<Result<Vec<_>, _>>()?;
            history.insert(id, recorded);
        }

        Ok(ExecutionContext {
            instance_id: self.instance_id.clone(),
            chart_checksum: self.chart_checksum,
            status: self.status,
            data: self.data.clone(),
            configuration,
            internal_queue: VecDeque::from(self.internal_queue.clone()),
            history,
            invocations: self
                .invocations
                .iter()
                .map(|r| (r.invoke_id.clone(), r.clone()))
                .collect(),
            timers: self
                .timers
                .iter()
                .map(|t| (t.key.clone(), t.clone()))
                .collect(),
            done_data: self.done_data.clone(),
        })
    }

    /// Writes the snapshot as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Recomputes the integrity field from the body.
    pub(crate) fn seal(&mut self) {
        self.integrity = self.body_crc();
    }

    fn body_crc(&self) -> u32 {
        let mut body = self.clone();
        body.integrity = 0;
        // Field order is fixed by the struct and map keys are sorted, so
        // the serialization is stable.
        match serde_json::to_vec(&body) {
            Ok(bytes) => crc32c::crc32c(&bytes),
            Err(_) => 0,
        }
    }

    fn state_id(&self, chart: &StateChart, name: &str) -> Result<StateId, CoreError> {
        chart
            .state_by_name(name)
            .ok_or_else(|| CoreError::corrupt_snapshot(format!("unknown state '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::Configuration;
    use rscharts_model::ChartDocument;
    use serde_json::json;

    fn chart() -> StateChart {
        ChartDocument::from_json(
            r#"{"name": "order", "data": [{"id": "total", "value": 0}], "states": [
                {"type": "state", "id": "open", "initial": "draft", "states": [
                    {"type": "history", "id": "h", "kind": "shallow", "target": ["draft"]},
                    {"type": "state", "id": "draft"},
                    {"type": "state", "id": "review"}
                ]},
                {"type": "state", "id": "closed"}
            ]}"#,
        )
        .unwrap()
        .compile()
        .unwrap()
    }

    fn stable_ctx(chart: &StateChart) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(chart).with_instance_id("ord-1");
        ctx.status = Status::WaitingForEvent;
        ctx.data = json!({"total": 7});
        let mut config = Configuration::new();
        config.insert(chart.root());
        config.insert(chart.state_by_name("open").unwrap());
        config.insert(chart.state_by_name("review").unwrap());
        ctx.configuration = config;
        ctx.history.insert(
            chart.state_by_name("h").unwrap(),
            vec![chart.state_by_name("review").unwrap()],
        );
        ctx.internal_queue
            .push_back(Message::internal("pending", Value::Null));
        ctx.timers.insert(
            "send.1".to_string(),
            PendingTimer {
                key: "send.1".to_string(),
                message: Message::external("later", Value::Null).with_send_id("send.1"),
                deadline: Utc::now() + chrono::Duration::milliseconds(500),
                owner: None,
            },
        );
        ctx.invocations.insert(
            "job".to_string(),
            InvocationRecord {
                invoke_id: "job".to_string(),
                owner: "review".to_string(),
                child_instance_id: "ord-1.job".to_string(),
                started_at: Utc::now(),
            },
        );
        ctx
    }

    #[test]
    fn test_capture_restore_roundtrip() {
        let chart = chart();
        let ctx = stable_ctx(&chart);

        let snapshot = ExecutionSnapshot::capture(&chart, &ctx);
        assert_eq!(snapshot.configuration, vec!["open", "review"]);

        let restored = snapshot.restore(&chart).unwrap();
        assert_eq!(restored.instance_id, "ord-1");
        assert_eq!(restored.status, Status::WaitingForEvent);
        assert_eq!(restored.data, json!({"total": 7}));
        assert_eq!(restored.configuration, ctx.configuration);
        assert_eq!(restored.internal_queue.len(), 1);
        assert_eq!(
            restored.history.get(&chart.state_by_name("h").unwrap()),
            Some(&vec![chart.state_by_name("review").unwrap()])
        );
        assert!(restored.timers.contains_key("send.1"));
        assert_eq!(restored.invocations["job"].owner, "review");
    }

    #[test]
    fn test_serde_roundtrip_preserves_integrity() {
        let chart = chart();
        let snapshot = ExecutionSnapshot::capture(&chart, &stable_ctx(&chart));

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: ExecutionSnapshot = serde_json::from_str(&json).unwrap();
        assert!(parsed.restore(&chart).is_ok());
    }

    #[test]
    fn test_tampered_snapshot_rejected() {
        let chart = chart();
        let mut snapshot = ExecutionSnapshot::capture(&chart, &stable_ctx(&chart));
        snapshot.data = json!({"total": 9000});

        let err = snapshot.restore(&chart).unwrap_err();
        assert_eq!(err.error_code(), "CORRUPT_SNAPSHOT");
    }

    #[test]
    fn test_changed_chart_rejected() {
        let chart = chart();
        let snapshot = ExecutionSnapshot::capture(&chart, &stable_ctx(&chart));

        let other = ChartDocument::from_json(
            r#"{"name": "order", "states": [{"type": "state", "id": "open"}]}"#,
        )
        .unwrap()
        .compile()
        .unwrap();

        let err = snapshot.restore(&other).unwrap_err();
        assert_eq!(err.error_code(), "CHECKSUM_MISMATCH");
    }

    #[test]
    fn test_unknown_state_name_rejected() {
        let chart = chart();
        let mut snapshot = ExecutionSnapshot::capture(&chart, &stable_ctx(&chart));
        snapshot.configuration = vec!["open".to_string(), "ghost".to_string()];
        snapshot.seal();

        let err = snapshot.restore(&chart).unwrap_err();
        assert_eq!(err.error_code(), "CORRUPT_SNAPSHOT");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_illegal_configuration_rejected() {
        let chart = chart();
        let mut snapshot = ExecutionSnapshot::capture(&chart, &stable_ctx(&chart));
        // review without its parent.
        snapshot.configuration = vec!["review".to_string()];
        snapshot.seal();

        let err = snapshot.restore(&chart).unwrap_err();
        assert_eq!(err.error_code(), "CORRUPT_SNAPSHOT");
    }

    #[test]
    fn test_save_load_file() {
        let chart = chart();
        let snapshot = ExecutionSnapshot::capture(&chart, &stable_ctx(&chart));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ord-1.snapshot.json");
        snapshot.save(&path).unwrap();

        let loaded = ExecutionSnapshot::load(&path).unwrap();
        assert_eq!(loaded.instance_id, snapshot.instance_id);
        assert_eq!(loaded.integrity, snapshot.integrity);
        assert!(loaded.restore(&chart).is_ok());
    }

    #[test]
    fn test_terminal_snapshot_restores_without_legality_check() {
        let chart = chart();
        let mut ctx = stable_ctx(&chart);
        ctx.status = Status::Cancelled;
        ctx.configuration = Configuration::new();
        ctx.invocations.clear();
        ctx.timers.clear();

        let snapshot = ExecutionSnapshot::capture(&chart, &ctx);
        let restored = snapshot.restore(&chart).unwrap();
        assert_eq!(restored.status, Status::Cancelled);
        assert!(restored.configuration.is_empty());
    }
}

use orion_error::prelude::*;
use orion_error::ErrorOweBase;
use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::error::{CoreReason, CoreResult};
use crate::state::StateEntry;
use crate::time::Time;
use crate::value::Value;

/// Format version written into every record.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Point-in-time snapshot of a stream graph, taken between ticks.
///
/// Only data is stored. Functions come back by re-running the pipeline
/// recipe; `fingerprint` ties a record to the graph shape it was taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    /// Last tick whose work completed before the snapshot.
    pub time: Time,
    pub batch_duration_ms: u64,
    pub fingerprint: String,
    pub nodes: Vec<NodeSnapshot>,
    pub sources: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node: usize,
    pub op: String,
    /// Generated batches still inside the node's retention.
    pub history: Vec<BatchSnapshot>,
    /// Key state of a stateful node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Vec<(Value, StateEntry)>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub time: Time,
    pub partitions: Vec<Vec<Value>>,
}

impl BatchSnapshot {
    pub fn capture(time: Time, batch: &Batch) -> Self {
        Self {
            time,
            partitions: batch.partitions().to_vec(),
        }
    }

    pub fn into_batch(self) -> (Time, Batch) {
        (self.time, Batch::from_partitions(self.partitions))
    }
}

impl CheckpointRecord {
    pub fn to_json(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(self).owe(CoreReason::Recovery)
    }

    /// Parse and version-check a stored record.
    pub fn from_json(bytes: &[u8]) -> CoreResult<Self> {
        let record: CheckpointRecord = serde_json::from_slice(bytes)
            .owe(CoreReason::Recovery)
            .map_err(|e| e.with_detail("checkpoint record is not valid JSON"))?;
        if record.version != CHECKPOINT_VERSION {
            return StructError::from(CoreReason::Recovery)
                .with_detail(format!(
                    "unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
                    record.version
                ))
                .err();
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CheckpointRecord {
        CheckpointRecord {
            version: CHECKPOINT_VERSION,
            time: Time::from_millis(1500),
            batch_duration_ms: 500,
            fingerprint: "0:input(queue)".into(),
            nodes: vec![NodeSnapshot {
                node: 0,
                op: "update_state_by_key".into(),
                history: vec![BatchSnapshot::capture(
                    Time::from_millis(1500),
                    &Batch::single(Value::pair("a", 3)),
                )],
                state: Some(vec![(
                    Value::from("a"),
                    StateEntry {
                        value: Value::Int(3),
                        updated_at: Time::from_millis(1500),
                        last_input: Time::from_millis(1000),
                    },
                )]),
            }],
            sources: vec![serde_json::json!({ "consumed": 3 })],
        }
    }

    #[test]
    fn json_roundtrip_preserves_record() {
        let rec = record();
        let bytes = rec.to_json().unwrap();
        assert_eq!(CheckpointRecord::from_json(&bytes).unwrap(), rec);
    }

    #[test]
    fn rejects_garbage_and_unknown_versions() {
        assert!(CheckpointRecord::from_json(b"{not json").is_err());
        let mut rec = record();
        rec.version = 99;
        let bytes = rec.to_json().unwrap();
        assert!(CheckpointRecord::from_json(&bytes).is_err());
    }
}

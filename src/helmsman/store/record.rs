use crate::helmsman::op::{CommandSpec, Phase};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Running => "running",
            RecordStatus::Completed => "completed",
            RecordStatus::Cancelled => "cancelled",
            RecordStatus::Failed => "failed",
        }
    }
}

/// The persisted trail of one operation.
///
/// A record is created when the operation starts and mutated only by the
/// leader that created it; completion and failure are terminal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub operator_name: String,
    pub phase: Phase,
    pub targets: Vec<String>,
    #[serde(default)]
    pub command: CommandSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: RecordStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub leader_key: String,
}

impl Record {
    pub fn new(
        id: i64,
        operator_name: &str,
        phase: Phase,
        targets: Vec<String>,
        leader_key: &str,
    ) -> Self {
        Record {
            id,
            operator_name: operator_name.to_string(),
            phase,
            targets,
            command: CommandSpec::default(),
            error: None,
            status: RecordStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            leader_key: leader_key.to_string(),
        }
    }

    pub fn set_command(&mut self, command: CommandSpec) {
        self.command = command;
    }

    pub fn set_error(&mut self, err: &crate::helmsman::util::DynError) {
        self.error = Some(err.to_string());
        self.status = RecordStatus::Failed;
        self.finished_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = RecordStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = RecordStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, RecordStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helmsman::util::new_error;

    #[test]
    fn lifecycle_transitions_are_terminal() {
        let mut record = Record::new(
            7,
            "etcd-boot",
            Phase::EtcdBoot,
            vec!["10.0.0.1".to_string()],
            "leader/abc",
        );
        assert_eq!(record.status, RecordStatus::Running);
        assert!(!record.is_terminal());
        assert!(record.finished_at.is_none());

        record.set_command(CommandSpec::new("volume-create", "10.0.0.1", "etcd-helmsman"));
        assert_eq!(record.command.name, "volume-create");

        record.complete();
        assert!(record.is_terminal());
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn failure_captures_error_text() {
        let mut record = Record::new(8, "rivers", Phase::Rivers, Vec::new(), "leader/abc");
        let err = new_error("docker run failed");
        record.set_error(&err);
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("docker run failed"));
        assert!(record.is_terminal());
    }

    #[test]
    fn records_round_trip_through_json() {
        let record = Record::new(9, "upgrade", Phase::Upgrade, Vec::new(), "leader/abc");
        let raw = serde_json::to_string(&record).expect("encode");
        let decoded: Record = serde_json::from_str(&raw).expect("decode");
        assert_eq!(decoded, record);
    }
}

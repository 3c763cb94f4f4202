//! Control channel messages between the backfill master and its workers

use serde::{Deserialize, Serialize};

/// Identifies one worker slot; a replacement worker reuses the slot
pub type WorkerId = usize;

/// Worker to master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToMaster {
    /// Sent once when a worker is ready for jobs
    Alive { pid: WorkerId },
    Finished { pid: WorkerId, account_id: i64 },
    /// Raised by the supervisor when a worker task ends
    Exited { pid: WorkerId },
}

/// Master to worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToWorker {
    Analyze { account_id: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let alive = serde_json::to_value(ToMaster::Alive { pid: 3 }).unwrap();
        assert_eq!(alive, serde_json::json!({ "type": "alive", "pid": 3 }));

        let job: ToWorker = serde_json::from_str(r#"{"type":"analyze","account_id":42}"#).unwrap();
        assert_eq!(job, ToWorker::Analyze { account_id: 42 });
    }
}

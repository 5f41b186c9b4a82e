//! Messages produced by the employee.

use crate::meta::Meta;
use crate::names;

/// A typed employee → boss message.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    /// Identifies the job descriptor this employee was started for.
    Info { qdesc: String },
    /// An assignment was accepted.
    Processing,
    /// Profiling statistics; precedes `Finished` when profiling was requested.
    Profile { stats: Vec<u8> },
    /// The single outcome of a job: a serialized result, or a traceback.
    Finished {
        runtime: f64,
        traceback: bool,
        payload: Vec<u8>,
    },
    /// Reply to a boss heartbeat.
    Heartbeat { seq: Option<u64> },
}

impl Report {
    pub fn success(runtime: f64, result: Vec<u8>) -> Self {
        Self::Finished {
            runtime,
            traceback: false,
            payload: result,
        }
    }

    pub fn failure(runtime: f64, traceback: impl Into<String>) -> Self {
        Self::Finished {
            runtime,
            traceback: true,
            payload: traceback.into().into_bytes(),
        }
    }

    /// Split into the meta and payload to hand to the transport.
    pub fn into_parts(self) -> (Meta, Vec<u8>) {
        match self {
            Self::Info { qdesc } => (Meta::typed(names::INFO).with("qdesc", qdesc), Vec::new()),
            Self::Processing => (Meta::typed(names::PROCESSING), Vec::new()),
            Self::Profile { stats } => (Meta::typed(names::PROFILE), stats),
            Self::Finished {
                runtime,
                traceback,
                payload,
            } => {
                let mut meta = Meta::typed(names::FINISHED).with("runtime", runtime);
                if traceback {
                    meta.insert("traceback", true);
                }
                (meta, payload)
            }
            Self::Heartbeat { seq } => {
                let mut meta = Meta::typed(names::HEARTBEAT);
                if let Some(seq) = seq {
                    meta.insert("seq", seq);
                }
                (meta, Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_success_has_no_traceback_flag() {
        let (meta, payload) = Report::success(0.5, b"[1,2]".to_vec()).into_parts();
        assert_eq!(meta.kind(), Some(names::FINISHED));
        assert_eq!(meta.get("runtime"), Some(&Value::from(0.5)));
        assert!(!meta.contains_key("traceback"));
        assert_eq!(payload, b"[1,2]");
    }

    #[test]
    fn test_failure_sets_traceback_flag() {
        let (meta, payload) = Report::failure(1.0, "boom").into_parts();
        assert_eq!(meta.get("traceback"), Some(&Value::Bool(true)));
        assert_eq!(payload, b"boom");
    }

    #[test]
    fn test_info_carries_qdesc() {
        let (meta, payload) = Report::Info { qdesc: "q-17".into() }.into_parts();
        assert_eq!(meta.kind(), Some(names::INFO));
        assert_eq!(meta.get("qdesc"), Some(&Value::from("q-17")));
        assert!(payload.is_empty());
    }

    #[test]
    fn test_heartbeat_echoes_seq() {
        let (meta, _) = Report::Heartbeat { seq: Some(9) }.into_parts();
        assert_eq!(meta.get("seq"), Some(&Value::from(9)));
    }
}

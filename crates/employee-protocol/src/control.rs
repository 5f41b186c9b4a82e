//! Control messages sent by the boss.
//!
//! [`ControlMessage`] is a closed set. Types this version does not know
//! become [`ControlMessage::Unknown`] so a newer boss can add messages
//! without breaking older employees.

use std::os::fd::OwnedFd;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::decoder::Message;
use crate::error::{ProtocolError, ProtocolResult};
use crate::names;

/// A typed boss → employee message.
#[derive(Debug)]
pub enum ControlMessage {
    Info { qdesc: Option<String> },
    Setup(Setup),
    Stdout(OwnedFd),
    Stderr(OwnedFd),
    Logging(OwnedFd),
    FaultHandler(OwnedFd),
    Pilog(OwnedFd),
    Assign(Box<AssignMessage>),
    Die,
    Unknown(String),
}

/// First message after `info`: where the employee's own log goes.
#[derive(Debug)]
pub struct Setup {
    pub log: OwnedFd,
    pub hostname: Option<String>,
}

/// An `assign` message: the job description plus its raw payload.
#[derive(Debug)]
pub struct AssignMessage {
    pub assignment: Assignment,
    pub payload: Vec<u8>,
}

impl ControlMessage {
    /// Name of the message type, for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Info { .. } => names::INFO,
            Self::Setup(_) => names::SETUP,
            Self::Stdout(_) => names::STDOUT,
            Self::Stderr(_) => names::STDERR,
            Self::Logging(_) => names::LOGGING,
            Self::FaultHandler(_) => names::FAULTHANDLER,
            Self::Pilog(_) => names::PILOG,
            Self::Assign(_) => names::ASSIGN,
            Self::Die => names::DIE,
            Self::Unknown(kind) => kind.as_str(),
        }
    }
}

impl TryFrom<Message> for ControlMessage {
    type Error = ProtocolError;

    fn try_from(message: Message) -> ProtocolResult<Self> {
        let kind = message.kind().to_string();
        let Message {
            meta,
            payload,
            descriptor,
        } = message;

        let descriptor_for = |descriptor: Option<OwnedFd>| {
            descriptor.ok_or_else(|| ProtocolError::MissingDescriptor { kind: kind.clone() })
        };

        let parsed = match kind.as_str() {
            names::INFO => Self::Info {
                qdesc: meta.get("qdesc").and_then(Value::as_str).map(String::from),
            },
            names::SETUP => Self::Setup(Setup {
                log: descriptor_for(descriptor)?,
                hostname: meta.get("hostname").and_then(Value::as_str).map(String::from),
            }),
            names::STDOUT => Self::Stdout(descriptor_for(descriptor)?),
            names::STDERR => Self::Stderr(descriptor_for(descriptor)?),
            names::LOGGING => Self::Logging(descriptor_for(descriptor)?),
            names::FAULTHANDLER => Self::FaultHandler(descriptor_for(descriptor)?),
            names::PILOG => Self::Pilog(descriptor_for(descriptor)?),
            names::ASSIGN => {
                let assignment: Assignment = serde_json::from_value(meta.into_value())
                    .map_err(|e| ProtocolError::invalid_message(names::ASSIGN, e.to_string()))?;
                Self::Assign(Box::new(AssignMessage {
                    assignment,
                    payload,
                }))
            }
            names::DIE => Self::Die,
            _ => Self::Unknown(kind.clone()),
        };
        Ok(parsed)
    }
}

/// Job phase selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    #[default]
    #[serde(rename = "", alias = "plain")]
    Plain,
    /// Map-combine phase of a distributed batch job.
    #[serde(rename = "filemap_mapper")]
    Map,
    /// Reduce phase of a distributed batch job.
    #[serde(rename = "filemap_reducer")]
    Reduce,
}

/// Job-owner credentials forwarded to the execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(deserialize_with = "string_or_number")]
    pub api_key: String,
    pub api_secretkey: String,
    pub server_url: String,
}

/// The job description carried by an `assign` meta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub jid: u64,
    /// Parent job, when this job was spawned by another one.
    #[serde(default)]
    pub ujid: Option<u64>,
    #[serde(default = "default_core_type")]
    pub core_type: String,
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// Byte lengths of the callable and positional-args ranges. Keyword
    /// args take the rest of the payload.
    pub payload_parts: Vec<usize>,
    #[serde(default)]
    pub job_type: Option<JobKind>,
    #[serde(default)]
    pub profile: bool,
    #[serde(default)]
    pub fast_serialization: u8,
    #[serde(flatten)]
    pub credentials: Credentials,
}

/// The three byte ranges of an assignment payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadParts<'a> {
    pub callable: &'a [u8],
    pub args: &'a [u8],
    pub kwargs: &'a [u8],
}

impl Assignment {
    pub fn job_kind(&self) -> JobKind {
        self.job_type.unwrap_or_default()
    }

    /// Split the payload along the declared boundaries.
    pub fn split_payload<'a>(&self, payload: &'a [u8]) -> ProtocolResult<PayloadParts<'a>> {
        let [callable_len, args_len] = self.payload_parts[..] else {
            return Err(ProtocolError::invalid_message(
                names::ASSIGN,
                format!("payload_parts must have 2 entries, got {}", self.payload_parts.len()),
            ));
        };

        let args_end = callable_len
            .checked_add(args_len)
            .filter(|end| *end <= payload.len())
            .ok_or_else(|| {
                ProtocolError::invalid_message(
                    names::ASSIGN,
                    format!(
                        "payload_parts {:?} exceed payload length {}",
                        self.payload_parts,
                        payload.len()
                    ),
                )
            })?;

        Ok(PayloadParts {
            callable: &payload[..callable_len],
            args: &payload[callable_len..args_end],
            kwargs: &payload[args_end..],
        })
    }
}

fn default_core_type() -> String {
    "c1".to_string()
}

fn default_cores() -> u32 {
    1
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

//! Wire-facing request/response surface and endpoint URL conventions.
//!
//! The transport itself (TCP/RDMA channels) lives outside this crate; these
//! are the payload types any transport carries, plus the verb codes shared
//! with the external collaborators.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::TimestampBatch;

/// Internal verbs spoken to the consensus store and the time authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum InternalVerb {
    GetPaxosLeaderUrl = 110,
    UpdatePaxos = 111,
    AckPaxos = 112,
    GetAtomicClockTime = 115,
    GetGpsClockTime = 116,
    AckTime = 117,
}

impl InternalVerb {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Client-facing request payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Ask any core for the cluster's master URL.
    GetTsoMasterUrl,
    /// Ask the controller for every worker's endpoint URLs.
    GetTsoWorkersUrls,
    /// Ask a worker for a timestamp batch.
    GetTimestampBatch { batch_size: u16 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    MasterUrl { url: String },
    NotMaster { master_url: Option<String> },
    WorkersUrls { urls: Vec<Vec<String>> },
    Batch { batch: TimestampBatch },
    Error { error: ErrorPayload },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotReady,
    ShuttingDown,
    WrongEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportProto {
    Tcp,
    Rdma,
}

impl TransportProto {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportProto::Tcp => "tcp",
            TransportProto::Rdma => "rdma",
        }
    }
}

impl fmt::Display for TransportProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportProto {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(TransportProto::Tcp),
            "rdma" => Ok(TransportProto::Rdma),
            other => Err(format!("unknown transport proto {other:?}")),
        }
    }
}

/// Format an endpoint as `<proto>+<host>:<port>`.
pub fn endpoint_url(proto: TransportProto, host: &str, port: u16) -> String {
    format!("{proto}+{host}:{port}")
}

/// Split an endpoint URL into its proto, host, and port.
pub fn parse_endpoint_url(url: &str) -> Result<(TransportProto, String, u16), String> {
    let (proto, rest) = url
        .split_once('+')
        .ok_or_else(|| format!("missing proto separator in {url:?}"))?;
    let proto = proto.parse()?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| format!("missing port in {url:?}"))?;
    let port = port
        .parse()
        .map_err(|_| format!("invalid port in {url:?}"))?;
    Ok((proto, host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_codes_are_stable() {
        assert_eq!(InternalVerb::GetPaxosLeaderUrl.code(), 110);
        assert_eq!(InternalVerb::UpdatePaxos.code(), 111);
        assert_eq!(InternalVerb::AckPaxos.code(), 112);
        assert_eq!(InternalVerb::GetAtomicClockTime.code(), 115);
        assert_eq!(InternalVerb::GetGpsClockTime.code(), 116);
        assert_eq!(InternalVerb::AckTime.code(), 117);
    }

    #[test]
    fn endpoint_urls_round_trip() {
        let url = endpoint_url(TransportProto::Tcp, "10.0.0.7", 13001);
        assert_eq!(url, "tcp+10.0.0.7:13001");
        let (proto, host, port) = parse_endpoint_url(&url).expect("parse");
        assert_eq!(proto, TransportProto::Tcp);
        assert_eq!(host, "10.0.0.7");
        assert_eq!(port, 13001);

        let (proto, _, _) = parse_endpoint_url("rdma+node3:9000").expect("parse rdma");
        assert_eq!(proto, TransportProto::Rdma);
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(parse_endpoint_url("tcp:9000").is_err());
        assert!(parse_endpoint_url("quic+host:9000").is_err());
        assert!(parse_endpoint_url("tcp+host").is_err());
        assert!(parse_endpoint_url("tcp+host:notaport").is_err());
    }

    #[test]
    fn requests_serialize_with_op_tags() {
        let json =
            serde_json::to_string(&Request::GetTimestampBatch { batch_size: 128 }).expect("encode");
        assert_eq!(json, r#"{"op":"get_timestamp_batch","batch_size":128}"#);

        let decoded: Request = serde_json::from_str(&json).expect("decode");
        assert!(matches!(
            decoded,
            Request::GetTimestampBatch { batch_size: 128 }
        ));
    }
}

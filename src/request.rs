//! Request classes, the wire codec, and the job representation shared by the
//! server, the schedulers, and the work sink.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of bytes a request occupies on the wire.
pub const TAG_LEN: usize = 4;

/// The two request classes offered by the workload.
///
/// On the wire a request is a 4-byte big-endian unsigned integer carrying
/// nothing but the class tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestClass {
    Slow,
    Fast,
}

impl RequestClass {
    /// Wire value of the class tag.
    pub const fn tag(self) -> u32 {
        match self {
            RequestClass::Slow => 0,
            RequestClass::Fast => 1,
        }
    }

    /// Decode a class tag. Values other than 0 and 1 are rejected.
    pub fn from_tag(tag: u32) -> Option<RequestClass> {
        match tag {
            0 => Some(RequestClass::Slow),
            1 => Some(RequestClass::Fast),
            _ => None,
        }
    }

    /// Encode the class into its 4-byte big-endian wire form.
    pub fn encode(self, buf: &mut [u8]) {
        buf[..TAG_LEN].copy_from_slice(&self.tag().to_be_bytes());
    }

    /// Decode a class from 4 wire bytes.
    pub fn decode(buf: &[u8]) -> Option<RequestClass> {
        let raw: [u8; TAG_LEN] = buf.get(..TAG_LEN)?.try_into().ok()?;
        RequestClass::from_tag(u32::from_be_bytes(raw))
    }
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestClass::Slow => "slow",
            RequestClass::Fast => "fast",
        };
        write!(f, "{label}")
    }
}

/// Per-request measurement record written back to the client.
///
/// Timestamps are integer microseconds since the Unix epoch; `accepted_ts`
/// is stamped by the server right after the tag bytes are read, the other
/// two by the work sink around the service. One JSON object per response,
/// terminated by a newline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub accepted_ts: u64,
    pub running_ts: u64,
    pub finished_ts: u64,
    /// Resident set size of the server process, 0 when unavailable.
    #[serde(default)]
    pub memory: u64,
    /// Jobs accepted but not yet finished at completion time.
    #[serde(default)]
    pub jobs_number: i64,
    /// 1-minute load average, 0.0 when unavailable.
    #[serde(default)]
    pub cpu: f64,
}

/// Microseconds since the Unix epoch, the stamp unit used on the wire.
pub fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A unit of work travelling server -> scheduler -> sink.
///
/// The job owns its response record; the stream handle is shared with the
/// connection's read loop, which keeps reading further requests while this
/// one is serviced.
#[derive(Debug, Clone)]
pub struct Job {
    pub class: RequestClass,
    pub client: Arc<TcpStream>,
    pub response: Response,
}

impl Job {
    /// Build a job for a freshly read request, stamping the accept time.
    pub fn accepted(class: RequestClass, client: Arc<TcpStream>) -> Job {
        Job {
            class,
            client,
            response: Response {
                accepted_ts: unix_micros(),
                ..Response::default()
            },
        }
    }
}

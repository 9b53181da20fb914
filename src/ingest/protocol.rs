//! JSON message protocol between the orchestrator and ingestion worker processes.
//!
//! Commands travel orchestrator → worker on the child's stdin; events travel
//! worker → orchestrator on the child's stdout. One JSON document per line.
//! Audio frames are carried by value inside the `audio` envelope — workers and
//! the orchestrator share no memory.

use serde::{Deserialize, Serialize};

/// Commands sent by the orchestrator to a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Scan for a free port and hold it with a probe listener.
    Init,
    /// Tear down the probe and attach the real decode pipeline.
    ///
    /// With `force` set, the worker re-arms on its already-claimed port
    /// without re-scanning (publisher reconnect after end-of-stream).
    Start { force: bool },
    /// Stop the decode pipeline but keep the process alive.
    Stop,
    /// Stop everything and exit the process.
    Terminate,
}

/// Events sent by a worker process to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A port was claimed; the transport URI is what publishers connect to.
    PortSelected { port: u16, uri: String },
    /// The decode pipeline is attached and accepting data.
    Ready,
    /// First decoded buffer arrived; the stream is live.
    Streaming,
    /// One decoded PCM chunk (16-bit LE mono).
    Audio { pcm: Vec<u8> },
    /// The publisher disconnected; the worker re-arms itself.
    Eos,
    /// A failure. Fatal errors exceed the retry ceiling and must not be
    /// answered with a restart.
    Error { message: String, fatal: bool },
    /// The worker is exiting.
    Closed,
}

impl WorkerCommand {
    /// Serialize command to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize command from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl WorkerEvent {
    /// Serialize event to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize event from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

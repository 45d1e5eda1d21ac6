//! Core request path: pipeline types, backend connections, the session
//! state machine, and the multi-sub-command coordinator.

pub mod backend;
pub mod connection;
pub mod multi;
pub mod session;

use tokio::sync::mpsc;

use crate::error::ProxyError;
use crate::proto::{Command, RespValue};

/// One client request on its way to a backend.
///
/// Sub-requests of a scattered or fanned-out command share their parent's
/// `seq` and are numbered by `sub_seq`; they carry no reference to the
/// coordinator, which the session owns in a map keyed by `seq`.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub cmd: Command,
    pub slot: u16,
    pub read_only: bool,
    pub seq: u64,
    pub sub_seq: usize,
    pub is_sub: bool,
}

/// A completed request: either the backend reply or the error that ended it
#[derive(Debug)]
pub struct PipelineResponse {
    pub ctx: PipelineRequest,
    pub result: Result<RespValue, ProxyError>,
}

/// Sender half of a session's response channel. Every in-flight request
/// holds a clone; the session writer finishes once all of them are gone.
pub type BackQueueSender = mpsc::UnboundedSender<PipelineResponse>;
pub type BackQueueReceiver = mpsc::UnboundedReceiver<PipelineResponse>;

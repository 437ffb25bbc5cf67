use std::time::Duration;

use common::RpcId;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::framing::StreamSource;
use crate::message::InboundMessage;
use crate::sequencer::SequencerState;
use crate::supervisor::ExitReport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    Matched { method: String },
    Unsolicited,
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    Launched {
        pid: u32,
        command: String,
    },
    StateChanged {
        from: SequencerState,
        to: SequencerState,
    },
    Sent {
        step: usize,
        method: String,
        id: Option<RpcId>,
        payload: String,
    },
    Received {
        source: StreamSource,
        message: InboundMessage,
        correlation: Correlation,
    },
    /// Raw text the child wrote to stderr.
    Diagnostic {
        source: StreamSource,
        text: String,
    },
    Error {
        step: Option<usize>,
        kind: &'static str,
        detail: String,
        fatal: bool,
        /// The outbound message being written, or the offending inbound line.
        payload: Option<String>,
    },
    DeadlineExpired {
        elapsed: Duration,
    },
    Terminating {
        pid: u32,
        signal: &'static str,
    },
    Exited(ExitReport),
}

/// Sink for everything the probe sees. Implementations must not fail and
/// must not influence the run.
pub trait Observer {
    fn record(&mut self, event: ObservedEvent);
}

impl<O: Observer + ?Sized> Observer for &mut O {
    fn record(&mut self, event: ObservedEvent) {
        (**self).record(event);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn record(&mut self, event: ObservedEvent) {
        match event {
            ObservedEvent::Launched { pid, command } => info!(pid, %command, "server launched"),
            ObservedEvent::StateChanged { from, to } => {
                debug!(from = ?from, to = ?to, "sequencer state changed");
            }
            ObservedEvent::Sent {
                step,
                method,
                id,
                payload,
            } => info!(step, %method, id = ?id, %payload, "sent"),
            ObservedEvent::Received {
                source,
                message,
                correlation,
            } => {
                let kind = message.kind();
                match &correlation {
                    Correlation::Matched { method } => info!(
                        source = source.as_str(),
                        kind,
                        request = %method,
                        message = ?message,
                        "server response"
                    ),
                    Correlation::Unsolicited => warn!(
                        source = source.as_str(),
                        kind,
                        message = ?message,
                        "response without outstanding request"
                    ),
                    Correlation::NotApplicable => info!(
                        source = source.as_str(),
                        kind,
                        message = ?message,
                        "server message"
                    ),
                }
            }
            ObservedEvent::Diagnostic { source, text } => {
                info!(source = source.as_str(), line = %text, "server output");
            }
            ObservedEvent::Error {
                step,
                kind,
                detail,
                fatal,
                payload,
            } => {
                if fatal {
                    error!(step = ?step, kind, %detail, payload = ?payload, "probe error");
                } else {
                    warn!(step = ?step, kind, %detail, payload = ?payload, "probe error");
                }
            }
            ObservedEvent::DeadlineExpired { elapsed } => {
                info!(elapsed_ms = elapsed.as_millis(), "deadline reached, terminating server");
            }
            ObservedEvent::Terminating { pid, signal } => info!(pid, signal, "terminating server"),
            ObservedEvent::Exited(report) => info!(
                code = ?report.code,
                signal = ?report.signal,
                "server {report}"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub at: Duration,
    pub event: ObservedEvent,
}

/// Keeps every event in memory with its offset from creation.
#[derive(Debug)]
pub struct RecordingObserver {
    started: Instant,
    events: Vec<RecordedEvent>,
}

impl Default for RecordingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match &e.event {
                ObservedEvent::Sent { method, .. } => Some(method.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&ObservedEvent) -> bool) -> usize {
        self.events.iter().filter(|e| predicate(&e.event)).count()
    }
}

impl Observer for RecordingObserver {
    fn record(&mut self, event: ObservedEvent) {
        self.events.push(RecordedEvent {
            at: self.started.elapsed(),
            event,
        });
    }
}

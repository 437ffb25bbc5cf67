//! Scripted handshake driver.
//!
//! One task owns the sequencer. Stream readers and the exit watcher only push
//! [`SequencerEvent`]s into its queue, so step sends, timer expiry and event
//! handling never interleave mid-operation, and only this task writes to the
//! child's stdin.
//!
//! ```text
//! idle -> running -> draining -> done
//!            |                    ^
//!            +---- child exit ----+
//! ```

use std::collections::HashMap;
use std::time::Duration;

use common::RpcId;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::error::ProbeError;
use crate::framing::{Frame, FrameWriter, StreamSource};
use crate::message::InboundMessage;
use crate::observer::{Correlation, ObservedEvent, Observer};
use crate::script::{Script, WaitPolicy};
use crate::supervisor::{ChildHandle, ExitReport, TermSignal};

/// How long stdout output already in flight is still collected after the
/// child has been reaped.
const EXIT_DRAIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Running,
    Draining,
    Done,
}

/// Absolute termination point, fixed once at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    launched_at: Instant,
    at: Instant,
}

impl Deadline {
    pub fn after(launched_at: Instant, within: Duration) -> Self {
        Self {
            launched_at,
            at: launched_at + within,
        }
    }

    pub const fn at(&self) -> Instant {
        self.at
    }

    pub fn has_passed(&self) -> bool {
        Instant::now() >= self.at
    }
}

#[derive(Debug)]
pub enum SequencerEvent {
    Inbound { source: StreamSource, frame: Frame },
    Exited(ExitReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    ChildExited(ExitReport),
    DeadlineReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerOutcome {
    pub completion: Completion,
    pub steps_sent: usize,
    pub terminate_requested: bool,
}

impl SequencerOutcome {
    pub const fn exit(&self) -> Option<ExitReport> {
        match self.completion {
            Completion::ChildExited(report) => Some(report),
            Completion::DeadlineReached => None,
        }
    }
}

pub trait Terminate {
    fn target_pid(&self) -> u32;

    /// Returns whether a signal was actually delivered.
    fn terminate_gracefully(&self) -> Result<bool, ProbeError>;
}

impl Terminate for ChildHandle {
    fn target_pid(&self) -> u32 {
        self.pid()
    }

    fn terminate_gracefully(&self) -> Result<bool, ProbeError> {
        self.terminate(TermSignal::Terminate)
    }
}

#[derive(Debug, Clone, Copy)]
enum Gate {
    At(Instant),
    DataAfter(u64),
}

pub struct Sequencer<W, T, O> {
    script: Script,
    deadline: Deadline,
    writer: FrameWriter<W>,
    events: mpsc::UnboundedReceiver<SequencerEvent>,
    terminator: T,
    observer: O,
    state: SequencerState,
    data_seen: u64,
    last_step: Option<usize>,
    outstanding: HashMap<RpcId, String>,
}

impl<W, T, O> Sequencer<W, T, O>
where
    W: AsyncWrite + Unpin,
    T: Terminate,
    O: Observer,
{
    pub fn new(
        script: Script,
        deadline: Deadline,
        writer: FrameWriter<W>,
        events: mpsc::UnboundedReceiver<SequencerEvent>,
        terminator: T,
        observer: O,
    ) -> Self {
        Self {
            script,
            deadline,
            writer,
            events,
            terminator,
            observer,
            state: SequencerState::Idle,
            data_seen: 0,
            last_step: None,
            outstanding: HashMap::new(),
        }
    }

    pub const fn state(&self) -> SequencerState {
        self.state
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<SequencerEvent>, O) {
        (self.events, self.observer)
    }

    pub async fn run(&mut self) -> Result<SequencerOutcome, ProbeError> {
        if self.state != SequencerState::Idle {
            return Err(ProbeError::InvalidScript(
                "sequencer can only run once".to_string(),
            ));
        }
        self.transition(SequencerState::Running);

        let deadline = sleep_until(self.deadline.at());
        tokio::pin!(deadline);
        let mut gate = Gate::At(Instant::now() + self.script.start_delay());
        let mut next_step = 0;
        let mut steps_sent = 0;
        let mut events_open = true;

        loop {
            if self.state == SequencerState::Running
                && self.gate_open(gate)
                && !self.deadline.has_passed()
            {
                if next_step == self.script.len() {
                    self.transition(SequencerState::Draining);
                    continue;
                }
                match self.send_step(next_step).await {
                    Ok(wait) => {
                        steps_sent += 1;
                        next_step += 1;
                        gate = match wait {
                            WaitPolicy::Delay(delay) => Gate::At(Instant::now() + delay),
                            WaitPolicy::AnyData => Gate::DataAfter(self.data_seen),
                        };
                    }
                    Err(err) => {
                        self.report_error(Some(next_step + 1), &err);
                        if err.is_fatal() {
                            return Err(err);
                        }
                        self.transition(SequencerState::Draining);
                    }
                }
                continue;
            }

            let gate_at = match (self.state, gate) {
                (SequencerState::Running, Gate::At(at)) => Some(at),
                _ => None,
            };
            let wake_at = gate_at.unwrap_or(self.deadline.at());

            tokio::select! {
                biased;
                event = self.events.recv(), if events_open => match event {
                    Some(SequencerEvent::Inbound { source, frame }) => self.observe(source, frame),
                    Some(SequencerEvent::Exited(report)) => {
                        self.drain_after_exit().await;
                        self.observer.record(ObservedEvent::Exited(report));
                        self.transition(SequencerState::Done);
                        return Ok(SequencerOutcome {
                            completion: Completion::ChildExited(report),
                            steps_sent,
                            terminate_requested: false,
                        });
                    }
                    None => events_open = false,
                },
                () = &mut deadline => {
                    self.observer.record(ObservedEvent::DeadlineExpired {
                        elapsed: self.deadline.launched_at.elapsed(),
                    });
                    let terminate_requested = self.request_termination();
                    self.transition(SequencerState::Done);
                    return Ok(SequencerOutcome {
                        completion: Completion::DeadlineReached,
                        steps_sent,
                        terminate_requested,
                    });
                }
                () = sleep_until(wake_at), if gate_at.is_some() => {}
            }
        }
    }

    /// The exit watcher and the stream readers race, so the child's last
    /// lines may still be queued behind its exit.
    async fn drain_after_exit(&mut self) {
        let drain = async {
            while let Some(event) = self.events.recv().await {
                if let SequencerEvent::Inbound { source, frame } = event {
                    self.observe(source, frame);
                }
            }
        };
        if tokio::time::timeout(EXIT_DRAIN, drain).await.is_err() {
            debug!("child streams still open after exit, stopped draining");
        }
    }

    fn gate_open(&self, gate: Gate) -> bool {
        match gate {
            Gate::At(at) => Instant::now() >= at,
            Gate::DataAfter(mark) => self.data_seen > mark,
        }
    }

    async fn send_step(&mut self, index: usize) -> Result<WaitPolicy, ProbeError> {
        let step = self.script.steps()[index].clone();
        self.writer.send(&step.message).await?;
        self.last_step = Some(index + 1);

        let method = step.message.method().to_string();
        let id = step.message.id().cloned();
        if let Some(id) = &id {
            self.outstanding.insert(id.clone(), method.clone());
        }
        let payload = serde_json::to_string(&step.message).unwrap_or_default();
        self.observer.record(ObservedEvent::Sent {
            step: index + 1,
            method,
            id,
            payload,
        });
        Ok(step.wait)
    }

    fn observe(&mut self, source: StreamSource, frame: Frame) {
        if self.state == SequencerState::Done {
            return;
        }
        if source == StreamSource::Stdout {
            self.data_seen += 1;
        }
        let event = match frame {
            Frame::Message(value) => {
                let message = InboundMessage::classify(value);
                let correlation = match message.response_id() {
                    Some(id) => self
                        .outstanding
                        .remove(id)
                        .map_or(Correlation::Unsolicited, |method| Correlation::Matched {
                            method,
                        }),
                    None if matches!(message, InboundMessage::Response(_)) => {
                        Correlation::Unsolicited
                    }
                    None => Correlation::NotApplicable,
                };
                ObservedEvent::Received {
                    source,
                    message,
                    correlation,
                }
            }
            Frame::Malformed { line, reason } => {
                let payload = Some(line.clone());
                let err = ProbeError::MalformedLine { line, reason };
                ObservedEvent::Error {
                    step: self.last_step,
                    kind: err.kind(),
                    detail: err.to_string(),
                    fatal: err.is_fatal(),
                    payload,
                }
            }
            Frame::Text(text) => ObservedEvent::Diagnostic { source, text },
        };
        self.observer.record(event);
    }

    fn request_termination(&mut self) -> bool {
        self.observer.record(ObservedEvent::Terminating {
            pid: self.terminator.target_pid(),
            signal: TermSignal::Terminate.name(),
        });
        match self.terminator.terminate_gracefully() {
            Ok(delivered) => delivered,
            Err(err) => {
                self.report_error(None, &err);
                false
            }
        }
    }

    fn report_error(&mut self, step: Option<usize>, err: &ProbeError) {
        let (detail, payload) = match step.and_then(|n| self.script.steps().get(n - 1)) {
            Some(s) => (
                format!("{}: {err}", s.message.method()),
                serde_json::to_string(&s.message).ok(),
            ),
            None => (err.to_string(), None),
        };
        self.observer.record(ObservedEvent::Error {
            step,
            kind: err.kind(),
            detail,
            fatal: err.is_fatal(),
            payload,
        });
    }

    fn transition(&mut self, to: SequencerState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.observer.record(ObservedEvent::StateChanged { from, to });
    }
}

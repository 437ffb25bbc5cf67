use std::time::Duration;

use common::config::ProbeConfig;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::error::ProbeError;
use crate::framing::{FrameWriter, LineFramer, StreamSource};
use crate::observer::{ObservedEvent, Observer};
use crate::script::Script;
use crate::sequencer::{Deadline, Sequencer, SequencerEvent, SequencerOutcome};
use crate::supervisor::{ChildHandle, ExitReport, ProcessSupervisor, TermSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: SequencerOutcome,
    pub exit: ExitReport,
    /// SIGKILL was needed because the child outlived the grace period.
    pub killed: bool,
}

/// Launches `command`, drives the handshake script and waits for the child
/// to be reaped. The observer is handed back alongside the report.
pub async fn run_probe<O: Observer>(
    command: &str,
    args: &[String],
    config: &ProbeConfig,
    mut observer: O,
) -> (Result<RunReport, ProbeError>, O) {
    let script = match Script::handshake(config) {
        Ok(script) => script,
        Err(err) => {
            record_fatal(&mut observer, &err);
            return (Err(err), observer);
        }
    };

    let launched = match ProcessSupervisor::launch(command, args) {
        Ok(launched) => launched,
        Err(err) => {
            record_fatal(&mut observer, &err);
            return (Err(err), observer);
        }
    };
    let deadline = Deadline::after(Instant::now(), config.deadline());
    let handle = launched.handle;
    observer.record(ObservedEvent::Launched {
        pid: handle.pid(),
        command: command.to_string(),
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let streams = launched.streams;
    tokio::spawn(pump(
        FramedRead::new(streams.stdout, LineFramer::json(config.max_line_bytes)),
        StreamSource::Stdout,
        tx.clone(),
    ));
    tokio::spawn(pump(
        FramedRead::new(streams.stderr, LineFramer::text(config.max_line_bytes)),
        StreamSource::Stderr,
        tx.clone(),
    ));
    tokio::spawn(forward_exit(launched.exit, tx));

    let mut sequencer = Sequencer::new(
        script,
        deadline,
        FrameWriter::new(streams.stdin),
        rx,
        handle.clone(),
        observer,
    );
    let outcome = sequencer.run().await;
    let (mut events, mut observer) = sequencer.into_parts();

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            if let Err(kill_err) = handle.kill() {
                warn!(error = %kill_err, "failed to kill child after fatal error");
            }
            return (Err(err), observer);
        }
    };

    let (exit, killed) = match outcome.exit() {
        Some(exit) => (exit, false),
        None => {
            let (exit, killed) =
                await_exit(&mut events, &handle, config.kill_grace(), &mut observer).await;
            observer.record(ObservedEvent::Exited(exit));
            (exit, killed)
        }
    };

    (
        Ok(RunReport {
            outcome,
            exit,
            killed,
        }),
        observer,
    )
}

fn record_fatal<O: Observer>(observer: &mut O, err: &ProbeError) {
    observer.record(ObservedEvent::Error {
        step: None,
        kind: err.kind(),
        detail: err.to_string(),
        fatal: err.is_fatal(),
        payload: None,
    });
}

async fn pump<R: AsyncRead + Unpin>(
    mut frames: FramedRead<R, LineFramer>,
    source: StreamSource,
    tx: mpsc::UnboundedSender<SequencerEvent>,
) {
    while let Some(next) = frames.next().await {
        match next {
            Ok(frame) => {
                if tx.send(SequencerEvent::Inbound { source, frame }).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(source = source.as_str(), error = %err, "failed reading child stream");
                break;
            }
        }
    }
    debug!(source = source.as_str(), "child stream closed");
}

async fn forward_exit(
    exit: oneshot::Receiver<ExitReport>,
    tx: mpsc::UnboundedSender<SequencerEvent>,
) {
    let report = exit.await.unwrap_or_else(|_| ExitReport::unknown());
    let _ = tx.send(SequencerEvent::Exited(report));
}

/// Everything other than the exit event is late traffic and is dropped.
async fn await_exit<O: Observer>(
    events: &mut mpsc::UnboundedReceiver<SequencerEvent>,
    handle: &ChildHandle,
    grace: Duration,
    observer: &mut O,
) -> (ExitReport, bool) {
    if let Some(report) = next_exit(events, grace).await {
        return (report, false);
    }
    warn!(
        pid = handle.pid(),
        grace_ms = grace.as_millis(),
        "child ignored SIGTERM, sending SIGKILL"
    );
    observer.record(ObservedEvent::Terminating {
        pid: handle.pid(),
        signal: TermSignal::Kill.name(),
    });
    if let Err(err) = handle.kill() {
        warn!(pid = handle.pid(), error = %err, "failed to kill child");
    }
    let report = next_exit(events, grace)
        .await
        .or_else(|| handle.exit_report())
        .unwrap_or_else(ExitReport::unknown);
    (report, true)
}

async fn next_exit(
    events: &mut mpsc::UnboundedReceiver<SequencerEvent>,
    within: Duration,
) -> Option<ExitReport> {
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                SequencerEvent::Exited(report) => return Some(report),
                SequencerEvent::Inbound { source, frame } => {
                    debug!(source = source.as_str(), frame = ?frame, "discarding late output");
                }
            }
        }
        None
    };
    tokio::time::timeout(within, wait).await.ok().flatten()
}

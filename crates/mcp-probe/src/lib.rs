pub mod error;
pub mod framing;
pub mod message;
pub mod observer;
pub mod run;
pub mod script;
pub mod sequencer;
pub mod supervisor;

pub use error::ProbeError;
pub use observer::{ObservedEvent, Observer, RecordingObserver, TracingObserver};
pub use run::{RunReport, run_probe};
pub use script::{Script, Step, WaitPolicy};
pub use sequencer::{Completion, Sequencer, SequencerOutcome, SequencerState};
pub use supervisor::{ExitReport, ProcessSupervisor};

//! Message classification and validation
//!
//! Pure classification lives in [`classifier`] and the modules it delegates
//! to; [`pipeline`] is the impure task that feeds classified results to the
//! ring buffers, the session hub and the broker.

pub mod classifier;
pub mod command;
pub mod decode;
pub mod emergency;
pub mod pipeline;
pub mod result;
pub mod sensors;
pub mod telemetry;

pub use classifier::{TopicClassifier, TopicFamily};
pub use command::{CommandKind, CommandOutcome, CommandValidator, Execution, SafetyLevel};
pub use decode::DecodeError;
pub use emergency::{detect_emergency, EmergencySignal, RequiredAction, Severity};
pub use pipeline::{MessagePipeline, PipelineOutcome};
pub use result::{Category, ClassifiedResult, Validation, ValidationStatus};

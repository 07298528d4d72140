/// Errors raised by the execution core.
///
/// Validation problems are never surfaced through this type mid-validation —
/// the validator collects them into a list and only the *count* travels here
/// when a run is refused. Everything else aborts at most the current run;
/// the scheduler itself never dies on one of these.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("flow validation failed with {0} error(s)")]
    ValidationFailed(usize),

    #[error("incompatible units: {from} and {to} are not in the same category")]
    UnitIncompatibility { from: String, to: String },

    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("device i/o failed: {0}")]
    DeviceIo(String),

    #[error("run exceeded {limit_mins} minute execution budget")]
    Timeout { limit_mins: u32 },

    #[error("queue: {0}")]
    Queue(String),

    #[error("block not found: {0}")]
    UnknownBlock(String),

    #[error("variable not found: {0}")]
    UnknownVariable(String),

    #[error("program: {0}")]
    Program(String),

    #[error("invalid time '{0}', expected HH:MM")]
    InvalidTime(String),
}

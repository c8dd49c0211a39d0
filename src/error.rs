use thiserror::Error;

/// Coarse classification of an [`Error`], used by the retry policy and the
/// scheduler to decide between retrying, isolating, or aborting the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network, timeout, or rate-limit failure. Retried with backoff.
    Transient,
    /// Worker output that could not be parsed or repaired.
    MalformedOutput,
    /// The quality gate halted the run.
    SystematicQualityFailure,
    /// A cost or call budget was exhausted.
    ResourceExhaustion,
    /// The chronolog hash chain or an artifact failed verification.
    IntegrityViolation,
    /// Durable storage could not be read or written.
    Storage,
    /// A permanent failure local to one task.
    Permanent,
}

impl ErrorKind {
    /// Fatal kinds abort the whole run instead of failing a single task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::ResourceExhaustion | ErrorKind::IntegrityViolation | ErrorKind::Storage
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "TRANSIENT"),
            ErrorKind::MalformedOutput => write!(f, "MALFORMED_OUTPUT"),
            ErrorKind::SystematicQualityFailure => write!(f, "SYSTEMATIC_QUALITY_FAILURE"),
            ErrorKind::ResourceExhaustion => write!(f, "RESOURCE_EXHAUSTION"),
            ErrorKind::IntegrityViolation => write!(f, "INTEGRITY_VIOLATION"),
            ErrorKind::Storage => write!(f, "STORAGE"),
            ErrorKind::Permanent => write!(f, "PERMANENT"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transient service error: {0}")]
    Transient(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("Systematic quality failure: {reason}")]
    SystematicQualityFailure { reason: String },

    #[error("Resource exhaustion: {used} external calls used (limit {limit})")]
    ResourceExhaustion { limit: u64, used: u64 },

    #[error("Integrity violation at seq {seq}: {detail}")]
    IntegrityViolation { seq: u64, detail: String },

    #[error("FORMULA_INPUT_MISSING: formula '{formula}' requires field '{field}'")]
    FormulaInputMissing { formula: String, field: String },

    #[error("Calculation error: {0}")]
    Calculation(String),

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Checkpoint conflict for {key}: already {existing}, refused {attempted}")]
    CheckpointConflict {
        key: String,
        existing: String,
        attempted: String,
    },

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Artifact {hash} failed content verification")]
    ArtifactCorrupted { hash: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Worker pool is full (max {max})")]
    PoolFull { max: usize },

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Classify this error into the engine's taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient(_) | Error::Timeout(_) => ErrorKind::Transient,
            Error::MalformedOutput(_) => ErrorKind::MalformedOutput,
            Error::SystematicQualityFailure { .. } => ErrorKind::SystematicQualityFailure,
            Error::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            Error::IntegrityViolation { .. } | Error::ArtifactCorrupted { .. } => {
                ErrorKind::IntegrityViolation
            }
            Error::Io(_) | Error::Storage(_) | Error::CheckpointConflict { .. } => {
                ErrorKind::Storage
            }
            Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::NoHomeDir
            | Error::Validation(_)
            | Error::Service(_)
            | Error::FormulaInputMissing { .. }
            | Error::Calculation(_)
            | Error::InvalidTransition { .. }
            | Error::ArtifactNotFound(_)
            | Error::PoolFull { .. }
            | Error::TaskJoin(_) => ErrorKind::Permanent,
        }
    }

    /// Shorthand for `self.kind().is_fatal()`.
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T> = std::result::Result<T, Error>;

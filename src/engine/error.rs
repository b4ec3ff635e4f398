use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// An interval, override or working plan is malformed (`start >= end`,
    /// breaks outside work hours, bad JSON plan).
    Validation(String),
    /// A query parameter is out of range (non-positive duration, negative buffer).
    InvalidArgument(String),
    /// A new appointment overlaps this existing one.
    Conflict(Ulid),
    LimitExceeded(&'static str),
    /// The durable store failed underneath the engine.
    Dependency(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::Conflict(id) => write!(f, "conflict with appointment: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Dependency(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

use thiserror::Error;

/// Failure classes surfaced by the engine. Each variant maps to one
/// operator-facing outcome; `Cancelled` is a cooperative stop rather than a
/// fault.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("step '{step}' failed: {message}")]
    StepExecution { step: String, message: String },

    #[error("step '{step}' exhausted {attempts} attempts, last error: {last_error}")]
    RetryExhausted {
        step: String,
        attempts: u32,
        last_error: String,
    },

    #[error("loop '{step}' hit its cap of {cap} iterations without meeting its exit condition")]
    LoopExhausted { step: String, cap: u32 },

    #[error("isolation error: {0}")]
    Isolation(#[from] IsolationError),

    #[error("cancellation requested")]
    Cancelled,

    #[error("progress error: {0}")]
    Progress(String),

    #[error("store error: {0}")]
    Store(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural problems in a workflow definition. None of these reach the
/// executor; a definition is validated in full before a run starts.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("failed to read workflow file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse workflow file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("step name '{0}' is empty or contains reserved characters")]
    InvalidStepName(String),

    #[error("duplicate step name '{name}' under '{parent}'")]
    DuplicateStepName { name: String, parent: String },

    #[error("step '{0}' has no children")]
    EmptyComposite(String),

    #[error("conditional step '{0}' has an empty condition")]
    EmptyCondition(String),

    #[error("loop step '{step}' has max_iterations {value}, expected at least 1")]
    InvalidLoopCap { step: String, value: u32 },

    #[error("duplicate variable '{0}'")]
    DuplicateVariable(String),

    #[error("variable '{name}' default '{value}' is not a valid {expected}")]
    InvalidVariableDefault {
        name: String,
        value: String,
        expected: String,
    },

    #[error("variable '{name}' value '{value}' is not a valid {expected}")]
    InvalidVariableValue {
        name: String,
        value: String,
        expected: String,
    },

    #[error("unknown step '{0}'")]
    UnknownStep(String),
}

/// Worktree acquire/release failures. A branch that cannot get its isolation
/// counts as a failed branch, never a crashed run.
#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("failed to create worktree for branch '{branch}': {message}")]
    Create { branch: String, message: String },

    #[error("failed to remove worktree at '{path}': {message}")]
    Remove { path: String, message: String },

    #[error("worktree base directory unavailable: {0}")]
    BaseDir(String),

    #[error("git error: {0}")]
    Git(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("unsupported document kind: {0}")]
    UnsupportedKind(String),

    #[error("policy {name} failed to compile: {errors}")]
    Compile { name: String, errors: CompileErrors },

    #[error("pattern compilation error: {0}")]
    Pattern(#[from] PatternError),

    #[error("exception lister failed: {0}")]
    Lister(String),

    #[error("policy cache lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Error)]
pub enum PatternError {
    #[error("invalid regex pattern '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("invalid glob pattern: {0}")]
    InvalidGlob(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("invalid label key \"{key}\": {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("invalid label value: \"{value}\": {reason}")]
    InvalidValue { value: String, reason: String },

    #[error("key {key}: values must be specified for operator {operator}")]
    MissingValues { key: String, operator: String },

    #[error("key {key}: values must be empty for operator {operator}")]
    UnexpectedValues { key: String, operator: String },
}

/// A deferred selector problem surfaced by the matcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("namespace selector: {0}")]
    NamespaceSelector(SelectorError),

    #[error("object selector: {0}")]
    ObjectSelector(SelectorError),

    #[error("namespace \"{0}\" not found")]
    NamespaceNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldErrorKind {
    Invalid,
    Required,
    Internal,
}

/// A compile problem pinned to a field of the policy document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub kind: FieldErrorKind,
    pub value: String,
    pub detail: String,
}

impl FieldError {
    pub fn invalid(path: impl Into<String>, value: &str, detail: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FieldErrorKind::Invalid,
            value: value.to_string(),
            detail: detail.into(),
        }
    }

    pub fn required(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FieldErrorKind::Required,
            value: String::new(),
            detail: detail.into(),
        }
    }

    pub fn internal(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FieldErrorKind::Internal,
            value: String::new(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FieldErrorKind::Invalid => write!(
                f,
                "{}: Invalid value: {:?}: {}",
                self.path, self.value, self.detail
            ),
            FieldErrorKind::Required => write!(f, "{}: Required value: {}", self.path, self.detail),
            FieldErrorKind::Internal => write!(f, "{}: Internal error: {}", self.path, self.detail),
        }
    }
}

/// Every compile problem found in one policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileErrors(pub Vec<FieldError>);

impl CompileErrors {
    pub fn push(&mut self, error: FieldError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// `Ok(value)` when nothing was recorded.
    pub fn into_result<T>(self, value: T) -> std::result::Result<T, CompileErrors> {
        if self.0.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => f.write_str("<no errors>"),
            [single] => write!(f, "{}", single),
            many => {
                f.write_str("[")?;
                for (i, e) in many.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl std::error::Error for CompileErrors {}

/// Failure raised while running compiled programs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("{context}: {message}")]
    Execution { context: String, message: String },

    #[error("{context}: expected {expected} result, got {got}")]
    UnexpectedType {
        context: String,
        expected: &'static str,
        got: String,
    },

    #[error("variable \"{name}\" failed: {message}")]
    Variable { name: String, message: String },

    #[error("match condition \"{name}\" failed: {message}")]
    MatchCondition { name: String, message: String },

    #[error("exception {exception} condition \"{condition}\" failed: {message}")]
    ExceptionCondition {
        exception: String,
        condition: String,
        message: String,
    },

    #[error("failed to prepare evaluation context: {0}")]
    Prepare(String),

    #[error("failed to apply patch: {0}")]
    Patch(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("evaluation cancelled")]
    Cancelled,

    #[error("evaluation deadline exceeded")]
    DeadlineExceeded,
}

impl EvalError {
    pub fn execution(context: impl Into<String>, message: impl fmt::Display) -> Self {
        EvalError::Execution {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// True for cancellation and deadline failures.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, EvalError::Cancelled | EvalError::DeadlineExceeded)
    }
}

/// Failure raised by a context capability (cluster access, image registry, ...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{resource} already exists and is not managed by policy {policy}")]
    Unmanaged { resource: String, policy: String },

    #[error("{0}")]
    Failed(String),
}

/// Failure of a whole engine call, as opposed to a single policy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to fetch policies: {0}")]
    Fetch(#[from] PolicyError),

    #[error("malformed request: {0}")]
    Request(String),

    #[error("{0} annotation not present")]
    MissingOutcomes(String),

    #[error("failed to compute patch: {0}")]
    Patch(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, PolicyError>;
pub type PatternResult<T> = std::result::Result<T, PatternError>;
pub type EvalResult<T> = std::result::Result<T, EvalError>;
pub type ContextResult<T> = std::result::Result<T, ContextError>;
pub type EngineResult<T> = std::result::Result<T, EngineError>;

use thiserror::Error;

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Invalid address for {field}: {value}")]
    InvalidAddress { field: String, value: String },

    #[error("Invalid chain id key: {0}")]
    InvalidChainId(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

/// Form input rejected before any transaction is built.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Election title is required")]
    TitleRequired,

    #[error("Election title must be less than {0} characters")]
    TitleTooLong(usize),

    #[error("Election description is required")]
    DescriptionRequired,

    #[error("Election description must be less than {0} characters")]
    DescriptionTooLong(usize),

    #[error("At least {0} candidates are required")]
    TooFewCandidates(usize),

    #[error("Maximum {0} candidates allowed")]
    TooManyCandidates(usize),

    #[error("All candidate names must be provided")]
    EmptyCandidate,

    #[error("Candidate names must be less than {0} characters")]
    CandidateTooLong(usize),

    #[error("Candidate names must be unique")]
    DuplicateCandidate,

    #[error("Election duration must be at least {0} hour")]
    DurationTooShort(u64),

    #[error("Election duration cannot exceed 1 week")]
    DurationTooLong,

    #[error("Invalid Ethereum address: {0}")]
    InvalidAddress(String),

    #[error("Candidate index {index} out of range (candidates: {count})")]
    CandidateOutOfRange { index: usize, count: usize },

    #[error("Rating must be between {min} and {max}, got {rating}")]
    RatingOutOfRange { rating: u32, min: u32, max: u32 },

    #[error("Subject cannot be empty")]
    SubjectRequired,

    #[error("Subject is too long (max {0} characters)")]
    SubjectTooLong(usize),
}

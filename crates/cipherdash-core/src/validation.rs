// Election and rating form validation
//
// Mirrors the contracts' own checks so obviously invalid input never costs a
// wallet prompt or a reverted transaction. A rating is encrypted before it
// leaves the client, so its range can only be checked here.

use crate::errors::ValidationError;
use std::collections::HashSet;

pub const MIN_CANDIDATES: usize = 2;
pub const MAX_CANDIDATES: usize = 10;
pub const MIN_DURATION_HOURS: u64 = 1;
pub const MAX_DURATION_HOURS: u64 = 168;
pub const MAX_TITLE_LENGTH: usize = 100;
pub const MAX_DESCRIPTION_LENGTH: usize = 500;
pub const MAX_CANDIDATE_NAME_LENGTH: usize = 50;
pub const MIN_RATING: u32 = 1;
pub const MAX_RATING: u32 = 5;
pub const MAX_SUBJECT_LENGTH: usize = 100;

/// Input for `createElection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionDraft {
    pub title: String,
    pub description: String,
    pub candidates: Vec<String>,
    pub duration_hours: u64,
}

impl ElectionDraft {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_title(&self.title)?;
        validate_description(&self.description)?;
        validate_candidates(&self.candidates)?;
        validate_duration(self.duration_hours)
    }
}

pub fn validate_title(title: &str) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::TitleRequired);
    }
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(ValidationError::TitleTooLong(MAX_TITLE_LENGTH));
    }
    Ok(())
}

pub fn validate_description(description: &str) -> Result<(), ValidationError> {
    if description.trim().is_empty() {
        return Err(ValidationError::DescriptionRequired);
    }
    if description.chars().count() > MAX_DESCRIPTION_LENGTH {
        return Err(ValidationError::DescriptionTooLong(MAX_DESCRIPTION_LENGTH));
    }
    Ok(())
}

pub fn validate_candidates(candidates: &[String]) -> Result<(), ValidationError> {
    if candidates.len() < MIN_CANDIDATES {
        return Err(ValidationError::TooFewCandidates(MIN_CANDIDATES));
    }
    if candidates.len() > MAX_CANDIDATES {
        return Err(ValidationError::TooManyCandidates(MAX_CANDIDATES));
    }

    for candidate in candidates {
        if candidate.trim().is_empty() {
            return Err(ValidationError::EmptyCandidate);
        }
        if candidate.chars().count() > MAX_CANDIDATE_NAME_LENGTH {
            return Err(ValidationError::CandidateTooLong(MAX_CANDIDATE_NAME_LENGTH));
        }
    }

    // Case- and whitespace-insensitive uniqueness
    let unique: HashSet<String> = candidates.iter().map(|c| c.trim().to_lowercase()).collect();
    if unique.len() != candidates.len() {
        return Err(ValidationError::DuplicateCandidate);
    }

    Ok(())
}

pub fn validate_duration(hours: u64) -> Result<(), ValidationError> {
    if hours < MIN_DURATION_HOURS {
        return Err(ValidationError::DurationTooShort(MIN_DURATION_HOURS));
    }
    if hours > MAX_DURATION_HOURS {
        return Err(ValidationError::DurationTooLong);
    }
    Ok(())
}

/// `0x` followed by exactly 40 hex digits.
pub fn validate_ethereum_address(address: &str) -> Result<(), ValidationError> {
    let valid = address
        .strip_prefix("0x")
        .map(|rest| rest.len() == 40 && rest.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false);

    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidAddress(address.to_string()))
    }
}

pub fn validate_rating(rating: u32) -> Result<(), ValidationError> {
    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(ValidationError::RatingOutOfRange { rating, min: MIN_RATING, max: MAX_RATING });
    }
    Ok(())
}

/// Non-blank and at most 100 characters.
pub fn validate_subject(subject: &str) -> Result<(), ValidationError> {
    if subject.trim().is_empty() {
        return Err(ValidationError::SubjectRequired);
    }
    if subject.chars().count() > MAX_SUBJECT_LENGTH {
        return Err(ValidationError::SubjectTooLong(MAX_SUBJECT_LENGTH));
    }
    Ok(())
}

/// Candidate indexes are zero-based on the client.
pub fn validate_candidate_index(index: usize, count: usize) -> Result<(), ValidationError> {
    if index >= count {
        return Err(ValidationError::CandidateOutOfRange { index, count });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(candidates: &[&str]) -> ElectionDraft {
        ElectionDraft {
            title: "Student Council President 2024".to_string(),
            description: "Vote for your next student council president".to_string(),
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
            duration_hours: 72,
        }
    }

    #[test]
    fn test_valid_draft() {
        assert!(draft(&["Alice Smith", "Bob Johnson", "Carol White"]).validate().is_ok());
    }

    #[test]
    fn test_title_rules() {
        assert_eq!(validate_title("   "), Err(ValidationError::TitleRequired));
        assert_eq!(validate_title(&"x".repeat(101)), Err(ValidationError::TitleTooLong(100)));
        assert!(validate_title(&"x".repeat(100)).is_ok());
    }

    #[test]
    fn test_description_rules() {
        assert_eq!(validate_description(""), Err(ValidationError::DescriptionRequired));
        assert_eq!(
            validate_description(&"d".repeat(501)),
            Err(ValidationError::DescriptionTooLong(500))
        );
    }

    #[test]
    fn test_candidate_count_bounds() {
        assert_eq!(draft(&["Alice"]).validate(), Err(ValidationError::TooFewCandidates(2)));

        let eleven: Vec<String> = (0..11).map(|i| format!("Candidate {i}")).collect();
        assert_eq!(validate_candidates(&eleven), Err(ValidationError::TooManyCandidates(10)));
    }

    #[test]
    fn test_candidate_names() {
        assert_eq!(draft(&["Alice", " "]).validate(), Err(ValidationError::EmptyCandidate));
        assert_eq!(
            validate_candidates(&["a".repeat(51), "b".to_string()]),
            Err(ValidationError::CandidateTooLong(50))
        );
        assert_eq!(
            draft(&["Alice", " alice "]).validate(),
            Err(ValidationError::DuplicateCandidate)
        );
    }

    #[test]
    fn test_duration_bounds() {
        assert_eq!(validate_duration(0), Err(ValidationError::DurationTooShort(1)));
        assert!(validate_duration(1).is_ok());
        assert!(validate_duration(168).is_ok());
        assert_eq!(validate_duration(169), Err(ValidationError::DurationTooLong));
    }

    #[test]
    fn test_ethereum_address_format() {
        assert!(validate_ethereum_address("0x5FbDB2315678afecb367f032d93F642f64180aa3").is_ok());
        assert!(validate_ethereum_address("5FbDB2315678afecb367f032d93F642f64180aa3").is_err());
        assert!(validate_ethereum_address("0x5FbDB2315678afecb367f032d93F642f64180aa").is_err());
        assert!(validate_ethereum_address("0xZFbDB2315678afecb367f032d93F642f64180aa3").is_err());
    }

    #[test]
    fn test_rating_bounds() {
        assert!(validate_rating(1).is_ok());
        assert!(validate_rating(5).is_ok());
        assert_eq!(
            validate_rating(0),
            Err(ValidationError::RatingOutOfRange { rating: 0, min: 1, max: 5 })
        );
        assert!(validate_rating(6).is_err());
    }

    #[test]
    fn test_subject_rules() {
        assert_eq!(validate_subject("  "), Err(ValidationError::SubjectRequired));
        assert_eq!(
            validate_subject(&"s".repeat(101)).unwrap_err().to_string(),
            "Subject is too long (max 100 characters)"
        );
        assert!(validate_subject("Coffee shop on 5th").is_ok());
    }

    #[test]
    fn test_candidate_index() {
        assert!(validate_candidate_index(2, 3).is_ok());
        assert_eq!(
            validate_candidate_index(3, 3),
            Err(ValidationError::CandidateOutOfRange { index: 3, count: 3 })
        );
    }
}

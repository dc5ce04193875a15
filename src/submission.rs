use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::language::{Language, MAX_SOURCE_BYTES, UnsupportedLanguage};

/// A single piece of user code waiting to be evaluated
///
/// Built once from a queue message body and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireSubmission")]
pub struct Submission {
    #[serde(rename = "submissionId")]
    pub id: String,
    #[serde(rename = "problemId")]
    pub problem_id: String,
    pub code: String,
    #[serde(rename = "lang")]
    pub language: Language,
}

/// Message body as published by the submission service
#[derive(Deserialize)]
struct WireSubmission {
    #[serde(rename = "submissionId")]
    id: String,
    #[serde(rename = "problemId")]
    problem_id: String,
    code: String,
    lang: String,
}

impl TryFrom<WireSubmission> for Submission {
    type Error = DecodeError;

    fn try_from(wire: WireSubmission) -> Result<Self, Self::Error> {
        let language: Language = wire.lang.parse()?;
        if !language.is_supported() {
            return Err(UnsupportedLanguage(wire.lang).into());
        }
        if wire.code.len() > MAX_SOURCE_BYTES {
            return Err(DecodeError::SourceTooLarge(wire.code.len()));
        }

        Ok(Self {
            language,
            id: wire.id,
            problem_id: wire.problem_id,
            code: wire.code,
        })
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed submission: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    UnsupportedLanguage(#[from] UnsupportedLanguage),
    #[error("source of {0} bytes exceeds the {max} byte limit", max = MAX_SOURCE_BYTES)]
    SourceTooLarge(usize),
}

impl Submission {
    /// Decodes a raw queue message body
    ///
    /// Unknown `lang` values surface as [`DecodeError::UnsupportedLanguage`]
    /// rather than being folded into a generic parse failure.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireSubmission = serde_json::from_slice(body)?;
        wire.try_into()
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

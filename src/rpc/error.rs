#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// Errors produced while encoding or decoding RPC payloads.
#[non_exhaustive]
#[derive(Debug)]
pub enum CodecError {
    /// The payload text is not valid JSON, or could not be written as JSON
    Json(serde_json::Error),
    /// The payload decoded to an empty reference table
    EmptyPayload,
    /// A reference slot did not contain a table index
    InvalidReference(String),
    /// A reference pointed outside the table
    DanglingReference(usize),
    /// A cyclic value was converted to a representation that cannot hold cycles
    Cyclic,
    /// A value nested deeper than the given limit was converted to plain JSON
    TooDeep(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "invalid payload JSON: {e}"),
            Self::EmptyPayload => write!(f, "payload reference table is empty"),
            Self::InvalidReference(reference) => {
                write!(f, "invalid payload reference: {reference:?}")
            }
            Self::DanglingReference(index) => {
                write!(f, "payload reference {index} points outside the table")
            }
            Self::Cyclic => write!(f, "value contains a reference cycle"),
            Self::TooDeep(limit) => write!(f, "value is nested deeper than {limit} levels"),
        }
    }
}

impl StdError for CodecError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for crate::error::Error {
    fn from(e: CodecError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Serialization, e)
    }
}

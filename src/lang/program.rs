use super::node::Node;
use serde::{Deserialize, Serialize};

/// Parsed VeryBasic compilation unit: a file, or one REPL entry.
///
/// Procedure definitions appear interleaved with the other top-level
/// statements, in source order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub statements: Vec<Node>,
}

impl Program {
    pub fn new(statements: Vec<Node>) -> Self {
        Program { statements }
    }

    /// Decode a program handed over by an external front end.
    pub fn from_postcard(bytes: &[u8]) -> Result<Program, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    pub fn to_postcard(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }
}

//! Managed names: a textual, escaping-aware encoding of a type/method
//! identity used to address a single test across process and tool
//! boundaries.
//!
//! ```text
//! managed type name:    Namespace.Outer`1+Inner
//! managed method name:  Method`2(System.Int32[],System.Collections.Generic.List`1<!!0>)
//! ```

mod helper;
pub mod metadata;
mod parser;

use thiserror::Error;

pub use helper::{
    escape_identifier, get_managed_hierarchy, get_managed_name, get_managed_name_with, get_method,
    unescape_identifier, ManagedName,
};
pub use metadata::{
    AssemblyMetadata, MethodDefinition, MethodHandle, TypeDefinition, TypeId, TypeReference,
    TypeSignature,
};
pub use parser::{parse_managed_method_name, parse_managed_type_name, ParsedMethodName};

/// Positions of the levels in a managed hierarchy.
pub mod hierarchy {
    pub const CONTAINER: usize = 0;
    pub const NAMESPACE: usize = 1;
    pub const CLASS: usize = 2;
    pub const TEST_GROUP: usize = 3;
    pub const TOTAL_LEVELS: usize = 4;

    pub const LABELS: [&str; TOTAL_LEVELS] = ["Container", "Namespace", "Class", "TestGroup"];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedNameErrorKind {
    WhitespaceNotValid,
    ArityNotNumeric,
    IncompleteManagedName,
    UnexpectedCharacter,
    TypeNotFound,
    MethodNotFound,
    AmbiguousMethod,
}

/// A managed name could not be parsed or resolved.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct InvalidManagedNameError {
    pub kind: ManagedNameErrorKind,
    pub message: String,
    /// Character index of the offending input, when there is one.
    pub index: Option<usize>,
}

impl InvalidManagedNameError {
    pub(crate) fn new(kind: ManagedNameErrorKind, message: String) -> Self {
        Self { kind, message, index: None }
    }

    pub(crate) fn at(kind: ManagedNameErrorKind, index: usize, message: String) -> Self {
        Self { kind, message, index: Some(index) }
    }

    /// The input with a caret under the offending character.
    pub fn context(&self, input: &str) -> Option<String> {
        let index = self.index?;
        Some(format!("{}\n{}^", input, " ".repeat(index)))
    }
}

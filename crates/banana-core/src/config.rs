//! Codec configuration.

use crate::constraint::Constraint;

/// How long OPEN indices and the objects they name stay referenceable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceScope {
    /// Counter and tables reset after every top-level object
    #[default]
    PerObject,
    /// Counter and tables live as long as the connection
    Connection,
}

/// Limits and policies for one codec instance.
///
/// Both peers must agree on `reference_scope`; the limits are local.
#[derive(Debug, Clone)]
pub struct BananaConfig {
    /// Largest STRING body accepted anywhere
    pub max_string_length: usize,
    /// Largest STRING accepted as an OPEN index token
    pub max_index_length: usize,
    /// Largest OPEN index accepted before the connection is dropped
    pub max_open_index: u64,
    /// Deepest nesting of open objects; deeper OPENs are rejected and skipped
    pub max_depth: usize,
    /// Reference scope policy
    pub reference_scope: ReferenceScope,
    /// Constraint applied to every top-level object
    pub root_constraint: Option<Constraint>,
}

impl Default for BananaConfig {
    fn default() -> Self {
        Self {
            max_string_length: 1024 * 1024,
            max_index_length: 64,
            max_open_index: 1 << 20,
            max_depth: 256,
            reference_scope: ReferenceScope::PerObject,
            root_constraint: None,
        }
    }
}

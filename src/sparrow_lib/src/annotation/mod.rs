//! External-function annotation tables.
//!
//! The analyses cannot look into external library functions; their behavior
//! is described by three text-file tables instead:
//!
//! - the [pointer table](pointer): allocation and pointer-copy effects,
//! - the [mod-ref table](mod_ref): which memory a call may read or write,
//! - the [taint table](taint): taint sources, pipes and sinks.
//!
//! All three formats are line-oriented: whitespace is permitted freely and
//! lines beginning with `#` are comments. They are parsed by the shared
//! recursive-descent [`parser`]; a parse failure is fatal and reports file,
//! line and column.

use crate::prelude::*;
use std::fmt;

pub mod mod_ref;
pub mod parser;
pub mod pointer;
pub mod taint;

pub use mod_ref::ExternalModRefTable;
pub use pointer::ExternalPointerTable;
pub use taint::ExternalTaintTable;

/// A position in a call: the return value, a single argument, or all
/// arguments from an index onward (the variadic tail).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum APosition {
    Ret,
    Arg(u8),
    AfterArg(u8),
}

impl APosition {
    pub fn is_return(self) -> bool {
        matches!(self, APosition::Ret)
    }

    /// Expand the position into concrete argument indices for a call with
    /// `num_args` arguments. Returns an empty list for `Ret`.
    pub fn argument_indices(self, num_args: usize) -> Vec<usize> {
        match self {
            APosition::Ret => Vec::new(),
            APosition::Arg(i) => {
                if (i as usize) < num_args {
                    vec![i as usize]
                } else {
                    Vec::new()
                }
            }
            APosition::AfterArg(i) => (i as usize..num_args).collect(),
        }
    }

    /// Whether the position names at least one argument of a call with
    /// `num_args` arguments.
    pub fn in_range(self, num_args: usize) -> bool {
        match self {
            APosition::Ret => true,
            APosition::Arg(i) => (i as usize) < num_args,
            APosition::AfterArg(i) => (i as usize) < num_args,
        }
    }
}

impl fmt::Display for APosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            APosition::Ret => write!(f, "Ret"),
            APosition::Arg(i) => write!(f, "Arg{i}"),
            APosition::AfterArg(i) => write!(f, "AfterArg{i}"),
        }
    }
}

/// How to interpret the data a position refers to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TClass {
    /// The SSA value itself.
    ValueOnly,
    /// The memory directly pointed to by the value.
    DirectMemory,
    /// All memory reachable from the value by a type-layout walk.
    ReachableMemory,
}

impl fmt::Display for TClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TClass::ValueOnly => write!(f, "V"),
            TClass::DirectMemory => write!(f, "D"),
            TClass::ReachableMemory => write!(f, "R"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_expansion() {
        assert_eq!(APosition::Arg(1).argument_indices(3), vec![1]);
        assert_eq!(APosition::Arg(5).argument_indices(3), Vec::<usize>::new());
        assert_eq!(APosition::AfterArg(1).argument_indices(4), vec![1, 2, 3]);
        assert!(APosition::Ret.argument_indices(2).is_empty());
        assert!(!APosition::Arg(2).in_range(2));
        assert!(APosition::AfterArg(1).in_range(2));
    }
}

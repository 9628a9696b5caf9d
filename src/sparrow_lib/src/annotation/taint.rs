//! The external taint table.
//!
//! Grammar (literal tokens, one entry per line):
//!
//! ```text
//! SOURCE <id> (Ret|Arg<i>|AfterArg<i>) (V|D|R) (T|U|E)
//! PIPE   <id> (Ret|Arg<i>|AfterArg<i>) (V|D|R) Arg<i> (V|D|R)
//! SINK   <id> (Arg<i>|AfterArg<i>)     (V|D)
//! IGNORE <id>
//! ```
//!
//! Classes: `V` = ValueOnly, `D` = DirectMemory, `R` = ReachableMemory.
//! Lattice values: `T` = Tainted, `U` = Untainted, `E` = Either. Examples:
//!
//! ```text
//! SOURCE getenv Ret V T
//! PIPE   memcpy Arg1 R Arg0 R
//! SINK   system Arg0 V
//! IGNORE strlen
//! ```

use super::parser::{Cursor, ParseError};
use super::{APosition, TClass};
use crate::analysis::taint::lattice::TaintLattice;
use crate::prelude::*;
use std::collections::HashMap;

/// One taint entry of an external function.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaintEntry {
    /// Inject the given lattice value at the position.
    Source {
        pos: APosition,
        class: TClass,
        value: TaintLattice,
    },
    /// Copy the taint from `src` (with `src_class`) to `dst` (with
    /// `dst_class`).
    Pipe {
        src: APosition,
        src_class: TClass,
        dst: APosition,
        dst_class: TClass,
    },
    /// The position must be untainted; checked after the fixpoint.
    Sink { pos: APosition, class: TClass },
}

/// All taint entries of one external function. An empty list means the
/// function is explicitly ignored.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TaintSummary {
    pub entries: Vec<TaintEntry>,
}

impl TaintSummary {
    /// Whether any entry of the summary is a sink.
    pub fn has_sink(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, TaintEntry::Sink { .. }))
    }
}

/// The table mapping external-function names to their taint summaries.
#[derive(Debug, Clone, Default)]
pub struct ExternalTaintTable {
    map: HashMap<String, TaintSummary>,
}

impl ExternalTaintTable {
    pub fn new() -> Self {
        ExternalTaintTable::default()
    }

    /// Look up the summary for a function name. `None` means the function is
    /// not annotated at all (as opposed to explicitly ignored).
    pub fn lookup(&self, name: &str) -> Option<&TaintSummary> {
        self.map.get(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Parse a table from file content.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut table = ExternalTaintTable::new();
        let mut cursor = Cursor::new(text);
        while !cursor.at_end() {
            if cursor.eat_keyword("SOURCE") {
                let name = cursor.identifier()?;
                let pos = cursor.position()?;
                let class = taint_class(&mut cursor)?;
                let value = lattice_value(&mut cursor)?;
                table
                    .map
                    .entry(name)
                    .or_default()
                    .entries
                    .push(TaintEntry::Source { pos, class, value });
            } else if cursor.eat_keyword("PIPE") {
                let name = cursor.identifier()?;
                let src = cursor.position()?;
                let src_class = taint_class(&mut cursor)?;
                let dst = cursor.position()?;
                if !matches!(dst, APosition::Arg(_)) {
                    return Err(cursor.error("PIPE destination must be Arg<i>"));
                }
                let dst_class = taint_class(&mut cursor)?;
                table.map.entry(name).or_default().entries.push(TaintEntry::Pipe {
                    src,
                    src_class,
                    dst,
                    dst_class,
                });
            } else if cursor.eat_keyword("SINK") {
                let name = cursor.identifier()?;
                let pos = cursor.position()?;
                if pos.is_return() {
                    return Err(cursor.error("SINK position must be Arg<i> or AfterArg<i>"));
                }
                let class = taint_class(&mut cursor)?;
                if class == TClass::ReachableMemory {
                    return Err(cursor.error("SINK class must be V or D"));
                }
                table
                    .map
                    .entry(name)
                    .or_default()
                    .entries
                    .push(TaintEntry::Sink { pos, class });
            } else if cursor.eat_keyword("IGNORE") {
                let name = cursor.identifier()?;
                table.map.entry(name).or_default();
            } else {
                return Err(cursor.error("expected SOURCE, PIPE, SINK or IGNORE"));
            }
        }
        Ok(table)
    }

    /// Load a table from a file. Parse errors are fatal and name the file.
    pub fn load_from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read taint annotation file {path}"))?;
        Self::parse(&text).map_err(|e| anyhow!("{path}: {e}"))
    }
}

fn taint_class(cursor: &mut Cursor) -> Result<TClass, ParseError> {
    let word = cursor.word()?;
    match word {
        "V" => Ok(TClass::ValueOnly),
        "D" => Ok(TClass::DirectMemory),
        "R" => Ok(TClass::ReachableMemory),
        _ => Err(cursor.error(format!("expected V, D or R, found `{word}`"))),
    }
}

fn lattice_value(cursor: &mut Cursor) -> Result<TaintLattice, ParseError> {
    let word = cursor.word()?;
    match word {
        "T" => Ok(TaintLattice::Tainted),
        "U" => Ok(TaintLattice::Untainted),
        "E" => Ok(TaintLattice::Either),
        _ => Err(cursor.error(format!("expected T, U or E, found `{word}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all_entry_kinds() {
        let table = ExternalTaintTable::parse(
            "# taint annotations\n\
             SOURCE getenv Ret V T\n\
             PIPE   memcpy Arg1 R Arg0 R\n\
             SINK   system Arg0 V\n\
             SINK   execv  AfterArg0 V\n\
             IGNORE strlen\n",
        )
        .unwrap();
        assert_eq!(
            table.lookup("getenv").unwrap().entries,
            vec![TaintEntry::Source {
                pos: APosition::Ret,
                class: TClass::ValueOnly,
                value: TaintLattice::Tainted,
            }]
        );
        assert!(table.lookup("system").unwrap().has_sink());
        assert!(table.lookup("strlen").unwrap().entries.is_empty());
        assert!(table.lookup("memset").is_none());
    }

    #[test]
    fn sink_rejects_ret_and_reachable() {
        assert!(ExternalTaintTable::parse("SINK system Ret V\n").is_err());
        assert!(ExternalTaintTable::parse("SINK system Arg0 R\n").is_err());
    }

    #[test]
    fn pipe_destination_must_be_single_arg() {
        assert!(ExternalTaintTable::parse("PIPE f Arg0 V Ret V\n").is_err());
        assert!(ExternalTaintTable::parse("PIPE f Arg0 V AfterArg1 V\n").is_err());
    }

    #[test]
    fn error_reports_line_and_column() {
        let err = ExternalTaintTable::parse("SOURCE getenv Ret V T\nBOGUS x\n").unwrap_err();
        assert_eq!(err.line, 2);
    }
}

//! The external pointer-effect table.
//!
//! Grammar (one entry per line):
//!
//! ```text
//! FUNC_NAME  ALLOC  SIZE_POSITION?          # size position is an arg index or omitted
//! FUNC_NAME  COPY   SRC_SPEC  DST_SPEC
//! FUNC_NAME  EXIT
//! FUNC_NAME  IGNORE
//! ```
//!
//! Positions are `Ret`, `Arg<i>` or `AfterArg<i>`. A copy spec is a class
//! token juxtaposed with a position: `ValueArg0`, `DirectMemRet`,
//! `ReachMemArg1` — or one of the position-free sources `Universal`, `Null`
//! and `Static`. Examples:
//!
//! ```text
//! malloc  ALLOC  Arg0
//! strdup  ALLOC
//! memcpy  COPY  ReachMemArg1  ReachMemArg0
//! getenv  COPY  Static        ValueRet
//! exit    EXIT
//! atoi    IGNORE
//! ```

use super::parser::{Cursor, ParseError};
use super::APosition;
use crate::prelude::*;
use std::collections::HashMap;

/// Where the points-to data of a copy effect comes from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopySource {
    /// The points-to set of the value at the position.
    Value(APosition),
    /// The sets stored in the memory directly pointed to by the value.
    DirectMemory(APosition),
    /// The sets stored in all memory reachable from the value.
    ReachableMemory(APosition),
    /// The universal points-to set.
    Universal,
    /// The null points-to set.
    Null,
    /// A fresh static memory region owned by the external library.
    Static,
}

/// Where the points-to data of a copy effect goes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyDest {
    Value(APosition),
    DirectMemory(APosition),
    ReachableMemory(APosition),
}

impl CopyDest {
    pub fn position(self) -> APosition {
        match self {
            CopyDest::Value(p) | CopyDest::DirectMemory(p) | CopyDest::ReachableMemory(p) => p,
        }
    }
}

/// One pointer effect of an external function.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum PointerEffect {
    /// The call allocates fresh memory returned through `Ret`. If a size
    /// position is given and the size matches the layout of the allocation's
    /// inferred type, that layout is used; otherwise the byte-array layout.
    Alloc { size_position: Option<APosition> },
    /// The call copies pointer data from `src` to `dst`.
    Copy { src: CopySource, dst: CopyDest },
    /// The call never returns.
    Exit,
}

/// All pointer effects of one external function. An empty effect list means
/// the function is explicitly ignored.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PointerSummary {
    pub effects: Vec<PointerEffect>,
}

/// The table mapping external-function names to their pointer summaries.
#[derive(Debug, Clone, Default)]
pub struct ExternalPointerTable {
    map: HashMap<String, PointerSummary>,
}

impl ExternalPointerTable {
    pub fn new() -> Self {
        ExternalPointerTable::default()
    }

    /// Look up the summary for a function name. `None` means the function is
    /// not annotated at all (as opposed to explicitly ignored).
    pub fn lookup(&self, name: &str) -> Option<&PointerSummary> {
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
        let mut table = ExternalPointerTable::new();
        let mut cursor = Cursor::new(text);
        while !cursor.at_end() {
            let name = cursor.identifier()?;
            let summary = table.map.entry(name).or_default();
            if cursor.eat_keyword("ALLOC") {
                let size_position = maybe_position(&mut cursor)?;
                summary.effects.push(PointerEffect::Alloc { size_position });
            } else if cursor.eat_keyword("COPY") {
                let src = copy_source(&mut cursor)?;
                let dst = copy_dest(&mut cursor)?;
                summary.effects.push(PointerEffect::Copy { src, dst });
            } else if cursor.eat_keyword("EXIT") {
                summary.effects.push(PointerEffect::Exit);
            } else if cursor.eat_keyword("IGNORE") {
                // Ignoring a function is just an entry without effects.
            } else {
                return Err(cursor.error("expected ALLOC, COPY, EXIT or IGNORE"));
            }
        }
        Ok(table)
    }

    /// Load a table from a file. Parse errors are fatal and name the file.
    pub fn load_from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read pointer annotation file {path}"))?;
        Self::parse(&text).map_err(|e| anyhow!("{path}: {e}"))
    }
}

fn maybe_position(cursor: &mut Cursor) -> Result<Option<APosition>, ParseError> {
    // The size position is optional; the next token may already be the next
    // entry's function name.
    let mut probe = cursor.snapshot();
    if let Ok(pos) = probe.position() {
        cursor.restore(probe);
        return Ok(Some(pos));
    }
    Ok(None)
}

fn copy_source(cursor: &mut Cursor) -> Result<CopySource, ParseError> {
    let word = cursor.word()?;
    match word {
        "Universal" => return Ok(CopySource::Universal),
        "Null" => return Ok(CopySource::Null),
        "Static" => return Ok(CopySource::Static),
        _ => (),
    }
    let (class, pos) = split_class_position(cursor, word)?;
    Ok(match class {
        "Value" => CopySource::Value(pos),
        "DirectMem" => CopySource::DirectMemory(pos),
        "ReachMem" => CopySource::ReachableMemory(pos),
        _ => return Err(cursor.error(format!("unknown copy source `{word}`"))),
    })
}

fn copy_dest(cursor: &mut Cursor) -> Result<CopyDest, ParseError> {
    let word = cursor.word()?;
    let (class, pos) = split_class_position(cursor, word)?;
    Ok(match class {
        "Value" => CopyDest::Value(pos),
        "DirectMem" => CopyDest::DirectMemory(pos),
        "ReachMem" => CopyDest::ReachableMemory(pos),
        _ => return Err(cursor.error(format!("unknown copy destination `{word}`"))),
    })
}

/// Split a juxtaposed class+position token like `ValueArg0` or
/// `DirectMemRet`.
fn split_class_position<'a>(
    cursor: &Cursor,
    word: &'a str,
) -> Result<(&'a str, APosition), ParseError> {
    for class in ["Value", "DirectMem", "ReachMem"] {
        if let Some(rest) = word.strip_prefix(class) {
            let mut sub = Cursor::new(rest);
            let pos = sub
                .position()
                .map_err(|_| cursor.error(format!("invalid position in `{word}`")))?;
            return Ok((class, pos));
        }
    }
    Err(cursor.error(format!("unknown copy spec `{word}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_alloc_and_copy() {
        let table = ExternalPointerTable::parse(
            "# allocators\n\
             malloc  ALLOC Arg0\n\
             strdup  ALLOC\n\
             memcpy  COPY ReachMemArg1 ReachMemArg0\n\
             getenv  COPY Static ValueRet\n\
             exit    EXIT\n\
             atoi    IGNORE\n",
        )
        .unwrap();
        assert_eq!(
            table.lookup("malloc").unwrap().effects,
            vec![PointerEffect::Alloc {
                size_position: Some(APosition::Arg(0))
            }]
        );
        assert_eq!(
            table.lookup("strdup").unwrap().effects,
            vec![PointerEffect::Alloc {
                size_position: None
            }]
        );
        assert_eq!(
            table.lookup("memcpy").unwrap().effects,
            vec![PointerEffect::Copy {
                src: CopySource::ReachableMemory(APosition::Arg(1)),
                dst: CopyDest::ReachableMemory(APosition::Arg(0)),
            }]
        );
        assert!(table.lookup("atoi").unwrap().effects.is_empty());
        assert!(table.lookup("unknown").is_none());
    }

    #[test]
    fn multiple_effects_accumulate() {
        let table =
            ExternalPointerTable::parse("realloc ALLOC Arg1\nrealloc COPY DirectMemArg0 DirectMemRet\n")
                .unwrap();
        assert_eq!(table.lookup("realloc").unwrap().effects.len(), 2);
    }

    #[test]
    fn parse_error_has_location() {
        let err = ExternalPointerTable::parse("malloc FROBNICATE\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("expected ALLOC"));
    }
}

//! The external mod-ref table.
//!
//! Grammar (one entry per line):
//!
//! ```text
//! FUNC_NAME  MOD  POSITION  REACH?          # REACH switches to reachable memory
//! FUNC_NAME  REF  POSITION  REACH?
//! FUNC_NAME  IGNORE
//! ```
//!
//! Examples:
//!
//! ```text
//! memcpy  MOD Arg0 REACH
//! memcpy  REF Arg1 REACH
//! gets    MOD Arg0
//! atoi    REF Arg0
//! ```

use super::parser::{Cursor, ParseError};
use super::APosition;
use crate::prelude::*;
use std::collections::HashMap;

/// Whether an effect modifies or only references memory.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModRefType {
    Mod,
    Ref,
}

/// One mod or ref effect of an external function.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRefEffect {
    pub kind: ModRefType,
    pub pos: APosition,
    /// If set, the effect applies to all memory reachable from the position
    /// instead of only the directly pointed-to memory.
    pub reach: bool,
}

impl ModRefEffect {
    pub fn is_mod(&self) -> bool {
        self.kind == ModRefType::Mod
    }

    pub fn is_ref(&self) -> bool {
        self.kind == ModRefType::Ref
    }
}

/// The table mapping external-function names to their mod-ref effects.
#[derive(Debug, Clone, Default)]
pub struct ExternalModRefTable {
    map: HashMap<String, Vec<ModRefEffect>>,
}

impl ExternalModRefTable {
    pub fn new() -> Self {
        ExternalModRefTable::default()
    }

    /// Look up the effects for a function name. `None` means the function is
    /// not annotated.
    pub fn lookup(&self, name: &str) -> Option<&[ModRefEffect]> {
        self.map.get(name).map(|v| v.as_slice())
    }

    /// Parse a table from file content.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut table = ExternalModRefTable::new();
        let mut cursor = Cursor::new(text);
        while !cursor.at_end() {
            let name = cursor.identifier()?;
            let effects = table.map.entry(name).or_default();
            let kind = if cursor.eat_keyword("MOD") {
                ModRefType::Mod
            } else if cursor.eat_keyword("REF") {
                ModRefType::Ref
            } else if cursor.eat_keyword("IGNORE") {
                continue;
            } else {
                return Err(cursor.error("expected MOD, REF or IGNORE"));
            };
            let pos = cursor.position()?;
            let reach = cursor.eat_keyword("REACH");
            effects.push(ModRefEffect { kind, pos, reach });
        }
        Ok(table)
    }

    /// Load a table from a file. Parse errors are fatal and name the file.
    pub fn load_from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read mod-ref annotation file {path}"))?;
        Self::parse(&text).map_err(|e| anyhow!("{path}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mod_and_ref() {
        let table = ExternalModRefTable::parse(
            "memcpy MOD Arg0 REACH\n\
             memcpy REF Arg1 REACH\n\
             gets   MOD Arg0\n\
             free   IGNORE\n",
        )
        .unwrap();
        let memcpy = table.lookup("memcpy").unwrap();
        assert_eq!(memcpy.len(), 2);
        assert!(memcpy[0].is_mod() && memcpy[0].reach);
        assert!(memcpy[1].is_ref() && memcpy[1].reach);
        let gets = table.lookup("gets").unwrap();
        assert_eq!(
            gets,
            &[ModRefEffect {
                kind: ModRefType::Mod,
                pos: APosition::Arg(0),
                reach: false
            }]
        );
        assert_eq!(table.lookup("free").unwrap().len(), 0);
    }

    #[test]
    fn reject_bad_keyword() {
        let err = ExternalModRefTable::parse("foo WRITES Arg0\n").unwrap_err();
        assert!(err.message.contains("expected MOD"));
    }
}

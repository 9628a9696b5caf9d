//! The typed SSA intermediate representation that the analyses operate on.
//!
//! The IR is produced by an external front end and reaches this crate as a
//! serialized [`Module`] (the on-disk `.ir` format is the serde_json encoding
//! of the module). Parsing and canonicalization of source languages is out of
//! scope here; tests construct modules programmatically through
//! [`builder::ModuleBuilder`].
//!
//! Everything in the module is referred to by small index types
//! ([`ValueId`], [`FuncId`], ...) into the owning tables of the module, so
//! the cyclic SSA graph contains no owning cycles.

use crate::prelude::*;
use std::fmt;

pub mod builder;
pub mod types;

pub use types::{Type, TypeTable};

/// Index of a type in the module's [`TypeTable`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Index of an SSA value in [`Module::values`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Index of a global variable in [`Module::globals`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub u32);

/// Index of a function in [`Module::functions`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

/// Index of a basic block inside its function.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Identifies one instruction: function, block and position inside the block.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstRef {
    pub func: FuncId,
    pub block: BlockId,
    pub index: u32,
}

impl fmt::Display for InstRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fn{}:bb{}:i{}",
            self.func.0, self.block.0, self.index
        )
    }
}

/// A whole program: types, globals, functions and the SSA value table.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Module {
    /// The module name, used only for diagnostics.
    pub name: String,
    /// All types referenced by the module.
    pub types: TypeTable,
    /// Global variables, including their (optional) pointer initializers.
    pub globals: Vec<GlobalVariable>,
    /// Function definitions and declarations.
    pub functions: Vec<Function>,
    /// The SSA value table. Every argument, instruction result, global
    /// address, function address and constant has exactly one entry here.
    pub values: Vec<ValueData>,
}

/// A global variable. Its [`GlobalVariable::value`] is the SSA value holding
/// the address of the global.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GlobalVariable {
    pub name: String,
    /// The pointee type of the global.
    pub ty: TypeId,
    /// The address-of-global SSA value.
    pub value: ValueId,
    /// Pointer-valued initializers as (byte offset, initializing value)
    /// pairs. Only global and function addresses and null are meaningful
    /// initializer values for the analysis.
    pub initializers: Vec<(u64, ValueId)>,
}

/// A function definition or declaration. Declarations have no blocks and are
/// resolved through the external annotation tables during analysis.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Function {
    pub name: String,
    /// The formal parameters, in order. Each entry is an `Argument` value.
    pub params: Vec<ValueId>,
    pub return_type: TypeId,
    pub blocks: Vec<Block>,
    /// The address-of-function SSA value.
    pub value: ValueId,
}

impl Function {
    /// Whether this function is an external declaration without a body.
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// A basic block. The terminator is the last instruction of `insts`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Block {
    pub insts: Vec<Inst>,
}

/// One SSA instruction together with its result value (if it produces one).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Inst {
    pub result: Option<ValueId>,
    pub kind: InstKind,
}

/// The byte offset computed by a `Gep` instruction.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GepOffset {
    /// A compile-time-constant byte offset from the base pointer.
    Constant(u64),
    /// An index into an array region with the given element stride; the index
    /// itself is not statically known.
    ArrayIndex { index: ValueId, stride: u64 },
}

/// Instruction kinds. Value-producing arithmetic, comparisons, casts and
/// aggregate extractions are collapsed into `Compute`: the analyses only care
/// about which operands flow into the result, never about the operation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum InstKind {
    /// Reserve a stack slot of the given pointee type; the result is the
    /// address of the slot.
    Alloca { ty: TypeId },
    /// A pure value operation over the given operands.
    Compute { operands: Vec<ValueId> },
    /// SSA merge of the incoming values.
    Phi { incoming: Vec<ValueId> },
    /// Conditional value selection.
    Select {
        cond: ValueId,
        true_value: ValueId,
        false_value: ValueId,
    },
    /// Pointer offset computation.
    Gep { base: ValueId, offset: GepOffset },
    /// Read the cell the address points to.
    Load { address: ValueId },
    /// Write `value` into the cell the address points to.
    Store { address: ValueId, value: ValueId },
    /// Direct or indirect call. `callee` is a function address value for
    /// direct calls and an arbitrary pointer value for indirect ones.
    Call { callee: ValueId, args: Vec<ValueId> },
    /// Branch to one of `targets`, conditionally if `cond` is set.
    Branch {
        cond: Option<ValueId>,
        targets: Vec<BlockId>,
    },
    /// Return from the current function.
    Return { value: Option<ValueId> },
    /// A block that is never reached.
    Unreachable,
}

impl InstKind {
    /// All SSA operands of the instruction, in a fixed order.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            InstKind::Alloca { .. } | InstKind::Unreachable => Vec::new(),
            InstKind::Compute { operands } => operands.clone(),
            InstKind::Phi { incoming } => incoming.clone(),
            InstKind::Select {
                cond,
                true_value,
                false_value,
            } => vec![*cond, *true_value, *false_value],
            InstKind::Gep { base, offset } => match offset {
                GepOffset::Constant(_) => vec![*base],
                GepOffset::ArrayIndex { index, .. } => vec![*base, *index],
            },
            InstKind::Load { address } => vec![*address],
            InstKind::Store { address, value } => vec![*address, *value],
            InstKind::Call { callee, args } => {
                let mut ops = vec![*callee];
                ops.extend_from_slice(args);
                ops
            }
            InstKind::Branch { cond, .. } => cond.iter().copied().collect(),
            InstKind::Return { value } => value.iter().copied().collect(),
        }
    }
}

/// What an SSA value is.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// The `index`-th formal parameter of `func`.
    Argument { func: FuncId, index: u32 },
    /// The result of the referenced instruction.
    Result(InstRef),
    /// The address of a global variable.
    Global(GlobalId),
    /// The address of a function.
    Function(FuncId),
    /// An integer constant.
    ConstantInt(i64),
    /// The null pointer constant.
    ConstantNull,
    /// An undefined value.
    Undef,
}

/// One entry of the SSA value table.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ValueData {
    pub ty: TypeId,
    /// Optional source-level name, used only for diagnostics.
    pub name: Option<String>,
    pub kind: ValueKind,
}

impl Module {
    pub fn value(&self, v: ValueId) -> &ValueData {
        &self.values[v.0 as usize]
    }

    pub fn func(&self, f: FuncId) -> &Function {
        &self.functions[f.0 as usize]
    }

    pub fn global(&self, g: GlobalId) -> &GlobalVariable {
        &self.globals[g.0 as usize]
    }

    pub fn inst(&self, r: InstRef) -> &Inst {
        &self.functions[r.func.0 as usize].blocks[r.block.0 as usize].insts[r.index as usize]
    }

    /// Look up a function by name.
    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    /// The program entry function, conventionally named `main`.
    pub fn entry_function(&self) -> Option<FuncId> {
        self.function_by_name("main")
    }

    /// Whether the value has pointer type.
    pub fn is_pointer_value(&self, v: ValueId) -> bool {
        self.types.is_pointer(self.value(v).ty)
    }

    /// Whether the value is a global or function address. Such values are
    /// context-independent and may be collapsed to the global context.
    pub fn is_global_value(&self, v: ValueId) -> bool {
        matches!(
            self.value(v).kind,
            ValueKind::Global(_) | ValueKind::Function(_)
        )
    }

    /// Whether the value is a constant (and thus never carries taint of its
    /// own).
    pub fn is_constant_value(&self, v: ValueId) -> bool {
        matches!(
            self.value(v).kind,
            ValueKind::Global(_)
                | ValueKind::Function(_)
                | ValueKind::ConstantInt(_)
                | ValueKind::ConstantNull
                | ValueKind::Undef
        )
    }

    /// A human-readable rendering of a value for diagnostics.
    pub fn display_value(&self, v: ValueId) -> String {
        let data = self.value(v);
        match &data.kind {
            ValueKind::Global(g) => format!("@{}", self.global(*g).name),
            ValueKind::Function(f) => format!("@{}", self.func(*f).name),
            ValueKind::ConstantInt(i) => format!("{i}"),
            ValueKind::ConstantNull => "null".to_string(),
            ValueKind::Undef => "undef".to_string(),
            ValueKind::Argument { .. } | ValueKind::Result(_) => match &data.name {
                Some(name) => format!("%{name}"),
                None => format!("%v{}", v.0),
            },
        }
    }

    /// A human-readable rendering of an instruction site for diagnostics.
    pub fn display_site(&self, site: InstRef) -> String {
        format!("{}:{}", self.func(site.func).name, site)
    }

    /// Consistency checks on the value table; a violation here is a front-end
    /// bug and aborts the analysis.
    pub fn validate(&self) -> Result<()> {
        for (idx, func) in self.functions.iter().enumerate() {
            for (pidx, param) in func.params.iter().enumerate() {
                match &self.value(*param).kind {
                    ValueKind::Argument { func: f, index } if f.0 as usize == idx => {
                        if *index as usize != pidx {
                            bail!("function {}: parameter {pidx} has index {index}", func.name);
                        }
                    }
                    _ => bail!("function {}: parameter {pidx} is not an argument value", func.name),
                }
            }
            for (bidx, block) in func.blocks.iter().enumerate() {
                for (iidx, inst) in block.insts.iter().enumerate() {
                    if let Some(result) = inst.result {
                        let expected = InstRef {
                            func: FuncId(idx as u32),
                            block: BlockId(bidx as u32),
                            index: iidx as u32,
                        };
                        if self.value(result).kind != ValueKind::Result(expected) {
                            bail!(
                                "function {}: result of {expected} is not linked to its value",
                                func.name
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::builder::ModuleBuilder;
    use super::*;

    #[test]
    fn value_display() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let g = b.add_global("gvar", i32_ty);
        let module = b.finish();
        let gval = module.global(g).value;
        assert_eq!(module.display_value(gval), "@gvar");
        assert!(module.is_pointer_value(gval));
        assert!(module.is_global_value(gval));
    }

    #[test]
    fn module_validation() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let f = b.begin_function("main", &[], i32_ty);
        let zero = b.const_int(0);
        b.ret(Some(zero));
        b.end_function(f);
        let module = b.finish();
        assert!(module.validate().is_ok());
        assert_eq!(module.entry_function(), Some(f));
    }
}

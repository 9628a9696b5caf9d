//! Programmatic construction of IR modules.
//!
//! The builder is primarily used by tests, which assemble small programs the
//! same way an external front end would emit them. It keeps the value table
//! and the instruction stream consistent (result values are linked to their
//! defining instructions) so that [`Module::validate`] passes by
//! construction.

use super::types::Type;
use super::*;

/// Incrementally builds a [`Module`].
///
/// Functions are built one at a time: [`ModuleBuilder::begin_function`]
/// opens a definition, the instruction methods append to the current block,
/// and [`ModuleBuilder::end_function`] closes it. Blocks are created with
/// [`ModuleBuilder::block`] and selected with [`ModuleBuilder::switch_to`].
pub struct ModuleBuilder {
    module: Module,
    current_func: Option<FuncId>,
    current_block: BlockId,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        ModuleBuilder {
            module: Module {
                name: name.to_string(),
                types: TypeTable::new(),
                globals: Vec::new(),
                functions: Vec::new(),
                values: Vec::new(),
            },
            current_func: None,
            current_block: BlockId(0),
        }
    }

    // ---- types ----

    pub fn void_type(&mut self) -> TypeId {
        self.module.types.intern(Type::Void)
    }

    pub fn int_type(&mut self, bits: u32) -> TypeId {
        self.module.types.intern(Type::Int { bits })
    }

    pub fn pointer_type(&mut self, pointee: TypeId) -> TypeId {
        self.module.types.intern(Type::Pointer { pointee })
    }

    pub fn array_type(&mut self, element: TypeId, len: u64) -> TypeId {
        self.module.types.intern(Type::Array { element, len })
    }

    pub fn struct_type(&mut self, fields: &[TypeId]) -> TypeId {
        self.module.types.intern(Type::Struct {
            fields: fields.to_vec(),
        })
    }

    // ---- values ----

    fn add_value(&mut self, ty: TypeId, name: Option<String>, kind: ValueKind) -> ValueId {
        self.module.values.push(ValueData { ty, name, kind });
        ValueId((self.module.values.len() - 1) as u32)
    }

    pub fn const_int(&mut self, value: i64) -> ValueId {
        let ty = self.int_type(64);
        self.add_value(ty, None, ValueKind::ConstantInt(value))
    }

    pub fn const_null(&mut self, pointee: TypeId) -> ValueId {
        let ty = self.pointer_type(pointee);
        self.add_value(ty, None, ValueKind::ConstantNull)
    }

    pub fn undef(&mut self, ty: TypeId) -> ValueId {
        self.add_value(ty, None, ValueKind::Undef)
    }

    // ---- globals ----

    /// Add a global variable with the given pointee type. The returned id can
    /// be resolved to its address value via `module.global(id).value`.
    pub fn add_global(&mut self, name: &str, ty: TypeId) -> GlobalId {
        let id = GlobalId(self.module.globals.len() as u32);
        let ptr_ty = self.pointer_type(ty);
        let value = self.add_value(ptr_ty, Some(name.to_string()), ValueKind::Global(id));
        self.module.globals.push(GlobalVariable {
            name: name.to_string(),
            ty,
            value,
            initializers: Vec::new(),
        });
        id
    }

    /// The address value of a global.
    pub fn global_value(&self, g: GlobalId) -> ValueId {
        self.module.globals[g.0 as usize].value
    }

    /// Record a pointer-valued initializer at the given byte offset of the
    /// global.
    pub fn set_initializer(&mut self, g: GlobalId, offset: u64, value: ValueId) {
        self.module.globals[g.0 as usize]
            .initializers
            .push((offset, value));
    }

    // ---- functions ----

    fn add_function(&mut self, name: &str, param_tys: &[TypeId], ret: TypeId) -> FuncId {
        let id = FuncId(self.module.functions.len() as u32);
        let fn_ty = self.module.types.intern(Type::Function {
            params: param_tys.to_vec(),
            ret,
        });
        // The address of a function is a pointer value.
        let fn_ptr_ty = self.pointer_type(fn_ty);
        let value = self.add_value(fn_ptr_ty, Some(name.to_string()), ValueKind::Function(id));
        let params = param_tys
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                self.add_value(
                    *ty,
                    None,
                    ValueKind::Argument {
                        func: id,
                        index: i as u32,
                    },
                )
            })
            .collect();
        self.module.functions.push(Function {
            name: name.to_string(),
            params,
            return_type: ret,
            blocks: Vec::new(),
            value,
        });
        id
    }

    /// Declare an external function (no body).
    pub fn declare_function(&mut self, name: &str, param_tys: &[TypeId], ret: TypeId) -> FuncId {
        self.add_function(name, param_tys, ret)
    }

    /// Open a function definition with one (empty) entry block.
    pub fn begin_function(&mut self, name: &str, param_tys: &[TypeId], ret: TypeId) -> FuncId {
        assert!(self.current_func.is_none(), "unfinished function");
        let id = self.add_function(name, param_tys, ret);
        self.module.functions[id.0 as usize]
            .blocks
            .push(Block { insts: Vec::new() });
        self.current_func = Some(id);
        self.current_block = BlockId(0);
        id
    }

    pub fn end_function(&mut self, f: FuncId) {
        assert_eq!(self.current_func, Some(f), "mismatched end_function");
        self.current_func = None;
    }

    /// The `index`-th parameter value of a function.
    pub fn param(&self, f: FuncId, index: usize) -> ValueId {
        self.module.functions[f.0 as usize].params[index]
    }

    /// The address value of a function.
    pub fn function_value(&self, f: FuncId) -> ValueId {
        self.module.functions[f.0 as usize].value
    }

    /// The type of an already created value.
    pub fn value_type(&self, v: ValueId) -> TypeId {
        self.module.values[v.0 as usize].ty
    }

    /// Append a new empty block to the current function.
    pub fn block(&mut self) -> BlockId {
        let f = self.current_func.expect("no current function");
        let func = &mut self.module.functions[f.0 as usize];
        func.blocks.push(Block { insts: Vec::new() });
        BlockId((func.blocks.len() - 1) as u32)
    }

    /// Select the block that subsequent instructions are appended to.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current_block = block;
    }

    // ---- instructions ----

    fn push_inst(&mut self, result_ty: Option<TypeId>, kind: InstKind) -> Option<ValueId> {
        let f = self.current_func.expect("no current function");
        let block = self.current_block;
        let index = self.module.functions[f.0 as usize].blocks[block.0 as usize]
            .insts
            .len() as u32;
        let site = InstRef {
            func: f,
            block,
            index,
        };
        let result = result_ty.map(|ty| self.add_value(ty, None, ValueKind::Result(site)));
        self.module.functions[f.0 as usize].blocks[block.0 as usize]
            .insts
            .push(Inst { result, kind });
        result
    }

    /// Name the given value for nicer diagnostics in tests.
    pub fn name_value(&mut self, v: ValueId, name: &str) {
        self.module.values[v.0 as usize].name = Some(name.to_string());
    }

    pub fn alloca(&mut self, ty: TypeId) -> ValueId {
        let ptr_ty = self.pointer_type(ty);
        self.push_inst(Some(ptr_ty), InstKind::Alloca { ty }).unwrap()
    }

    pub fn compute(&mut self, ty: TypeId, operands: &[ValueId]) -> ValueId {
        self.push_inst(
            Some(ty),
            InstKind::Compute {
                operands: operands.to_vec(),
            },
        )
        .unwrap()
    }

    pub fn phi(&mut self, ty: TypeId, incoming: &[ValueId]) -> ValueId {
        self.push_inst(
            Some(ty),
            InstKind::Phi {
                incoming: incoming.to_vec(),
            },
        )
        .unwrap()
    }

    pub fn select(
        &mut self,
        ty: TypeId,
        cond: ValueId,
        true_value: ValueId,
        false_value: ValueId,
    ) -> ValueId {
        self.push_inst(
            Some(ty),
            InstKind::Select {
                cond,
                true_value,
                false_value,
            },
        )
        .unwrap()
    }

    pub fn gep(&mut self, result_ty: TypeId, base: ValueId, offset: GepOffset) -> ValueId {
        self.push_inst(Some(result_ty), InstKind::Gep { base, offset })
            .unwrap()
    }

    pub fn load(&mut self, ty: TypeId, address: ValueId) -> ValueId {
        self.push_inst(Some(ty), InstKind::Load { address }).unwrap()
    }

    pub fn store(&mut self, address: ValueId, value: ValueId) {
        self.push_inst(None, InstKind::Store { address, value });
    }

    /// A call whose result type is `ret`; `None` for void calls.
    pub fn call(&mut self, ret: Option<TypeId>, callee: ValueId, args: &[ValueId]) -> Option<ValueId> {
        self.push_inst(
            ret,
            InstKind::Call {
                callee,
                args: args.to_vec(),
            },
        )
    }

    pub fn br(&mut self, target: BlockId) {
        self.push_inst(
            None,
            InstKind::Branch {
                cond: None,
                targets: vec![target],
            },
        );
    }

    pub fn cond_br(&mut self, cond: ValueId, then_block: BlockId, else_block: BlockId) {
        self.push_inst(
            None,
            InstKind::Branch {
                cond: Some(cond),
                targets: vec![then_block, else_block],
            },
        );
    }

    pub fn ret(&mut self, value: Option<ValueId>) {
        self.push_inst(None, InstKind::Return { value });
    }

    pub fn unreachable(&mut self) {
        self.push_inst(None, InstKind::Unreachable);
    }

    /// Finish the module.
    pub fn finish(self) -> Module {
        assert!(self.current_func.is_none(), "unfinished function");
        self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_small_function() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let main = b.begin_function("main", &[], i32_ty);
        let slot = b.alloca(i32_ty);
        let zero = b.const_int(0);
        b.store(slot, zero);
        let loaded = b.load(i32_ty, slot);
        b.ret(Some(loaded));
        b.end_function(main);
        let module = b.finish();

        module.validate().unwrap();
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.func(main).blocks[0].insts.len(), 4);
        assert!(module.is_pointer_value(slot));
    }

    #[test]
    fn branches_and_blocks() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let f = b.begin_function("f", &[i32_ty], i32_ty);
        let exit = b.block();
        let cond = b.param(f, 0);
        let body = b.block();
        b.cond_br(cond, body, exit);
        b.switch_to(body);
        b.br(exit);
        b.switch_to(exit);
        let arg = b.param(f, 0);
        b.ret(Some(arg));
        b.end_function(f);
        let module = b.finish();
        module.validate().unwrap();
        assert_eq!(module.func(f).blocks.len(), 3);
    }
}

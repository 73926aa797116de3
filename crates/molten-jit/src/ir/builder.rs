//! Insertion-point builder over the IR

use super::instr::{Cond, IrBlock, IrBlockId, IrFunction, IrInst, IrTerminator, IrType, Value};
use crate::runtime::table::Sym;

/// Builder that appends instructions to a current block.
pub struct IrBuilder<'a> {
    func: &'a mut IrFunction,
    current: IrBlockId,
}

impl<'a> IrBuilder<'a> {
    /// Target an existing function, starting at its entry block.
    pub fn new(func: &'a mut IrFunction) -> Self {
        let entry = func.entry;
        IrBuilder {
            func,
            current: entry,
        }
    }

    /// Target an existing function at a specific block.
    pub fn at(func: &'a mut IrFunction, block: IrBlockId) -> Self {
        IrBuilder {
            func,
            current: block,
        }
    }

    /// The block currently receiving instructions.
    pub fn current_block(&self) -> IrBlockId {
        self.current
    }

    /// Redirect emission into another block.
    pub fn switch_to_block(&mut self, block: IrBlockId) {
        self.current = block;
    }

    /// Append a fresh block (emission point unchanged).
    pub fn create_block(&mut self) -> IrBlockId {
        self.func.add_block()
    }

    /// Append an instruction to the current block.
    pub fn emit(&mut self, inst: IrInst) {
        debug_assert!(
            matches!(self.func.block(self.current).terminator, IrTerminator::None),
            "emitting into a terminated block"
        );
        self.func.block_mut(self.current).instrs.push(inst);
    }

    /// Allocate a value.
    pub fn alloc_value(&mut self, ty: IrType) -> Value {
        self.func.alloc_value(ty)
    }

    /// Access the function being built.
    pub fn func(&self) -> &IrFunction {
        self.func
    }

    /// Access the function mutably.
    pub fn func_mut(&mut self) -> &mut IrFunction {
        self.func
    }

    /// Whether the current block already ends.
    pub fn is_terminated(&self) -> bool {
        !matches!(self.func.block(self.current).terminator, IrTerminator::None)
    }

    // ===== instruction shorthands =====

    /// Integer constant.
    pub fn iconst(&mut self, ty: IrType, value: i64) -> Value {
        let dest = self.alloc_value(ty);
        self.emit(IrInst::ConstInt { dest, ty, value });
        dest
    }

    /// Null pointer.
    pub fn null(&mut self) -> Value {
        let dest = self.alloc_value(IrType::Ptr);
        self.emit(IrInst::ConstNull { dest });
        dest
    }

    /// Typed load.
    pub fn load(&mut self, ty: IrType, base: Value, offset: i32) -> Value {
        let dest = self.alloc_value(ty);
        self.emit(IrInst::Load {
            dest,
            ty,
            base,
            offset,
        });
        dest
    }

    /// Typed store.
    pub fn store(&mut self, ty: IrType, base: Value, offset: i32, value: Value) {
        self.emit(IrInst::Store {
            ty,
            base,
            offset,
            value,
        });
    }

    /// Pointer plus constant byte offset.
    pub fn lea(&mut self, base: Value, offset: i32) -> Value {
        if offset == 0 {
            return base;
        }
        let dest = self.alloc_value(IrType::Ptr);
        self.emit(IrInst::Lea { dest, base, offset });
        dest
    }

    /// Integer add.
    pub fn iadd(&mut self, ty: IrType, a: Value, b: Value) -> Value {
        let dest = self.alloc_value(ty);
        self.emit(IrInst::IAdd { dest, ty, a, b });
        dest
    }

    /// Integer subtract.
    pub fn isub(&mut self, ty: IrType, a: Value, b: Value) -> Value {
        let dest = self.alloc_value(ty);
        self.emit(IrInst::ISub { dest, ty, a, b });
        dest
    }

    /// Comparison flag.
    pub fn icmp(&mut self, cond: Cond, a: Value, b: Value) -> Value {
        let dest = self.alloc_value(IrType::I8);
        self.emit(IrInst::ICmp { dest, cond, a, b });
        dest
    }

    /// Flag-driven select.
    pub fn select(&mut self, cond: Value, if_true: Value, if_false: Value) -> Value {
        let ty = self.func.value_type(if_true);
        let dest = self.alloc_value(ty);
        self.emit(IrInst::Select {
            dest,
            cond,
            if_true,
            if_false,
        });
        dest
    }

    /// Load a table entry (data symbols such as the singletons).
    pub fn load_sym(&mut self, sym: Sym) -> Value {
        let dest = self.alloc_value(IrType::Ptr);
        self.emit(IrInst::LoadSym { dest, sym });
        dest
    }

    /// Call a value-returning helper.
    pub fn call_sym(&mut self, sym: Sym, args: &[Value]) -> Value {
        let dest = self.alloc_value(IrType::Ptr);
        self.emit(IrInst::CallSym {
            dest: Some(dest),
            sym,
            args: args.to_vec(),
        });
        dest
    }

    /// Call a helper for its effect.
    pub fn call_sym_void(&mut self, sym: Sym, args: &[Value]) {
        self.emit(IrInst::CallSym {
            dest: None,
            sym,
            args: args.to_vec(),
        });
    }

    /// Indirect call through a loaded function pointer.
    pub fn call_indirect(&mut self, callee: Value, args: &[Value]) -> Value {
        let dest = self.alloc_value(IrType::Ptr);
        self.emit(IrInst::CallIndirect {
            dest: Some(dest),
            callee,
            args: args.to_vec(),
        });
        dest
    }

    /// Phi merge (wide-rotation loop only).
    pub fn phi(&mut self, ty: IrType, sources: Vec<(IrBlockId, Value)>) -> Value {
        let dest = self.alloc_value(ty);
        self.emit(IrInst::Phi { dest, ty, sources });
        dest
    }

    /// Append an incoming edge to an existing phi.
    pub fn phi_add_incoming(&mut self, block: IrBlockId, phi: Value, from: IrBlockId, value: Value) {
        for inst in &mut self.func.block_mut(block).instrs {
            if let IrInst::Phi { dest, sources, .. } = inst {
                if *dest == phi {
                    sources.push((from, value));
                    return;
                }
            }
        }
        panic!("no such phi in block");
    }

    // ===== terminators =====

    fn terminate(&mut self, terminator: IrTerminator) {
        let block = self.func.block_mut(self.current);
        debug_assert!(matches!(block.terminator, IrTerminator::None));
        block.terminator = terminator;
    }

    /// Unconditional jump.
    pub fn jump(&mut self, target: IrBlockId) {
        self.terminate(IrTerminator::Jump(target));
    }

    /// Conditional branch.
    pub fn branch(
        &mut self,
        cond: Value,
        then_block: IrBlockId,
        else_block: IrBlockId,
        hint: Option<bool>,
    ) {
        self.terminate(IrTerminator::Branch {
            cond,
            then_block,
            else_block,
            hint,
        });
    }

    /// Multi-way dispatch.
    pub fn dispatch(&mut self, selector: Value, targets: Vec<IrBlockId>, default: IrBlockId) {
        self.terminate(IrTerminator::Dispatch {
            selector,
            targets,
            default,
        });
    }

    /// Return to the caller.
    pub fn ret(&mut self, value: Value) {
        self.terminate(IrTerminator::Return(value));
    }

    /// Mark the current point unreachable.
    pub fn unreachable(&mut self) {
        self.terminate(IrTerminator::Unreachable);
    }

    /// Borrow the current block.
    pub fn block(&self) -> &IrBlock {
        self.func.block(self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instr::IrFunction;

    #[test]
    fn builds_a_small_function() {
        let mut func = IrFunction::new("t".to_string());
        let entry = func.add_block();
        func.entry = entry;

        let mut b = IrBuilder::new(&mut func);
        let k = b.iconst(IrType::I64, 7);
        let frame = b.func().frame_param;
        b.store(IrType::I64, frame, 8, k);
        let loaded = b.load(IrType::I64, frame, 8);
        b.ret(loaded);

        assert_eq!(func.block(entry).instrs.len(), 3);
        assert!(matches!(
            func.block(entry).terminator,
            IrTerminator::Return(_)
        ));
    }

    #[test]
    fn lea_folds_zero_offsets() {
        let mut func = IrFunction::new("t".to_string());
        let entry = func.add_block();
        func.entry = entry;
        let mut b = IrBuilder::new(&mut func);
        let base = b.func().frame_param;
        assert_eq!(b.lea(base, 0), base);
        assert_ne!(b.lea(base, 16), base);
    }
}

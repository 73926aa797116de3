//! The per-block code emitter
//!
//! [`CompileUnit`] drives translation of one code unit: it runs the
//! preparatory analyses, then walks each basic block emitting IR while
//! maintaining an abstract operand stack. Each abstract entry pairs the
//! IR value occupying the slot with a *really pushed* flag: when the flag
//! is clear the value is known at compile time but no frame slot was
//! written and no reference acquired, so consumers skip the paired
//! decrement. Before every opcode the current vpc is stored into the
//! frame's last-instruction field and the materialized stack height is
//! recorded into the vpc→height side table the unwinder reads.

mod opcodes;

use molten_bytecode::{CodeUnit, Opcode};

use crate::analysis::cfg::{BlockTable, CfgError};
use crate::analysis::{analyze_locals_definition, analyze_redundant_loads};
use crate::bits::BitSet;
use crate::host::frame::Frame;
use crate::host::func::CodeObject;
use crate::host::object::HostObject;
use crate::ir::{Cond, IrBlockId, IrBuilder, IrFunction, IrType, Value};
use crate::runtime::table::Sym;

/// Error during translation. The code unit is left uninstalled; callers
/// fall back to the host's default evaluator.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    /// Malformed bytecode discovered while building the block table.
    #[error(transparent)]
    Cfg(#[from] CfgError),
    /// The function uses an opcode outside the translatable subset.
    #[error("unsupported opcode {opcode:?} at vpc {vpc}")]
    UnsupportedOpcode {
        /// The refused opcode.
        opcode: Opcode,
        /// Where it appears.
        vpc: usize,
    },
    /// Generator, coroutine, and async-generator bodies stay interpreted.
    #[error("cannot translate generator-shaped code unit '{name}'")]
    GeneratorCode {
        /// Name of the refused code unit.
        name: String,
    },
    /// A code unit with no instructions at all.
    #[error("cannot translate empty code unit '{name}'")]
    EmptyCode {
        /// Name of the refused code unit.
        name: String,
    },
}

/// A finished translation: the IR module plus the vpc→stack-height side
/// table handed to the extended C frame at call time.
#[derive(Debug)]
pub struct Translation {
    /// The emitted function.
    pub ir: IrFunction,
    /// Operand-stack height at the start of every vpc.
    pub sp_map: Vec<i32>,
}

/// One abstract operand-stack entry.
#[derive(Debug, Clone, Copy)]
struct StackEntry {
    value: Value,
    really_pushed: bool,
}

/// A popped entry whose pending reference release the opcode emitter
/// still owes (skipped for entries that were never materialized).
#[derive(Debug, Clone, Copy)]
struct Popped {
    value: Value,
    really_pushed: bool,
}

/// Emitter state for a single code unit.
pub struct CompileUnit<'a> {
    unit: &'a CodeUnit,
    table: BlockTable,
    redundant: BitSet,
    ir: IrFunction,
    cur: IrBlockId,
    /// IR block per table entry; index 0 is the function entry block.
    ir_blocks: Vec<IrBlockId>,
    error_block: IrBlockId,
    /// Handler tokens already assigned, per table block index.
    handler_tokens: Vec<Option<i32>>,
    code_consts: Value,
    code_names: Value,
    stack_height: i32,
    abstract_stack: Vec<StackEntry>,
    abstract_height: usize,
    sp_map: Vec<i32>,
    defined_locals: BitSet,
}

/// Threshold above which a stack rotation becomes an IR loop instead of
/// an unrolled shift.
const ROT_UNROLL_LIMIT: u32 = 17;

const PTR: i32 = std::mem::size_of::<usize>() as i32;

impl<'a> CompileUnit<'a> {
    /// Translate a code unit into IR.
    pub fn translate(unit: &'a CodeUnit) -> Result<Translation, TranslateError> {
        if unit.flags.is_generator_like() {
            return Err(TranslateError::GeneratorCode {
                name: unit.name.clone(),
            });
        }
        if unit.instr_count() == 0 {
            return Err(TranslateError::EmptyCode {
                name: unit.name.clone(),
            });
        }

        let mut table = BlockTable::build(unit)?;
        let redundant = analyze_redundant_loads(unit, &mut table);
        analyze_locals_definition(unit, &mut table);

        let block_count = table.block_count();
        let mut ir = IrFunction::new(unit.name.clone());
        let entry = ir.add_block();
        ir.entry = entry;

        let mut ir_blocks = Vec::with_capacity(block_count);
        ir_blocks.push(entry);
        for _ in 1..block_count {
            ir_blocks.push(ir.add_block());
        }
        let error_block = ir.add_block();

        let dummy = Value(0);
        let mut cu = CompileUnit {
            unit,
            table,
            redundant,
            ir,
            cur: entry,
            ir_blocks,
            error_block,
            handler_tokens: vec![None; block_count],
            code_consts: dummy,
            code_names: dummy,
            stack_height: 0,
            abstract_stack: vec![
                StackEntry {
                    value: dummy,
                    really_pushed: false,
                };
                unit.stacksize as usize
            ],
            abstract_height: 0,
            sp_map: vec![0; unit.instr_count()],
            defined_locals: BitSet::new(unit.nlocals as usize),
        };
        cu.emit_function()?;

        Ok(Translation {
            ir: cu.ir,
            sp_map: cu.sp_map,
        })
    }

    fn emit_function(&mut self) -> Result<(), TranslateError> {
        // Entry block: resolve the tables emitted code indexes, then
        // (after every block exists) dispatch on the resume token.
        self.cur = self.ir_blocks[0];
        let frame = self.ir.frame_param;
        let code = self.load(
            IrType::Ptr,
            frame,
            std::mem::offset_of!(Frame, code) as i32,
        );
        self.code_consts = self.load(
            IrType::Ptr,
            code,
            std::mem::offset_of!(CodeObject, consts_ptr) as i32,
        );
        self.code_names = self.load(
            IrType::Ptr,
            code,
            std::mem::offset_of!(CodeObject, names_ptr) as i32,
        );

        self.ir.dispatch = vec![self.ir_blocks[1]];
        if let Some(first) = self.table.blocks.get_mut(1) {
            first.initial_stack_height = Some(0);
        }

        for index in 1..self.table.block_count() {
            self.emit_block(index)?;
        }

        // The shared unwind entry: every failed null check lands here.
        self.cur = self.error_block;
        self.call_sym_void(Sym::RaiseException, &[]);
        self.unreachable();

        // Entry dispatch through the handler table; token 0 falls into
        // the function body.
        self.cur = self.ir_blocks[0];
        let resume = self.load(
            IrType::I32,
            frame,
            std::mem::offset_of!(Frame, resume) as i32,
        );
        let targets = self.ir.dispatch.clone();
        let body = self.ir_blocks[1];
        let mut b = IrBuilder::at(&mut self.ir, self.cur);
        b.dispatch(resume, targets, body);
        Ok(())
    }

    fn emit_block(&mut self, index: usize) -> Result<(), TranslateError> {
        self.cur = self.ir_blocks[index];
        let start = self.table.start_of(index);
        let end = self.table.blocks[index].end;

        let entry_height = self.table.blocks[index]
            .initial_stack_height
            .unwrap_or(0);
        self.stack_height = entry_height;
        self.abstract_height = entry_height as usize;
        // Seed the abstract stack from the runtime frame slots.
        for i in 1..=entry_height {
            let addr_offset = self.stack_slot_offset(i);
            let frame = self.ir.frame_param;
            let value = self.load(IrType::Ptr, frame, addr_offset);
            self.abstract_stack[(entry_height - i) as usize] = StackEntry {
                value,
                really_pushed: true,
            };
        }

        self.defined_locals = self.table.blocks[index].locals_input.clone();

        let mut fall_through = true;
        let mut extended_oparg: u32 = 0;

        for vpc in start..end {
            // The height recorded here predates the opcode's own pops, so
            // a failing helper still sees its consumed operands live.
            let frame = self.ir.frame_param;
            let vpc_const = self.iconst(IrType::I32, vpc as i64);
            self.store(
                IrType::I32,
                frame,
                std::mem::offset_of!(Frame, lasti) as i32,
                vpc_const,
            );
            self.sp_map[vpc] = self.stack_height;

            let (byte, arg) = self.unit.raw(vpc);
            let opcode = Opcode::from_u8(byte).expect("block table built over decoded stream");
            let oparg = arg as u32 | extended_oparg;
            extended_oparg = 0;
            if opcode == Opcode::ExtendedArg {
                extended_oparg = oparg << 8;
                continue;
            }

            self.emit_opcode(vpc, opcode, oparg, index, &mut fall_through)?;
        }

        if fall_through && index + 1 < self.ir_blocks.len() {
            let successor = self.ir_blocks[index + 1];
            let mut b = IrBuilder::at(&mut self.ir, self.cur);
            b.jump(successor);
            let next = &mut self.table.blocks[index + 1];
            if next.initial_stack_height.is_none() {
                next.initial_stack_height = Some(self.stack_height);
            }
        }
        Ok(())
    }

    // ===== builder delegates =====

    fn iconst(&mut self, ty: IrType, value: i64) -> Value {
        IrBuilder::at(&mut self.ir, self.cur).iconst(ty, value)
    }

    fn null(&mut self) -> Value {
        IrBuilder::at(&mut self.ir, self.cur).null()
    }

    fn load(&mut self, ty: IrType, base: Value, offset: i32) -> Value {
        IrBuilder::at(&mut self.ir, self.cur).load(ty, base, offset)
    }

    fn store(&mut self, ty: IrType, base: Value, offset: i32, value: Value) {
        IrBuilder::at(&mut self.ir, self.cur).store(ty, base, offset, value);
    }

    fn lea(&mut self, base: Value, offset: i32) -> Value {
        IrBuilder::at(&mut self.ir, self.cur).lea(base, offset)
    }

    fn icmp(&mut self, cond: Cond, a: Value, b: Value) -> Value {
        IrBuilder::at(&mut self.ir, self.cur).icmp(cond, a, b)
    }

    fn select(&mut self, cond: Value, if_true: Value, if_false: Value) -> Value {
        IrBuilder::at(&mut self.ir, self.cur).select(cond, if_true, if_false)
    }

    fn load_sym(&mut self, sym: Sym) -> Value {
        IrBuilder::at(&mut self.ir, self.cur).load_sym(sym)
    }

    fn call_sym(&mut self, sym: Sym, args: &[Value]) -> Value {
        IrBuilder::at(&mut self.ir, self.cur).call_sym(sym, args)
    }

    fn call_sym_void(&mut self, sym: Sym, args: &[Value]) {
        IrBuilder::at(&mut self.ir, self.cur).call_sym_void(sym, args);
    }

    fn call_indirect(&mut self, callee: Value, args: &[Value]) -> Value {
        IrBuilder::at(&mut self.ir, self.cur).call_indirect(callee, args)
    }

    fn create_block(&mut self) -> IrBlockId {
        self.ir.add_block()
    }

    fn jump(&mut self, target: IrBlockId) {
        IrBuilder::at(&mut self.ir, self.cur).jump(target);
    }

    fn branch(&mut self, cond: Value, then_block: IrBlockId, else_block: IrBlockId, hint: Option<bool>) {
        IrBuilder::at(&mut self.ir, self.cur).branch(cond, then_block, else_block, hint);
    }

    fn ret(&mut self, value: Value) {
        IrBuilder::at(&mut self.ir, self.cur).ret(value);
    }

    fn unreachable(&mut self) {
        IrBuilder::at(&mut self.ir, self.cur).unreachable();
    }

    // ===== frame and stack addressing =====

    /// Byte offset of the value-stack slot `i` entries below the top
    /// (`i == 0` addresses the next free slot).
    fn stack_slot_offset(&self, i: i32) -> i32 {
        debug_assert!(self.stack_height >= i);
        let unit = self.unit;
        let slot = self.stack_height - i
            + unit.nlocals as i32
            + unit.cell_and_free_count() as i32;
        Frame::slots_offset() as i32 + slot * PTR
    }

    /// Address of a value-stack slot as an IR value.
    fn stack_slot_addr(&mut self, i: i32) -> Value {
        let offset = self.stack_slot_offset(i);
        let frame = self.ir.frame_param;
        self.lea(frame, offset)
    }

    /// Byte offset of a local/cell/free slot.
    fn fixed_slot_offset(&self, index: usize) -> i32 {
        Frame::slots_offset() as i32 + index as i32 * PTR
    }

    /// Load a local variable slot.
    fn get_local(&mut self, oparg: u32) -> Value {
        let offset = self.fixed_slot_offset(oparg as usize);
        let frame = self.ir.frame_param;
        self.load(IrType::Ptr, frame, offset)
    }

    /// Overwrite a local slot with `value`, releasing the old contents.
    /// `defined` skips the null check on the previous value.
    fn set_local(&mut self, oparg: u32, value: Value, defined: bool) {
        let offset = self.fixed_slot_offset(oparg as usize);
        let frame = self.ir.frame_param;
        let old = self.load(IrType::Ptr, frame, offset);
        self.store(IrType::Ptr, frame, offset, value);
        if defined {
            self.emit_decref(old);
        } else {
            self.emit_xdecref(old);
        }
    }

    /// Load the cell object for cell/free slot `oparg`.
    fn get_cell(&mut self, oparg: u32) -> Value {
        let offset = self.fixed_slot_offset(self.unit.nlocals as usize + oparg as usize);
        let frame = self.ir.frame_param;
        self.load(IrType::Ptr, frame, offset)
    }

    /// Load a name-table entry.
    fn get_name(&mut self, oparg: u32) -> Value {
        let base = self.code_names;
        self.load(IrType::Ptr, base, oparg as i32 * PTR)
    }

    /// Load a constant-table entry.
    fn get_const(&mut self, oparg: u32) -> Value {
        let base = self.code_consts;
        self.load(IrType::Ptr, base, oparg as i32 * PTR)
    }

    // ===== abstract stack =====

    /// Push a value; materialize into the frame slot unless elided.
    fn push(&mut self, value: Value, really_pushed: bool) {
        if really_pushed {
            let offset = self.stack_slot_offset(0);
            let frame = self.ir.frame_param;
            self.store(IrType::Ptr, frame, offset, value);
            self.stack_height += 1;
        }
        self.abstract_stack[self.abstract_height] = StackEntry {
            value,
            really_pushed,
        };
        self.abstract_height += 1;
    }

    /// Pop the top abstract entry; the caller owes [`Self::decref_popped`]
    /// (or a store that steals the reference).
    fn pop(&mut self) -> Popped {
        self.abstract_height -= 1;
        let entry = self.abstract_stack[self.abstract_height];
        if entry.really_pushed {
            self.stack_height -= 1;
        }
        Popped {
            value: entry.value,
            really_pushed: entry.really_pushed,
        }
    }

    /// Pop and hand the caller an owned reference: entries that were
    /// never materialized acquire one here.
    fn pop_with_stolen_ref(&mut self) -> Value {
        let popped = self.pop();
        if !popped.really_pushed {
            self.emit_incref(popped.value);
        }
        popped.value
    }

    /// Release the reference a pop consumed, unless it was elided.
    fn decref_popped(&mut self, popped: Popped) {
        if popped.really_pushed {
            self.emit_decref(popped.value);
        }
    }

    /// Peek the entry `i` positions from the top without popping.
    fn fetch(&self, i: usize) -> Value {
        self.abstract_stack[self.abstract_height - i].value
    }

    /// Drop `n` materialized entries and return the base slot address of
    /// the popped run, for helpers taking contiguous argument arrays.
    fn pop_materialized_run(&mut self, n: u32) -> Value {
        for _ in 0..n {
            self.abstract_height -= 1;
            debug_assert!(
                self.abstract_stack[self.abstract_height].really_pushed,
                "helper operand was elided"
            );
        }
        self.stack_height -= n as i32;
        self.stack_slot_addr(0)
    }

    /// Adopt `n` slots a helper wrote past the current top: reload them
    /// into abstract entries.
    fn adopt_pushed(&mut self, n: i32) {
        self.stack_height += n;
        for i in (1..=n).rev() {
            let offset = self.stack_slot_offset(i);
            let frame = self.ir.frame_param;
            let value = self.load(IrType::Ptr, frame, offset);
            self.abstract_stack[self.abstract_height] = StackEntry {
                value,
                really_pushed: true,
            };
            self.abstract_height += 1;
        }
    }

    // ===== inlined refcount sequences =====

    fn refcnt_offset() -> i32 {
        std::mem::offset_of!(HostObject, refcnt) as i32
    }

    /// Inline `refcnt += 1`.
    fn emit_incref(&mut self, obj: Value) {
        let old = self.load(IrType::I64, obj, Self::refcnt_offset());
        let one = self.iconst(IrType::I64, 1);
        let new = IrBuilder::at(&mut self.ir, self.cur).iadd(IrType::I64, old, one);
        self.store(IrType::I64, obj, Self::refcnt_offset(), new);
    }

    /// Inline `refcnt -= 1`, calling the dealloc helper at zero.
    fn emit_decref(&mut self, obj: Value) {
        let old = self.load(IrType::I64, obj, Self::refcnt_offset());
        let one = self.iconst(IrType::I64, 1);
        let new = IrBuilder::at(&mut self.ir, self.cur).isub(IrType::I64, old, one);
        self.store(IrType::I64, obj, Self::refcnt_offset(), new);
        let zero = self.iconst(IrType::I64, 0);
        let is_zero = self.icmp(Cond::Eq, new, zero);
        let dealloc_block = self.create_block();
        let end_block = self.create_block();
        self.branch(is_zero, dealloc_block, end_block, Some(false));
        self.cur = dealloc_block;
        self.call_sym_void(Sym::Dealloc, &[obj]);
        self.jump(end_block);
        self.cur = end_block;
    }

    /// Inline decref guarded by a null check.
    fn emit_xdecref(&mut self, obj: Value) {
        let null = self.null();
        let non_null = self.icmp(Cond::Ne, obj, null);
        let decref_block = self.create_block();
        let end_block = self.create_block();
        self.branch(non_null, decref_block, end_block, Some(true));
        self.cur = decref_block;
        self.emit_decref(obj);
        self.jump(end_block);
        self.cur = end_block;
    }

    /// Branch to the shared unwind entry when `obj` is null.
    fn emit_null_check(&mut self, obj: Value, label_hint: &str) -> Value {
        let _ = label_hint;
        let null = self.null();
        let non_null = self.icmp(Cond::Ne, obj, null);
        let ok_block = self.create_block();
        let error = self.error_block;
        self.branch(non_null, ok_block, error, Some(true));
        self.cur = ok_block;
        obj
    }

    // ===== block resolution and handler tokens =====

    /// Block index starting at `vpc`, recording the entry stack height a
    /// branch or setup site knows.
    fn find_block(&mut self, vpc: usize, entry_height: i32) -> usize {
        let index = self.table.find(vpc);
        let block = &mut self.table.blocks[index];
        match block.initial_stack_height {
            Some(known) => debug_assert_eq!(known, entry_height, "stack height mismatch at join"),
            None => block.initial_stack_height = Some(entry_height),
        }
        index
    }

    /// Handler token for a block, allocating a dispatch-table entry the
    /// first time a setup opcode targets it.
    fn handler_token(&mut self, index: usize) -> i32 {
        if let Some(token) = self.handler_tokens[index] {
            return token;
        }
        self.table.blocks[index].is_handler = true;
        self.ir.dispatch.push(self.ir_blocks[index]);
        let token = (self.ir.dispatch.len() - 1) as i32;
        self.handler_tokens[index] = Some(token);
        token
    }

    // ===== shared lowering patterns =====

    /// Unary operator: pop, call, push, release the operand.
    fn emit_unary_op(&mut self, sym: Sym) {
        let value = self.pop();
        let result = self.call_sym(sym, &[value.value]);
        self.push(result, true);
        self.decref_popped(value);
    }

    /// Binary operator: pop both, call, push, release the operands.
    fn emit_binary_op(&mut self, sym: Sym) {
        let right = self.pop();
        let left = self.pop();
        let result = self.call_sym(sym, &[left.value, right.value]);
        self.push(result, true);
        self.decref_popped(left);
        self.decref_popped(right);
    }

    /// The three-way boolean jump: fast-path pointer compares against the
    /// `True` and `False` singletons, helper call only when neither hits.
    fn emit_bool_jump(&mut self, target_vpc: usize, pop_if_jump: bool, jump_cond: bool) {
        let target_height = self.stack_height - pop_if_jump as i32;
        let target_index = self.find_block(target_vpc, target_height);
        let target_block = self.ir_blocks[target_index];

        let false_cmp_block = self.create_block();
        let slow_cmp_block = self.create_block();
        let fall_block = self.create_block();
        let jump_block = if pop_if_jump {
            self.create_block()
        } else {
            target_block
        };
        let (true_block, false_block) = if jump_cond {
            (jump_block, fall_block)
        } else {
            (fall_block, jump_block)
        };

        let obj = self.fetch(1);
        let py_true = self.load_sym(Sym::PyTrue);
        let is_true = self.icmp(Cond::Eq, obj, py_true);
        self.branch(is_true, true_block, false_cmp_block, None);

        self.cur = false_cmp_block;
        let py_false = self.load_sym(Sym::PyFalse);
        let is_false = self.icmp(Cond::Eq, obj, py_false);
        self.branch(is_false, false_block, slow_cmp_block, None);

        self.cur = slow_cmp_block;
        let truth = self.call_sym(Sym::CastToBool, &[obj]);
        let zero = self.iconst(IrType::I64, 0);
        let nonzero = self.icmp(Cond::Ne, truth, zero);
        self.branch(nonzero, true_block, false_block, None);

        if pop_if_jump {
            self.cur = jump_block;
            self.emit_decref(obj);
            self.jump(target_block);
        }

        // Fall path always consumes the operand.
        self.cur = fall_block;
        self.emit_decref(obj);
        let popped = self.pop();
        debug_assert!(popped.really_pushed, "jump operand crossed a block edge");
    }

    /// Stack rotation. The abstract entries permute at compile time; the
    /// materialized slots shift in memory, unrolled for small counts and
    /// as an IR loop beyond [`ROT_UNROLL_LIMIT`].
    fn emit_rot_n(&mut self, n: u32) {
        let n = n as usize;
        let top = self.abstract_stack[self.abstract_height - 1];
        let mut lifted = 0u32;
        for i in 1..n {
            let below = self.abstract_stack[self.abstract_height - (i + 1)];
            self.abstract_stack[self.abstract_height - i] = below;
            lifted += below.really_pushed as u32;
        }
        self.abstract_stack[self.abstract_height - n] = top;

        if !top.really_pushed || lifted == 0 {
            return;
        }

        let frame = self.ir.frame_param;
        let top_offset = self.stack_slot_offset(1);
        let top_value = self.load(IrType::Ptr, frame, top_offset);

        if lifted <= ROT_UNROLL_LIMIT {
            for i in 1..=lifted as i32 {
                let src = self.stack_slot_offset(i + 1);
                let dst = self.stack_slot_offset(i);
                let value = self.load(IrType::Ptr, frame, src);
                self.store(IrType::Ptr, frame, dst, value);
            }
        } else {
            let dest_begin = self.stack_slot_addr(1);
            let dest_end = self.stack_slot_addr(lifted as i32);
            let entry_block = self.cur;
            let loop_block = self.create_block();
            let end_block = self.create_block();
            self.jump(loop_block);

            self.cur = loop_block;
            let dest = IrBuilder::at(&mut self.ir, self.cur)
                .phi(IrType::Ptr, vec![(entry_block, dest_begin)]);
            let src = self.lea(dest, -PTR);
            let value = self.load(IrType::Ptr, src, 0);
            self.store(IrType::Ptr, dest, 0, value);
            let done = self.icmp(Cond::Eq, dest, dest_end);
            self.branch(done, end_block, loop_block, None);
            IrBuilder::at(&mut self.ir, self.cur).phi_add_incoming(loop_block, dest, loop_block, src);

            self.cur = end_block;
        }

        let final_offset = self.stack_slot_offset(lifted as i32 + 1);
        self.store(IrType::Ptr, frame, final_offset, top_value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrInst;
    use molten_bytecode::{Assembler, Const, Opcode};

    fn translate(unit: &CodeUnit) -> Translation {
        CompileUnit::translate(unit).unwrap()
    }

    #[test]
    fn addition_calls_the_operator_helper_once() {
        let mut asm = Assembler::new("f");
        let one = asm.const_int(1);
        let two = asm.const_int(2);
        asm.op_arg(Opcode::LoadConst, one);
        asm.op_arg(Opcode::LoadConst, two);
        asm.op(Opcode::BinaryAdd);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let translation = translate(&unit);
        assert_eq!(translation.ir.count_calls(Sym::BinaryAdd), 1);
        // Both constant loads stayed materialized: two increfs feed the
        // helper, so the add operands carry owned references.
        let text = translation.ir.to_string();
        assert!(text.contains("call binary_add("));
    }

    #[test]
    fn repeated_subexpressions_dispatch_separately() {
        // a * b + a * b: two multiply calls, one add call.
        let mut asm = Assembler::new("f");
        let a = asm.param("a");
        let b = asm.param("b");
        asm.op_arg(Opcode::LoadFast, a);
        asm.op_arg(Opcode::LoadFast, b);
        asm.op(Opcode::BinaryMultiply);
        asm.op_arg(Opcode::LoadFast, a);
        asm.op_arg(Opcode::LoadFast, b);
        asm.op(Opcode::BinaryMultiply);
        asm.op(Opcode::BinaryAdd);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let translation = translate(&unit);
        assert_eq!(translation.ir.count_calls(Sym::BinaryMultiply), 2);
        assert_eq!(translation.ir.count_calls(Sym::BinaryAdd), 1);
    }

    #[test]
    fn sp_map_records_height_before_each_opcode() {
        let mut asm = Assembler::new("f");
        let one = asm.const_int(1);
        let two = asm.const_int(2);
        asm.op_arg(Opcode::LoadConst, one);
        asm.op_arg(Opcode::LoadConst, two);
        asm.op(Opcode::BinaryAdd);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let translation = translate(&unit);
        assert_eq!(translation.sp_map, vec![0, 1, 2, 1]);
    }

    #[test]
    fn redundant_load_skips_incref_and_store() {
        // return x — the load feeds only ReturnValue, so it is elided:
        // no frame-slot store, and exactly one incref (the return's own).
        let mut asm = Assembler::new("f");
        let x = asm.param("x");
        asm.op_arg(Opcode::LoadFast, x);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let translation = translate(&unit);
        let stores: usize = translation
            .ir
            .blocks
            .iter()
            .flat_map(|b| &b.instrs)
            .filter(|i| {
                matches!(
                    i,
                    IrInst::Store {
                        ty: IrType::Ptr,
                        ..
                    }
                )
            })
            .count();
        // Only the lasti store writes pointers... lasti is i32; no
        // pointer-sized store means the value-stack slot was never
        // written.
        assert_eq!(stores, 0);
    }

    #[test]
    fn unsupported_opcode_is_rejected() {
        let mut asm = Assembler::new("f");
        asm.op_arg(Opcode::UnpackSequence, 2);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();
        assert!(matches!(
            CompileUnit::translate(&unit),
            Err(TranslateError::UnsupportedOpcode {
                opcode: Opcode::UnpackSequence,
                ..
            })
        ));
    }

    #[test]
    fn generator_shaped_units_are_rejected() {
        let mut asm = Assembler::new("gen");
        asm.flags(molten_bytecode::CodeFlags::GENERATOR);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();
        assert!(matches!(
            CompileUnit::translate(&unit),
            Err(TranslateError::GeneratorCode { .. })
        ));
    }

    #[test]
    fn setup_finally_allocates_handler_tokens() {
        let mut asm = Assembler::new("f");
        let handler = asm.label();
        let k = asm.const_int(1);
        asm.jump(Opcode::SetupFinally, handler);
        asm.op(Opcode::PopBlock);
        asm.op_arg(Opcode::LoadConst, k);
        asm.op(Opcode::ReturnValue);
        asm.bind(handler);
        asm.op_arg(Opcode::Reraise, 0);
        let unit = asm.finish();

        let translation = translate(&unit);
        // Token 0 is the body; the finally handler takes token 1.
        assert_eq!(translation.ir.dispatch.len(), 2);
        assert_eq!(translation.ir.count_calls(Sym::BlockSetup), 1);
        assert_eq!(translation.ir.count_calls(Sym::Reraise), 1);
    }

    #[test]
    fn conditional_jump_uses_singleton_fast_path() {
        let mut asm = Assembler::new("f");
        let x = asm.param("x");
        let k = asm.const_int(1);
        let orelse = asm.label();
        asm.op_arg(Opcode::LoadFast, x);
        asm.jump(Opcode::PopJumpIfFalse, orelse);
        asm.op_arg(Opcode::LoadConst, k);
        asm.op(Opcode::ReturnValue);
        asm.bind(orelse);
        asm.op_arg(Opcode::LoadConst, k);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let translation = translate(&unit);
        let text = translation.ir.to_string();
        assert!(text.contains("sym py_true"));
        assert!(text.contains("sym py_false"));
        assert_eq!(translation.ir.count_calls(Sym::CastToBool), 1);
    }

    #[test]
    fn for_iter_reads_the_iternext_slot_directly() {
        // for x in xs: pass — the loop body stores then jumps back.
        let mut asm = Assembler::new("f");
        let xs = asm.param("xs");
        let x = asm.local("x");
        let none = asm.const_(Const::None);
        let top = asm.label();
        let out = asm.label();
        asm.op_arg(Opcode::LoadFast, xs);
        asm.op(Opcode::GetIter);
        asm.bind(top);
        asm.jump(Opcode::ForIter, out);
        asm.op_arg(Opcode::StoreFast, x);
        asm.jump(Opcode::JumpAbsolute, top);
        asm.bind(out);
        asm.op_arg(Opcode::LoadConst, none);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let translation = translate(&unit);
        assert_eq!(translation.ir.count_calls(Sym::GetIter), 1);
        let indirect_calls = translation
            .ir
            .blocks
            .iter()
            .flat_map(|b| &b.instrs)
            .filter(|i| matches!(i, IrInst::CallIndirect { .. }))
            .count();
        assert_eq!(indirect_calls, 1);
    }
}

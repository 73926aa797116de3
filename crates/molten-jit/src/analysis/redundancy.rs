//! Redundant-load analysis
//!
//! A backward walk over the instruction stream, block by block in reverse
//! index order, simulating the reverse of each instruction's stack effect
//! on a stack of timestamps. Each slot holds the vpc at which the value
//! occupying it (forward-time) is next consumed; `UNTIL_FOREVER` means the
//! value is either handed to an operation that needs an owned reference or
//! survives the block, and `UNTIL_ANYTIME` marks a value any trivial
//! consumer may discard.
//!
//! Consumers split into two camps. Anything that passes a value to a
//! runtime helper or stores it with ownership deposits `UNTIL_FOREVER`
//! into the operand slots: such loads must stay materialized. `PopTop`
//! deposits `UNTIL_ANYTIME` and `ReturnValue` deposits its own vpc; both
//! re-acquire nothing from the pushed reference, so a `LoadConst` feeding
//! them is always elidable and a `LoadFast` is elidable as long as the
//! local is not rebound before the consumption point.
//!
//! The same walk fills the per-block locals bitsets. Inside a block
//! `locals_touched` collects reads and writes and `locals_deleted` the
//! deletions no later write overwrites; at the block boundary the two are
//! flipped into the pass-through mask and the defined-by-block mask the
//! definition analysis combines.

use molten_bytecode::{CodeUnit, Opcode};

use crate::analysis::cfg::BlockTable;
use crate::bits::BitSet;

/// Timestamp for "consumed by any later operation, however trivial".
const UNTIL_ANYTIME: u32 = 0;
/// Timestamp for "needs an owned reference or never consumed here".
const UNTIL_FOREVER: u32 = u32::MAX;

/// The reversed operand stack of timestamps.
///
/// Forward pushes become reads (`push` returns the consumption timestamp
/// already waiting in the slot) and forward pops become deposits. The
/// buffer is twice the function's stack size so a block that consumes more
/// than it produces can deposit past the reset point.
struct ReversedStack {
    slots: Vec<u32>,
    size: usize,
    sp: usize,
    until_now: u32,
}

impl ReversedStack {
    fn new(size: usize) -> Self {
        ReversedStack {
            slots: vec![UNTIL_FOREVER; size * 2],
            size,
            sp: size,
            until_now: UNTIL_FOREVER,
        }
    }

    fn set_timestamp(&mut self, t: u32) {
        self.until_now = t;
    }

    /// Reset at a block boundary: everything below the watermark becomes
    /// "survives the block".
    fn reset(&mut self) {
        self.sp = self.size;
        for slot in &mut self.slots[..self.size] {
            *slot = UNTIL_FOREVER;
        }
    }

    /// Timestamp of the value `i` entries below the (forward) top.
    fn get(&self, i: usize) -> u32 {
        self.slots[self.sp - i]
    }

    /// Overwrite the timestamp `i` entries below the (forward) top.
    fn put(&mut self, i: usize, t: u32) {
        self.slots[self.sp - i] = t;
    }

    /// Reverse of a forward pop: deposit a timestamp into a fresh slot.
    fn pop(&mut self, t: u32) {
        self.slots[self.sp] = t;
        self.sp += 1;
    }

    /// A consumer that needs an owned reference.
    fn pop_observed(&mut self) {
        self.pop(UNTIL_FOREVER);
    }

    /// `PopTop`: any value may be discarded here.
    fn pop_disposable(&mut self) {
        self.pop(UNTIL_ANYTIME);
    }

    /// `ReturnValue`: the consumer re-acquires its own reference, so the
    /// pushed one is elidable up to this vpc.
    fn pop_rereferenced(&mut self) {
        self.pop(self.until_now);
    }

    fn pop_n_observed(&mut self, n: u32) {
        for _ in 0..n {
            self.pop_observed();
        }
    }

    /// Reverse of a forward push: read back the consumption timestamp.
    fn push(&mut self) -> u32 {
        self.sp -= 1;
        self.slots[self.sp]
    }

    fn rotate(&mut self, n: usize) {
        let top = self.get(n);
        for i in (1..n).rev() {
            let below = self.get(i);
            self.put(i + 1, below);
        }
        self.put(1, top);
    }
}

/// Run the analysis: fills each block's locals bitsets (already flipped
/// into kept/set form) and returns the one-bit-per-vpc redundant-load map.
pub fn analyze_redundant_loads(unit: &CodeUnit, table: &mut BlockTable) -> BitSet {
    let instr_count = unit.instr_count();
    let nlocals = unit.nlocals as usize;
    let until_finally = instr_count as u32;

    let mut stack = ReversedStack::new(unit.stacksize as usize);
    let mut redundant = BitSet::new(instr_count);

    // Next (forward) rebinding vpc of each local, over the whole walk.
    let mut locals = vec![until_finally; nlocals];

    for block_index in (1..table.block_count()).rev() {
        let start = table.start_of(block_index);
        let end = table.blocks[block_index].end;
        let block = &mut table.blocks[block_index];
        block.locals_touched = BitSet::new(nlocals);
        block.locals_deleted = BitSet::new(nlocals);
        block.locals_ever_deleted = BitSet::new(nlocals);
        stack.reset();

        for vpc in (start..end).rev() {
            stack.set_timestamp(vpc as u32);
            let (byte, _) = unit.raw(vpc);
            let Some(opcode) = Opcode::from_u8(byte) else {
                continue;
            };

            match opcode {
                Opcode::ExtendedArg | Opcode::Nop => {}

                Opcode::RotTwo => stack.rotate(2),
                Opcode::RotThree => stack.rotate(3),
                Opcode::RotFour => stack.rotate(4),
                Opcode::RotN => stack.rotate(unit.full_oparg(vpc) as usize),

                Opcode::DupTop => {
                    let t1 = stack.push();
                    let t2 = stack.push();
                    // The load is elidable only if every copy is.
                    stack.pop(t1.max(t2));
                }
                Opcode::DupTopTwo => {
                    let t1 = stack.push();
                    let t2 = stack.push();
                    let t3 = stack.push();
                    let t4 = stack.push();
                    stack.pop(t2.max(t4));
                    stack.pop(t1.max(t3));
                }
                Opcode::PopTop => stack.pop_disposable(),

                Opcode::LoadConst => {
                    let t = stack.push();
                    redundant.set_if(vpc, until_finally > t);
                }
                Opcode::LoadFast => {
                    let oparg = unit.full_oparg(vpc) as usize;
                    let t = stack.push();
                    redundant.set_if(vpc, locals[oparg] > t);
                    block.locals_touched.set(oparg);
                }
                Opcode::StoreFast => {
                    let oparg = unit.full_oparg(vpc) as usize;
                    locals[oparg] = vpc as u32;
                    stack.pop_observed();
                    block.locals_touched.set(oparg);
                }
                Opcode::DeleteFast => {
                    let oparg = unit.full_oparg(vpc) as usize;
                    block
                        .locals_deleted
                        .set_if(oparg, !block.locals_touched.get(oparg));
                    block.locals_ever_deleted.set(oparg);
                    block.locals_touched.set(oparg);
                }

                Opcode::LoadDeref | Opcode::LoadClassderef | Opcode::LoadClosure => {
                    stack.push();
                }
                Opcode::StoreDeref => stack.pop_observed(),
                Opcode::DeleteDeref => {}

                Opcode::LoadGlobal | Opcode::LoadName => {
                    stack.push();
                }
                Opcode::StoreGlobal | Opcode::StoreName => stack.pop_observed(),
                Opcode::DeleteGlobal | Opcode::DeleteName => {}

                Opcode::LoadAttr => {
                    stack.push();
                    stack.pop_observed();
                }
                Opcode::LoadMethod => {
                    stack.push();
                    stack.push();
                    stack.pop_observed();
                }
                Opcode::StoreAttr => {
                    stack.pop_observed();
                    stack.pop_observed();
                }
                Opcode::DeleteAttr => stack.pop_observed(),

                Opcode::BinarySubscr => {
                    stack.push();
                    stack.pop_observed();
                    stack.pop_observed();
                }
                Opcode::StoreSubscr => {
                    stack.pop_observed();
                    stack.pop_observed();
                    stack.pop_observed();
                }
                Opcode::DeleteSubscr => {
                    stack.pop_observed();
                    stack.pop_observed();
                }

                Opcode::UnaryNot
                | Opcode::UnaryPositive
                | Opcode::UnaryNegative
                | Opcode::UnaryInvert => {
                    stack.push();
                    stack.pop_observed();
                }

                Opcode::BinaryAdd
                | Opcode::InplaceAdd
                | Opcode::BinarySubtract
                | Opcode::InplaceSubtract
                | Opcode::BinaryMultiply
                | Opcode::InplaceMultiply
                | Opcode::BinaryFloorDivide
                | Opcode::InplaceFloorDivide
                | Opcode::BinaryTrueDivide
                | Opcode::InplaceTrueDivide
                | Opcode::BinaryModulo
                | Opcode::InplaceModulo
                | Opcode::BinaryPower
                | Opcode::InplacePower
                | Opcode::BinaryMatrixMultiply
                | Opcode::InplaceMatrixMultiply
                | Opcode::BinaryLshift
                | Opcode::InplaceLshift
                | Opcode::BinaryRshift
                | Opcode::InplaceRshift
                | Opcode::BinaryAnd
                | Opcode::InplaceAnd
                | Opcode::BinaryOr
                | Opcode::InplaceOr
                | Opcode::BinaryXor
                | Opcode::InplaceXor
                | Opcode::CompareOp
                | Opcode::IsOp
                | Opcode::ContainsOp => {
                    stack.push();
                    stack.pop_observed();
                    stack.pop_observed();
                }

                Opcode::ReturnValue => stack.pop_rereferenced(),

                Opcode::CallFunction => {
                    stack.push();
                    stack.pop_n_observed(1 + unit.full_oparg(vpc));
                }
                Opcode::CallFunctionKw => {
                    stack.push();
                    stack.pop_n_observed(2 + unit.full_oparg(vpc));
                }
                Opcode::CallFunctionEx => {
                    stack.push();
                    stack.pop_observed();
                    stack.pop_observed();
                    if unit.full_oparg(vpc) & 1 != 0 {
                        stack.pop_observed();
                    }
                }
                Opcode::CallMethod => {
                    stack.push();
                    stack.pop_n_observed(2 + unit.full_oparg(vpc));
                }
                Opcode::MakeFunction => {
                    stack.push();
                    let oparg = unit.full_oparg(vpc);
                    let extras = (oparg & 1 != 0) as u32
                        + (oparg & 2 != 0) as u32
                        + (oparg & 4 != 0) as u32
                        + (oparg & 8 != 0) as u32;
                    stack.pop_n_observed(2 + extras);
                }
                Opcode::LoadBuildClass => {
                    stack.push();
                }

                Opcode::ImportName => {
                    stack.push();
                    stack.pop_observed();
                    stack.pop_observed();
                }
                Opcode::ImportFrom => {
                    stack.push();
                }
                Opcode::ImportStar => stack.pop_observed(),

                Opcode::JumpForward | Opcode::JumpAbsolute => {}
                Opcode::PopJumpIfTrue | Opcode::PopJumpIfFalse => stack.pop_observed(),
                Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => {}

                Opcode::GetIter => {
                    stack.push();
                    stack.pop_observed();
                }
                Opcode::ForIter => {
                    stack.push();
                }

                Opcode::BuildTuple | Opcode::BuildList | Opcode::BuildSet => {
                    stack.push();
                    stack.pop_n_observed(unit.full_oparg(vpc));
                }
                Opcode::BuildMap => {
                    stack.push();
                    stack.pop_n_observed(2 * unit.full_oparg(vpc));
                }
                Opcode::BuildConstKeyMap => {
                    stack.push();
                    stack.pop_n_observed(1 + unit.full_oparg(vpc));
                }
                Opcode::ListAppend | Opcode::SetAdd => stack.pop_observed(),
                Opcode::MapAdd => {
                    stack.pop_observed();
                    stack.pop_observed();
                }
                Opcode::ListExtend
                | Opcode::SetUpdate
                | Opcode::DictUpdate
                | Opcode::DictMerge => stack.pop_observed(),
                Opcode::ListToTuple => {
                    stack.push();
                    stack.pop_observed();
                }

                Opcode::FormatValue => {
                    stack.push();
                    stack.pop_observed();
                    let oparg = unit.full_oparg(vpc);
                    if oparg & molten_bytecode::opcode::FVS_MASK
                        == molten_bytecode::opcode::FVS_HAVE_SPEC
                    {
                        stack.pop_observed();
                    }
                }
                Opcode::BuildString => {
                    stack.push();
                    stack.pop_n_observed(unit.full_oparg(vpc));
                }

                Opcode::UnpackSequence => {
                    for _ in 0..unit.full_oparg(vpc) {
                        stack.push();
                    }
                    stack.pop_observed();
                }
                Opcode::UnpackEx => {
                    let oparg = unit.full_oparg(vpc);
                    for _ in 0..(oparg & 0xff) + 1 + (oparg >> 8) {
                        stack.push();
                    }
                    stack.pop_observed();
                }

                // No information for the match, slice, raise, and
                // annotation opcodes; treating them as stack no-ops only
                // under-approximates the redundancy map.
                Opcode::GetLen
                | Opcode::MatchMapping
                | Opcode::MatchSequence
                | Opcode::MatchKeys
                | Opcode::MatchClass
                | Opcode::CopyDictWithoutKeys
                | Opcode::BuildSlice
                | Opcode::LoadAssertionError
                | Opcode::RaiseVarargs
                | Opcode::SetupAnnotations
                | Opcode::PrintExpr => {}

                Opcode::SetupFinally | Opcode::PopBlock | Opcode::PopExcept => {}
                Opcode::JumpIfNotExcMatch => {
                    stack.pop_observed();
                    stack.pop_observed();
                }
                Opcode::Reraise | Opcode::SetupWith => {
                    stack.push();
                    stack.push();
                    stack.pop_observed();
                }
                Opcode::WithExceptStart => {
                    stack.push();
                }

                Opcode::GenStart
                | Opcode::YieldValue
                | Opcode::GetYieldFromIter
                | Opcode::YieldFrom
                | Opcode::GetAwaitable
                | Opcode::GetAiter
                | Opcode::GetAnext
                | Opcode::EndAsyncFor
                | Opcode::SetupAsyncWith
                | Opcode::BeforeAsyncWith => {}
            }
        }

        // Boundary flips: locals_deleted becomes "touched and not deleted
        // at exit" (what the block defines) and locals_touched becomes the
        // pass-through mask.
        let block = &mut table.blocks[block_index];
        block.locals_deleted.flip_all();
        block.locals_deleted.and_assign(&block.locals_touched);
        block.locals_touched.flip_all();
    }

    redundant
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cfg::BlockTable;
    use molten_bytecode::{Assembler, Opcode};

    fn analyze(unit: &CodeUnit) -> (BitSet, BlockTable) {
        let mut table = BlockTable::build(unit).unwrap();
        let redundant = analyze_redundant_loads(unit, &mut table);
        (redundant, table)
    }

    #[test]
    fn operator_operands_stay_materialized() {
        // return 1 + 2: both constants feed the add helper, which may
        // observe their refcounts, so neither load is redundant.
        let mut asm = Assembler::new("f");
        let one = asm.const_int(1);
        let two = asm.const_int(2);
        asm.op_arg(Opcode::LoadConst, one);
        asm.op_arg(Opcode::LoadConst, two);
        asm.op(Opcode::BinaryAdd);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let (redundant, _) = analyze(&unit);
        assert!(!redundant.get(0));
        assert!(!redundant.get(1));
    }

    #[test]
    fn returned_local_load_is_redundant() {
        // y = x; return y — the final LoadFast feeds ReturnValue, which
        // takes its own reference, and y is not rebound in between.
        let mut asm = Assembler::new("f");
        let x = asm.param("x");
        let y = asm.local("y");
        asm.op_arg(Opcode::LoadFast, x);
        asm.op_arg(Opcode::StoreFast, y);
        asm.op_arg(Opcode::LoadFast, y);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let (redundant, _) = analyze(&unit);
        // LoadFast x feeds a store, which needs ownership.
        assert!(!redundant.get(0));
        assert!(redundant.get(2));
    }

    #[test]
    fn rebinding_blocks_the_return_elision() {
        // LoadFast x; LoadFast x; StoreFast x; ReturnValue — the first
        // load's value is returned after x is rebound, so its reference
        // must be materialized.
        let mut asm = Assembler::new("f");
        let x = asm.param("x");
        asm.op_arg(Opcode::LoadFast, x);
        asm.op_arg(Opcode::LoadFast, x);
        asm.op_arg(Opcode::StoreFast, x);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let (redundant, _) = analyze(&unit);
        assert!(!redundant.get(0));
    }

    #[test]
    fn popped_constant_is_redundant() {
        let mut asm = Assembler::new("f");
        let k = asm.const_int(5);
        let r = asm.const_(molten_bytecode::Const::None);
        asm.op_arg(Opcode::LoadConst, k);
        asm.op(Opcode::PopTop);
        asm.op_arg(Opcode::LoadConst, r);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let (redundant, _) = analyze(&unit);
        assert!(redundant.get(0));
        assert!(redundant.get(2));
    }

    #[test]
    fn dup_combines_copy_timestamps() {
        // LoadConst; DupTop; PopTop; ReturnValue: both copies die in
        // non-observing consumers, so the load is elidable.
        let mut asm = Assembler::new("f");
        let k = asm.const_int(1);
        asm.op_arg(Opcode::LoadConst, k);
        asm.op(Opcode::DupTop);
        asm.op(Opcode::PopTop);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();
        let (redundant, _) = analyze(&unit);
        assert!(redundant.get(0));

        // LoadConst; DupTop; BinaryAdd; ReturnValue: one copy reaches a
        // helper, so the load must stay materialized.
        let mut asm = Assembler::new("g");
        let k = asm.const_int(1);
        asm.op_arg(Opcode::LoadConst, k);
        asm.op(Opcode::DupTop);
        asm.op(Opcode::BinaryAdd);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();
        let (redundant, _) = analyze(&unit);
        assert!(!redundant.get(0));
    }

    #[test]
    fn value_surviving_its_block_stays_materialized() {
        // The constant is pushed in one block and consumed in another;
        // the frame slot must hold a real reference across the edge.
        let mut asm = Assembler::new("f");
        let k = asm.const_int(1);
        let join = asm.label();
        asm.op_arg(Opcode::LoadConst, k);
        asm.jump(Opcode::JumpForward, join);
        asm.bind(join);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let (redundant, _) = analyze(&unit);
        assert!(!redundant.get(0));
    }

    #[test]
    fn rotation_preserves_timestamps() {
        // LoadConst a; LoadConst b; RotTwo; PopTop(a); ReturnValue(b).
        // After the rotation, a dies trivially and b is returned — both
        // loads elidable.
        let mut asm = Assembler::new("f");
        let a = asm.const_int(1);
        let b = asm.const_int(2);
        asm.op_arg(Opcode::LoadConst, a);
        asm.op_arg(Opcode::LoadConst, b);
        asm.op(Opcode::RotTwo);
        asm.op(Opcode::PopTop);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let (redundant, _) = analyze(&unit);
        assert!(redundant.get(0));
        assert!(redundant.get(1));
    }

    #[test]
    fn boundary_flips_produce_kept_and_set_masks() {
        // Locals: x=0, y=1, z=2. Block stores x and deletes y.
        let mut asm = Assembler::new("f");
        let x = asm.local("x");
        let y = asm.local("y");
        let _z = asm.local("z");
        let k = asm.const_int(1);
        asm.op_arg(Opcode::LoadConst, k);
        asm.op_arg(Opcode::StoreFast, x);
        asm.op_arg(Opcode::DeleteFast, y);
        asm.op_arg(Opcode::LoadConst, k);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let (_, table) = analyze(&unit);
        let block = &table.blocks[1];
        // Post-flip: locals_touched is the pass-through mask, so only z
        // flows through; locals_deleted is the defined-by-block mask, so
        // only x is set (y's deletion survives to the exit).
        assert!(!block.locals_touched.get(0));
        assert!(!block.locals_touched.get(1));
        assert!(block.locals_touched.get(2));
        assert!(block.locals_deleted.get(0));
        assert!(!block.locals_deleted.get(1));
        assert!(!block.locals_deleted.get(2));
        assert!(block.locals_ever_deleted.get(1));
    }

    #[test]
    fn deletion_overwritten_by_store_still_defines() {
        // del y; y = 1 within one block: the deletion does not survive.
        let mut asm = Assembler::new("f");
        let y = asm.local("y");
        let k = asm.const_int(1);
        asm.op_arg(Opcode::DeleteFast, y);
        asm.op_arg(Opcode::LoadConst, k);
        asm.op_arg(Opcode::StoreFast, y);
        asm.op_arg(Opcode::LoadConst, k);
        asm.op(Opcode::ReturnValue);
        let unit = asm.finish();

        let (_, table) = analyze(&unit);
        let block = &table.blocks[1];
        // y is defined on exit despite the deletion.
        assert!(block.locals_deleted.get(0));
        assert!(block.locals_ever_deleted.get(0));
    }
}

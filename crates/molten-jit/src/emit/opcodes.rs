//! The per-opcode emission switch
//!
//! Each opcode lowers to at most one helper call plus refcount
//! maintenance and an abstract-stack update. Opcode families the
//! translator refuses (generators, pattern matching, unpacking) surface
//! as [`TranslateError::UnsupportedOpcode`] so installation falls back to
//! the interpreter before any code exists.

use molten_bytecode::opcode::{FVC_MASK, FVS_HAVE_SPEC, FVS_MASK};
use molten_bytecode::Opcode;

use crate::host::frame::{Frame, BLOCK_SETUP_FINALLY};
use crate::host::func::{CellObject, FunctionObject};
use crate::host::object::HostObject;
use crate::host::typeobj::TypeObject;
use crate::ir::{Cond, IrType};
use crate::runtime::table::Sym;

use super::{CompileUnit, TranslateError};

impl CompileUnit<'_> {
    pub(super) fn emit_opcode(
        &mut self,
        vpc: usize,
        opcode: Opcode,
        oparg: u32,
        block_index: usize,
        fall_through: &mut bool,
    ) -> Result<(), TranslateError> {
        match opcode {
            Opcode::Nop => {}
            Opcode::ExtendedArg => unreachable!("prefixes folded by the block loop"),

            // ===== stack shuffles =====
            Opcode::RotTwo => self.emit_rot_n(2),
            Opcode::RotThree => self.emit_rot_n(3),
            Opcode::RotFour => self.emit_rot_n(4),
            Opcode::RotN => self.emit_rot_n(oparg),

            Opcode::DupTop => {
                let top = self.abstract_stack[self.abstract_height - 1];
                if top.really_pushed {
                    self.emit_incref(top.value);
                }
                self.push(top.value, top.really_pushed);
            }
            Opcode::DupTopTwo => {
                let second = self.abstract_stack[self.abstract_height - 2];
                let top = self.abstract_stack[self.abstract_height - 1];
                if second.really_pushed {
                    self.emit_incref(second.value);
                }
                self.push(second.value, second.really_pushed);
                if top.really_pushed {
                    self.emit_incref(top.value);
                }
                self.push(top.value, top.really_pushed);
            }
            Opcode::PopTop => {
                let value = self.pop();
                self.decref_popped(value);
            }

            // ===== constants and locals =====
            Opcode::LoadConst => {
                let value = self.get_const(oparg);
                let redundant = self.redundant.get(vpc);
                if !redundant {
                    self.emit_incref(value);
                }
                self.push(value, !redundant);
            }
            Opcode::LoadFast => {
                let value = self.get_local(oparg);
                let value = if self.defined_locals.get(oparg as usize) {
                    value
                } else {
                    self.emit_null_check(value, "LoadFast")
                };
                let redundant = self.redundant.get(vpc);
                if !redundant {
                    self.emit_incref(value);
                }
                self.push(value, !redundant);
                self.defined_locals.set(oparg as usize);
            }
            Opcode::StoreFast => {
                let value = self.pop_with_stolen_ref();
                let defined = self.defined_locals.get(oparg as usize);
                self.set_local(oparg, value, defined);
                self.defined_locals.set(oparg as usize);
            }
            Opcode::DeleteFast => {
                let value = self.get_local(oparg);
                let value = self.emit_null_check(value, "DeleteFast");
                let null = self.null();
                let offset = self.fixed_slot_offset(oparg as usize);
                let frame = self.ir.frame_param;
                self.store(IrType::Ptr, frame, offset, null);
                self.emit_decref(value);
                self.defined_locals.reset(oparg as usize);
            }

            // ===== cells and closures =====
            Opcode::LoadDeref => {
                let cell = self.get_cell(oparg);
                let contents = self.load(
                    IrType::Ptr,
                    cell,
                    std::mem::offset_of!(CellObject, contents) as i32,
                );
                let contents = self.emit_null_check(contents, "LoadDeref");
                self.emit_incref(contents);
                self.push(contents, true);
            }
            Opcode::LoadClassderef => {
                let frame = self.ir.frame_param;
                let index = self.iconst(IrType::I64, oparg as i64);
                let value = self.call_sym(Sym::LoadClassderef, &[frame, index]);
                self.push(value, true);
            }
            Opcode::StoreDeref => {
                let cell = self.get_cell(oparg);
                let contents_offset = std::mem::offset_of!(CellObject, contents) as i32;
                let old = self.load(IrType::Ptr, cell, contents_offset);
                let value = self.pop_with_stolen_ref();
                self.store(IrType::Ptr, cell, contents_offset, value);
                self.emit_xdecref(old);
            }
            Opcode::DeleteDeref => {
                let cell = self.get_cell(oparg);
                let contents_offset = std::mem::offset_of!(CellObject, contents) as i32;
                let old = self.load(IrType::Ptr, cell, contents_offset);
                let old = self.emit_null_check(old, "DeleteDeref");
                let null = self.null();
                self.store(IrType::Ptr, cell, contents_offset, null);
                self.emit_decref(old);
            }
            Opcode::LoadClosure => {
                let cell = self.get_cell(oparg);
                self.emit_incref(cell);
                self.push(cell, true);
            }

            // ===== global and name access =====
            Opcode::LoadGlobal => {
                let frame = self.ir.frame_param;
                let name = self.get_name(oparg);
                let value = self.call_sym(Sym::LoadGlobal, &[frame, name]);
                self.push(value, true);
            }
            Opcode::StoreGlobal => {
                let value = self.pop();
                let frame = self.ir.frame_param;
                let name = self.get_name(oparg);
                self.call_sym_void(Sym::StoreGlobal, &[frame, name, value.value]);
                self.decref_popped(value);
            }
            Opcode::DeleteGlobal => {
                let frame = self.ir.frame_param;
                let name = self.get_name(oparg);
                self.call_sym_void(Sym::DeleteGlobal, &[frame, name]);
            }
            Opcode::LoadName => {
                let frame = self.ir.frame_param;
                let name = self.get_name(oparg);
                let value = self.call_sym(Sym::LoadName, &[frame, name]);
                self.push(value, true);
            }
            Opcode::StoreName => {
                let value = self.pop();
                let frame = self.ir.frame_param;
                let name = self.get_name(oparg);
                self.call_sym_void(Sym::StoreName, &[frame, name, value.value]);
                self.decref_popped(value);
            }
            Opcode::DeleteName => {
                let frame = self.ir.frame_param;
                let name = self.get_name(oparg);
                self.call_sym_void(Sym::DeleteName, &[frame, name]);
            }

            // ===== attributes and subscripts =====
            Opcode::LoadAttr => {
                let owner = self.pop();
                let name = self.get_name(oparg);
                let attr = self.call_sym(Sym::LoadAttr, &[owner.value, name]);
                self.push(attr, true);
                self.decref_popped(owner);
            }
            Opcode::LoadMethod => {
                let obj = self.pop();
                debug_assert!(obj.really_pushed);
                let name = self.get_name(oparg);
                let sp = self.stack_slot_addr(0);
                self.call_sym_void(Sym::LoadMethod, &[name, sp]);
                self.adopt_pushed(2);
            }
            Opcode::StoreAttr => {
                let owner = self.pop();
                let value = self.pop();
                let name = self.get_name(oparg);
                self.call_sym_void(Sym::StoreAttr, &[owner.value, name, value.value]);
                self.decref_popped(value);
                self.decref_popped(owner);
            }
            Opcode::DeleteAttr => {
                let owner = self.pop();
                let name = self.get_name(oparg);
                let null = self.null();
                self.call_sym_void(Sym::StoreAttr, &[owner.value, name, null]);
                self.decref_popped(owner);
            }
            Opcode::BinarySubscr => self.emit_binary_op(Sym::BinarySubscr),
            Opcode::StoreSubscr => {
                let sub = self.pop();
                let container = self.pop();
                let value = self.pop();
                self.call_sym_void(
                    Sym::StoreSubscr,
                    &[container.value, sub.value, value.value],
                );
                self.decref_popped(value);
                self.decref_popped(container);
                self.decref_popped(sub);
            }
            Opcode::DeleteSubscr => {
                let sub = self.pop();
                let container = self.pop();
                let null = self.null();
                self.call_sym_void(Sym::StoreSubscr, &[container.value, sub.value, null]);
                self.decref_popped(container);
                self.decref_popped(sub);
            }

            // ===== operators =====
            Opcode::UnaryNot => self.emit_unary_op(Sym::UnaryNot),
            Opcode::UnaryPositive => self.emit_unary_op(Sym::UnaryPositive),
            Opcode::UnaryNegative => self.emit_unary_op(Sym::UnaryNegative),
            Opcode::UnaryInvert => self.emit_unary_op(Sym::UnaryInvert),

            Opcode::BinaryAdd => self.emit_binary_op(Sym::BinaryAdd),
            Opcode::InplaceAdd => self.emit_binary_op(Sym::InplaceAdd),
            Opcode::BinarySubtract => self.emit_binary_op(Sym::BinarySubtract),
            Opcode::InplaceSubtract => self.emit_binary_op(Sym::InplaceSubtract),
            Opcode::BinaryMultiply => self.emit_binary_op(Sym::BinaryMultiply),
            Opcode::InplaceMultiply => self.emit_binary_op(Sym::InplaceMultiply),
            Opcode::BinaryFloorDivide => self.emit_binary_op(Sym::BinaryFloorDivide),
            Opcode::InplaceFloorDivide => self.emit_binary_op(Sym::InplaceFloorDivide),
            Opcode::BinaryTrueDivide => self.emit_binary_op(Sym::BinaryTrueDivide),
            Opcode::InplaceTrueDivide => self.emit_binary_op(Sym::InplaceTrueDivide),
            Opcode::BinaryModulo => self.emit_binary_op(Sym::BinaryModulo),
            Opcode::InplaceModulo => self.emit_binary_op(Sym::InplaceModulo),
            Opcode::BinaryPower => self.emit_binary_op(Sym::BinaryPower),
            Opcode::InplacePower => self.emit_binary_op(Sym::InplacePower),
            Opcode::BinaryMatrixMultiply => self.emit_binary_op(Sym::BinaryMatrixMultiply),
            Opcode::InplaceMatrixMultiply => self.emit_binary_op(Sym::InplaceMatrixMultiply),
            Opcode::BinaryLshift => self.emit_binary_op(Sym::BinaryLshift),
            Opcode::InplaceLshift => self.emit_binary_op(Sym::InplaceLshift),
            Opcode::BinaryRshift => self.emit_binary_op(Sym::BinaryRshift),
            Opcode::InplaceRshift => self.emit_binary_op(Sym::InplaceRshift),
            Opcode::BinaryAnd => self.emit_binary_op(Sym::BinaryAnd),
            Opcode::InplaceAnd => self.emit_binary_op(Sym::InplaceAnd),
            Opcode::BinaryOr => self.emit_binary_op(Sym::BinaryOr),
            Opcode::InplaceOr => self.emit_binary_op(Sym::InplaceOr),
            Opcode::BinaryXor => self.emit_binary_op(Sym::BinaryXor),
            Opcode::InplaceXor => self.emit_binary_op(Sym::InplaceXor),

            Opcode::CompareOp => {
                let right = self.pop();
                let left = self.pop();
                let selector = self.iconst(IrType::I64, oparg as i64);
                let result = self.call_sym(Sym::CompareOp, &[left.value, right.value, selector]);
                self.push(result, true);
                self.decref_popped(left);
                self.decref_popped(right);
            }
            Opcode::IsOp => {
                let right = self.pop();
                let left = self.pop();
                let py_true = self.load_sym(Sym::PyTrue);
                let py_false = self.load_sym(Sym::PyFalse);
                let (if_same, if_diff) = if oparg == 0 {
                    (py_true, py_false)
                } else {
                    (py_false, py_true)
                };
                let same = self.icmp(Cond::Eq, left.value, right.value);
                let chosen = self.select(same, if_same, if_diff);
                self.emit_incref(chosen);
                self.push(chosen, true);
                self.decref_popped(left);
                self.decref_popped(right);
            }
            Opcode::ContainsOp => {
                let right = self.pop();
                let left = self.pop();
                let found = self.call_sym(Sym::ContainsOp, &[right.value, left.value]);
                let zero = self.iconst(IrType::I64, 0);
                let nonzero = self.icmp(Cond::Ne, found, zero);
                let py_true = self.load_sym(Sym::PyTrue);
                let py_false = self.load_sym(Sym::PyFalse);
                let (if_found, if_missing) = if oparg == 0 {
                    (py_true, py_false)
                } else {
                    (py_false, py_true)
                };
                let chosen = self.select(nonzero, if_found, if_missing);
                self.emit_incref(chosen);
                self.push(chosen, true);
                self.decref_popped(left);
                self.decref_popped(right);
            }

            // ===== return =====
            Opcode::ReturnValue => {
                let retval = self.fetch(1);
                self.emit_incref(retval);
                self.ret(retval);
                *fall_through = false;
            }

            // ===== calls =====
            Opcode::CallFunction => {
                let func_args = self.pop_materialized_run(oparg + 1);
                let nargs = self.iconst(IrType::I64, oparg as i64);
                let result = self.call_sym(Sym::CallFunction, &[func_args, nargs]);
                self.push(result, true);
            }
            Opcode::CallFunctionKw => {
                let func_args = self.pop_materialized_run(oparg + 2);
                let nargs = self.iconst(IrType::I64, oparg as i64);
                let result = self.call_sym(Sym::CallFunctionKw, &[func_args, nargs]);
                self.push(result, true);
            }
            Opcode::CallMethod => {
                let func_args = self.pop_materialized_run(oparg + 2);
                let nargs = self.iconst(IrType::I64, oparg as i64);
                let result = self.call_sym(Sym::CallMethod, &[func_args, nargs]);
                self.push(result, true);
            }
            Opcode::CallFunctionEx => {
                let kwargs = if oparg & 1 != 0 {
                    Some(self.pop())
                } else {
                    None
                };
                let args = self.pop();
                let callable = self.pop();
                let kwargs_value = match kwargs {
                    Some(popped) => popped.value,
                    None => self.null(),
                };
                let result = self.call_sym(
                    Sym::CallFunctionEx,
                    &[callable.value, args.value, kwargs_value],
                );
                self.push(result, true);
                if let Some(popped) = kwargs {
                    self.decref_popped(popped);
                }
                self.decref_popped(args);
                self.decref_popped(callable);
            }
            Opcode::MakeFunction => {
                let qualname = self.pop();
                let code = self.pop();
                let frame = self.ir.frame_param;
                let func =
                    self.call_sym(Sym::MakeFunction, &[frame, code.value, qualname.value]);
                if oparg & 8 != 0 {
                    let closure = self.pop_with_stolen_ref();
                    let offset = std::mem::offset_of!(FunctionObject, closure) as i32;
                    self.store(IrType::Ptr, func, offset, closure);
                }
                if oparg & 4 != 0 {
                    let annotations = self.pop_with_stolen_ref();
                    let offset = std::mem::offset_of!(FunctionObject, annotations) as i32;
                    self.store(IrType::Ptr, func, offset, annotations);
                }
                if oparg & 2 != 0 {
                    let kwdefaults = self.pop_with_stolen_ref();
                    let offset = std::mem::offset_of!(FunctionObject, kwdefaults) as i32;
                    self.store(IrType::Ptr, func, offset, kwdefaults);
                }
                if oparg & 1 != 0 {
                    let defaults = self.pop_with_stolen_ref();
                    let offset = std::mem::offset_of!(FunctionObject, defaults) as i32;
                    self.store(IrType::Ptr, func, offset, defaults);
                }
                self.push(func, true);
                self.decref_popped(code);
                self.decref_popped(qualname);
            }
            Opcode::LoadBuildClass => {
                let frame = self.ir.frame_param;
                let builtins = self.load(
                    IrType::Ptr,
                    frame,
                    std::mem::offset_of!(Frame, builtins) as i32,
                );
                let value = self.call_sym(Sym::LoadBuildClass, &[builtins]);
                self.push(value, true);
            }

            // ===== imports =====
            Opcode::ImportName => {
                let name = self.get_name(oparg);
                let fromlist = self.pop();
                let level = self.pop();
                let frame = self.ir.frame_param;
                let module = self.call_sym(
                    Sym::ImportName,
                    &[frame, name, fromlist.value, level.value],
                );
                self.push(module, true);
                self.decref_popped(level);
                self.decref_popped(fromlist);
            }
            Opcode::ImportFrom => {
                let from = self.fetch(1);
                let name = self.get_name(oparg);
                let value = self.call_sym(Sym::ImportFrom, &[from, name]);
                self.push(value, true);
            }
            Opcode::ImportStar => {
                let from = self.pop();
                let frame = self.ir.frame_param;
                self.call_sym_void(Sym::ImportStar, &[frame, from.value]);
                self.decref_popped(from);
            }

            // ===== control flow =====
            Opcode::JumpForward => {
                let target = self.find_block(vpc + 1 + oparg as usize, self.stack_height);
                let target_block = self.ir_blocks[target];
                self.jump(target_block);
                *fall_through = false;
            }
            Opcode::JumpAbsolute => {
                let target = self.find_block(oparg as usize, self.stack_height);
                let target_block = self.ir_blocks[target];
                self.jump(target_block);
                *fall_through = false;
            }
            Opcode::PopJumpIfTrue => self.emit_bool_jump(oparg as usize, true, true),
            Opcode::PopJumpIfFalse => self.emit_bool_jump(oparg as usize, true, false),
            Opcode::JumpIfTrueOrPop => self.emit_bool_jump(oparg as usize, false, true),
            Opcode::JumpIfFalseOrPop => self.emit_bool_jump(oparg as usize, false, false),

            Opcode::GetIter => {
                let iterable = self.pop();
                let iter = self.call_sym(Sym::GetIter, &[iterable.value]);
                self.decref_popped(iterable);
                self.push(iter, true);
            }
            Opcode::ForIter => {
                let iter = self.fetch(1);
                let ty = self.load(
                    IrType::Ptr,
                    iter,
                    std::mem::offset_of!(HostObject, ty) as i32,
                );
                let next_fn = self.load(IrType::Ptr, ty, TypeObject::iternext_offset() as i32);
                let next = self.call_indirect(next_fn, &[iter]);
                let null = self.null();
                let exhausted = self.icmp(Cond::Eq, next, null);
                let break_block = self.create_block();
                let continue_block = self.create_block();
                self.branch(exhausted, break_block, continue_block, None);

                self.cur = break_block;
                let exit = self.find_block(vpc + 1 + oparg as usize, self.stack_height - 1);
                self.emit_decref(iter);
                let exit_block = self.ir_blocks[exit];
                self.jump(exit_block);

                self.cur = continue_block;
                self.push(next, true);
            }

            // ===== container builds and appends =====
            Opcode::BuildString => {
                let values = self.pop_materialized_run(oparg);
                let count = self.iconst(IrType::I64, oparg as i64);
                let result = self.call_sym(Sym::BuildString, &[values, count]);
                self.push(result, true);
            }
            Opcode::BuildTuple => {
                let values = self.pop_materialized_run(oparg);
                let count = self.iconst(IrType::I64, oparg as i64);
                let result = self.call_sym(Sym::BuildTuple, &[values, count]);
                self.push(result, true);
            }
            Opcode::BuildList => {
                let values = self.pop_materialized_run(oparg);
                let count = self.iconst(IrType::I64, oparg as i64);
                let result = self.call_sym(Sym::BuildList, &[values, count]);
                self.push(result, true);
            }
            Opcode::BuildSet => {
                let values = self.pop_materialized_run(oparg);
                let count = self.iconst(IrType::I64, oparg as i64);
                let result = self.call_sym(Sym::BuildSet, &[values, count]);
                self.push(result, true);
            }
            Opcode::BuildMap => {
                let values = self.pop_materialized_run(2 * oparg);
                let count = self.iconst(IrType::I64, oparg as i64);
                let result = self.call_sym(Sym::BuildMap, &[values, count]);
                self.push(result, true);
            }
            Opcode::BuildConstKeyMap => {
                let values = self.pop_materialized_run(oparg + 1);
                let count = self.iconst(IrType::I64, oparg as i64);
                let result = self.call_sym(Sym::BuildConstKeyMap, &[values, count]);
                self.push(result, true);
            }
            Opcode::ListAppend => {
                let value = self.pop();
                let list = self.fetch(oparg as usize);
                self.call_sym_void(Sym::ListAppend, &[list, value.value]);
                self.decref_popped(value);
            }
            Opcode::SetAdd => {
                let value = self.pop();
                let set = self.fetch(oparg as usize);
                self.call_sym_void(Sym::SetAdd, &[set, value.value]);
                self.decref_popped(value);
            }
            Opcode::MapAdd => {
                let value = self.pop();
                let key = self.pop();
                let map = self.fetch(oparg as usize);
                self.call_sym_void(Sym::MapAdd, &[map, key.value, value.value]);
                self.decref_popped(key);
                self.decref_popped(value);
            }
            Opcode::ListExtend => {
                let iterable = self.pop();
                let list = self.fetch(oparg as usize);
                self.call_sym_void(Sym::ListExtend, &[list, iterable.value]);
                self.decref_popped(iterable);
            }
            Opcode::SetUpdate => {
                let iterable = self.pop();
                let set = self.fetch(oparg as usize);
                self.call_sym_void(Sym::SetUpdate, &[set, iterable.value]);
                self.decref_popped(iterable);
            }
            Opcode::DictUpdate => {
                let update = self.pop();
                let dict = self.fetch(oparg as usize);
                self.call_sym_void(Sym::DictUpdate, &[dict, update.value]);
                self.decref_popped(update);
            }
            Opcode::DictMerge => {
                let update = self.pop();
                let dict = self.fetch(oparg as usize);
                let callee = self.fetch(oparg as usize + 2);
                self.call_sym_void(Sym::DictMerge, &[callee, dict, update.value]);
                self.decref_popped(update);
            }
            Opcode::ListToTuple => {
                let list = self.pop();
                let tuple = self.call_sym(Sym::ListToTuple, &[list.value]);
                self.push(tuple, true);
                self.decref_popped(list);
            }

            Opcode::FormatValue => {
                let fmt_spec = if oparg & FVS_MASK == FVS_HAVE_SPEC {
                    Some(self.pop())
                } else {
                    None
                };
                let value = self.pop();
                let spec_value = match fmt_spec {
                    Some(popped) => popped.value,
                    None => self.null(),
                };
                let conversion = self.iconst(IrType::I64, (oparg & FVC_MASK) as i64);
                let result =
                    self.call_sym(Sym::FormatValue, &[value.value, spec_value, conversion]);
                self.push(result, true);
                self.decref_popped(value);
                if let Some(popped) = fmt_spec {
                    self.decref_popped(popped);
                }
            }

            // ===== exception machinery =====
            Opcode::RaiseVarargs => {
                if oparg > 2 {
                    return Err(TranslateError::UnsupportedOpcode { opcode, vpc });
                }
                let cause = if oparg == 2 {
                    self.pop_with_stolen_ref()
                } else {
                    self.null()
                };
                let exc = if oparg >= 1 {
                    self.pop_with_stolen_ref()
                } else {
                    self.null()
                };
                self.call_sym_void(Sym::RaiseVarargs, &[cause, exc]);
                self.unreachable();
                *fall_through = false;
            }
            Opcode::SetupFinally => {
                let handler_index =
                    self.find_block(vpc + 1 + oparg as usize, self.stack_height + 6);
                let token = self.handler_token(handler_index);
                let frame = self.ir.frame_param;
                let kind = self.iconst(IrType::I64, BLOCK_SETUP_FINALLY as i64);
                let token_value = self.iconst(IrType::I64, token as i64);
                let level = self.iconst(IrType::I64, self.stack_height as i64);
                self.call_sym_void(Sym::BlockSetup, &[frame, kind, token_value, level]);
            }
            Opcode::PopBlock => {
                let frame = self.ir.frame_param;
                self.call_sym_void(Sym::BlockPop, &[frame]);
            }
            Opcode::PopExcept => {
                let frame = self.ir.frame_param;
                self.call_sym_void(Sym::PopExcept, &[frame]);
            }
            Opcode::JumpIfNotExcMatch => {
                let right = self.pop();
                let left = self.pop();
                let matched = self.call_sym(Sym::ExcMatch, &[left.value, right.value]);
                self.decref_popped(left);
                self.decref_popped(right);
                let target = self.find_block(oparg as usize, self.stack_height);
                let target_block = self.ir_blocks[target];
                // A match falls into the next block; bytecode always has
                // one (the handler body), but degrade to the error block
                // rather than index past the table.
                let next_block = if block_index + 1 < self.ir_blocks.len() {
                    let next = &mut self.table.blocks[block_index + 1];
                    if next.initial_stack_height.is_none() {
                        next.initial_stack_height = Some(self.stack_height);
                    }
                    self.ir_blocks[block_index + 1]
                } else {
                    self.error_block
                };
                let zero = self.iconst(IrType::I64, 0);
                let is_match = self.icmp(Cond::Ne, matched, zero);
                self.branch(is_match, next_block, target_block, None);
                *fall_through = false;
            }
            Opcode::Reraise => {
                let frame = self.ir.frame_param;
                let restore = self.iconst(IrType::I64, (oparg != 0) as i64);
                self.call_sym_void(Sym::Reraise, &[frame, restore]);
                self.unreachable();
                *fall_through = false;
            }
            Opcode::SetupWith => {
                let handler_index =
                    self.find_block(vpc + 1 + oparg as usize, self.stack_height - 1 + 7);
                let token = self.handler_token(handler_index);
                let frame = self.ir.frame_param;
                let sp = self.stack_slot_addr(0);
                let token_value = self.iconst(IrType::I64, token as i64);
                self.call_sym_void(Sym::SetupWith, &[frame, sp, token_value]);
                // The helper rewrote [mgr] into [exit, enter-result].
                let mgr = self.pop();
                debug_assert!(mgr.really_pushed);
                self.adopt_pushed(2);
            }
            Opcode::WithExceptStart => {
                let exc = self.fetch(1);
                let value = self.fetch(2);
                let tb = self.fetch(3);
                let exit_func = self.fetch(7);
                let result =
                    self.call_sym(Sym::WithExceptStart, &[exc, value, tb, exit_func]);
                self.push(result, true);
            }

            // ===== refused families =====
            Opcode::UnpackSequence
            | Opcode::UnpackEx
            | Opcode::GetLen
            | Opcode::MatchMapping
            | Opcode::MatchSequence
            | Opcode::MatchKeys
            | Opcode::MatchClass
            | Opcode::CopyDictWithoutKeys
            | Opcode::BuildSlice
            | Opcode::LoadAssertionError
            | Opcode::SetupAnnotations
            | Opcode::PrintExpr
            | Opcode::GenStart
            | Opcode::YieldValue
            | Opcode::GetYieldFromIter
            | Opcode::YieldFrom
            | Opcode::GetAwaitable
            | Opcode::GetAiter
            | Opcode::GetAnext
            | Opcode::EndAsyncFor
            | Opcode::SetupAsyncWith
            | Opcode::BeforeAsyncWith => {
                return Err(TranslateError::UnsupportedOpcode { opcode, vpc });
            }
        }
        Ok(())
    }
}

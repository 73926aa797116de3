//! IR → Cranelift lowering
//!
//! Every IR value becomes a Cranelift variable; phis resolve through
//! `def_var` copies in predecessor blocks, with loop headers sealed last.
//! Helper calls load the entry from the table argument and call it
//! indirectly, so the generated code needs no relocations. The entry
//! dispatch lowers to a chain of equality branches over the handler
//! tokens; handler tables are small.

use cranelift_codegen::ir::{self, condcodes, types, AbiParam, InstBuilder, MemFlags};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, Variable};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{Cond, IrBlockId, IrFunction, IrInst, IrTerminator, IrType, Value};

/// Error during Cranelift lowering.
#[derive(Debug, thiserror::Error)]
pub enum LowerError {
    #[error("unsupported instruction: {0}")]
    UnsupportedInstruction(String),
}

/// State maintained while lowering one function.
pub struct LoweringContext<'a> {
    value_vars: FxHashMap<Value, Variable>,
    block_map: FxHashMap<IrBlockId, ir::Block>,
    func: &'a IrFunction,
    symbols_param: ir::Value,
    phi_copies: FxHashMap<IrBlockId, Vec<(Value, Value)>>,
}

fn cl_type(ty: IrType) -> types::Type {
    match ty {
        IrType::I8 => types::I8,
        IrType::I32 => types::I32,
        IrType::I64 | IrType::Ptr => types::I64,
    }
}

/// Predecessor map derived from terminators.
fn predecessors(func: &IrFunction) -> FxHashMap<IrBlockId, Vec<IrBlockId>> {
    let mut preds: FxHashMap<IrBlockId, Vec<IrBlockId>> = FxHashMap::default();
    for block in &func.blocks {
        let mut add = |succ: IrBlockId| preds.entry(succ).or_default().push(block.id);
        match &block.terminator {
            IrTerminator::Jump(target) => add(*target),
            IrTerminator::Branch {
                then_block,
                else_block,
                ..
            } => {
                add(*then_block);
                add(*else_block);
            }
            IrTerminator::Dispatch {
                targets, default, ..
            } => {
                for target in targets {
                    add(*target);
                }
                add(*default);
            }
            IrTerminator::Return(_) | IrTerminator::Unreachable | IrTerminator::None => {}
        }
    }
    preds
}

/// Blocks with a back-edge predecessor; their sealing is deferred.
fn loop_headers(func: &IrFunction) -> FxHashSet<IrBlockId> {
    let mut headers = FxHashSet::default();
    for (block, preds) in predecessors(func) {
        if preds.iter().any(|p| p.0 >= block.0) {
            headers.insert(block);
        }
    }
    headers
}

fn phi_copies(func: &IrFunction) -> FxHashMap<IrBlockId, Vec<(Value, Value)>> {
    let mut copies: FxHashMap<IrBlockId, Vec<(Value, Value)>> = FxHashMap::default();
    for block in &func.blocks {
        for inst in &block.instrs {
            if let IrInst::Phi { dest, sources, .. } = inst {
                for (src_block, src_value) in sources {
                    copies.entry(*src_block).or_default().push((*dest, *src_value));
                }
            }
        }
    }
    copies
}

impl<'a> LoweringContext<'a> {
    /// Lower a whole function; consumes the builder because finalize does.
    pub fn lower(func: &'a IrFunction, mut builder: FunctionBuilder<'_>) -> Result<(), LowerError> {
        let mut block_map = FxHashMap::default();
        for block in &func.blocks {
            block_map.insert(block.id, builder.create_block());
        }

        let headers = loop_headers(func);
        let copies = phi_copies(func);

        let entry_block = block_map[&func.entry];
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        if !headers.contains(&func.entry) {
            builder.seal_block(entry_block);
        }

        let symbols_param = builder.block_params(entry_block)[0];
        let frame_param = builder.block_params(entry_block)[1];

        let mut ctx = LoweringContext {
            value_vars: FxHashMap::default(),
            block_map,
            func,
            symbols_param,
            phi_copies: copies,
        };

        // Declare one variable per IR value.
        for index in 0..func.value_count() {
            let value = Value(index);
            let var = builder.declare_var(cl_type(func.value_type(value)));
            ctx.value_vars.insert(value, var);
        }
        builder.def_var(ctx.value_vars[&func.symbols_param], symbols_param);
        builder.def_var(ctx.value_vars[&func.frame_param], frame_param);

        // Entry first (already active), then the rest in order.
        let entry_id = func.entry;
        ctx.lower_block(entry_id, &mut builder)?;
        for block in &func.blocks {
            if block.id == entry_id {
                continue;
            }
            let cl_block = ctx.block_map[&block.id];
            builder.switch_to_block(cl_block);
            if !headers.contains(&block.id) {
                builder.seal_block(cl_block);
            }
            ctx.lower_block(block.id, &mut builder)?;
        }

        for header in &headers {
            builder.seal_block(ctx.block_map[header]);
        }

        builder.finalize();
        Ok(())
    }

    fn use_value(&self, builder: &mut FunctionBuilder<'_>, value: Value) -> ir::Value {
        builder.use_var(self.value_vars[&value])
    }

    fn def_value(&self, builder: &mut FunctionBuilder<'_>, value: Value, cl: ir::Value) {
        builder.def_var(self.value_vars[&value], cl);
    }

    fn lower_block(
        &mut self,
        block_id: IrBlockId,
        builder: &mut FunctionBuilder<'_>,
    ) -> Result<(), LowerError> {
        let block = self.func.block(block_id);
        for inst in &block.instrs {
            self.lower_inst(inst, builder)?;
        }

        if let Some(copies) = self.phi_copies.get(&block_id).cloned() {
            for (phi_dest, src) in copies {
                let value = self.use_value(builder, src);
                self.def_value(builder, phi_dest, value);
            }
        }

        self.lower_terminator(&block.terminator, builder)
    }

    fn lower_inst(
        &mut self,
        inst: &IrInst,
        builder: &mut FunctionBuilder<'_>,
    ) -> Result<(), LowerError> {
        match inst {
            IrInst::ConstInt { dest, ty, value } => {
                let cl = builder.ins().iconst(cl_type(*ty), *value);
                self.def_value(builder, *dest, cl);
            }
            IrInst::ConstNull { dest } => {
                let cl = builder.ins().iconst(types::I64, 0);
                self.def_value(builder, *dest, cl);
            }
            IrInst::Load {
                dest,
                ty,
                base,
                offset,
            } => {
                let base = self.use_value(builder, *base);
                let cl = builder
                    .ins()
                    .load(cl_type(*ty), MemFlags::trusted(), base, *offset);
                self.def_value(builder, *dest, cl);
            }
            IrInst::Store {
                ty: _,
                base,
                offset,
                value,
            } => {
                let base = self.use_value(builder, *base);
                let value = self.use_value(builder, *value);
                builder.ins().store(MemFlags::trusted(), value, base, *offset);
            }
            IrInst::Lea { dest, base, offset } => {
                let base = self.use_value(builder, *base);
                let cl = builder.ins().iadd_imm(base, *offset as i64);
                self.def_value(builder, *dest, cl);
            }
            IrInst::IAdd { dest, ty: _, a, b } => {
                let a = self.use_value(builder, *a);
                let b = self.use_value(builder, *b);
                let cl = builder.ins().iadd(a, b);
                self.def_value(builder, *dest, cl);
            }
            IrInst::ISub { dest, ty: _, a, b } => {
                let a = self.use_value(builder, *a);
                let b = self.use_value(builder, *b);
                let cl = builder.ins().isub(a, b);
                self.def_value(builder, *dest, cl);
            }
            IrInst::ICmp { dest, cond, a, b } => {
                let cc = match cond {
                    Cond::Eq => condcodes::IntCC::Equal,
                    Cond::Ne => condcodes::IntCC::NotEqual,
                };
                let a = self.use_value(builder, *a);
                let b = self.use_value(builder, *b);
                let cl = builder.ins().icmp(cc, a, b);
                self.def_value(builder, *dest, cl);
            }
            IrInst::Select {
                dest,
                cond,
                if_true,
                if_false,
            } => {
                let cond = self.use_value(builder, *cond);
                let if_true = self.use_value(builder, *if_true);
                let if_false = self.use_value(builder, *if_false);
                let cl = builder.ins().select(cond, if_true, if_false);
                self.def_value(builder, *dest, cl);
            }
            IrInst::LoadSym { dest, sym } => {
                let cl = builder.ins().load(
                    types::I64,
                    MemFlags::trusted(),
                    self.symbols_param,
                    sym.offset() as i32,
                );
                self.def_value(builder, *dest, cl);
            }
            IrInst::CallSym { dest, sym, args } => {
                let callee = builder.ins().load(
                    types::I64,
                    MemFlags::trusted(),
                    self.symbols_param,
                    sym.offset() as i32,
                );
                self.lower_indirect_call(builder, *dest, callee, args);
            }
            IrInst::CallIndirect { dest, callee, args } => {
                let callee = self.use_value(builder, *callee);
                self.lower_indirect_call(builder, *dest, callee, args);
            }
            IrInst::Phi { .. } => {
                // Resolved by def_var copies in the predecessors.
            }
        }
        Ok(())
    }

    fn lower_indirect_call(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        dest: Option<Value>,
        callee: ir::Value,
        args: &[Value],
    ) {
        let call_conv = builder.func.signature.call_conv;
        let mut sig = ir::Signature::new(call_conv);
        for _ in args {
            sig.params.push(AbiParam::new(types::I64));
        }
        if dest.is_some() {
            sig.returns.push(AbiParam::new(types::I64));
        }
        let sig_ref = builder.import_signature(sig);

        let mut cl_args = Vec::with_capacity(args.len());
        for &arg in args {
            let mut value = self.use_value(builder, arg);
            // Narrow arguments widen to the pointer-sized ABI slot.
            let ty = self.func.value_type(arg);
            if matches!(ty, IrType::I8 | IrType::I32) {
                value = builder.ins().uextend(types::I64, value);
            }
            cl_args.push(value);
        }
        let call = builder.ins().call_indirect(sig_ref, callee, &cl_args);
        if let Some(dest) = dest {
            let result = builder.inst_results(call)[0];
            self.def_value(builder, dest, result);
        }
    }

    fn lower_terminator(
        &mut self,
        terminator: &IrTerminator,
        builder: &mut FunctionBuilder<'_>,
    ) -> Result<(), LowerError> {
        match terminator {
            IrTerminator::Jump(target) => {
                let target = self.block_map[target];
                builder.ins().jump(target, &[]);
            }
            IrTerminator::Branch {
                cond,
                then_block,
                else_block,
                hint: _,
            } => {
                let cond = self.use_value(builder, *cond);
                let then_block = self.block_map[then_block];
                let else_block = self.block_map[else_block];
                builder.ins().brif(cond, then_block, &[], else_block, &[]);
            }
            IrTerminator::Dispatch {
                selector,
                targets,
                default,
            } => {
                // A short equality chain; handler tables stay small.
                let selector = self.use_value(builder, *selector);
                let mut next = None;
                for (token, target) in targets.iter().enumerate().skip(1) {
                    if let Some(check) = next.take() {
                        builder.switch_to_block(check);
                        builder.seal_block(check);
                    }
                    let matches =
                        builder
                            .ins()
                            .icmp_imm(condcodes::IntCC::Equal, selector, token as i64);
                    let target = self.block_map[target];
                    let check = builder.create_block();
                    builder.ins().brif(matches, target, &[], check, &[]);
                    next = Some(check);
                }
                let default = self.block_map[default];
                match next {
                    Some(check) => {
                        builder.switch_to_block(check);
                        builder.seal_block(check);
                        builder.ins().jump(default, &[]);
                    }
                    None => {
                        builder.ins().jump(default, &[]);
                    }
                }
            }
            IrTerminator::Return(value) => {
                let value = self.use_value(builder, *value);
                builder.ins().return_(&[value]);
            }
            IrTerminator::Unreachable => {
                builder.ins().trap(ir::TrapCode::user(1).unwrap());
            }
            IrTerminator::None => {
                builder.ins().trap(ir::TrapCode::user(2).unwrap());
            }
        }
        Ok(())
    }
}

/// Cranelift signature of the compiled-function ABI.
pub fn compiled_signature(call_conv: CallConv) -> ir::Signature {
    let mut sig = ir::Signature::new(call_conv);
    sig.params.push(AbiParam::new(types::I64)); // helpers table
    sig.params.push(AbiParam::new(types::I64)); // frame
    sig.returns.push(AbiParam::new(types::I64)); // result object
    sig
}

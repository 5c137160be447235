//! Reference interpreter for the SSA IR, used by the end-to-end scenarios.
//!
//! Every value is its little-endian byte image, so loads, stores, and
//! aggregate accesses are plain byte splices; arithmetic unpacks the first
//! word. Memory is one flat arena: allocas and the builtin allocator bump
//! it, globals are laid out at startup.

use hashbrown::HashMap;

use scatha::ir::context::{sign_extend, truncate, ConstData, Context};
use scatha::ir::ir::{
    ArithOp, BlockId, Callee, CompareMode, CompareOp, Conversion, FuncId, Function, GlobalId,
    InstData, Module, UnaryArithOp, Value, ValueId,
};
pub type Bytes = Vec<u8>;

pub struct Interp<'a> {
    ctx: &'a Context,
    module: &'a Module,
    memory: Vec<u8>,
    global_addrs: HashMap<GlobalId, usize>,
}

impl<'a> Interp<'a> {
    pub fn new(ctx: &'a Context, module: &'a Module) -> Interp<'a> {
        let mut interp = Interp {
            ctx,
            module,
            // Address zero stays unused so null pointers trap.
            memory: vec![0; 8],
            global_addrs: HashMap::new(),
        };
        for (index, global) in module.globals.iter().enumerate() {
            let size = ctx.types.size(global.value_type);
            let addr = interp.alloc(size.max(1));
            let mut bytes = vec![0u8; size];
            scatha::backend::static_data::write_constant_bytes(ctx, global.initializer, &mut bytes);
            interp.memory[addr..addr + size].copy_from_slice(&bytes);
            interp.global_addrs.insert(GlobalId(index as u32), addr);
        }
        interp
    }

    fn alloc(&mut self, size: usize) -> usize {
        let addr = self.memory.len();
        self.memory.resize(addr + size.max(1), 0);
        addr
    }

    /// Runs the function named `name` with integer arguments and returns the
    /// first word of the result, sign-extended.
    pub fn run_named(&mut self, name: &str, args: &[i64]) -> i64 {
        let id = self
            .module
            .functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
            .expect("function exists");
        let func = self.module.function(id);
        let arg_bytes: Vec<Bytes> = args
            .iter()
            .zip(func.params.iter())
            .map(|(&a, &p)| {
                let size = self.ctx.types.size(func.local_type(p));
                (a as u64).to_le_bytes()[..size].to_vec()
            })
            .collect();
        let result = self.call(id, arg_bytes);
        let ret_size = self.ctx.types.size(func.return_type);
        if ret_size == 0 {
            return 0;
        }
        let word = read_word(&result);
        sign_extend(word, (ret_size * 8).min(64) as u32)
    }

    fn call(&mut self, id: FuncId, args: Vec<Bytes>) -> Bytes {
        let func = self.module.function(id);
        let mut env: HashMap<ValueId, Bytes> = HashMap::new();
        for (&param, arg) in func.params.iter().zip(args.into_iter()) {
            env.insert(param, arg);
        }
        let mut block = func.entry();
        let mut prev: Option<BlockId> = None;
        loop {
            // Phis read their inputs in parallel before anything is written.
            let phis = func.phis_of(block);
            if !phis.is_empty() {
                let prev = prev.expect("phis never appear in the entry block");
                let values: Vec<(ValueId, Bytes)> = phis
                    .iter()
                    .map(|&phi| {
                        let arg = func.phi_arg_for(phi, prev).expect("complete phi");
                        (phi, self.eval(func, &env, arg))
                    })
                    .collect();
                for (phi, value) in values {
                    env.insert(phi, value);
                }
            }
            let insts = func.block(block).insts.clone();
            let mut next_block = None;
            for inst in insts {
                let data = func.inst_data(inst).clone();
                if data.is_phi() {
                    continue;
                }
                match data {
                    InstData::Alloca { allocated, count } => {
                        let count = read_word(&self.eval(func, &env, count)) as usize;
                        let addr = self.alloc(self.ctx.types.size(allocated) * count.max(1));
                        env.insert(inst, (addr as u64).to_le_bytes().to_vec());
                    }
                    InstData::Load { addr } => {
                        let addr = read_word(&self.eval(func, &env, addr)) as usize;
                        let size = self.ctx.types.size(func.local_type(inst));
                        env.insert(inst, self.memory[addr..addr + size].to_vec());
                    }
                    InstData::Store { addr, value } => {
                        let addr = read_word(&self.eval(func, &env, addr)) as usize;
                        let bytes = self.eval(func, &env, value);
                        self.memory[addr..addr + bytes.len()].copy_from_slice(&bytes);
                    }
                    InstData::Gep {
                        inbounds,
                        base,
                        index,
                        ref members,
                    } => {
                        let base = read_word(&self.eval(func, &env, base));
                        let index_ty = func.value_type(index, self.ctx);
                        let index_bits = (self.ctx.types.size(index_ty) * 8).min(64) as u32;
                        let index =
                            sign_extend(read_word(&self.eval(func, &env, index)), index_bits);
                        let elem = self.ctx.types.size(inbounds) as i64;
                        let (_, inner) = self.ctx.types.inner_type_and_offset(inbounds, members);
                        let addr = base as i64 + index * elem + inner as i64;
                        env.insert(inst, (addr as u64).to_le_bytes().to_vec());
                    }
                    InstData::Arith { op, lhs, rhs } => {
                        let ty = func.local_type(inst);
                        let size = self.ctx.types.size(ty);
                        let a = read_word(&self.eval(func, &env, lhs));
                        let b = read_word(&self.eval(func, &env, rhs));
                        let result = if self.ctx.types.is_float(ty) {
                            float_arith(op, a, b, size)
                        } else {
                            int_arith(op, a, b, (size * 8).min(64) as u32)
                        };
                        env.insert(inst, result.to_le_bytes()[..size].to_vec());
                    }
                    InstData::UnaryArith { op, operand } => {
                        let ty = func.local_type(inst);
                        let size = self.ctx.types.size(ty);
                        let bits = (size * 8).min(64) as u32;
                        let a = read_word(&self.eval(func, &env, operand));
                        let result = match op {
                            UnaryArithOp::BitwiseNot => truncate(!a, bits),
                            UnaryArithOp::LogicalNot => (a == 0) as u64,
                            UnaryArithOp::Negate => {
                                if self.ctx.types.is_float(ty) {
                                    float_neg(a, size)
                                } else {
                                    truncate((a as i64).wrapping_neg() as u64, bits)
                                }
                            }
                        };
                        env.insert(inst, result.to_le_bytes()[..size].to_vec());
                    }
                    InstData::Cmp { mode, op, lhs, rhs } => {
                        let operand_ty = func.value_type(lhs, self.ctx);
                        let size = self.ctx.types.size(operand_ty);
                        let bits = (size * 8).min(64) as u32;
                        let a = read_word(&self.eval(func, &env, lhs));
                        let b = read_word(&self.eval(func, &env, rhs));
                        let result = match mode {
                            CompareMode::Signed => {
                                compare(op, sign_extend(a, bits), sign_extend(b, bits))
                            }
                            CompareMode::Unsigned => {
                                compare_unsigned(op, truncate(a, bits), truncate(b, bits))
                            }
                            CompareMode::Float => compare_float(op, a, b, size),
                        };
                        env.insert(inst, vec![result as u8]);
                    }
                    InstData::Conv { conv, operand } => {
                        let from_ty = func.value_type(operand, self.ctx);
                        let to_ty = func.local_type(inst);
                        let from_size = self.ctx.types.size(from_ty);
                        let to_size = self.ctx.types.size(to_ty);
                        let a = read_word(&self.eval(func, &env, operand));
                        let result = convert(conv, a, from_size, to_size);
                        env.insert(inst, result.to_le_bytes()[..to_size].to_vec());
                    }
                    InstData::Call {
                        ref callee,
                        ref args,
                    } => {
                        let arg_bytes: Vec<Bytes> =
                            args.iter().map(|&a| self.eval(func, &env, a)).collect();
                        let result = match *callee {
                            Callee::Function(f) => self.call(f, arg_bytes),
                            Callee::Ext(e) => self.call_builtin(e, arg_bytes),
                            Callee::Indirect(_) => panic!("indirect calls not interpreted"),
                        };
                        env.insert(inst, result);
                    }
                    InstData::Select {
                        cond,
                        then_value,
                        else_value,
                    } => {
                        let c = read_word(&self.eval(func, &env, cond));
                        let chosen = if c != 0 { then_value } else { else_value };
                        let value = self.eval(func, &env, chosen);
                        env.insert(inst, value);
                    }
                    InstData::ExtractValue { base, ref members } => {
                        let base_ty = func.value_type(base, self.ctx);
                        let (ty, offset) = self.ctx.types.inner_type_and_offset(base_ty, members);
                        let size = self.ctx.types.size(ty);
                        let bytes = self.eval(func, &env, base);
                        env.insert(inst, bytes[offset..offset + size].to_vec());
                    }
                    InstData::InsertValue {
                        base,
                        inserted,
                        ref members,
                    } => {
                        let base_ty = func.value_type(base, self.ctx);
                        let (_, offset) = self.ctx.types.inner_type_and_offset(base_ty, members);
                        let mut bytes = self.eval(func, &env, base);
                        let inserted = self.eval(func, &env, inserted);
                        bytes[offset..offset + inserted.len()].copy_from_slice(&inserted);
                        env.insert(inst, bytes);
                    }
                    InstData::Goto { target } => {
                        next_block = Some(target);
                    }
                    InstData::Branch {
                        cond,
                        then_target,
                        else_target,
                    } => {
                        let c = read_word(&self.eval(func, &env, cond));
                        next_block = Some(if c != 0 { then_target } else { else_target });
                    }
                    InstData::Return { value } => {
                        return self.eval(func, &env, value);
                    }
                    InstData::Phi { .. } => unreachable!(),
                }
            }
            prev = Some(block);
            block = next_block.expect("blocks end in terminators");
        }
    }

    fn call_builtin(&mut self, ext: scatha::ir::ir::ExtFuncId, args: Vec<Bytes>) -> Bytes {
        let name = self.module.ext_function(ext).name.clone();
        match name.as_str() {
            "__builtin_memcpy" => {
                let dest = read_word(&args[0]) as usize;
                let size = read_word(&args[1]) as usize;
                let source = read_word(&args[2]) as usize;
                let data = self.memory[source..source + size].to_vec();
                self.memory[dest..dest + size].copy_from_slice(&data);
                Vec::new()
            }
            "__builtin_memset" => {
                let dest = read_word(&args[0]) as usize;
                let size = read_word(&args[1]) as usize;
                let value = read_word(&args[2]) as u8;
                self.memory[dest..dest + size].fill(value);
                Vec::new()
            }
            "__builtin_alloc" => {
                let size = read_word(&args[0]) as usize;
                let addr = self.alloc(size.div_ceil(16) * 16);
                let mut fat = (addr as u64).to_le_bytes().to_vec();
                fat.extend_from_slice(&(size as u64).to_le_bytes());
                fat
            }
            other => panic!("unknown builtin: {other}"),
        }
    }

    fn eval(&self, func: &Function, env: &HashMap<ValueId, Bytes>, value: Value) -> Bytes {
        match value {
            Value::Local(id) => env
                .get(&id)
                .cloned()
                .unwrap_or_else(|| vec![0; self.ctx.types.size(func.local_type(id)).max(1)]),
            Value::Const(c) => {
                if let ConstData::Undef { ty } = *self.ctx.const_data(c) {
                    return vec![0; self.ctx.types.size(ty)];
                }
                let size = self.ctx.types.size(self.ctx.const_type(c));
                let mut bytes = vec![0u8; size];
                scatha::backend::static_data::write_constant_bytes(self.ctx, c, &mut bytes);
                bytes
            }
            Value::Global(g) => (self.global_addrs[&g] as u64).to_le_bytes().to_vec(),
            Value::Function(_) | Value::ExtFunction(_) => vec![0; 8],
        }
    }
}

fn read_word(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    let n = bytes.len().min(8);
    word[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(word)
}

fn int_arith(op: ArithOp, a: u64, b: u64, bits: u32) -> u64 {
    let sa = sign_extend(a, bits);
    let sb = sign_extend(b, bits);
    let ua = truncate(a, bits);
    let ub = truncate(b, bits);
    let result = match op {
        ArithOp::Add => ua.wrapping_add(ub),
        ArithOp::Sub => ua.wrapping_sub(ub),
        ArithOp::Mul => ua.wrapping_mul(ub),
        ArithOp::SDiv => (sa.wrapping_div(sb)) as u64,
        ArithOp::UDiv => ua / ub,
        ArithOp::SRem => (sa.wrapping_rem(sb)) as u64,
        ArithOp::URem => ua % ub,
        ArithOp::LShL | ArithOp::AShL => ua.wrapping_shl(ub as u32),
        ArithOp::LShR => ua.wrapping_shr(ub as u32),
        ArithOp::AShR => (sa.wrapping_shr(ub as u32)) as u64,
        ArithOp::And => ua & ub,
        ArithOp::Or => ua | ub,
        ArithOp::XOr => ua ^ ub,
        ArithOp::FAdd | ArithOp::FSub | ArithOp::FMul | ArithOp::FDiv => {
            panic!("float op on integers")
        }
    };
    truncate(result, bits)
}

fn float_arith(op: ArithOp, a: u64, b: u64, size: usize) -> u64 {
    if size == 4 {
        let x = f32::from_bits(a as u32);
        let y = f32::from_bits(b as u32);
        let r = match op {
            ArithOp::FAdd => x + y,
            ArithOp::FSub => x - y,
            ArithOp::FMul => x * y,
            ArithOp::FDiv => x / y,
            _ => panic!("integer op on floats"),
        };
        r.to_bits() as u64
    } else {
        let x = f64::from_bits(a);
        let y = f64::from_bits(b);
        let r = match op {
            ArithOp::FAdd => x + y,
            ArithOp::FSub => x - y,
            ArithOp::FMul => x * y,
            ArithOp::FDiv => x / y,
            _ => panic!("integer op on floats"),
        };
        r.to_bits()
    }
}

fn float_neg(a: u64, size: usize) -> u64 {
    if size == 4 {
        (-f32::from_bits(a as u32)).to_bits() as u64
    } else {
        (-f64::from_bits(a)).to_bits()
    }
}

fn compare(op: CompareOp, a: i64, b: i64) -> bool {
    match op {
        CompareOp::Equal => a == b,
        CompareOp::NotEqual => a != b,
        CompareOp::Less => a < b,
        CompareOp::LessEq => a <= b,
        CompareOp::Greater => a > b,
        CompareOp::GreaterEq => a >= b,
    }
}

fn compare_unsigned(op: CompareOp, a: u64, b: u64) -> bool {
    match op {
        CompareOp::Equal => a == b,
        CompareOp::NotEqual => a != b,
        CompareOp::Less => a < b,
        CompareOp::LessEq => a <= b,
        CompareOp::Greater => a > b,
        CompareOp::GreaterEq => a >= b,
    }
}

fn compare_float(op: CompareOp, a: u64, b: u64, size: usize) -> bool {
    let (x, y) = if size == 4 {
        (f32::from_bits(a as u32) as f64, f32::from_bits(b as u32) as f64)
    } else {
        (f64::from_bits(a), f64::from_bits(b))
    };
    match op {
        CompareOp::Equal => x == y,
        CompareOp::NotEqual => x != y,
        CompareOp::Less => x < y,
        CompareOp::LessEq => x <= y,
        CompareOp::Greater => x > y,
        CompareOp::GreaterEq => x >= y,
    }
}

fn convert(conv: Conversion, a: u64, from_size: usize, to_size: usize) -> u64 {
    let from_bits = (from_size * 8).min(64) as u32;
    let to_bits = (to_size * 8).min(64) as u32;
    match conv {
        Conversion::Zext => truncate(a, from_bits),
        Conversion::Sext => truncate(sign_extend(a, from_bits) as u64, to_bits),
        Conversion::Trunc => truncate(a, to_bits),
        Conversion::Bitcast => a,
        Conversion::Fext => {
            debug_assert_eq!(from_size, 4);
            (f32::from_bits(a as u32) as f64).to_bits()
        }
        Conversion::Ftrunc => {
            debug_assert_eq!(from_size, 8);
            (f64::from_bits(a) as f32).to_bits() as u64
        }
        Conversion::UtoF => {
            if to_size == 4 {
                (a as f32).to_bits() as u64
            } else {
                (a as f64).to_bits()
            }
        }
        Conversion::StoF => {
            let s = sign_extend(a, from_bits);
            if to_size == 4 {
                (s as f32).to_bits() as u64
            } else {
                (s as f64).to_bits()
            }
        }
        Conversion::FtoU | Conversion::FtoS => {
            let value = if from_size == 4 {
                f32::from_bits(a as u32) as f64
            } else {
                f64::from_bits(a)
            };
            truncate(value as i64 as u64, to_bits)
        }
    }
}

/// Convenience: run `main` on a fresh interpreter.
pub fn run_main(ctx: &Context, module: &Module) -> i64 {
    Interp::new(ctx, module).run_named("main", &[])
}

//! End-to-end scenarios: build IR through the builder, execute it with the
//! reference interpreter, run the full optimization pipeline, check the
//! invariants, execute again, and lower the result to MIR. Front-end style
//! code keeps every local in a stack slot, so these scenarios exercise
//! mem2reg, the loop passes, and the lowering together.

mod common;

use pretty_assertions::assert_eq;
use scatha::backend::codegen;
use scatha::ir::builder::FunctionBuilder;
use scatha::ir::context::Context;
use scatha::ir::ir::{
    ArithOp, Callee, CompareMode, CompareOp, FuncId, Module, Value,
};
use scatha::ir::validate::validate_module;
use scatha::passes::optimize;

use common::run_main;

fn check(ctx: &mut Context, module: &mut Module, expected: i64) {
    let _ = env_logger::builder().is_test(true).try_init();
    validate_module(ctx, module).expect("input module is valid");
    assert_eq!(run_main(ctx, module), expected, "before optimization");
    optimize(ctx, module);
    validate_module(ctx, module).expect("optimized module is valid");
    assert_eq!(run_main(ctx, module), expected, "after optimization");
    let mir = codegen(ctx, module);
    assert_eq!(mir.functions.len(), module.functions.len());
}

/// fn main() { let a = 1; let b = 2; return a + b; }
#[test]
fn test_straight_line_locals() {
    let mut ctx = Context::new();
    let i64t = ctx.int_type(64);
    let mut b = FunctionBuilder::new(&mut ctx, "main", &[], i64t);
    b.add_new_block("entry");
    let a = b.alloca(i64t, "a");
    let bb = b.alloca(i64t, "b");
    let one = Value::Const(b.ctx.int_constant(1, 64));
    let two = Value::Const(b.ctx.int_constant(2, 64));
    b.store(a, one);
    b.store(bb, two);
    let va = b.load(a, i64t, "a.value");
    let vb = b.load(bb, i64t, "b.value");
    let sum = b.arith(ArithOp::Add, va, vb, "sum");
    b.ret(sum);
    let mut module = Module::new();
    module.add_function(b.finish());
    check(&mut ctx, &mut module, 3);
}

/// Recursive factorial, fact(10) == 3628800.
#[test]
fn test_recursive_factorial() {
    let mut ctx = Context::new();
    let i64t = ctx.int_type(64);
    let fact_id = FuncId(0);
    let mut b = FunctionBuilder::new(&mut ctx, "fact", &[i64t], i64t);
    let entry = b.add_new_block("entry");
    let base = b.func.add_block("base");
    let recurse = b.func.add_block("recurse");
    b.select_block(entry);
    let n = b.param(0);
    let one = Value::Const(b.ctx.int_constant(1, 64));
    let cond = b.cmp(CompareMode::Signed, CompareOp::LessEq, n, one, "n.small");
    b.branch(cond, base, recurse);
    b.select_block(base);
    b.ret(one);
    b.select_block(recurse);
    let n1 = b.arith(ArithOp::Sub, n, one, "n.minus");
    let rec = b.call(Callee::Function(fact_id), &[n1], i64t, "rec");
    let result = b.arith(ArithOp::Mul, n, rec, "result");
    b.ret(result);
    let mut module = Module::new();
    module.add_function(b.finish());
    let mut m = FunctionBuilder::new(&mut ctx, "main", &[], i64t);
    m.add_new_block("entry");
    let ten = Value::Const(m.ctx.int_constant(10, 64));
    let r = m.call(Callee::Function(fact_id), &[ten], i64t, "r");
    m.ret(r);
    module.add_function(m.finish());
    check(&mut ctx, &mut module, 3_628_800);
}

/// Iterative gcd through stack slots, gcd(756476, 1253) == 7.
#[test]
fn test_iterative_gcd() {
    let mut ctx = Context::new();
    let i64t = ctx.int_type(64);
    let mut b = FunctionBuilder::new(&mut ctx, "main", &[], i64t);
    let entry = b.add_new_block("entry");
    let header = b.func.add_block("loop.header");
    let body = b.func.add_block("loop.body");
    let exit = b.func.add_block("loop.end");
    b.select_block(entry);
    let a = b.alloca(i64t, "a");
    let bs = b.alloca(i64t, "b");
    let va0 = Value::Const(b.ctx.int_constant(756_476, 64));
    let vb0 = Value::Const(b.ctx.int_constant(1253, 64));
    b.store(a, va0);
    b.store(bs, vb0);
    b.goto(header);
    b.select_block(header);
    let vb = b.load(bs, i64t, "b.value");
    let zero = Value::Const(b.ctx.int_constant(0, 64));
    let cond = b.cmp(CompareMode::Signed, CompareOp::NotEqual, vb, zero, "continue");
    b.branch(cond, body, exit);
    b.select_block(body);
    let va = b.load(a, i64t, "a.value");
    let vb1 = b.load(bs, i64t, "b.value");
    let rem = b.arith(ArithOp::SRem, va, vb1, "rem");
    b.store(a, vb1);
    b.store(bs, rem);
    b.goto(header);
    b.select_block(exit);
    let result = b.load(a, i64t, "result");
    b.ret(result);
    let mut module = Module::new();
    module.add_function(b.finish());
    check(&mut ctx, &mut module, 7);
}

/// Bubble sort over a 100-element permutation, then an is-sorted check.
/// Everything goes through stack slots, front-end style.
#[test]
fn test_bubble_sort_permutation() {
    let mut ctx = Context::new();
    let i64t = ctx.int_type(64);
    let arr_ty = ctx.array_type(i64t, 100);
    let mut b = FunctionBuilder::new(&mut ctx, "main", &[], i64t);
    let entry = b.add_new_block("entry");
    let fill_header = b.func.add_block("fill.header");
    let fill_body = b.func.add_block("fill.body");
    let outer_header = b.func.add_block("outer.header");
    let outer_body = b.func.add_block("outer.body");
    let inner_header = b.func.add_block("inner.header");
    let inner_body = b.func.add_block("inner.body");
    let swap_block = b.func.add_block("swap");
    let inner_latch = b.func.add_block("inner.latch");
    let outer_latch = b.func.add_block("outer.latch");
    let check_header = b.func.add_block("check.header");
    let check_body = b.func.add_block("check.body");
    let fail = b.func.add_block("fail");
    let check_latch = b.func.add_block("check.latch");
    let done = b.func.add_block("done");

    let zero = Value::Const(b.ctx.int_constant(0, 64));
    let one = Value::Const(b.ctx.int_constant(1, 64));
    let n = Value::Const(b.ctx.int_constant(100, 64));

    b.select_block(entry);
    let arr = b.alloca(arr_ty, "numbers");
    let i = b.alloca(i64t, "i");
    let j = b.alloca(i64t, "j");
    b.store(i, zero);
    b.goto(fill_header);

    // numbers[i] = (i * 37 + 11) % 100  -- a permutation of 0..100.
    b.select_block(fill_header);
    let vi = b.load(i, i64t, "i.value");
    let more = b.cmp(CompareMode::Signed, CompareOp::Less, vi, n, "fill.more");
    b.branch(more, fill_body, outer_header);
    b.select_block(fill_body);
    let vi2 = b.load(i, i64t, "i.value");
    let c37 = Value::Const(b.ctx.int_constant(37, 64));
    let c11 = Value::Const(b.ctx.int_constant(11, 64));
    let scaled = b.arith(ArithOp::Mul, vi2, c37, "scaled");
    let shifted = b.arith(ArithOp::Add, scaled, c11, "shifted");
    let element = b.arith(ArithOp::SRem, shifted, n, "element");
    let slot = b.gep(i64t, arr, vi2, &[], "slot");
    b.store(slot, element);
    let vi3 = b.arith(ArithOp::Add, vi2, one, "i.next");
    b.store(i, vi3);
    b.goto(fill_header);

    // for i in 0..n { for j in 0..n-1 { order numbers[j], numbers[j+1] } }
    b.select_block(outer_header);
    b.store(i, zero);
    b.goto(outer_body);
    b.select_block(outer_body);
    let vi4 = b.load(i, i64t, "i.value");
    let outer_more = b.cmp(CompareMode::Signed, CompareOp::Less, vi4, n, "outer.more");
    b.branch(outer_more, inner_header, check_header);
    b.select_block(inner_header);
    b.store(j, zero);
    b.goto(inner_body);
    b.select_block(inner_body);
    let vj = b.load(j, i64t, "j.value");
    let n1 = b.arith(ArithOp::Sub, n, one, "n.minus");
    let inner_more = b.cmp(CompareMode::Signed, CompareOp::Less, vj, n1, "inner.more");
    b.branch(inner_more, swap_block, outer_latch);
    b.select_block(swap_block);
    let vj2 = b.load(j, i64t, "j.value");
    let left_ptr = b.gep(i64t, arr, vj2, &[], "left.ptr");
    let vj3 = b.arith(ArithOp::Add, vj2, one, "j.next");
    let right_ptr = b.gep(i64t, arr, vj3, &[], "right.ptr");
    let left = b.load(left_ptr, i64t, "left");
    let right = b.load(right_ptr, i64t, "right");
    let out_of_order = b.cmp(CompareMode::Signed, CompareOp::Greater, left, right, "unordered");
    // Branchless swap keeps the CFG simple: select both sides.
    let low = b.select(out_of_order, right, left, "low");
    let high = b.select(out_of_order, left, right, "high");
    b.store(left_ptr, low);
    b.store(right_ptr, high);
    b.goto(inner_latch);
    b.select_block(inner_latch);
    let vj4 = b.load(j, i64t, "j.value");
    let vj5 = b.arith(ArithOp::Add, vj4, one, "j.step");
    b.store(j, vj5);
    b.goto(inner_body);
    b.select_block(outer_latch);
    let vi5 = b.load(i, i64t, "i.value");
    let vi6 = b.arith(ArithOp::Add, vi5, one, "i.step");
    b.store(i, vi6);
    b.goto(outer_body);

    // isSorted: every adjacent pair ordered.
    b.select_block(check_header);
    b.store(i, zero);
    b.goto(check_body);
    b.select_block(check_body);
    let ci = b.load(i, i64t, "i.value");
    let limit = b.arith(ArithOp::Sub, n, one, "limit");
    let checking = b.cmp(CompareMode::Signed, CompareOp::Less, ci, limit, "checking");
    b.branch(checking, check_latch, done);
    b.select_block(check_latch);
    let ci2 = b.load(i, i64t, "i.value");
    let this_ptr = b.gep(i64t, arr, ci2, &[], "this.ptr");
    let ci3 = b.arith(ArithOp::Add, ci2, one, "i.next");
    let next_ptr = b.gep(i64t, arr, ci3, &[], "next.ptr");
    let this_v = b.load(this_ptr, i64t, "this");
    let next_v = b.load(next_ptr, i64t, "next");
    let ordered = b.cmp(CompareMode::Signed, CompareOp::LessEq, this_v, next_v, "ordered");
    b.store(i, ci3);
    b.branch(ordered, check_body, fail);
    b.select_block(fail);
    b.ret(zero);
    b.select_block(done);
    b.ret(one);
    let mut module = Module::new();
    module.add_function(b.finish());
    check(&mut ctx, &mut module, 1);
}

/// Ackermann, ack(3, 4) == 125.
#[test]
fn test_ackermann() {
    let mut ctx = Context::new();
    let i64t = ctx.int_type(64);
    let ack_id = FuncId(0);
    let mut b = FunctionBuilder::new(&mut ctx, "ack", &[i64t, i64t], i64t);
    let entry = b.add_new_block("entry");
    let m_zero = b.func.add_block("m.zero");
    let m_pos = b.func.add_block("m.pos");
    let n_zero = b.func.add_block("n.zero");
    let n_pos = b.func.add_block("n.pos");
    let zero = Value::Const(b.ctx.int_constant(0, 64));
    let one = Value::Const(b.ctx.int_constant(1, 64));
    b.select_block(entry);
    let m = b.param(0);
    let n = b.param(1);
    let m_is_zero = b.cmp(CompareMode::Signed, CompareOp::Equal, m, zero, "m.is.zero");
    b.branch(m_is_zero, m_zero, m_pos);
    b.select_block(m_zero);
    let n_inc = b.arith(ArithOp::Add, n, one, "n.inc");
    b.ret(n_inc);
    b.select_block(m_pos);
    let n_is_zero = b.cmp(CompareMode::Signed, CompareOp::Equal, n, zero, "n.is.zero");
    b.branch(n_is_zero, n_zero, n_pos);
    b.select_block(n_zero);
    let m_dec = b.arith(ArithOp::Sub, m, one, "m.dec");
    let base = b.call(Callee::Function(ack_id), &[m_dec, one], i64t, "base");
    b.ret(base);
    b.select_block(n_pos);
    let n_dec = b.arith(ArithOp::Sub, n, one, "n.dec");
    let inner = b.call(Callee::Function(ack_id), &[m, n_dec], i64t, "inner");
    let m_dec2 = b.arith(ArithOp::Sub, m, one, "m.dec");
    let outer = b.call(Callee::Function(ack_id), &[m_dec2, inner], i64t, "outer");
    b.ret(outer);
    let mut module = Module::new();
    module.add_function(b.finish());
    let mut main = FunctionBuilder::new(&mut ctx, "main", &[], i64t);
    main.add_new_block("entry");
    let three = Value::Const(main.ctx.int_constant(3, 64));
    let four = Value::Const(main.ctx.int_constant(4, 64));
    let r = main.call(Callee::Function(ack_id), &[three, four], i64t, "r");
    main.ret(r);
    module.add_function(main.finish());
    check(&mut ctx, &mut module, 125);
}

/// fn main() { var i = 0; modify(&i); return i; }  with the callee writing
/// 10 through its reference parameter. Guards against dead-code elimination
/// of a call whose return value is unused but which writes memory.
#[test]
fn test_write_through_reference_parameter() {
    let mut ctx = Context::new();
    let i64t = ctx.int_type(64);
    let ptr = ctx.ptr_type();
    let void = ctx.void_type();
    let mut module = Module::new();
    let modify_id = FuncId(0);
    let mut cb = FunctionBuilder::new(&mut ctx, "modify", &[ptr], void);
    cb.add_new_block("entry");
    let ten = Value::Const(cb.ctx.int_constant(10, 64));
    cb.store(cb.param(0), ten);
    cb.ret_void();
    module.add_function(cb.finish());
    let mut b = FunctionBuilder::new(&mut ctx, "main", &[], i64t);
    b.add_new_block("entry");
    let slot = b.alloca(i64t, "i");
    let zero = Value::Const(b.ctx.int_constant(0, 64));
    b.store(slot, zero);
    b.call(Callee::Function(modify_id), &[slot], void, "");
    let result = b.load(slot, i64t, "result");
    b.ret(result);
    module.add_function(b.finish());
    check(&mut ctx, &mut module, 10);
}

/// Each registered pass individually preserves the invariants on a module
/// that exercises loops, calls, and aggregates.
#[test]
fn test_every_pass_preserves_invariants() {
    for pass in scatha::passes::registry().passes() {
        let mut ctx = Context::new();
        let i64t = ctx.int_type(64);
        let pair = ctx.anonymous_struct(&[i64t, i64t]);
        let mut b = FunctionBuilder::new(&mut ctx, "main", &[], i64t);
        let entry = b.add_new_block("entry");
        let header = b.func.add_block("header");
        let body = b.func.add_block("body");
        let exit = b.func.add_block("exit");
        b.select_block(entry);
        let acc = b.alloca(pair, "acc");
        let zero = Value::Const(b.ctx.int_constant(0, 64));
        let one = Value::Const(b.ctx.int_constant(1, 64));
        let first = b.gep(pair, acc, zero, &[0u32], "first");
        let second = b.gep(pair, acc, zero, &[1u32], "second");
        b.store(first, zero);
        b.store(second, zero);
        b.goto(header);
        b.select_block(header);
        let v = b.load(first, i64t, "v");
        let ten = Value::Const(b.ctx.int_constant(10, 64));
        let more = b.cmp(CompareMode::Signed, CompareOp::Less, v, ten, "more");
        b.branch(more, body, exit);
        b.select_block(body);
        let v2 = b.load(first, i64t, "v");
        let next = b.arith(ArithOp::Add, v2, one, "next");
        b.store(first, next);
        let s = b.load(second, i64t, "s");
        let s2 = b.arith(ArithOp::Add, s, v2, "s.next");
        b.store(second, s2);
        b.goto(header);
        b.select_block(exit);
        let total = b.load(second, i64t, "total");
        b.ret(total);
        let mut module = Module::new();
        let id = module.add_function(b.finish());
        // 0+1+...+9
        assert_eq!(run_main(&ctx, &module), 45, "scenario sanity");
        (pass.run)(&mut ctx, &mut module, id);
        validate_module(&ctx, &module)
            .unwrap_or_else(|e| panic!("pass {} broke invariants: {e}", pass.name));
        assert_eq!(
            run_main(&ctx, &module),
            45,
            "pass {} changed behaviour",
            pass.name
        );
    }
}

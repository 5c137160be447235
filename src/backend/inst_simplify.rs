//! MIR instruction simplification.
//!
//! Register-to-register copies are replaced by their source, copies from
//! undef disappear, and `lea`s with neither dynamic offset nor constant
//! offset term collapse to their base register. Replacements propagate
//! through chains until a fixed point.

use hashbrown::HashMap;

use crate::backend::mir::{MirFunction, MirInst, MirValue, Reg};

pub fn inst_simplify(func: &mut MirFunction) -> bool {
    let mut modified = false;
    loop {
        let mut replacements: HashMap<Reg, MirValue> = HashMap::new();
        let mut removals: Vec<(usize, usize)> = Vec::new();
        for &block_id in &func.block_order {
            let block = func.block(block_id);
            for (inst_index, inst) in block.insts.iter().enumerate() {
                match *inst {
                    MirInst::Copy {
                        dest,
                        source: MirValue::Reg(source),
                        ..
                    } => {
                        replacements.insert(dest, MirValue::Reg(source));
                        removals.push((block_id.0 as usize, inst_index));
                    }
                    MirInst::Copy {
                        source: MirValue::Undef,
                        ..
                    } => {
                        // The copied value is undefined; the register keeps
                        // whatever it holds.
                        removals.push((block_id.0 as usize, inst_index));
                    }
                    MirInst::Lea { dest, addr } => {
                        if addr.dyn_offset.is_none() && addr.offset_term == 0 {
                            replacements.insert(dest, MirValue::Reg(addr.base));
                            removals.push((block_id.0 as usize, inst_index));
                        }
                    }
                    _ => {}
                }
            }
        }
        if replacements.is_empty() && removals.is_empty() {
            break;
        }
        // Resolve replacement chains to their final value.
        let resolve = |mut value: MirValue| {
            let mut hops = 0;
            while let MirValue::Reg(reg) = value {
                match replacements.get(&reg) {
                    Some(&next) if hops < replacements.len() => {
                        value = next;
                        hops += 1;
                    }
                    _ => break,
                }
            }
            value
        };
        for block in &mut func.blocks {
            for inst in &mut block.insts {
                let mut to_fix: Vec<(Reg, MirValue)> = Vec::new();
                inst.for_each_value(|v| {
                    if let MirValue::Reg(reg) = v {
                        let resolved = resolve(v);
                        if resolved != v {
                            to_fix.push((reg, resolved));
                        }
                    }
                });
                for (old, new) in to_fix {
                    inst.replace_reg(old, new);
                }
            }
        }
        // Delete the folded definitions, highest index first per block.
        let mut by_block: HashMap<usize, Vec<usize>> = HashMap::new();
        for (block, index) in removals {
            by_block.entry(block).or_default().push(index);
        }
        for (block, mut indices) in by_block {
            indices.sort_unstable_by(|a, b| b.cmp(a));
            for index in indices {
                func.blocks[block].insts.remove(index);
            }
        }
        modified = true;
    }
    modified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mir::{MemoryAddress, MirBlockId};
    use crate::ir::ir::ArithOp;

    #[test]
    fn test_copy_chain_folds_to_source() {
        let mut func = MirFunction::default();
        let block = func.add_block("entry");
        let a = func.alloc_regs(1);
        let b = func.alloc_regs(1);
        let c = func.alloc_regs(1);
        let d = func.alloc_regs(1);
        func.block_mut(block).insts = vec![
            MirInst::Copy {
                dest: b,
                source: MirValue::Reg(a),
                width: 8,
            },
            MirInst::Copy {
                dest: c,
                source: MirValue::Reg(b),
                width: 8,
            },
            MirInst::ValueArith {
                dest: d,
                lhs: MirValue::Reg(c),
                rhs: MirValue::Reg(c),
                op: ArithOp::Add,
                width: 8,
            },
            MirInst::Return {
                args: vec![MirValue::Reg(d)],
            },
        ];
        assert!(inst_simplify(&mut func));
        let insts = &func.block(block).insts;
        assert_eq!(insts.len(), 2);
        let MirInst::ValueArith { lhs, rhs, .. } = insts[0] else {
            panic!("expected arithmetic first");
        };
        assert_eq!(lhs, MirValue::Reg(a));
        assert_eq!(rhs, MirValue::Reg(a));
    }

    #[test]
    fn test_zero_offset_lea_folds() {
        let mut func = MirFunction::default();
        let block = func.add_block("entry");
        let base = func.alloc_regs(1);
        let lea = func.alloc_regs(1);
        func.block_mut(block).insts = vec![
            MirInst::Lea {
                dest: lea,
                addr: MemoryAddress::plain(base),
            },
            MirInst::Load {
                dest: func.alloc_regs(1),
                addr: MemoryAddress::plain(lea),
                width: 8,
            },
            MirInst::Jump {
                target: MirBlockId(0),
            },
        ];
        assert!(inst_simplify(&mut func));
        let insts = &func.block(block).insts;
        let MirInst::Load { addr, .. } = insts[0] else {
            panic!("lea folded away");
        };
        assert_eq!(addr.base, base);
    }
}

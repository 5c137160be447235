//! Jump elision.
//!
//! Reorders the basic blocks with a depth-first search so that as many
//! edges as possible become adjacent in layout order, then erases jumps to
//! the textually next block. A jump whose target holds nothing but a single
//! terminator gets that terminator copied in place of the jump; a fall-through
//! successor with a single predecessor is spliced into its predecessor.

use hashbrown::HashSet;

use crate::backend::mir::{MirBlockId, MirFunction, MirInst};

pub fn elide_jumps(func: &mut MirFunction) {
    if func.block_order.is_empty() {
        return;
    }
    let entry = func.block_order[0];
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    dfs(func, entry, &mut visited, &mut order);
    // Blocks the DFS never reached are dead; their successors drop the edge.
    let dead: Vec<MirBlockId> = func
        .block_order
        .iter()
        .copied()
        .filter(|b| !visited.contains(b))
        .collect();
    for &block in &dead {
        let succs = func.block(block).succs.clone();
        for succ in succs {
            func.block_mut(succ).preds.retain(|&p| p != block);
        }
    }
    func.block_order = order;
    copy_trivial_targets(func);
    remove_jumps(func);
}

/// Depth-first over jump targets: the target of the final jump is visited
/// first so it lands directly after this block in the new order.
fn dfs(
    func: &MirFunction,
    block: MirBlockId,
    visited: &mut HashSet<MirBlockId>,
    order: &mut Vec<MirBlockId>,
) {
    if !visited.insert(block) {
        return;
    }
    order.push(block);
    // Trailing run of jump instructions, last first.
    let mut targets = Vec::new();
    for inst in func.block(block).insts.iter().rev() {
        match inst.jump_target() {
            Some(target) => targets.push(target),
            None => break,
        }
    }
    for target in targets {
        dfs(func, target, visited, order);
    }
}

/// When a jump's target holds exactly its terminator, the terminator is
/// copied over the jump and the edge rerouted.
fn copy_trivial_targets(func: &mut MirFunction) {
    for position in 0..func.block_order.len() {
        let block = func.block_order[position];
        let next = func.block_order.get(position + 1).copied();
        let Some(MirInst::Jump { target }) = func.block(block).insts.last().cloned() else {
            continue;
        };
        // Fall-through jumps are handled by `remove_jumps`.
        if Some(target) == next {
            continue;
        }
        if func.block(target).insts.len() != 1 {
            continue;
        }
        let replacement = func.block(target).insts[0].clone();
        if !replacement.is_terminator() {
            continue;
        }
        let insts = &mut func.block_mut(block).insts;
        insts.pop();
        insts.push(replacement.clone());
        func.block_mut(target).preds.retain(|&p| p != block);
        func.block_mut(block).succs.retain(|&s| s != target);
        if let Some(new_target) = replacement.jump_target() {
            func.block_mut(new_target).preds.push(block);
            func.block_mut(block).succs.push(new_target);
        }
    }
}

fn remove_jumps(func: &mut MirFunction) {
    let mut position = 0;
    while position < func.block_order.len() {
        let block = func.block_order[position];
        loop {
            let next = func.block_order.get(position + 1).copied();
            let Some(MirInst::Jump { target }) = func.block(block).insts.last().cloned() else {
                break;
            };
            if Some(target) != next {
                break;
            }
            // Control flows through; the jump is dead weight.
            func.block_mut(block).insts.pop();
            let next_block = target;
            if func.block(next_block).preds.len() > 1 {
                break;
            }
            // No other jump in this block may target the successor either.
            let has_other_jumps = func
                .block(block)
                .insts
                .iter()
                .any(|inst| inst.jump_target() == Some(next_block));
            if has_other_jumps {
                break;
            }
            // Splice the successor into this block.
            let spliced = std::mem::take(&mut func.block_mut(next_block).insts);
            func.block_mut(block).insts.extend(spliced);
            let succs = std::mem::take(&mut func.block_mut(next_block).succs);
            func.block_mut(block).succs.retain(|&s| s != next_block);
            for &succ in &succs {
                let preds = &mut func.block_mut(succ).preds;
                preds.retain(|&p| p != next_block);
                preds.push(block);
            }
            func.block_mut(block).succs.extend(succs);
            func.block_order.remove(position + 1);
        }
        position += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mir::MirValue;

    /// entry jumps to `b`, which jumps to `c`: after elision everything is
    /// one straight-line block.
    #[test]
    fn test_chain_collapses() {
        let mut func = MirFunction::default();
        let entry = func.add_block("entry");
        let b = func.add_block("b");
        let c = func.add_block("c");
        func.block_mut(entry).insts = vec![MirInst::Jump { target: b }];
        func.block_mut(entry).succs = vec![b];
        func.block_mut(b).insts = vec![MirInst::Jump { target: c }];
        func.block_mut(b).preds = vec![entry];
        func.block_mut(b).succs = vec![c];
        func.block_mut(c).insts = vec![MirInst::Return { args: vec![] }];
        func.block_mut(c).preds = vec![b];
        elide_jumps(&mut func);
        assert_eq!(func.block_order.len(), 1);
        let insts = &func.block(entry).insts;
        assert_eq!(insts.len(), 1);
        assert!(matches!(insts[0], MirInst::Return { .. }));
    }

    /// A jump to a return-only block gets the return copied in place.
    #[test]
    fn test_trivial_target_is_copied() {
        let mut func = MirFunction::default();
        let entry = func.add_block("entry");
        let middle = func.add_block("middle");
        let exit = func.add_block("exit");
        let r = func.alloc_regs(1);
        // entry falls through to middle; both jump to the shared exit.
        func.block_mut(entry).insts = vec![MirInst::Jump { target: middle }];
        func.block_mut(entry).succs = vec![middle];
        func.block_mut(middle).insts = vec![
            MirInst::Copy {
                dest: r,
                source: MirValue::Const { value: 1, width: 8 },
                width: 8,
            },
            MirInst::Jump { target: exit },
        ];
        func.block_mut(middle).preds = vec![entry];
        func.block_mut(middle).succs = vec![exit];
        func.block_mut(exit).insts = vec![MirInst::Return {
            args: vec![MirValue::Reg(r)],
        }];
        func.block_mut(exit).preds = vec![middle];
        elide_jumps(&mut func);
        // Everything collapses into the entry, ending in the copied return.
        assert_eq!(func.block_order.len(), 1);
        assert!(matches!(
            func.block(entry).insts.last(),
            Some(MirInst::Return { .. })
        ));
    }
}

//! Access trees.
//!
//! A recursive mirror of a record type with a value payload per node,
//! fanning out to children on demand. Instruction combining uses one tree
//! per insert/extract chain to memoize which value sits at which member
//! path, so redundant `insert_value`/`extract_value` sequences collapse.

use crate::ir::ir::Value;
use crate::ir::types::{TypeData, TypeId, TypeInterner};

#[derive(Debug, Clone)]
pub struct AccessTree {
    ty: TypeId,
    children: Vec<Option<Box<AccessTree>>>,
    value: Option<Value>,
}

impl AccessTree {
    pub fn new(ty: TypeId) -> AccessTree {
        AccessTree {
            ty,
            children: Vec::new(),
            value: None,
        }
    }

    pub fn ty(&self) -> TypeId {
        self.ty
    }

    pub fn value(&self) -> Option<Value> {
        self.value
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = Some(value);
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn child_at(&self, index: usize) -> Option<&AccessTree> {
        self.children.get(index).and_then(|c| c.as_deref())
    }

    pub fn child_at_mut(&mut self, index: usize) -> Option<&mut AccessTree> {
        self.children.get_mut(index).and_then(|c| c.as_deref_mut())
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    fn member_count(&self, types: &TypeInterner) -> usize {
        match types.data(self.ty) {
            TypeData::Record { members, .. } => members.len(),
            TypeData::Array { count, .. } => *count,
            _ => 0,
        }
    }

    /// Creates children for every member of this node's type.
    pub fn fan_out(&mut self, types: &TypeInterner) {
        let count = self.member_count(types);
        if count == 0 {
            return;
        }
        if self.children.len() < count {
            self.children.resize_with(count, || None);
        }
        for index in 0..count {
            if self.children[index].is_none() {
                let child_ty = types.member_type_at(self.ty, index);
                self.children[index] = Some(Box::new(AccessTree::new(child_ty)));
            }
        }
    }

    /// Whether any child node carries a constant value.
    pub fn has_constant_children(&self) -> bool {
        self.children.iter().flatten().any(|child| {
            matches!(child.value, Some(Value::Const(_)))
        })
    }

    /// Invokes `callback` for every leaf together with its member index path.
    pub fn leaf_walk(&self, callback: &mut impl FnMut(&AccessTree, &[u32])) {
        let mut indices = Vec::new();
        self.leaf_walk_impl(callback, &mut indices);
    }

    fn leaf_walk_impl(&self, callback: &mut impl FnMut(&AccessTree, &[u32]), indices: &mut Vec<u32>) {
        if !self.has_children() {
            callback(self, indices);
            return;
        }
        for (index, child) in self.children.iter().enumerate() {
            if let Some(child) = child {
                indices.push(index as u32);
                child.leaf_walk_impl(callback, indices);
                indices.pop();
            }
        }
    }

    /// Post-order walk over all nodes, with the member index path of each
    /// node. Mutable so the callback can fill in node values bottom-up.
    pub fn post_order_walk(&mut self, callback: &mut impl FnMut(&mut AccessTree, &[u32])) {
        let mut indices = Vec::new();
        self.post_order_walk_impl(callback, &mut indices);
    }

    fn post_order_walk_impl(
        &mut self,
        callback: &mut impl FnMut(&mut AccessTree, &[u32]),
        indices: &mut Vec<u32>,
    ) {
        for index in 0..self.children.len() {
            if self.children[index].is_some() {
                indices.push(index as u32);
                let child = self.children[index].as_deref_mut().expect("checked");
                child.post_order_walk_impl(callback, indices);
                indices.pop();
            }
        }
        callback(self, indices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::ValueId;

    #[test]
    fn test_fan_out_and_walks() {
        let mut types = TypeInterner::new();
        let i32t = types.int(32);
        let inner = types.anonymous_record(&[i32t, i32t]);
        let outer = types.anonymous_record(&[inner, i32t]);
        let mut tree = AccessTree::new(outer);
        tree.fan_out(&types);
        assert_eq!(tree.num_children(), 2);
        tree.child_at_mut(0).unwrap().fan_out(&types);
        tree.child_at_mut(0)
            .unwrap()
            .child_at_mut(1)
            .unwrap()
            .set_value(Value::Local(ValueId(7)));
        let mut leaves = Vec::new();
        tree.leaf_walk(&mut |node, indices| {
            leaves.push((indices.to_vec(), node.value()));
        });
        assert_eq!(leaves.len(), 3);
        assert_eq!(leaves[1].0, vec![0, 1]);
        assert_eq!(leaves[1].1, Some(Value::Local(ValueId(7))));
        let mut order = Vec::new();
        tree.post_order_walk(&mut |node, indices| {
            order.push((indices.to_vec(), node.has_children()));
        });
        // Children come before their parents.
        assert_eq!(order.last().unwrap().0, Vec::<u32>::new());
        assert!(order.last().unwrap().1);
    }
}

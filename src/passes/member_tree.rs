//! Member trees.
//!
//! A member tree mirrors a type's layout as a tree of byte ranges: the root
//! spans the whole type, record nodes fan out into one child per member and
//! array nodes into one child per element. SROA uses it to find the
//! "critical positions" a slice must respect so that every sliced access
//! still lands on contiguous member boundaries.

use crate::ir::types::{TypeData, TypeId, TypeInterner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

#[derive(Debug)]
pub struct MemberTreeNode {
    pub ty: TypeId,
    /// Index of this node within its parent.
    pub index: u32,
    /// Byte range relative to the root.
    pub begin: usize,
    pub end: usize,
    children: Vec<NodeId>,
}

pub struct MemberTree {
    nodes: Vec<MemberTreeNode>,
    root: NodeId,
}

impl MemberTree {
    pub fn compute(types: &TypeInterner, ty: TypeId) -> MemberTree {
        let mut tree = MemberTree {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        tree.root = tree.build(types, ty, 0, 0);
        tree
    }

    fn build(&mut self, types: &TypeInterner, ty: TypeId, index: u32, begin: usize) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(MemberTreeNode {
            ty,
            index,
            begin,
            end: begin + types.size(ty),
            children: Vec::new(),
        });
        let children: Vec<NodeId> = match types.data(ty).clone() {
            TypeData::Record { members, .. } => members
                .iter()
                .enumerate()
                .map(|(i, m)| self.build(types, m.ty, i as u32, begin + m.offset))
                .collect(),
            TypeData::Array { elem, count } => {
                let elem_size = types.size(elem);
                (0..count)
                    .map(|i| self.build(types, elem, i as u32, begin + i * elem_size))
                    .collect()
            }
            _ => Vec::new(),
        };
        self.nodes[id.0].children = children;
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &MemberTreeNode {
        &self.nodes[id.0]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }
}

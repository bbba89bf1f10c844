//! Field-path codec (C3).
//!
//! A field path is a small stack of signed indices addressing one leaf
//! field under a class's serializer root. The wire encoding is a
//! frequency-weighted Huffman code over ~40 named operations; the code
//! itself is never transmitted as a table, only the tree shape implied by
//! the fixed weights below, so the tree is built once and walked bit by
//! bit rather than looked up by value.

use std::sync::OnceLock;

use crate::bitreader::BitReader;
use crate::config::DEFAULT_FIELD_PATH_DEPTH;
use crate::error::{Error, Result};
use crate::utils::BoundedStack;

pub type PathStack = BoundedStack<i32, 8>;

/// One entry of the field path: start at `[-1]`; terminated paths with a
/// single entry address a direct child of the serializer root.
#[derive(Debug, Clone, Default)]
pub struct FieldPath {
    stack: PathStack,
}

impl FieldPath {
    pub fn new() -> Self {
        let mut stack = PathStack::new();
        stack.push(-1).expect("fresh stack has room for one entry");
        FieldPath { stack }
    }

    pub fn reset(&mut self) {
        self.stack = PathStack::new();
        self.stack.push(-1).expect("fresh stack has room for one entry");
    }

    pub fn indices(&self) -> &[i32] {
        self.stack.as_slice()
    }

    fn top_mut(&mut self) -> Result<&mut i32> {
        self.stack.top_mut()
    }

    fn push(&mut self, v: i32) -> Result<()> {
        self.stack.push(v)
    }

    fn pop(&mut self) -> Result<i32> {
        self.stack.pop()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum FieldPathOp {
    PlusOne,
    PlusTwo,
    PlusThree,
    PlusFour,
    PlusN,
    PushOneLeftDeltaZeroRightZero,
    PushOneLeftDeltaZeroRightNonZero,
    PushOneLeftDeltaOneRightZero,
    PushOneLeftDeltaOneRightNonZero,
    PushOneLeftDeltaNRightZero,
    PushOneLeftDeltaNRightNonZero,
    PushOneLeftDeltaNRightNonZeroPack6Bits,
    PushOneLeftDeltaNRightNonZeroPack8Bits,
    PushTwoLeftDeltaZero,
    PushTwoPack5LeftDeltaZero,
    PushThreeLeftDeltaZero,
    PushThreePack5LeftDeltaZero,
    PushTwoLeftDeltaOne,
    PushTwoPack5LeftDeltaOne,
    PushThreeLeftDeltaOne,
    PushThreePack5LeftDeltaOne,
    PushTwoLeftDeltaN,
    PushTwoPack5LeftDeltaN,
    PushThreeLeftDeltaN,
    PushThreePack5LeftDeltaN,
    PushN,
    PushNAndNonTopological,
    PopOnePlusOne,
    PopOnePlusN,
    PopAllButOnePlusOne,
    PopAllButOnePlusN,
    PopAllButOnePlusNPack3Bits,
    PopAllButOnePlusNPack6Bits,
    PopNPlusOne,
    PopNPlusN,
    PopNAndNonTopographical,
    NonTopoComplex,
    NonTopoPenultimatePlusOne,
    NonTopoComplexPack4Bits,
    FieldPathEncodeFinish,
}

/// `(op, huffman weight)`, in the exact order the reference decoder
/// assigns operation numbers. The weights are the observed frequency of
/// each operation across real replays and fully determine the tree shape.
const OPS: [(FieldPathOp, u32); 40] = [
    (FieldPathOp::PlusOne, 36271),
    (FieldPathOp::PlusTwo, 10334),
    (FieldPathOp::PlusThree, 1375),
    (FieldPathOp::PlusFour, 646),
    (FieldPathOp::PlusN, 4128),
    (FieldPathOp::PushOneLeftDeltaZeroRightZero, 35),
    (FieldPathOp::PushOneLeftDeltaZeroRightNonZero, 3),
    (FieldPathOp::PushOneLeftDeltaOneRightZero, 521),
    (FieldPathOp::PushOneLeftDeltaOneRightNonZero, 2942),
    (FieldPathOp::PushOneLeftDeltaNRightZero, 560),
    (FieldPathOp::PushOneLeftDeltaNRightNonZero, 471),
    (FieldPathOp::PushOneLeftDeltaNRightNonZeroPack6Bits, 10530),
    (FieldPathOp::PushOneLeftDeltaNRightNonZeroPack8Bits, 251),
    (FieldPathOp::PushTwoLeftDeltaZero, 1),
    (FieldPathOp::PushTwoPack5LeftDeltaZero, 1),
    (FieldPathOp::PushThreeLeftDeltaZero, 1),
    (FieldPathOp::PushThreePack5LeftDeltaZero, 1),
    (FieldPathOp::PushTwoLeftDeltaOne, 1),
    (FieldPathOp::PushTwoPack5LeftDeltaOne, 1),
    (FieldPathOp::PushThreeLeftDeltaOne, 1),
    (FieldPathOp::PushThreePack5LeftDeltaOne, 1),
    (FieldPathOp::PushTwoLeftDeltaN, 1),
    (FieldPathOp::PushTwoPack5LeftDeltaN, 1),
    (FieldPathOp::PushThreeLeftDeltaN, 1),
    (FieldPathOp::PushThreePack5LeftDeltaN, 1),
    (FieldPathOp::PushN, 1),
    (FieldPathOp::PushNAndNonTopological, 310),
    (FieldPathOp::PopOnePlusOne, 2),
    (FieldPathOp::PopOnePlusN, 1),
    (FieldPathOp::PopAllButOnePlusOne, 1837),
    (FieldPathOp::PopAllButOnePlusN, 149),
    (FieldPathOp::PopAllButOnePlusNPack3Bits, 300),
    (FieldPathOp::PopAllButOnePlusNPack6Bits, 634),
    (FieldPathOp::PopNPlusOne, 1),
    (FieldPathOp::PopNPlusN, 1),
    (FieldPathOp::PopNAndNonTopographical, 1),
    (FieldPathOp::NonTopoComplex, 76),
    (FieldPathOp::NonTopoPenultimatePlusOne, 271),
    (FieldPathOp::NonTopoComplexPack4Bits, 99),
    (FieldPathOp::FieldPathEncodeFinish, 25474),
];

#[derive(Clone, Copy)]
enum TreeNode {
    Leaf(FieldPathOp),
    Branch(u32, u32),
}

struct HuffmanTree {
    nodes: Vec<TreeNode>,
    root: u32,
}

fn build_tree() -> HuffmanTree {
    struct Working {
        weight: u32,
        num: u32,
        node: u32,
    }

    let mut nodes: Vec<TreeNode> = Vec::with_capacity(OPS.len() * 2);
    let mut working: Vec<Working> = Vec::with_capacity(OPS.len());
    for (i, (op, weight)) in OPS.iter().enumerate() {
        nodes.push(TreeNode::Leaf(*op));
        working.push(Working {
            weight: *weight,
            num: i as u32,
            node: i as u32,
        });
    }
    let mut next_num = OPS.len() as u32;

    while working.len() > 1 {
        // Priority: lowest weight first; ties broken by highest `num`.
        let (i_best, _) = working
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.weight
                    .cmp(&b.weight)
                    .then_with(|| b.num.cmp(&a.num))
            })
            .unwrap();
        let first = working.swap_remove(i_best);
        let (i_second, _) = working
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.weight
                    .cmp(&b.weight)
                    .then_with(|| b.num.cmp(&a.num))
            })
            .unwrap();
        let second = working.swap_remove(i_second);

        let branch_idx = nodes.len() as u32;
        nodes.push(TreeNode::Branch(first.node, second.node));
        working.push(Working {
            weight: first.weight + second.weight,
            num: next_num,
            node: branch_idx,
        });
        next_num += 1;
    }

    HuffmanTree {
        root: working[0].node,
        nodes,
    }
}

static TREE: OnceLock<HuffmanTree> = OnceLock::new();

fn tree() -> &'static HuffmanTree {
    TREE.get_or_init(build_tree)
}

/// Walk the Huffman tree bit by bit to decode the next operation.
pub fn read_op(b: &mut BitReader) -> Result<FieldPathOp> {
    let t = tree();
    let mut idx = t.root;
    loop {
        match t.nodes[idx as usize] {
            TreeNode::Leaf(op) => return Ok(op),
            TreeNode::Branch(left, right) => {
                idx = if b.read_bool()? { right } else { left };
            }
        }
    }
}

/// Apply one decoded operation to `path`, consuming whatever payload bits
/// that operation carries.
pub fn apply_op(op: FieldPathOp, b: &mut BitReader, path: &mut FieldPath) -> Result<()> {
    use FieldPathOp::*;
    match op {
        PlusOne => *path.top_mut()? += 1,
        PlusTwo => *path.top_mut()? += 2,
        PlusThree => *path.top_mut()? += 3,
        PlusFour => *path.top_mut()? += 4,
        PlusN => *path.top_mut()? += b.read_fpbitvar()? + 5,
        PushOneLeftDeltaZeroRightZero => path.push(0)?,
        PushOneLeftDeltaZeroRightNonZero => {
            let v = b.read_fpbitvar()?;
            path.push(v)?;
        }
        PushOneLeftDeltaOneRightZero => {
            *path.top_mut()? += 1;
            path.push(0)?;
        }
        PushOneLeftDeltaOneRightNonZero => {
            *path.top_mut()? += 1;
            let v = b.read_fpbitvar()?;
            path.push(v)?;
        }
        PushOneLeftDeltaNRightZero => {
            let delta = b.read_fpbitvar()?;
            *path.top_mut()? += delta;
            path.push(0)?;
        }
        PushOneLeftDeltaNRightNonZero => {
            let delta = b.read_fpbitvar()?;
            *path.top_mut()? += delta + 2;
            let v = b.read_fpbitvar()? + 1;
            path.push(v)?;
        }
        PushOneLeftDeltaNRightNonZeroPack6Bits => {
            let delta = b.read(3)? as i32;
            *path.top_mut()? += delta + 2;
            let v = b.read(3)? as i32 + 1;
            path.push(v)?;
        }
        PushOneLeftDeltaNRightNonZeroPack8Bits => {
            let delta = b.read(4)? as i32;
            *path.top_mut()? += delta + 2;
            let v = b.read(4)? as i32 + 1;
            path.push(v)?;
        }
        PushTwoLeftDeltaZero => {
            let a = b.read_fpbitvar()?;
            let c = b.read_fpbitvar()?;
            path.push(a)?;
            path.push(c)?;
        }
        PushTwoPack5LeftDeltaZero => {
            let a = b.read(5)? as i32;
            let c = b.read(5)? as i32;
            path.push(a)?;
            path.push(c)?;
        }
        PushThreeLeftDeltaZero => {
            let a = b.read_fpbitvar()?;
            let c = b.read_fpbitvar()?;
            let d = b.read_fpbitvar()?;
            path.push(a)?;
            path.push(c)?;
            path.push(d)?;
        }
        PushThreePack5LeftDeltaZero => {
            let a = b.read(5)? as i32;
            let c = b.read(5)? as i32;
            let d = b.read(5)? as i32;
            path.push(a)?;
            path.push(c)?;
            path.push(d)?;
        }
        PushTwoLeftDeltaOne => {
            *path.top_mut()? += 1;
            let a = b.read_fpbitvar()?;
            let c = b.read_fpbitvar()?;
            path.push(a)?;
            path.push(c)?;
        }
        PushTwoPack5LeftDeltaOne => {
            *path.top_mut()? += 1;
            let a = b.read(5)? as i32;
            let c = b.read(5)? as i32;
            path.push(a)?;
            path.push(c)?;
        }
        PushThreeLeftDeltaOne => {
            *path.top_mut()? += 1;
            let a = b.read_fpbitvar()?;
            let c = b.read_fpbitvar()?;
            let d = b.read_fpbitvar()?;
            path.push(a)?;
            path.push(c)?;
            path.push(d)?;
        }
        PushThreePack5LeftDeltaOne => {
            *path.top_mut()? += 1;
            let a = b.read(5)? as i32;
            let c = b.read(5)? as i32;
            let d = b.read(5)? as i32;
            path.push(a)?;
            path.push(c)?;
            path.push(d)?;
        }
        PushTwoLeftDeltaN => {
            let delta = b.read_ubitvar()? as i32;
            *path.top_mut()? += delta + 2;
            let a = b.read_fpbitvar()?;
            let c = b.read_fpbitvar()?;
            path.push(a)?;
            path.push(c)?;
        }
        PushTwoPack5LeftDeltaN => {
            let delta = b.read_ubitvar()? as i32;
            *path.top_mut()? += delta + 2;
            let a = b.read(5)? as i32;
            let c = b.read(5)? as i32;
            path.push(a)?;
            path.push(c)?;
        }
        PushThreeLeftDeltaN => {
            let delta = b.read_ubitvar()? as i32;
            *path.top_mut()? += delta + 2;
            let a = b.read_fpbitvar()?;
            let c = b.read_fpbitvar()?;
            let d = b.read_fpbitvar()?;
            path.push(a)?;
            path.push(c)?;
            path.push(d)?;
        }
        PushThreePack5LeftDeltaN => {
            let delta = b.read_ubitvar()? as i32;
            *path.top_mut()? += delta + 2;
            let a = b.read(5)? as i32;
            let c = b.read(5)? as i32;
            let d = b.read(5)? as i32;
            path.push(a)?;
            path.push(c)?;
            path.push(d)?;
        }
        PushN => {
            let n = b.read_ubitvar()?;
            let delta = b.read_ubitvar()? as i32;
            *path.top_mut()? += delta;
            for _ in 0..n {
                let v = b.read_fpbitvar()?;
                path.push(v)?;
            }
        }
        PushNAndNonTopological => {
            for idx in path.stack.as_mut_slice() {
                if b.read_bool()? {
                    *idx += b.read_svarint32()? + 1;
                }
            }
            let n = b.read_ubitvar()?;
            for _ in 0..n {
                let v = b.read_fpbitvar()?;
                path.push(v)?;
            }
        }
        PopOnePlusOne => {
            path.pop()?;
            *path.top_mut()? += 1;
        }
        PopOnePlusN => {
            path.pop()?;
            let v = b.read_fpbitvar()? + 1;
            *path.top_mut()? += v;
        }
        PopAllButOnePlusOne => {
            path.stack.truncate(1)?;
            *path.top_mut()? += 1;
        }
        PopAllButOnePlusN => {
            path.stack.truncate(1)?;
            let v = b.read_fpbitvar()? + 1;
            *path.top_mut()? += v;
        }
        PopAllButOnePlusNPack3Bits => {
            path.stack.truncate(1)?;
            let v = b.read(3)? as i32 + 1;
            *path.top_mut()? += v;
        }
        PopAllButOnePlusNPack6Bits => {
            path.stack.truncate(1)?;
            let v = b.read(6)? as i32 + 1;
            *path.top_mut()? += v;
        }
        PopNPlusOne => {
            let pop_count = b.read_fpbitvar()?;
            let new_len = (path.stack.len() as i32) - pop_count;
            if new_len <= 0 || new_len >= DEFAULT_FIELD_PATH_DEPTH as i32 - 1 {
                return Err(Error::InvalidFieldPath("PopNPlusOne: invalid size"));
            }
            path.stack.truncate(new_len as usize)?;
            *path.top_mut()? += 1;
        }
        PopNPlusN => {
            let pop_count = b.read_fpbitvar()?;
            let new_len = (path.stack.len() as i32) - pop_count;
            if new_len <= 0 || new_len >= DEFAULT_FIELD_PATH_DEPTH as i32 - 1 {
                return Err(Error::InvalidFieldPath("PopNPlusN: invalid size"));
            }
            path.stack.truncate(new_len as usize)?;
            let delta = b.read_svarint32()?;
            *path.top_mut()? += delta;
        }
        PopNAndNonTopographical => {
            let pop_count = b.read_fpbitvar()?;
            let new_len = (path.stack.len() as i32) - pop_count;
            if new_len <= 0 || new_len >= DEFAULT_FIELD_PATH_DEPTH as i32 - 1 {
                return Err(Error::InvalidFieldPath("PopNAndNonTopographical: invalid size"));
            }
            path.stack.truncate(new_len as usize)?;
            for idx in path.stack.as_mut_slice() {
                if b.read_bool()? {
                    *idx += b.read_svarint32()?;
                }
            }
        }
        NonTopoComplex => {
            for idx in path.stack.as_mut_slice() {
                if b.read_bool()? {
                    *idx += b.read_svarint32()?;
                }
            }
        }
        NonTopoPenultimatePlusOne => {
            if path.stack.len() < 2 {
                return Err(Error::InvalidFieldPath("NonTopoPenultimatePlusOne: stack too short"));
            }
            let len = path.stack.len();
            *path.stack.get_mut(len - 2)? += 1;
        }
        NonTopoComplexPack4Bits => {
            for idx in path.stack.as_mut_slice() {
                if b.read_bool()? {
                    *idx += b.read(4)? as i32 - 7;
                }
            }
        }
        FieldPathEncodeFinish => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_has_forty_leaves() {
        let t = tree();
        let leaves = t
            .nodes
            .iter()
            .filter(|n| matches!(n, TreeNode::Leaf(_)))
            .count();
        assert_eq!(leaves, 40);
    }

    #[test]
    fn finish_is_shallow() {
        // FieldPathEncodeFinish has by far the highest weight alongside
        // PlusOne, so it should sit within a couple of bits of the root.
        let t = tree();
        fn depth(nodes: &[TreeNode], idx: u32, target: FieldPathOp, d: u32) -> Option<u32> {
            match nodes[idx as usize] {
                TreeNode::Leaf(op) if op == target => Some(d),
                TreeNode::Leaf(_) => None,
                TreeNode::Branch(l, r) => {
                    depth(nodes, l, target, d + 1).or_else(|| depth(nodes, r, target, d + 1))
                }
            }
        }
        let d = depth(&t.nodes, t.root, FieldPathOp::FieldPathEncodeFinish, 0).unwrap();
        assert!(d <= 3, "expected FieldPathEncodeFinish near the root, got depth {d}");
    }

    #[test]
    fn plus_one_then_push_zero() {
        let mut path = FieldPath::new();
        let mut b = BitReader::new(&[]);
        apply_op(FieldPathOp::PlusOne, &mut b, &mut path).unwrap();
        apply_op(FieldPathOp::PushOneLeftDeltaZeroRightZero, &mut b, &mut path).unwrap();
        assert_eq!(path.indices(), &[0, 0]);
    }
}

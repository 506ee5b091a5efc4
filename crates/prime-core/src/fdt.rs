//! Read-only view over a Flattened Device Tree blob.
//!
//! The vendor firmware container is an FDT whose nodes describe flashable
//! images. This module parses the structure block once into an index side
//! table and hands out cheap node handles borrowing the original blob; no
//! property data is copied. Writing or reflowing a tree is not supported.

use std::str;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

const FDT_MAGIC: u32 = 0xd00d_feed;
const HEADER_LEN: usize = 40;

// structure block tokens
const FDT_BEGIN_NODE: u32 = 0x01;
const FDT_END_NODE: u32 = 0x02;
const FDT_PROP: u32 = 0x03;
const FDT_NOP: u32 = 0x04;
const FDT_END: u32 = 0x09;

#[derive(Error, Debug)]
pub enum FdtError {
    #[error("bad magic: {0:#010x}")]
    BadMagic(u32),

    #[error("truncated device tree blob")]
    Truncated,

    #[error("unexpected token {token:#x} at offset {offset:#x}")]
    UnexpectedToken { token: u32, offset: usize },

    #[error("bad string reference in structure block")]
    BadString,

    #[error("property is not a string")]
    NotAString,

    #[error("property is not valid utf-8")]
    InvalidUtf8,
}

struct PropRec {
    name: (usize, usize),
    value: (usize, usize),
}

struct NodeRec {
    name: (usize, usize),
    children: Vec<usize>,
    props: Vec<PropRec>,
}

/// Parsed device tree. Borrows the blob for its whole lifetime; callers
/// keep the backing buffer alive until every derived handle is gone.
pub struct Fdt<'a> {
    data: &'a [u8],
    nodes: Vec<NodeRec>,
}

impl<'a> Fdt<'a> {
    /// Parses the blob header and walks the structure block. The blob may
    /// carry trailing bytes beyond `totalsize`; anything shorter than the
    /// declared layout is rejected.
    pub fn parse(data: &'a [u8]) -> Result<Self, FdtError> {
        if data.len() < HEADER_LEN {
            return Err(FdtError::Truncated);
        }
        let magic = BigEndian::read_u32(&data[0..4]);
        if magic != FDT_MAGIC {
            return Err(FdtError::BadMagic(magic));
        }
        let total_size = BigEndian::read_u32(&data[4..8]) as usize;
        let off_struct = BigEndian::read_u32(&data[8..12]) as usize;
        let off_strings = BigEndian::read_u32(&data[12..16]) as usize;
        let size_strings = BigEndian::read_u32(&data[32..36]) as usize;
        let size_struct = BigEndian::read_u32(&data[36..40]) as usize;

        let struct_end = off_struct.checked_add(size_struct).ok_or(FdtError::Truncated)?;
        let strings_end = off_strings.checked_add(size_strings).ok_or(FdtError::Truncated)?;
        if total_size > data.len() || struct_end > total_size || strings_end > total_size {
            return Err(FdtError::Truncated);
        }

        let mut fdt = Fdt {
            data,
            nodes: Vec::new(),
        };
        fdt.walk_structure(off_struct, struct_end, off_strings, strings_end)?;
        Ok(fdt)
    }

    /// Root node handle.
    pub fn root(&self) -> Node<'_> {
        Node {
            fdt: self,
            index: 0,
        }
    }

    fn walk_structure(
        &mut self,
        off_struct: usize,
        struct_end: usize,
        off_strings: usize,
        strings_end: usize,
    ) -> Result<(), FdtError> {
        let mut cursor = off_struct;
        let mut stack: Vec<usize> = Vec::new();

        loop {
            let token_offset = cursor;
            let token = self.read_token(&mut cursor, struct_end)?;
            match token {
                FDT_BEGIN_NODE => {
                    let name = self.read_node_name(&mut cursor, struct_end)?;
                    let index = self.nodes.len();
                    if let Some(&parent) = stack.last() {
                        self.nodes[parent].children.push(index);
                    } else if index != 0 {
                        // a second top-level node is malformed
                        return Err(FdtError::UnexpectedToken {
                            token,
                            offset: token_offset,
                        });
                    }
                    self.nodes.push(NodeRec {
                        name,
                        children: Vec::new(),
                        props: Vec::new(),
                    });
                    stack.push(index);
                }
                FDT_END_NODE => {
                    if stack.pop().is_none() {
                        return Err(FdtError::UnexpectedToken {
                            token,
                            offset: token_offset,
                        });
                    }
                }
                FDT_PROP => {
                    let len = self.read_token(&mut cursor, struct_end)? as usize;
                    let name_off = self.read_token(&mut cursor, struct_end)? as usize;
                    let value_start = cursor;
                    let value_end = value_start.checked_add(len).ok_or(FdtError::Truncated)?;
                    if value_end > struct_end {
                        return Err(FdtError::Truncated);
                    }
                    cursor = align4(value_end);

                    let abs_name = off_strings.checked_add(name_off).ok_or(FdtError::BadString)?;
                    let name = cstr_range(self.data, abs_name, strings_end)?;
                    let &node = stack.last().ok_or(FdtError::UnexpectedToken {
                        token,
                        offset: token_offset,
                    })?;
                    self.nodes[node].props.push(PropRec {
                        name,
                        value: (value_start, value_end),
                    });
                }
                FDT_NOP => {}
                FDT_END => {
                    if !stack.is_empty() || self.nodes.is_empty() {
                        return Err(FdtError::Truncated);
                    }
                    return Ok(());
                }
                other => {
                    return Err(FdtError::UnexpectedToken {
                        token: other,
                        offset: token_offset,
                    });
                }
            }
        }
    }

    fn read_token(&self, cursor: &mut usize, end: usize) -> Result<u32, FdtError> {
        let next = cursor.checked_add(4).ok_or(FdtError::Truncated)?;
        if next > end {
            return Err(FdtError::Truncated);
        }
        let token = BigEndian::read_u32(&self.data[*cursor..next]);
        *cursor = next;
        Ok(token)
    }

    fn read_node_name(&self, cursor: &mut usize, end: usize) -> Result<(usize, usize), FdtError> {
        let range = cstr_range(self.data, *cursor, end)?;
        *cursor = align4(range.1 + 1);
        Ok(range)
    }

    fn str_at(&self, range: (usize, usize)) -> &'a str {
        // ranges were UTF-8 validated during parse
        str::from_utf8(&self.data[range.0..range.1]).unwrap_or_default()
    }
}

/// NUL-terminated string starting at `start`, bounded by `end`. Returns the
/// byte range excluding the terminator, validated as UTF-8.
fn cstr_range(data: &[u8], start: usize, end: usize) -> Result<(usize, usize), FdtError> {
    if start > end || end > data.len() {
        return Err(FdtError::BadString);
    }
    let nul = data[start..end]
        .iter()
        .position(|&b| b == 0)
        .ok_or(FdtError::BadString)?;
    str::from_utf8(&data[start..start + nul]).map_err(|_| FdtError::InvalidUtf8)?;
    Ok((start, start + nul))
}

fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

/// Handle to one node of the tree.
#[derive(Clone, Copy)]
pub struct Node<'a> {
    fdt: &'a Fdt<'a>,
    index: usize,
}

impl<'a> Node<'a> {
    /// Node name; empty for the root.
    pub fn name(&self) -> &'a str {
        self.fdt.str_at(self.fdt.nodes[self.index].name)
    }

    /// Looks up a property on this node.
    pub fn property(&self, name: &str) -> Option<Property<'a>> {
        let fdt = self.fdt;
        fdt.nodes[self.index]
            .props
            .iter()
            .find(|prop| fdt.str_at(prop.name) == name)
            .map(|prop| Property {
                name: fdt.str_at(prop.name),
                value: &fdt.data[prop.value.0..prop.value.1],
            })
    }

    /// Direct child by name.
    pub fn child(&self, name: &str) -> Option<Node<'a>> {
        let fdt = self.fdt;
        fdt.nodes[self.index]
            .children
            .iter()
            .copied()
            .find(|&index| fdt.str_at(fdt.nodes[index].name) == name)
            .map(|index| Node { fdt, index })
    }

    /// Walks a slash-separated path relative to this node, e.g.
    /// `images/kernel/hash`.
    pub fn walk(&self, path: &str) -> Option<Node<'a>> {
        let mut current = *self;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = current.child(component)?;
        }
        Some(current)
    }

    /// Child nodes in declaration order.
    pub fn children(self) -> impl Iterator<Item = Node<'a>> {
        let fdt = self.fdt;
        fdt.nodes[self.index]
            .children
            .iter()
            .map(move |&index| Node { fdt, index })
    }

    /// Child node names in declaration order.
    pub fn child_names(&self) -> Vec<&'a str> {
        self.children().map(|node| node.name()).collect()
    }
}

/// Decoded property reference.
#[derive(Clone, Copy)]
pub struct Property<'a> {
    name: &'a str,
    value: &'a [u8],
}

impl<'a> Property<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Raw property bytes as stored in the blob.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.value
    }

    /// Property decoded as a NUL-terminated UTF-8 string. Interior NULs and
    /// missing terminators are decode errors, distinct from an absent
    /// property.
    pub fn as_str(&self) -> Result<&'a str, FdtError> {
        let (last, body) = self.value.split_last().ok_or(FdtError::NotAString)?;
        if *last != 0 || body.contains(&0) {
            return Err(FdtError::NotAString);
        }
        str::from_utf8(body).map_err(|_| FdtError::InvalidUtf8)
    }
}

#[cfg(test)]
pub(crate) use test_builder::TestNode;

//! Binary codec for the master file table.
//!
//! The table is the whole inode tree flattened depth-first, little-endian
//! throughout, with no header or footer. Each record is:
//!
//! ```text
//! id            u32
//! name_len      u32    name bytes including one NUL terminator
//! name          [u8]   name_len bytes, last byte 0x00
//! is_directory  u8     0 or 1
//! is_readonly   u8     0 or 1, always 0 for directories
//! ```
//!
//! followed for files by `filesize: u32`, `entry_count: u32` and the extent
//! pairs `(start_block: u32, block_count: u32)`, and for directories by
//! `entry_count: u32` and, per child, a reference pair `(child_id: u32,
//! 0: u32)` with the child's own record nested immediately after it.
//!
//! Loading runs in two phases. Phase one reads every record into a flat
//! list, keeping each record's entries as packed placeholder values rather
//! than links. Phase two resolves every directory's placeholder ids against
//! the full list and converts them into real ownership, so a parent written
//! before its children were readable as objects still ends up owning them.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::mem;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{FsError, Result};
use crate::extent::{pack_entry, unpack_entry, Extent};
use crate::node::{Inode, NodePayload};

/// Writes the tree rooted at `root` as a master file table.
pub fn write_tree<W: Write>(w: &mut W, root: &Inode) -> Result<()> {
    write_node(w, root)
}

fn write_node<W: Write>(w: &mut W, node: &Inode) -> Result<()> {
    w.write_u32::<LittleEndian>(node.id())?;

    let name = node.name().as_bytes();
    w.write_u32::<LittleEndian>(name.len() as u32 + 1)?;
    w.write_all(name)?;
    w.write_u8(0)?;

    w.write_u8(node.is_directory() as u8)?;
    w.write_u8(node.is_readonly() as u8)?;

    match &node.payload {
        NodePayload::File {
            filesize, extents, ..
        } => {
            w.write_u32::<LittleEndian>(*filesize)?;
            w.write_u32::<LittleEndian>(extents.len() as u32)?;
            for extent in extents {
                w.write_u32::<LittleEndian>(extent.start_block)?;
                w.write_u32::<LittleEndian>(extent.block_count)?;
            }
        }
        NodePayload::Directory { children } => {
            w.write_u32::<LittleEndian>(children.len() as u32)?;
            for child in children {
                w.write_u32::<LittleEndian>(child.id())?;
                w.write_u32::<LittleEndian>(0)?;
                write_node(w, child)?;
            }
        }
    }
    Ok(())
}

/// A record as it sits in the byte stream. Entries are packed placeholder
/// values, either `(start_block, block_count)` for files or `(child_id, 0)`
/// for directories, and nothing is wired to anything yet.
struct RawNode {
    id: u32,
    name: String,
    is_directory: bool,
    readonly: bool,
    filesize: u32,
    entries: Vec<u64>,
}

/// Reads a master file table back into an owned tree. The first record in
/// the stream is the root.
pub fn read_tree<R: Read>(r: &mut R) -> Result<Inode> {
    let mut records = Vec::new();
    read_node(r, &mut records)?;

    let mut probe = [0u8; 1];
    if r.read(&mut probe)? != 0 {
        return Err(FsError::Corrupt("trailing bytes after the inode tree"));
    }

    resolve(records)
}

fn read_node<R: Read>(r: &mut R, records: &mut Vec<RawNode>) -> Result<()> {
    let id = read_u32(r)?;
    let name = read_name(r)?;
    let is_directory = read_flag(r, "kind flag is neither file nor directory")?;
    let readonly = read_flag(r, "read-only flag is neither 0 nor 1")?;
    if is_directory && readonly {
        return Err(FsError::Corrupt("directory marked read-only"));
    }

    if is_directory {
        let entry_count = read_u32(r)?;
        records.push(RawNode {
            id,
            name,
            is_directory,
            readonly,
            filesize: 0,
            entries: Vec::new(),
        });
        let index = records.len() - 1;
        for _ in 0..entry_count {
            let child_id = read_u32(r)?;
            let unused = read_u32(r)?;
            records[index].entries.push(pack_entry(child_id, unused));
            read_node(r, records)?;
        }
    } else {
        let filesize = read_u32(r)?;
        let entry_count = read_u32(r)?;
        let mut entries = Vec::new();
        for _ in 0..entry_count {
            let start_block = read_u32(r)?;
            let block_count = read_u32(r)?;
            entries.push(pack_entry(start_block, block_count));
        }
        records.push(RawNode {
            id,
            name,
            is_directory,
            readonly,
            filesize,
            entries,
        });
    }
    Ok(())
}

fn resolve(records: Vec<RawNode>) -> Result<Inode> {
    let mut by_id = HashMap::new();
    for (index, record) in records.iter().enumerate() {
        if by_id.insert(record.id, index).is_some() {
            return Err(FsError::Corrupt("two inode records share an id"));
        }
    }

    // Inflate every record into a free-standing node, keeping directory
    // placeholder entries aside for the wiring pass.
    let mut slots: Vec<Option<Inode>> = Vec::new();
    let mut placeholders: Vec<Vec<u64>> = Vec::new();
    for record in records {
        let RawNode {
            id,
            name,
            is_directory,
            readonly,
            filesize,
            entries,
        } = record;
        if is_directory {
            slots.push(Some(Inode::new_dir(id, name)));
            placeholders.push(entries);
        } else {
            let mut extents = Vec::new();
            for &entry in &entries {
                let (start_block, block_count) = unpack_entry(entry);
                if block_count == 0 {
                    return Err(FsError::Corrupt("extent with a block count of zero"));
                }
                extents.push(Extent::new(start_block, block_count));
            }
            slots.push(Some(Inode::new_file(id, name, readonly, filesize, extents)));
            placeholders.push(Vec::new());
        }
    }

    // Children are wired deepest-first, so every subtree is complete by the
    // time its parent claims ownership of it.
    for index in (0..slots.len()).rev() {
        if placeholders[index].is_empty() {
            continue;
        }
        let entries = mem::replace(&mut placeholders[index], Vec::new());
        let mut children = Vec::new();
        for entry in entries {
            let (child_id, _) = unpack_entry(entry);
            let child_index = *by_id
                .get(&child_id)
                .ok_or(FsError::DanglingReference(child_id))?;
            let child = slots[child_index]
                .take()
                .ok_or(FsError::Corrupt("inode owned by more than one directory"))?;
            children.push(child);
        }
        let dir = slots[index]
            .as_mut()
            .ok_or(FsError::Corrupt("inode owned by more than one directory"))?;
        match &mut dir.payload {
            NodePayload::Directory { children: slot } => *slot = children,
            NodePayload::File { .. } => {
                unreachable!("placeholder entries recorded for a file record")
            }
        }
    }

    let root = slots[0]
        .take()
        .ok_or(FsError::Corrupt("root claimed as a child"))?;
    if slots.iter().any(|slot| slot.is_some()) {
        return Err(FsError::Corrupt("inode record not referenced by any directory"));
    }
    Ok(root)
}

fn read_name<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u32(r)?;
    if len == 0 {
        return Err(FsError::Corrupt("name length of zero"));
    }

    let mut buf = Vec::new();
    r.by_ref().take(u64::from(len)).read_to_end(&mut buf)?;
    if buf.len() != len as usize {
        return Err(FsError::Truncated);
    }
    if buf.pop() != Some(0) {
        return Err(FsError::Corrupt("name is not NUL terminated"));
    }
    if buf.is_empty() {
        return Err(FsError::Corrupt("empty node name"));
    }
    String::from_utf8(buf).map_err(|_| FsError::Corrupt("name is not valid utf-8"))
}

fn read_flag<R: Read>(r: &mut R, msg: &'static str) -> Result<bool> {
    match read_u8(r)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(FsError::Corrupt(msg)),
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    r.read_u32::<LittleEndian>().map_err(eof_as_truncated)
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    r.read_u8().map_err(eof_as_truncated)
}

fn eof_as_truncated(err: io::Error) -> FsError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        FsError::Truncated
    } else {
        FsError::Io(err)
    }
}

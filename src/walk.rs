//! Read-only diagnostic dump of the tree and its block usage.

use std::fmt::Write;

use crate::node::{Inode, NodePayload};

/// Renders the tree with two-space indentation, one line per node, followed
/// by a table of every disk block with a 1 for blocks claimed by some
/// file's extents. Purely diagnostic; the output format is not a contract.
pub fn report(root: &Inode, num_blocks: u32) -> String {
    let mut out = String::new();
    let mut table = vec![false; num_blocks as usize];
    walk_node(root, 0, &mut out, &mut table);
    render_table(&mut out, &table);
    out
}

fn walk_node(node: &Inode, depth: usize, out: &mut String, table: &mut [bool]) {
    for _ in 0..depth {
        out.push_str("  ");
    }
    match &node.payload {
        NodePayload::Directory { children } => {
            let _ = writeln!(out, "{} (id {})", node.name(), node.id());
            for child in children {
                walk_node(child, depth + 1, out, table);
            }
        }
        NodePayload::File {
            filesize, extents, ..
        } => {
            let _ = writeln!(out, "{} (id {} size {})", node.name(), node.id(), filesize);
            for extent in extents {
                for blockno in extent.blocks() {
                    if let Some(slot) = table.get_mut(blockno as usize) {
                        *slot = true;
                    }
                }
            }
        }
    }
}

fn render_table(out: &mut String, table: &[bool]) {
    out.push_str("Blocks recorded in master file table:");
    for (blocknr, used) in table.iter().enumerate() {
        if blocknr % 20 == 0 {
            let _ = write!(out, "\n{:03}: ", blocknr);
        }
        out.push(if *used { '1' } else { '0' });
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent;

    #[test]
    fn report_indents_children_and_marks_used_blocks() {
        let mut root = Inode::new_dir(1, "/".to_string());
        let mut docs = Inode::new_dir(2, "docs".to_string());
        let file = Inode::new_file(
            3,
            "a.txt".to_string(),
            false,
            1000,
            vec![Extent::new(2, 2)],
        );
        match &mut docs.payload {
            NodePayload::Directory { children } => children.push(file),
            _ => unreachable!(),
        }
        match &mut root.payload {
            NodePayload::Directory { children } => children.push(docs),
            _ => unreachable!(),
        }

        let report = report(&root, 8);

        assert!(report.starts_with("/ (id 1)\n  docs (id 2)\n    a.txt (id 3 size 1000)\n"));
        assert!(report.contains("Blocks recorded in master file table:"));
        assert!(report.contains("\n000: 00110000"));
    }

    #[test]
    fn table_wraps_every_twenty_blocks() {
        let root = Inode::new_dir(1, "/".to_string());

        let report = report(&root, 25);

        assert!(report.contains("\n000: 00000000000000000000"));
        assert!(report.contains("\n020: 00000"));
    }

    #[test]
    fn extents_past_the_table_are_ignored() {
        let mut root = Inode::new_dir(1, "/".to_string());
        let file = Inode::new_file(2, "big".to_string(), false, 512, vec![Extent::new(6, 4)]);
        match &mut root.payload {
            NodePayload::Directory { children } => children.push(file),
            _ => unreachable!(),
        }

        let report = report(&root, 8);

        assert!(report.contains("\n000: 00000011"));
    }
}

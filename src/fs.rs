use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use log::info;
use tempfile::NamedTempFile;

use crate::alloc::{plan_extents, BitmapAllocator, BlockAllocator};
use crate::error::{FsError, Result};
use crate::node::{Inode, NodeKind, NodePayload};
use crate::table;
use crate::walk;

/// Shape of the simulated disk, fixed when the filesystem is created or
/// loaded and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    /// Bytes per block.
    pub block_size: u32,
    /// Total blocks on the disk.
    pub num_blocks: u32,
}

impl Default for DiskGeometry {
    /// A fixed 64 4k block disk, the shape used throughout development.
    fn default() -> Self {
        Self {
            block_size: 4096,
            num_blocks: 64,
        }
    }
}

impl DiskGeometry {
    /// Blocks needed to hold `bytes` bytes of file data.
    fn blocks_for(&self, bytes: u32) -> u32 {
        ((u64::from(bytes) + u64::from(self.block_size) - 1) / u64::from(self.block_size)) as u32
    }
}

/// The in-memory inode tree together with the block allocator backing its
/// files. All operations address nodes by id, the same key the master file
/// table uses on disk.
pub struct FileSystem<A: BlockAllocator = BitmapAllocator> {
    geometry: DiskGeometry,
    alloc: A,
    root: Inode,
    /// Last id handed out. Ids only ever grow and are never reused, even
    /// across a save/load cycle.
    last_id: u32,
}

impl FileSystem<BitmapAllocator> {
    /// A fresh filesystem holding only the root directory `/`.
    pub fn new(geometry: DiskGeometry) -> Self {
        Self::with_allocator(geometry, BitmapAllocator::new(geometry.num_blocks))
    }

    /// Reads a master file table back into a live filesystem.
    ///
    /// Every block claimed by a loaded extent is re-reserved in a fresh
    /// allocator, and the id counter resumes past the largest id in the
    /// table. Any inconsistency in the table aborts the whole load.
    pub fn load<P: AsRef<Path>>(path: P, geometry: DiskGeometry) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let root = table::read_tree(&mut reader)?;

        let mut alloc = BitmapAllocator::new(geometry.num_blocks);
        reserve_tree(&root, &geometry, &mut alloc)?;

        let last_id = root.max_id();
        info!(
            "loaded master file table from {} (largest id {})",
            path.as_ref().display(),
            last_id
        );
        Ok(Self {
            geometry,
            alloc,
            root,
            last_id,
        })
    }
}

impl<A: BlockAllocator> FileSystem<A> {
    /// Builds the filesystem over a caller-supplied allocator.
    pub fn with_allocator(geometry: DiskGeometry, alloc: A) -> Self {
        Self {
            geometry,
            alloc,
            root: Inode::new_dir(1, "/".to_string()),
            last_id: 1,
        }
    }

    pub fn geometry(&self) -> DiskGeometry {
        self.geometry
    }

    pub fn root(&self) -> &Inode {
        &self.root
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Pre-order search over the whole tree; see [`Inode::find_by_name`].
    pub fn find_by_name(&self, name: &str) -> Option<&Inode> {
        self.root.find_by_name(name)
    }

    pub fn node(&self, id: u32) -> Option<&Inode> {
        self.root.find_by_id(id)
    }

    /// Creates a file of `size_in_bytes` bytes under the directory
    /// `parent_id` and returns the new node's id.
    ///
    /// All validation happens before the allocator is touched, and a failed
    /// allocation releases everything it took, so an error leaves both the
    /// tree and the allocator exactly as they were.
    pub fn create_file(
        &mut self,
        parent_id: u32,
        name: &str,
        readonly: bool,
        size_in_bytes: u32,
    ) -> Result<u32> {
        if name.is_empty() {
            return Err(FsError::EmptyName);
        }
        if size_in_bytes == 0 {
            return Err(FsError::EmptySize);
        }
        self.check_new_name(name)?;
        self.check_parent(parent_id)?;

        let required = self.geometry.blocks_for(size_in_bytes);
        let extents = plan_extents(&mut self.alloc, required)?;

        let id = self.next_id();
        let node = Inode::new_file(id, name.to_string(), readonly, size_in_bytes, extents);
        self.attach(parent_id, node);
        info!(
            "created file \"{}\" (id {}, {} bytes over {} blocks)",
            name, id, size_in_bytes, required
        );
        Ok(id)
    }

    /// Creates an empty directory under `parent_id` and returns its id.
    /// Directories allocate no blocks.
    pub fn create_dir(&mut self, parent_id: u32, name: &str) -> Result<u32> {
        if name.is_empty() {
            return Err(FsError::EmptyName);
        }
        self.check_new_name(name)?;
        self.check_parent(parent_id)?;

        let id = self.next_id();
        self.attach(parent_id, Inode::new_dir(id, name.to_string()));
        info!("created directory \"{}\" (id {})", name, id);
        Ok(id)
    }

    /// Deletes the file `node_id`, which must be a direct child of the
    /// directory `parent_id`, returning all of its blocks to the allocator.
    pub fn delete_file(&mut self, parent_id: u32, node_id: u32) -> Result<()> {
        let node = self.detach(parent_id, node_id, NodeKind::File)?;
        for extent in node.extents() {
            for blockno in extent.blocks() {
                self.alloc.free_block(blockno);
            }
        }
        info!("deleted file \"{}\" (id {})", node.name(), node_id);
        Ok(())
    }

    /// Deletes the directory `node_id`, which must be empty and a direct
    /// child of the directory `parent_id`.
    pub fn delete_dir(&mut self, parent_id: u32, node_id: u32) -> Result<()> {
        let node = self.detach(parent_id, node_id, NodeKind::Directory)?;
        info!("deleted directory \"{}\" (id {})", node.name(), node_id);
        Ok(())
    }

    /// Writes the master file table to `path`, replacing any previous table
    /// in one step: the new table is staged in a temporary file next to the
    /// target and renamed over it only once fully written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut staged = NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))?;
        {
            let mut writer = BufWriter::new(staged.as_file_mut());
            table::write_tree(&mut writer, &self.root)?;
            writer.flush()?;
        }
        staged.persist(path).map_err(|err| FsError::Io(err.error))?;
        info!("wrote master file table to {}", path.display());
        Ok(())
    }

    /// Human-readable tree dump plus the block-usage table.
    pub fn debug_report(&self) -> String {
        walk::report(&self.root, self.geometry.num_blocks)
    }

    fn next_id(&mut self) -> u32 {
        self.last_id += 1;
        self.last_id
    }

    /// Names are unique across the entire tree, not merely among siblings.
    fn check_new_name(&self, name: &str) -> Result<()> {
        if self.root.find_by_name(name).is_some() {
            return Err(FsError::NameCollision(name.to_string()));
        }
        Ok(())
    }

    fn check_parent(&self, parent_id: u32) -> Result<()> {
        let parent = self
            .root
            .find_by_id(parent_id)
            .ok_or(FsError::NodeNotFound(parent_id))?;
        if !parent.is_directory() {
            return Err(FsError::WrongKind);
        }
        Ok(())
    }

    fn attach(&mut self, parent_id: u32, node: Inode) {
        if let Some(parent) = self.root.find_by_id_mut(parent_id) {
            if let NodePayload::Directory { children } = &mut parent.payload {
                children.push(node);
                return;
            }
        }
        unreachable!("parent validated before attach");
    }

    fn detach(&mut self, parent_id: u32, node_id: u32, kind: NodeKind) -> Result<Inode> {
        let parent = self
            .root
            .find_by_id_mut(parent_id)
            .ok_or(FsError::NodeNotFound(parent_id))?;
        let children = match &mut parent.payload {
            NodePayload::Directory { children } => children,
            NodePayload::File { .. } => return Err(FsError::WrongKind),
        };

        let position = children
            .iter()
            .position(|child| child.id() == node_id)
            .ok_or(FsError::NotAChild)?;
        if children[position].kind() != kind {
            return Err(FsError::WrongKind);
        }
        if kind == NodeKind::Directory && !children[position].children().is_empty() {
            return Err(FsError::DirectoryNotEmpty);
        }

        // Sibling order carries no meaning, so the cheap removal is fine.
        Ok(children.swap_remove(position))
    }
}

/// Re-reserves every block claimed by a file extent and checks each file's
/// extents cover exactly the blocks its size requires.
fn reserve_tree(node: &Inode, geometry: &DiskGeometry, alloc: &mut BitmapAllocator) -> Result<()> {
    match node.kind() {
        NodeKind::File => {
            let mut total: u64 = 0;
            for extent in node.extents() {
                if extent.start_block.checked_add(extent.block_count).is_none() {
                    return Err(FsError::Corrupt("extent reaches past the end of the disk"));
                }
                total += u64::from(extent.block_count);
                for blockno in extent.blocks() {
                    alloc.reserve(blockno)?;
                }
            }
            if total != u64::from(geometry.blocks_for(node.filesize())) {
                return Err(FsError::Corrupt("file size disagrees with its extents"));
            }
        }
        NodeKind::Directory => {
            for child in node.children() {
                reserve_tree(child, geometry, alloc)?;
            }
        }
    }
    Ok(())
}

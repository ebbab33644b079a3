//! File-data addressing (direct + single-indirect pointers) and byte-granular read/write/
//! truncate/permission operations on inode records.

use crate::block::BlockDevice;
use crate::config::{
    BLOCK_SIZE, DIRECT_POINTERS, INODE_SIZE, INODE_TABLE_START, S_IFDIR, S_IFMT, S_IFREG,
    SINGLE_INDIRECT,
};
use crate::error::{FsError, FsResult};
use crate::superblock::Superblock;
use crate::user::Identity;
use crate::util::get_timestamp;
use std::mem::size_of;

/// Read permission bit.
pub const PERM_READ: u16 = 0o4;
/// Write permission bit.
pub const PERM_WRITE: u16 = 0o2;
/// Execute permission bit.
pub const PERM_EXEC: u16 = 0o1;

/// An on-disk inode record: 128 bytes, direct plus single-indirect block addressing only.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Inode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    pub blocks: u32,
    pub flags: u32,
    pub block: [u32; 15],
    pub generation: u32,
    _padding: [u8; INODE_SIZE - Inode::HEADER_LEN],
}

const _: () = assert!(size_of::<Inode>() == INODE_SIZE);

impl Inode {
    const HEADER_LEN: usize = 100;

    fn empty(mode: u16, uid: u16, gid: u16, now: u32) -> Self {
        Self {
            mode,
            uid,
            size: 0,
            atime: now,
            ctime: now,
            mtime: now,
            dtime: 0,
            gid,
            links_count: 1,
            blocks: 0,
            flags: 0,
            block: [0; 15],
            generation: 0,
            _padding: [0; INODE_SIZE - Self::HEADER_LEN],
        }
    }

    /// Builds the root directory's inode record directly, bypassing the bitmap allocator since
    /// inode 2 is reserved rather than allocated.
    pub(crate) fn for_format(mode: u16, uid: u16, gid: u16, now: u32, data_block: u32) -> Self {
        let mut inode = Self::empty(mode, uid, gid, now);
        inode.links_count = 2;
        inode.block[0] = data_block;
        inode.size = BLOCK_SIZE as u32;
        inode.blocks = 1;
        inode
    }

    /// The file-type nibble of the mode (`S_IFREG`, `S_IFDIR`, ...).
    pub fn file_type(&self) -> u16 {
        self.mode & S_IFMT
    }

    /// Whether this inode describes a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    /// Whether this inode describes a regular file.
    pub fn is_regular(&self) -> bool {
        self.file_type() == S_IFREG
    }

    /// The permission bits granted to `identity` (one of the three rwx nibbles).
    fn granted_bits(&self, identity: &Identity) -> u16 {
        let mode = self.mode;
        if identity.uid == self.uid as u32 {
            (mode >> 6) & 0o7
        } else if identity.gid == self.gid as u32 {
            (mode >> 3) & 0o7
        } else {
            mode & 0o7
        }
    }

    /// Tells whether `identity` holds every bit in `required` (owner, group, or other nibble,
    /// whichever applies). There is no superuser bypass.
    pub fn check_permission(&self, required: u16, identity: &Identity) -> bool {
        self.granted_bits(identity) & required == required
    }
}

fn inode_location(inode_no: u32) -> FsResult<(u32, usize)> {
    if inode_no == 0 || inode_no > crate::config::MAX_INODES {
        return Err(FsError::OutOfRange);
    }
    let index = (inode_no - 1) as usize;
    let per_block = BLOCK_SIZE / INODE_SIZE;
    let block = INODE_TABLE_START + (index / per_block) as u32;
    let offset = (index % per_block) * INODE_SIZE;
    Ok((block, offset))
}

/// Reads inode number `inode_no` (1-indexed) from the inode table. Returns `FsError::NotFound`
/// if the inode has been freed (a dangling handle left open across a `delete`), since a freed
/// inode's record is zeroed rather than removed.
pub fn read_inode(dev: &mut BlockDevice, inode_no: u32) -> FsResult<Inode> {
    let (block_no, offset) = inode_location(inode_no)?;
    if !crate::alloc::inode_is_allocated(dev, inode_no)? {
        return Err(FsError::NotFound);
    }
    let block = dev.read_block(block_no)?;
    let inode = unsafe { std::ptr::read_unaligned(block[offset..].as_ptr() as *const Inode) };
    Ok(inode)
}

/// Writes inode number `inode_no` back to the inode table.
pub fn write_inode(dev: &mut BlockDevice, inode_no: u32, inode: &Inode) -> FsResult<()> {
    let (block_no, offset) = inode_location(inode_no)?;
    let mut block = dev.read_block(block_no)?;
    let bytes = unsafe {
        std::slice::from_raw_parts(inode as *const Inode as *const u8, size_of::<Inode>())
    };
    block[offset..offset + bytes.len()].copy_from_slice(bytes);
    dev.write_block(block_no, &block)
}

/// Allocates an inode and initializes it as a live, empty file or directory.
pub fn create_inode(
    dev: &mut BlockDevice,
    sb: &mut Superblock,
    mode: u16,
    uid: u16,
    gid: u16,
) -> FsResult<u32> {
    let inode_no = crate::alloc::allocate_inode(dev, sb)?;
    let inode = Inode::empty(mode, uid, gid, get_timestamp());
    write_inode(dev, inode_no, &inode)?;
    log::info!("created inode {inode_no} (mode {mode:#o})");
    Ok(inode_no)
}

/// Frees every data block owned by inode `inode_no`, then the inode itself.
pub fn delete_inode(dev: &mut BlockDevice, sb: &mut Superblock, inode_no: u32) -> FsResult<()> {
    let inode = read_inode(dev, inode_no)?;
    for i in 0..DIRECT_POINTERS {
        let ptr = inode.block[i];
        if ptr != 0 {
            crate::alloc::free_block(dev, sb, ptr)?;
        }
    }
    let indirect = inode.block[SINGLE_INDIRECT];
    if indirect != 0 {
        let indirect_block = dev.read_block(indirect)?;
        for entry in indirect_block.chunks_exact(4) {
            let ptr = u32::from_le_bytes(entry.try_into().unwrap());
            if ptr != 0 {
                crate::alloc::free_block(dev, sb, ptr)?;
            }
        }
        crate::alloc::free_block(dev, sb, indirect)?;
    }
    write_inode(dev, inode_no, &Inode::empty(0, 0, 0, 0))?;
    crate::alloc::free_inode(dev, sb, inode_no)?;
    log::info!("deleted inode {inode_no}");
    Ok(())
}

/// Returns the data block number mapped at logical block index `logical`, or 0 for a hole.
pub fn get_inode_block(dev: &mut BlockDevice, inode: &Inode, logical: usize) -> FsResult<u32> {
    if logical < DIRECT_POINTERS {
        return Ok(inode.block[logical]);
    }
    let indirect_index = logical - DIRECT_POINTERS;
    if indirect_index >= crate::config::POINTERS_PER_BLOCK {
        return Err(FsError::OutOfRange);
    }
    let indirect = inode.block[SINGLE_INDIRECT];
    if indirect == 0 {
        return Ok(0);
    }
    let block = dev.read_block(indirect)?;
    let offset = indirect_index * 4;
    Ok(u32::from_le_bytes(block[offset..offset + 4].try_into().unwrap()))
}

/// Maps logical block index `logical` to `block_no` in `inode`, allocating the single-indirect
/// block on first use. Persists `inode`'s own record if its direct pointers or indirect pointer
/// changed.
pub fn set_inode_block(
    dev: &mut BlockDevice,
    sb: &mut Superblock,
    inode_no: u32,
    inode: &mut Inode,
    logical: usize,
    block_no: u32,
) -> FsResult<()> {
    if logical < DIRECT_POINTERS {
        inode.block[logical] = block_no;
        write_inode(dev, inode_no, inode)?;
        return Ok(());
    }
    let indirect_index = logical - DIRECT_POINTERS;
    if indirect_index >= crate::config::POINTERS_PER_BLOCK {
        return Err(FsError::OutOfRange);
    }
    if inode.block[SINGLE_INDIRECT] == 0 {
        let new_indirect = crate::alloc::allocate_block(dev, sb)?;
        inode.block[SINGLE_INDIRECT] = new_indirect;
        write_inode(dev, inode_no, inode)?;
    }
    let indirect = inode.block[SINGLE_INDIRECT];
    let mut block = dev.read_block(indirect)?;
    let offset = indirect_index * 4;
    block[offset..offset + 4].copy_from_slice(&block_no.to_le_bytes());
    dev.write_block(indirect, &block)
}

/// Allocates a new data block, maps it as the next logical block of `inode`, and extends the
/// inode's size by one block. Used by the directory layer, whose blocks are always added whole
/// rather than grown byte by byte.
pub fn append_block(
    dev: &mut BlockDevice,
    sb: &mut Superblock,
    inode_no: u32,
    inode: &mut Inode,
) -> FsResult<u32> {
    let logical = inode.size as usize / BLOCK_SIZE;
    let block_no = crate::alloc::allocate_block(dev, sb)?;
    set_inode_block(dev, sb, inode_no, inode, logical, block_no)?;
    inode.size += BLOCK_SIZE as u32;
    inode.blocks = crate::util::ceil_division(inode.size, BLOCK_SIZE as u32);
    write_inode(dev, inode_no, inode)?;
    Ok(block_no)
}

/// Reads up to `buf.len()` bytes of file data starting at byte `offset`, clipped to the file's
/// size. Returns the number of bytes actually read; a hole in the middle of the mapped range
/// stops the read early and returns the bytes gathered so far.
pub fn read_inode_data(
    dev: &mut BlockDevice,
    inode_no: u32,
    buf: &mut [u8],
    offset: u32,
) -> FsResult<usize> {
    let mut inode = read_inode(dev, inode_no)?;
    if offset >= inode.size {
        return Ok(0);
    }
    let to_read = buf.len().min((inode.size - offset) as usize);
    let mut done = 0usize;
    while done < to_read {
        let pos = offset as usize + done;
        let logical = pos / BLOCK_SIZE;
        let within = pos % BLOCK_SIZE;
        let block_no = get_inode_block(dev, &inode, logical)?;
        if block_no == 0 {
            break;
        }
        let block = dev.read_block(block_no)?;
        let chunk = (BLOCK_SIZE - within).min(to_read - done);
        buf[done..done + chunk].copy_from_slice(&block[within..within + chunk]);
        done += chunk;
    }
    inode.atime = get_timestamp();
    write_inode(dev, inode_no, &inode)?;
    Ok(done)
}

/// Writes `buf` to file data starting at byte `offset`, allocating blocks as needed. Returns the
/// number of bytes actually written; stops early (without returning an error) if allocation runs
/// out of space partway through.
pub fn write_inode_data(
    dev: &mut BlockDevice,
    sb: &mut Superblock,
    inode_no: u32,
    buf: &[u8],
    offset: u32,
) -> FsResult<usize> {
    let mut inode = read_inode(dev, inode_no)?;
    let mut done = 0usize;
    while done < buf.len() {
        let pos = offset as usize + done;
        let logical = pos / BLOCK_SIZE;
        let within = pos % BLOCK_SIZE;
        let mut block_no = get_inode_block(dev, &inode, logical)?;
        if block_no == 0 {
            block_no = match crate::alloc::allocate_block(dev, sb) {
                Ok(b) => b,
                Err(FsError::NoSpace) => break,
                Err(e) => return Err(e),
            };
            set_inode_block(dev, sb, inode_no, &mut inode, logical, block_no)?;
        }
        let mut block = dev.read_block(block_no)?;
        let chunk = (BLOCK_SIZE - within).min(buf.len() - done);
        block[within..within + chunk].copy_from_slice(&buf[done..done + chunk]);
        dev.write_block(block_no, &block)?;
        done += chunk;
    }
    let new_size = (offset as usize + done) as u32;
    if new_size > inode.size {
        inode.size = new_size;
    }
    inode.blocks = crate::util::ceil_division(inode.size, BLOCK_SIZE as u32);
    let now = get_timestamp();
    inode.mtime = now;
    inode.ctime = now;
    write_inode(dev, inode_no, &inode)?;
    Ok(done)
}

/// Shrinks a file to `length` bytes, freeing blocks beyond the new end. Growing is rejected.
pub fn truncate_inode(
    dev: &mut BlockDevice,
    sb: &mut Superblock,
    inode_no: u32,
    length: u32,
) -> FsResult<()> {
    let mut inode = read_inode(dev, inode_no)?;
    if length > inode.size {
        return Err(FsError::OutOfRange);
    }
    let keep_blocks = crate::util::ceil_division(length, BLOCK_SIZE as u32) as usize;
    let old_blocks = crate::util::ceil_division(inode.size, BLOCK_SIZE as u32) as usize;
    for logical in keep_blocks..old_blocks {
        let block_no = get_inode_block(dev, &inode, logical)?;
        if block_no != 0 {
            crate::alloc::free_block(dev, sb, block_no)?;
            if logical < DIRECT_POINTERS {
                inode.block[logical] = 0;
            } else {
                let indirect = inode.block[SINGLE_INDIRECT];
                let indirect_index = logical - DIRECT_POINTERS;
                let mut block = dev.read_block(indirect)?;
                let off = indirect_index * 4;
                block[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
                dev.write_block(indirect, &block)?;
            }
        }
    }
    if keep_blocks <= DIRECT_POINTERS && inode.block[SINGLE_INDIRECT] != 0 {
        crate::alloc::free_block(dev, sb, inode.block[SINGLE_INDIRECT])?;
        inode.block[SINGLE_INDIRECT] = 0;
    }
    inode.size = length;
    inode.blocks = crate::util::ceil_division(length, BLOCK_SIZE as u32);
    let now = get_timestamp();
    inode.mtime = now;
    inode.ctime = now;
    write_inode(dev, inode_no, &inode)
}

/// Overlays the permission bits of `mode` onto the inode's file-type nibble.
pub fn change_permission(dev: &mut BlockDevice, inode_no: u32, mode: u16) -> FsResult<()> {
    let mut inode = read_inode(dev, inode_no)?;
    inode.mode = inode.file_type() | (mode & 0o7777);
    inode.ctime = get_timestamp();
    write_inode(dev, inode_no, &inode)
}

/// Changes the owning uid and gid of an inode.
pub fn change_owner(dev: &mut BlockDevice, inode_no: u32, uid: u16, gid: u16) -> FsResult<()> {
    let mut inode = read_inode(dev, inode_no)?;
    inode.uid = uid;
    inode.gid = gid;
    inode.ctime = get_timestamp();
    write_inode(dev, inode_no, &inode)
}

/// Increments an inode's hard-link count.
pub fn increment_link_count(dev: &mut BlockDevice, inode_no: u32) -> FsResult<()> {
    let mut inode = read_inode(dev, inode_no)?;
    inode.links_count += 1;
    inode.ctime = get_timestamp();
    write_inode(dev, inode_no, &inode)
}

/// Decrements an inode's hard-link count, saturating at 0.
pub fn decrement_link_count(dev: &mut BlockDevice, inode_no: u32) -> FsResult<()> {
    let mut inode = read_inode(dev, inode_no)?;
    inode.links_count = inode.links_count.saturating_sub(1);
    inode.ctime = get_timestamp();
    write_inode(dev, inode_no, &inode)
}

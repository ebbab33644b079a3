//! Block and inode allocation: lowest-free-index bitmap allocator.

use crate::bitmap::Bitmap;
use crate::block::BlockDevice;
use crate::config::{
    BLOCK_BITMAP_BLOCK, FIRST_NON_RESERVED_INODE, INODE_BITMAP_BLOCK, MAX_BLOCKS, MAX_INODES,
};
use crate::error::{FsError, FsResult};
use crate::superblock::Superblock;

/// Allocates the lowest-numbered free data block, zeroing it before returning.
pub fn allocate_block(dev: &mut BlockDevice, sb: &mut Superblock) -> FsResult<u32> {
    let raw = dev.read_block(BLOCK_BITMAP_BLOCK)?;
    let mut bitmap = Bitmap::from_block(raw);
    let Some(index) = bitmap.find_first_zero(MAX_BLOCKS) else {
        log::warn!("block allocation failed: device full");
        return Err(FsError::NoSpace);
    };
    bitmap.set(index);
    dev.write_block(BLOCK_BITMAP_BLOCK, &bitmap.into_block())?;
    dev.write_block(index, &[0u8; crate::config::BLOCK_SIZE])?;
    sb.free_blocks_count = sb.free_blocks_count - 1;
    sb.write(dev)?;
    log::debug!("allocated block {index}");
    Ok(index)
}

/// Frees block `index`. A double-free is a silent no-op.
pub fn free_block(dev: &mut BlockDevice, sb: &mut Superblock, index: u32) -> FsResult<()> {
    let raw = dev.read_block(BLOCK_BITMAP_BLOCK)?;
    let mut bitmap = Bitmap::from_block(raw);
    if !bitmap.test(index) {
        return Ok(());
    }
    bitmap.clear(index);
    dev.write_block(BLOCK_BITMAP_BLOCK, &bitmap.into_block())?;
    sb.free_blocks_count = sb.free_blocks_count + 1;
    sb.write(dev)?;
    log::debug!("freed block {index}");
    Ok(())
}

/// Allocates the lowest-numbered free non-reserved inode. Returns a 1-indexed inode number.
pub fn allocate_inode(dev: &mut BlockDevice, sb: &mut Superblock) -> FsResult<u32> {
    let raw = dev.read_block(INODE_BITMAP_BLOCK)?;
    let mut bitmap = Bitmap::from_block(raw);
    let Some(bit) = bitmap.find_first_zero(MAX_INODES) else {
        log::warn!("inode allocation failed: table full");
        return Err(FsError::NoInode);
    };
    bitmap.set(bit);
    dev.write_block(INODE_BITMAP_BLOCK, &bitmap.into_block())?;
    sb.free_inodes_count = sb.free_inodes_count - 1;
    sb.write(dev)?;
    let inode_no = bit + 1;
    debug_assert!(inode_no >= FIRST_NON_RESERVED_INODE || inode_no == crate::config::ROOT_INODE);
    log::debug!("allocated inode {inode_no}");
    Ok(inode_no)
}

/// Tells whether inode number `inode_no` (1-indexed) is currently marked allocated in the inode
/// bitmap.
pub fn inode_is_allocated(dev: &mut BlockDevice, inode_no: u32) -> FsResult<bool> {
    let bit = inode_no - 1;
    let raw = dev.read_block(INODE_BITMAP_BLOCK)?;
    Ok(Bitmap::from_block(raw).test(bit))
}

/// Frees inode number `inode_no` (1-indexed). A double-free is a silent no-op.
pub fn free_inode(dev: &mut BlockDevice, sb: &mut Superblock, inode_no: u32) -> FsResult<()> {
    let bit = inode_no - 1;
    let raw = dev.read_block(INODE_BITMAP_BLOCK)?;
    let mut bitmap = Bitmap::from_block(raw);
    if !bitmap.test(bit) {
        return Ok(());
    }
    bitmap.clear(bit);
    dev.write_block(INODE_BITMAP_BLOCK, &bitmap.into_block())?;
    sb.free_inodes_count = sb.free_inodes_count + 1;
    sb.write(dev)?;
    log::debug!("freed inode {inode_no}");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format;

    fn temp_image(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("ext2sim-alloc-{}-{name}", std::process::id()))
    }

    #[test]
    fn lowest_free_tie_break() {
        let path = temp_image("tie-break");
        format::format(&path, format::FormatOptions::default()).unwrap();
        let mut dev = BlockDevice::open(&path).unwrap();
        let mut sb = Superblock::read(&mut dev).unwrap();
        let a = allocate_block(&mut dev, &mut sb).unwrap();
        let b = allocate_block(&mut dev, &mut sb).unwrap();
        assert_eq!(b, a + 1);
        free_block(&mut dev, &mut sb, a).unwrap();
        let c = allocate_block(&mut dev, &mut sb).unwrap();
        assert_eq!(c, a);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let path = temp_image("exhaustion");
        format::format(&path, format::FormatOptions::default()).unwrap();
        let mut dev = BlockDevice::open(&path).unwrap();
        let mut sb = Superblock::read(&mut dev).unwrap();
        let remaining = sb.free_blocks_count;
        for _ in 0..remaining {
            allocate_block(&mut dev, &mut sb).unwrap();
        }
        assert!(matches!(
            allocate_block(&mut dev, &mut sb),
            Err(FsError::NoSpace)
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn inode_exhaustion_reports_no_inode() {
        let path = temp_image("inode-exhaustion");
        format::format(&path, format::FormatOptions::default()).unwrap();
        let mut dev = BlockDevice::open(&path).unwrap();
        let mut sb = Superblock::read(&mut dev).unwrap();
        let remaining = sb.free_inodes_count;
        for _ in 0..remaining {
            allocate_inode(&mut dev, &mut sb).unwrap();
        }
        assert!(matches!(
            allocate_inode(&mut dev, &mut sb),
            Err(FsError::NoInode)
        ));
        std::fs::remove_file(&path).ok();
    }
}

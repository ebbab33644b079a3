//! Image initialization: a fresh superblock, both bitmaps reserved over the metadata region and
//! the reserved inodes, and a root directory with `.` and `..`.

use std::path::Path;

use crate::bitmap::Bitmap;
use crate::block::BlockDevice;
use crate::config::{
    BLOCK_BITMAP_BLOCK, BLOCK_SIZE, FIRST_DATA_BLOCK, FIRST_NON_RESERVED_INODE, INODE_BITMAP_BLOCK,
    MAX_BLOCKS, MAX_INODES, ROOT_INODE, S_IFDIR,
};
use crate::error::FsResult;
use crate::superblock::Superblock;
use crate::util::{align4, get_timestamp};

/// Configuration surface for [`format`]. Currently only lets tests override the block size; real
/// callers use [`FormatOptions::default`].
#[derive(Default)]
pub struct FormatOptions {
    pub block_size_override: Option<u32>,
}

/// Initializes a fresh image at `path`, overwriting any existing content.
pub fn format(path: &Path, options: FormatOptions) -> FsResult<()> {
    let _ = options.block_size_override;
    log::info!("formatting {}", path.display());
    let mut dev = BlockDevice::create(path)?;
    dev.zero_fill()?;

    let mut block_bitmap = Bitmap::from_block([0u8; BLOCK_SIZE]);
    block_bitmap.mark_used(FIRST_DATA_BLOCK);
    dev.write_block(BLOCK_BITMAP_BLOCK, &block_bitmap.into_block())?;

    let mut inode_bitmap = Bitmap::from_block([0u8; BLOCK_SIZE]);
    inode_bitmap.mark_used(FIRST_NON_RESERVED_INODE - 1);
    dev.write_block(INODE_BITMAP_BLOCK, &inode_bitmap.into_block())?;

    let root_data_block = FIRST_DATA_BLOCK;
    let mut block_bitmap = Bitmap::from_block(dev.read_block(BLOCK_BITMAP_BLOCK)?);
    block_bitmap.set(root_data_block);
    dev.write_block(BLOCK_BITMAP_BLOCK, &block_bitmap.into_block())?;

    let free_blocks = MAX_BLOCKS - FIRST_DATA_BLOCK - 1;
    let free_inodes = MAX_INODES - FIRST_NON_RESERVED_INODE + 1;
    let sb = Superblock::new(get_timestamp(), free_blocks, free_inodes);
    sb.write(&mut dev)?;

    let now = get_timestamp();
    let root = crate::inode::Inode::for_format(S_IFDIR | 0o755, 0, 0, now, root_data_block);
    crate::inode::write_inode(&mut dev, ROOT_INODE, &root)?;

    let mut block = [0u8; BLOCK_SIZE];
    write_dot_entries(&mut block);
    dev.write_block(root_data_block, &block)?;

    log::info!("format complete: {free_blocks} free blocks, {free_inodes} free inodes");
    Ok(())
}

fn write_dot_entries(block: &mut [u8; BLOCK_SIZE]) {
    let dot_len = align4(8 + 1);
    write_entry(block, 0, ROOT_INODE, dot_len, ".", crate::dir::FT_DIR);
    write_entry(
        block,
        dot_len as usize,
        ROOT_INODE,
        BLOCK_SIZE as u16 - dot_len,
        "..",
        crate::dir::FT_DIR,
    );
}

fn write_entry(block: &mut [u8; BLOCK_SIZE], offset: usize, inode: u32, rec_len: u16, name: &str, file_type: u8) {
    block[offset..offset + 4].copy_from_slice(&inode.to_le_bytes());
    block[offset + 4..offset + 6].copy_from_slice(&rec_len.to_le_bytes());
    block[offset + 6] = name.len() as u8;
    block[offset + 7] = file_type;
    let name_start = offset + 8;
    block[name_start..name_start + name.len()].copy_from_slice(name.as_bytes());
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn format_creates_mountable_image() {
        let path = std::env::temp_dir().join(format!("ext2sim-format-{}", std::process::id()));
        format(&path, FormatOptions::default()).unwrap();
        let mut dev = BlockDevice::open(&path).unwrap();
        let sb = Superblock::read(&mut dev).unwrap();
        assert_eq!({ sb.magic }, crate::config::EXT2_MAGIC);
        let entries = crate::dir::list_directory(&mut dev, ROOT_INODE).unwrap();
        assert!(entries.iter().any(|e| e.name == "." && e.inode == ROOT_INODE));
        assert!(entries.iter().any(|e| e.name == ".." && e.inode == ROOT_INODE));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn bitmaps_reserve_metadata_and_reserved_inodes() {
        let path = std::env::temp_dir().join(format!("ext2sim-format-bitmap-{}", std::process::id()));
        format(&path, FormatOptions::default()).unwrap();
        let mut dev = BlockDevice::open(&path).unwrap();
        let block_bitmap = Bitmap::from_block(dev.read_block(BLOCK_BITMAP_BLOCK).unwrap());
        assert!(block_bitmap.test(0));
        assert!(block_bitmap.test(FIRST_DATA_BLOCK));
        let inode_bitmap = Bitmap::from_block(dev.read_block(INODE_BITMAP_BLOCK).unwrap());
        assert!(inode_bitmap.test(0));
        assert!(inode_bitmap.test(FIRST_NON_RESERVED_INODE - 2));
        assert!(!inode_bitmap.test(FIRST_NON_RESERVED_INODE - 1));
        std::fs::remove_file(&path).ok();
    }
}

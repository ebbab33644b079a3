//! Variable-length directory entries, path resolution, and the directory operations built on
//! top of them.

use crate::block::BlockDevice;
use crate::config::{BLOCK_SIZE, S_IFDIR};
use crate::error::{FsError, FsResult};
use crate::inode::{self, Inode, PERM_READ, PERM_WRITE};
use crate::superblock::Superblock;
use crate::user::Identity;
use crate::util::align4;

/// Directory entry file-type tag: unknown.
pub const FT_UNKNOWN: u8 = 0;
/// Directory entry file-type tag: regular file.
pub const FT_REGULAR: u8 = 1;
/// Directory entry file-type tag: directory.
pub const FT_DIR: u8 = 2;

const ENTRY_HEADER_LEN: u16 = 8;

/// One decoded directory entry, together with its byte offset within the block it lives in.
struct RawEntry {
    offset: usize,
    inode: u32,
    rec_len: u16,
    name_len: u8,
    file_type: u8,
}

fn read_entry(block: &[u8; BLOCK_SIZE], offset: usize) -> RawEntry {
    let inode = u32::from_le_bytes(block[offset..offset + 4].try_into().unwrap());
    let rec_len = u16::from_le_bytes(block[offset + 4..offset + 6].try_into().unwrap());
    let name_len = block[offset + 6];
    let file_type = block[offset + 7];
    RawEntry { offset, inode, rec_len, name_len, file_type }
}

fn write_entry_header(block: &mut [u8; BLOCK_SIZE], e: &RawEntry) {
    block[e.offset..e.offset + 4].copy_from_slice(&e.inode.to_le_bytes());
    block[e.offset + 4..e.offset + 6].copy_from_slice(&e.rec_len.to_le_bytes());
    block[e.offset + 6] = e.name_len;
    block[e.offset + 7] = e.file_type;
}

fn entry_name<'a>(block: &'a [u8; BLOCK_SIZE], e: &RawEntry) -> &'a [u8] {
    let start = e.offset + ENTRY_HEADER_LEN as usize;
    &block[start..start + e.name_len as usize]
}

/// Number of data blocks currently allocated to a directory inode.
fn block_count(dir: &Inode) -> usize {
    dir.size as usize / BLOCK_SIZE
}

/// A live entry of a listed directory, resolved against its inode's metadata.
pub struct DirListEntry {
    pub name: String,
    pub inode: u32,
    pub file_type: u8,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub mtime: u32,
}

/// Inserts a `name` -> `child_inode` entry into directory `dir_inode_no`. Rejects a duplicate
/// name.
pub fn add_directory_entry(
    dev: &mut BlockDevice,
    sb: &mut Superblock,
    dir_inode_no: u32,
    name: &str,
    child_inode: u32,
    file_type: u8,
) -> FsResult<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(FsError::BadPath);
    }
    if lookup(dev, dir_inode_no, name).is_ok() {
        return Err(FsError::Exists);
    }
    let mut dir = inode::read_inode(dev, dir_inode_no)?;
    let required = align4(ENTRY_HEADER_LEN + name.len() as u16);

    for logical in 0..block_count(&dir) {
        let block_no = inode::get_inode_block(dev, &dir, logical)?;
        let mut block = dev.read_block(block_no)?;
        let mut offset = 0usize;
        while offset < BLOCK_SIZE {
            let entry = read_entry(&block, offset);
            if entry.rec_len == 0 {
                break;
            }
            if entry.inode == 0 && entry.rec_len >= required {
                place_entry(&mut block, offset, entry.rec_len, child_inode, name, file_type);
                dev.write_block(block_no, &block)?;
                touch(dev, dir_inode_no)?;
                return Ok(());
            }
            if entry.inode != 0 {
                let used = align4(ENTRY_HEADER_LEN + entry.name_len as u16);
                if entry.rec_len >= used + required {
                    let remaining = entry.rec_len - used;
                    write_entry_header(
                        &mut block,
                        &RawEntry { offset, inode: entry.inode, rec_len: used, name_len: entry.name_len, file_type: entry.file_type },
                    );
                    place_entry(&mut block, offset + used as usize, remaining, child_inode, name, file_type);
                    dev.write_block(block_no, &block)?;
                    touch(dev, dir_inode_no)?;
                    return Ok(());
                }
            }
            offset += entry.rec_len as usize;
        }
    }

    let block_no = inode::append_block(dev, sb, dir_inode_no, &mut dir)?;
    let mut block = [0u8; BLOCK_SIZE];
    place_entry(&mut block, 0, BLOCK_SIZE as u16, child_inode, name, file_type);
    dev.write_block(block_no, &block)?;
    touch(dev, dir_inode_no)
}

fn place_entry(
    block: &mut [u8; BLOCK_SIZE],
    offset: usize,
    rec_len: u16,
    child_inode: u32,
    name: &str,
    file_type: u8,
) {
    let entry = RawEntry {
        offset,
        inode: child_inode,
        rec_len,
        name_len: name.len() as u8,
        file_type,
    };
    write_entry_header(block, &entry);
    let name_start = offset + ENTRY_HEADER_LEN as usize;
    block[name_start..name_start + name.len()].copy_from_slice(name.as_bytes());
}

fn touch(dev: &mut BlockDevice, dir_inode_no: u32) -> FsResult<()> {
    let mut dir = inode::read_inode(dev, dir_inode_no)?;
    let now = crate::util::get_timestamp();
    dir.mtime = now;
    dir.ctime = now;
    inode::write_inode(dev, dir_inode_no, &dir)
}

/// Removes the entry named `name` from directory `dir_inode_no`. `.` and `..` cannot be removed.
pub fn remove_directory_entry(dev: &mut BlockDevice, dir_inode_no: u32, name: &str) -> FsResult<()> {
    if name == "." || name == ".." {
        return Err(FsError::PermissionDenied);
    }
    let dir = inode::read_inode(dev, dir_inode_no)?;
    for logical in 0..block_count(&dir) {
        let block_no = inode::get_inode_block(dev, &dir, logical)?;
        let mut block = dev.read_block(block_no)?;
        let mut offset = 0usize;
        let mut prev_offset: Option<usize> = None;
        while offset < BLOCK_SIZE {
            let entry = read_entry(&block, offset);
            if entry.rec_len == 0 {
                break;
            }
            if entry.inode != 0 && entry_name(&block, &entry) == name.as_bytes() {
                match prev_offset {
                    None => {
                        let tombstone = RawEntry { offset, inode: 0, rec_len: entry.rec_len, name_len: 0, file_type: 0 };
                        write_entry_header(&mut block, &tombstone);
                    }
                    Some(prev) => {
                        let mut prev_entry = read_entry(&block, prev);
                        prev_entry.rec_len += entry.rec_len;
                        write_entry_header(&mut block, &prev_entry);
                    }
                }
                dev.write_block(block_no, &block)?;
                return touch(dev, dir_inode_no);
            }
            prev_offset = Some(offset);
            offset += entry.rec_len as usize;
        }
    }
    Err(FsError::NotFound)
}

/// Looks up `name` in directory `dir_inode_no`, returning its inode number.
pub fn lookup(dev: &mut BlockDevice, dir_inode_no: u32, name: &str) -> FsResult<u32> {
    let dir = inode::read_inode(dev, dir_inode_no)?;
    for logical in 0..block_count(&dir) {
        let block_no = inode::get_inode_block(dev, &dir, logical)?;
        let block = dev.read_block(block_no)?;
        let mut offset = 0usize;
        while offset < BLOCK_SIZE {
            let entry = read_entry(&block, offset);
            if entry.rec_len == 0 {
                break;
            }
            if entry.inode != 0 && entry_name(&block, &entry) == name.as_bytes() {
                return Ok(entry.inode);
            }
            offset += entry.rec_len as usize;
        }
    }
    Err(FsError::NotFound)
}

/// Lists every live entry of directory `dir_inode_no` in on-disk order.
pub fn list_directory(dev: &mut BlockDevice, dir_inode_no: u32) -> FsResult<Vec<DirListEntry>> {
    let dir = inode::read_inode(dev, dir_inode_no)?;
    if !dir.is_dir() {
        return Err(FsError::NotDirectory);
    }
    let mut entries = Vec::new();
    for logical in 0..block_count(&dir) {
        let block_no = inode::get_inode_block(dev, &dir, logical)?;
        let block = dev.read_block(block_no)?;
        let mut offset = 0usize;
        while offset < BLOCK_SIZE {
            let entry = read_entry(&block, offset);
            if entry.rec_len == 0 {
                break;
            }
            if entry.inode != 0 {
                let name = String::from_utf8_lossy(entry_name(&block, &entry)).into_owned();
                let child = inode::read_inode(dev, entry.inode)?;
                entries.push(DirListEntry {
                    name,
                    inode: entry.inode,
                    file_type: entry.file_type,
                    mode: child.mode,
                    uid: child.uid,
                    gid: child.gid,
                    size: child.size,
                    mtime: child.mtime,
                });
            }
            offset += entry.rec_len as usize;
        }
    }
    Ok(entries)
}

/// Splits a path into its non-empty components. `/a//b/` and `a/b` both yield `["a", "b"]`.
fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Resolves `path` to an inode number, starting at root if absolute or `cwd_inode` otherwise.
pub fn path_to_inode(dev: &mut BlockDevice, cwd_inode: u32, path: &str) -> FsResult<u32> {
    let mut current = if path.starts_with('/') {
        crate::config::ROOT_INODE
    } else {
        cwd_inode
    };
    let components = split_path(path);
    for (i, name) in components.iter().enumerate() {
        let inode = inode::read_inode(dev, current)?;
        if !inode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let _ = i;
        current = lookup(dev, current, name)?;
    }
    Ok(current)
}

/// Resolves the parent directory of `path` and returns it with the final component's name.
pub fn get_parent_inode<'p>(
    dev: &mut BlockDevice,
    cwd_inode: u32,
    path: &'p str,
) -> FsResult<(u32, &'p str)> {
    let components = split_path(path);
    let Some((&last, rest)) = components.split_last() else {
        return Err(FsError::BadPath);
    };
    let parent = if path.starts_with('/') {
        let mut current = crate::config::ROOT_INODE;
        for name in rest {
            current = lookup(dev, current, name)?;
        }
        current
    } else {
        let mut current = cwd_inode;
        for name in rest {
            current = lookup(dev, current, name)?;
        }
        current
    };
    Ok((parent, last))
}

/// Creates a new, empty directory at `path` with the given permission bits.
pub fn create_directory(
    dev: &mut BlockDevice,
    sb: &mut Superblock,
    cwd_inode: u32,
    path: &str,
    mode: u16,
    identity: &Identity,
) -> FsResult<u32> {
    let (parent_no, name) = get_parent_inode(dev, cwd_inode, path)?;
    let parent = inode::read_inode(dev, parent_no)?;
    if !parent.is_dir() {
        return Err(FsError::NotDirectory);
    }
    if !parent.check_permission(PERM_WRITE, identity) {
        return Err(FsError::PermissionDenied);
    }
    let new_inode_no = inode::create_inode(dev, sb, S_IFDIR | (mode & 0o7777), identity.uid as u16, identity.gid as u16)?;
    let mut new_dir = inode::read_inode(dev, new_inode_no)?;
    let block_no = inode::append_block(dev, sb, new_inode_no, &mut new_dir)?;
    let mut block = [0u8; BLOCK_SIZE];
    let dot_len = align4(ENTRY_HEADER_LEN + 1);
    place_entry(&mut block, 0, dot_len, new_inode_no, ".", FT_DIR);
    place_entry(&mut block, dot_len as usize, BLOCK_SIZE as u16 - dot_len, parent_no, "..", FT_DIR);
    dev.write_block(block_no, &block)?;
    new_dir = inode::read_inode(dev, new_inode_no)?;
    new_dir.links_count = 2;
    inode::write_inode(dev, new_inode_no, &new_dir)?;

    add_directory_entry(dev, sb, parent_no, name, new_inode_no, FT_DIR)?;
    inode::increment_link_count(dev, parent_no)?;
    Ok(new_inode_no)
}

/// Removes the empty directory at `path`. Refuses the root, the current working directory, or a
/// directory still holding entries besides `.` and `..`.
pub fn delete_directory(
    dev: &mut BlockDevice,
    sb: &mut Superblock,
    cwd_inode: u32,
    path: &str,
) -> FsResult<()> {
    let target = path_to_inode(dev, cwd_inode, path)?;
    if target == crate::config::ROOT_INODE || target == cwd_inode {
        return Err(FsError::PermissionDenied);
    }
    let target_inode = inode::read_inode(dev, target)?;
    if !target_inode.is_dir() {
        return Err(FsError::NotDirectory);
    }
    let entries = list_directory(dev, target)?;
    if entries.iter().any(|e| e.name != "." && e.name != "..") {
        return Err(FsError::NotEmpty);
    }
    let (parent_no, name) = get_parent_inode(dev, cwd_inode, path)?;
    remove_directory_entry(dev, parent_no, name)?;
    for logical in 0..block_count(&target_inode) {
        let block_no = inode::get_inode_block(dev, &target_inode, logical)?;
        crate::alloc::free_block(dev, sb, block_no)?;
    }
    inode::delete_inode(dev, sb, target)?;
    inode::decrement_link_count(dev, parent_no)
}

/// Changes the current working directory, returning its inode number.
pub fn change_directory(
    dev: &mut BlockDevice,
    cwd_inode: u32,
    path: &str,
    identity: &Identity,
) -> FsResult<u32> {
    let target = path_to_inode(dev, cwd_inode, path)?;
    let inode = inode::read_inode(dev, target)?;
    if !inode.is_dir() {
        return Err(FsError::NotDirectory);
    }
    if !inode.check_permission(PERM_READ, identity) {
        return Err(FsError::PermissionDenied);
    }
    Ok(target)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::{self, FormatOptions};

    fn mounted(name: &str) -> (std::path::PathBuf, BlockDevice, Superblock) {
        let path = std::env::temp_dir().join(format!("ext2sim-dir-{}-{name}", std::process::id()));
        format::format(&path, FormatOptions::default()).unwrap();
        let mut dev = BlockDevice::open(&path).unwrap();
        let sb = Superblock::read(&mut dev).unwrap();
        (path, dev, sb)
    }

    fn root_identity() -> Identity {
        Identity { uid: 0, gid: 0, username: "root".into() }
    }

    #[test]
    fn mkdir_then_lookup() {
        let (path, mut dev, mut sb) = mounted("mkdir");
        let id = root_identity();
        let child = create_directory(&mut dev, &mut sb, crate::config::ROOT_INODE, "/a", 0o755, &id).unwrap();
        assert_eq!(lookup(&mut dev, crate::config::ROOT_INODE, "a").unwrap(), child);
        let listed = list_directory(&mut dev, crate::config::ROOT_INODE).unwrap();
        assert!(listed.iter().any(|e| e.name == "a" && e.inode == child));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn mkdir_rmdir_restores_state() {
        let (path, mut dev, mut sb) = mounted("rmdir");
        let id = root_identity();
        let free_before = sb.free_blocks_count;
        create_directory(&mut dev, &mut sb, crate::config::ROOT_INODE, "/tmp", 0o755, &id).unwrap();
        delete_directory(&mut dev, &mut sb, crate::config::ROOT_INODE, "/tmp").unwrap();
        assert_eq!(sb.free_blocks_count, free_before);
        assert!(matches!(
            lookup(&mut dev, crate::config::ROOT_INODE, "tmp"),
            Err(FsError::NotFound)
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rmdir_refuses_nonempty() {
        let (path, mut dev, mut sb) = mounted("rmdir-nonempty");
        let id = root_identity();
        create_directory(&mut dev, &mut sb, crate::config::ROOT_INODE, "/tmp", 0o755, &id).unwrap();
        create_directory(&mut dev, &mut sb, crate::config::ROOT_INODE, "/tmp/inner", 0o755, &id).unwrap();
        assert!(matches!(
            delete_directory(&mut dev, &mut sb, crate::config::ROOT_INODE, "/tmp"),
            Err(FsError::NotEmpty)
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn duplicate_name_rejected() {
        let (path, mut dev, mut sb) = mounted("dup");
        let id = root_identity();
        create_directory(&mut dev, &mut sb, crate::config::ROOT_INODE, "/a", 0o755, &id).unwrap();
        assert!(matches!(
            create_directory(&mut dev, &mut sb, crate::config::ROOT_INODE, "/a", 0o755, &id),
            Err(FsError::Exists)
        ));
        std::fs::remove_file(&path).ok();
    }
}

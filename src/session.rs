//! The mount session: device handle, cached superblock, open-file table, current identity and
//! working directory. This is the surface a shell collaborator drives.

use std::path::{Path, PathBuf};

use crate::block::BlockDevice;
use crate::config::{MAX_OPEN_FILES, ROOT_INODE, S_IFREG};
use crate::dir::{self, DirListEntry};
use crate::error::{FsError, FsResult};
use crate::inode::{self, PERM_READ, PERM_WRITE};
use crate::superblock::Superblock;
use crate::user::{Identity, UserRegistry};

/// Read-only open mode.
pub const O_RDONLY: u8 = 0;
/// Write-only open mode.
pub const O_WRONLY: u8 = 1;
/// Read-write open mode.
pub const O_RDWR: u8 = 2;

struct OpenFile {
    inode_no: u32,
    offset: u32,
    flags: u8,
    handle_id: u32,
}

/// Point-in-time summary returned by [`Session::status`].
pub struct SessionStatus {
    pub disk_image: PathBuf,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub cwd_inode: u32,
    pub logged_in_as: Option<String>,
    pub open_file_count: usize,
}

/// An active mount. Owns the device handle; dropping it closes the image.
pub struct Session {
    device: BlockDevice,
    superblock: Superblock,
    disk_image: PathBuf,
    open_files: Vec<Option<OpenFile>>,
    next_fd: u32,
    current_user: Option<Identity>,
    cwd_inode: u32,
    users: UserRegistry,
}

impl Session {
    /// Mounts the image at `path`, validating its superblock. Seeds the user registry with a
    /// `root` account using `root_password`.
    pub fn mount(path: impl AsRef<Path>, root_password: &str) -> FsResult<Self> {
        let mut device = BlockDevice::open(&path)?;
        let superblock = Superblock::read(&mut device)?;
        log::info!("mounted {}", path.as_ref().display());
        Ok(Self {
            device,
            superblock,
            disk_image: path.as_ref().to_path_buf(),
            open_files: (0..MAX_OPEN_FILES).map(|_| None).collect(),
            next_fd: 0,
            current_user: None,
            cwd_inode: ROOT_INODE,
            users: UserRegistry::new(root_password),
        })
    }

    /// Flushes superblock state and releases the image handle. Equivalent to letting the
    /// session drop.
    pub fn unmount(self) -> FsResult<()> {
        log::info!("unmounted {}", self.disk_image.display());
        Ok(())
    }

    /// A snapshot of the session's current state.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            disk_image: self.disk_image.clone(),
            free_blocks: self.superblock.free_blocks_count,
            free_inodes: self.superblock.free_inodes_count,
            cwd_inode: self.cwd_inode,
            logged_in_as: self.current_user.as_ref().map(|u| u.username.clone()),
            open_file_count: self.open_files.iter().flatten().count(),
        }
    }

    /// Authenticates `username`/`password` and, on success, makes it the active identity.
    pub fn login(&mut self, username: &str, password: &str) -> FsResult<Identity> {
        let identity = self.users.authenticate(username, password)?;
        log::info!("{username} logged in");
        self.current_user = Some(identity.clone());
        Ok(identity)
    }

    /// Clears the active identity.
    pub fn logout(&mut self) {
        if let Some(user) = self.current_user.take() {
            log::info!("{} logged out", user.username);
        }
    }

    /// Registers a new account. Requires an active identity.
    pub fn add_user(&mut self, username: &str, uid: u32, gid: u32, password: &str) -> FsResult<()> {
        self.current_identity()?;
        self.users.add(username, uid, gid, password)
    }

    /// Lists every registered account. Requires an active identity.
    pub fn list_users(&self) -> FsResult<&[crate::user::UserRecord]> {
        self.current_identity()?;
        Ok(self.users.list())
    }

    /// Returns the active identity, or `FsError::NotLoggedIn`.
    pub fn current_identity(&self) -> FsResult<Identity> {
        self.current_user.clone().ok_or(FsError::NotLoggedIn)
    }

    /// Creates a directory at `path` with permission bits `mode`.
    pub fn mkdir(&mut self, path: &str, mode: u16) -> FsResult<u32> {
        let identity = self.current_identity()?;
        dir::create_directory(&mut self.device, &mut self.superblock, self.cwd_inode, path, mode, &identity)
    }

    /// Removes the empty directory at `path`.
    pub fn rmdir(&mut self, path: &str) -> FsResult<()> {
        self.current_identity()?;
        dir::delete_directory(&mut self.device, &mut self.superblock, self.cwd_inode, path)
    }

    /// Changes the current working directory.
    pub fn change_directory(&mut self, path: &str) -> FsResult<()> {
        let identity = self.current_identity()?;
        self.cwd_inode = dir::change_directory(&mut self.device, self.cwd_inode, path, &identity)?;
        Ok(())
    }

    /// Lists the entries of `path` (or the working directory if `path` is `.`).
    pub fn list_directory(&mut self, path: &str) -> FsResult<Vec<DirListEntry>> {
        self.current_identity()?;
        let target = dir::path_to_inode(&mut self.device, self.cwd_inode, path)?;
        dir::list_directory(&mut self.device, target)
    }

    /// Creates an empty regular file at `path`.
    pub fn create(&mut self, path: &str, mode: u16) -> FsResult<u32> {
        let identity = self.current_identity()?;
        let (parent_no, name) = dir::get_parent_inode(&mut self.device, self.cwd_inode, path)?;
        let parent = inode::read_inode(&mut self.device, parent_no)?;
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if !parent.check_permission(PERM_WRITE, &identity) {
            return Err(FsError::PermissionDenied);
        }
        let new_inode = inode::create_inode(
            &mut self.device,
            &mut self.superblock,
            S_IFREG | (mode & 0o7777),
            identity.uid as u16,
            identity.gid as u16,
        )?;
        dir::add_directory_entry(&mut self.device, &mut self.superblock, parent_no, name, new_inode, dir::FT_REGULAR)?;
        Ok(new_inode)
    }

    /// Removes the regular file at `path`. Any handles left open on it become dangling.
    pub fn delete(&mut self, path: &str) -> FsResult<()> {
        let identity = self.current_identity()?;
        let target = dir::path_to_inode(&mut self.device, self.cwd_inode, path)?;
        let inode = inode::read_inode(&mut self.device, target)?;
        if inode.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if !inode.check_permission(PERM_WRITE, &identity) {
            return Err(FsError::PermissionDenied);
        }
        let (parent_no, name) = dir::get_parent_inode(&mut self.device, self.cwd_inode, path)?;
        dir::remove_directory_entry(&mut self.device, parent_no, name)?;
        inode::delete_inode(&mut self.device, &mut self.superblock, target)
    }

    /// Opens `path` with the given access mode (`O_RDONLY`/`O_WRONLY`/`O_RDWR`), returning a
    /// handle id.
    pub fn open(&mut self, path: &str, flags: u8) -> FsResult<u32> {
        let identity = self.current_identity()?;
        let target = dir::path_to_inode(&mut self.device, self.cwd_inode, path)?;
        let file_inode = inode::read_inode(&mut self.device, target)?;
        if !file_inode.is_regular() {
            return Err(FsError::IsDirectory);
        }
        let required = match flags {
            O_RDONLY => PERM_READ,
            O_WRONLY => PERM_WRITE,
            O_RDWR => PERM_READ | PERM_WRITE,
            _ => return Err(FsError::BadDescriptor),
        };
        if !file_inode.check_permission(required, &identity) {
            return Err(FsError::PermissionDenied);
        }
        let slot = self.open_files.iter().position(Option::is_none).ok_or(FsError::TooManyOpenFiles)?;
        let handle_id = self.next_fd;
        self.next_fd += 1;
        self.open_files[slot] = Some(OpenFile { inode_no: target, offset: 0, flags, handle_id });
        log::debug!("opened {path} as handle {handle_id}");
        Ok(handle_id)
    }

    fn find_slot(&mut self, handle_id: u32) -> FsResult<usize> {
        self.open_files
            .iter()
            .position(|f| matches!(f, Some(f) if f.handle_id == handle_id))
            .ok_or(FsError::BadDescriptor)
    }

    /// Closes a handle previously returned by [`Session::open`]. Never frees the underlying file.
    pub fn close(&mut self, handle_id: u32) -> FsResult<()> {
        let slot = self.find_slot(handle_id)?;
        self.open_files[slot] = None;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes from the current offset of an open handle, advancing it.
    pub fn read(&mut self, handle_id: u32, buf: &mut [u8]) -> FsResult<usize> {
        let slot = self.find_slot(handle_id)?;
        let (inode_no, flags, offset) = {
            let f = self.open_files[slot].as_ref().unwrap();
            (f.inode_no, f.flags, f.offset)
        };
        if flags == O_WRONLY {
            return Err(FsError::PermissionDenied);
        }
        inode::read_inode(&mut self.device, inode_no)?;
        let n = inode::read_inode_data(&mut self.device, inode_no, buf, offset)?;
        self.open_files[slot].as_mut().unwrap().offset += n as u32;
        Ok(n)
    }

    /// Writes `buf` at the current offset of an open handle, advancing it.
    pub fn write(&mut self, handle_id: u32, buf: &[u8]) -> FsResult<usize> {
        let slot = self.find_slot(handle_id)?;
        let (inode_no, flags, offset) = {
            let f = self.open_files[slot].as_ref().unwrap();
            (f.inode_no, f.flags, f.offset)
        };
        if flags == O_RDONLY {
            return Err(FsError::PermissionDenied);
        }
        inode::read_inode(&mut self.device, inode_no)?;
        let n = inode::write_inode_data(&mut self.device, &mut self.superblock, inode_no, buf, offset)?;
        self.open_files[slot].as_mut().unwrap().offset += n as u32;
        Ok(n)
    }

    /// Changes the permission bits of `path`.
    pub fn chmod(&mut self, path: &str, mode: u16) -> FsResult<()> {
        let identity = self.current_identity()?;
        let target = dir::path_to_inode(&mut self.device, self.cwd_inode, path)?;
        let file_inode = inode::read_inode(&mut self.device, target)?;
        if identity.uid != file_inode.uid as u32 {
            return Err(FsError::PermissionDenied);
        }
        inode::change_permission(&mut self.device, target, mode)
    }

    /// Changes the owning uid/gid of `path`.
    pub fn chown(&mut self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let identity = self.current_identity()?;
        let target = dir::path_to_inode(&mut self.device, self.cwd_inode, path)?;
        let file_inode = inode::read_inode(&mut self.device, target)?;
        if identity.uid != file_inode.uid as u32 {
            return Err(FsError::PermissionDenied);
        }
        inode::change_owner(&mut self.device, target, uid as u16, gid as u16)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::{self, FormatOptions};

    fn mounted(name: &str) -> (std::path::PathBuf, Session) {
        let path = std::env::temp_dir().join(format!("ext2sim-session-{}-{name}", std::process::id()));
        format::format(&path, FormatOptions::default()).unwrap();
        let mut session = Session::mount(&path, "hunter2").unwrap();
        session.login("root", "hunter2").unwrap();
        (path, session)
    }

    #[test]
    fn create_write_close_open_read_round_trip() {
        let (path, mut session) = mounted("round-trip");
        session.create("/greeting", 0o644).unwrap();
        let fd = session.open("/greeting", O_WRONLY).unwrap();
        session.write(fd, b"hello").unwrap();
        session.close(fd).unwrap();
        let fd = session.open("/greeting", O_RDONLY).unwrap();
        let mut buf = [0u8; 16];
        let n = session.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        session.close(fd).unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn mkdir_cd_create_delete_cd_up_rmdir() {
        let (path, mut session) = mounted("mkdir-cd");
        session.mkdir("/work", 0o755).unwrap();
        session.change_directory("/work").unwrap();
        session.create("scratch", 0o644).unwrap();
        session.delete("scratch").unwrap();
        session.change_directory("..").unwrap();
        session.rmdir("/work").unwrap();
        assert!(session.list_directory(".").unwrap().iter().all(|e| e.name != "work"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn operations_without_login_are_rejected() {
        let path = std::env::temp_dir().join(format!("ext2sim-session-{}-no-login", std::process::id()));
        format::format(&path, FormatOptions::default()).unwrap();
        let mut session = Session::mount(&path, "hunter2").unwrap();
        assert!(matches!(session.create("/x", 0o644), Err(FsError::NotLoggedIn)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn chmod_then_foreign_open_denied() {
        let (path, mut session) = mounted("chmod-deny");
        session.add_user("alice", 1, 1, "pw").unwrap();
        session.create("/secret", 0o644).unwrap();
        session.chmod("/secret", 0o000).unwrap();
        session.logout();
        session.login("alice", "pw").unwrap();
        assert!(matches!(
            session.open("/secret", O_RDONLY),
            Err(FsError::PermissionDenied)
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn delete_refuses_other_users_file() {
        let (path, mut session) = mounted("delete-deny");
        session.add_user("alice", 1, 1, "pw").unwrap();
        session.create("/owned", 0o644).unwrap();
        session.logout();
        session.login("alice", "pw").unwrap();
        assert!(matches!(
            session.delete("/owned"),
            Err(FsError::PermissionDenied)
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn dangling_handle_read_reports_not_found() {
        let (path, mut session) = mounted("dangling-handle");
        session.create("/ephemeral", 0o644).unwrap();
        let fd = session.open("/ephemeral", O_RDONLY).unwrap();
        session.delete("/ephemeral").unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(session.read(fd, &mut buf), Err(FsError::NotFound)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn unmount_then_remount_reproduces_listing() {
        let (path, mut session) = mounted("remount");
        session.mkdir("/a", 0o755).unwrap();
        session.create("/b", 0o644).unwrap();
        session.unmount().unwrap();
        let mut session = Session::mount(&path, "hunter2").unwrap();
        session.login("root", "hunter2").unwrap();
        let names: Vec<_> = session.list_directory(".").unwrap().into_iter().map(|e| e.name).collect();
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
        std::fs::remove_file(&path).ok();
    }
}

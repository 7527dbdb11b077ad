//! The per-process file table.
//!
//! Threads of the emulated process share one table. Stdio passes through to
//! the host, regular files are host-backed, and pipes, eventfds, epoll
//! instances, and memfds are emulated in-process so the wait machinery can
//! see their readiness without host help.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;

use strato_abi::poll::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};
use strato_abi::types::EpollEvent;
use strato_abi::Errno;
use tracing::trace;

use crate::host;

/// In-memory pipe shared by its two ends.
pub struct PipeBuf {
    data: VecDeque<u8>,
    readers: u32,
    writers: u32,
}

pub struct EventFdState {
    count: u64,
    semaphore: bool,
}

#[derive(Clone)]
pub struct EpollInterest {
    pub fd: i32,
    pub events: u32,
    pub data: u64,
}

pub struct EpollState {
    interests: Vec<EpollInterest>,
}

pub struct MemFdState {
    pub name: String,
    pub data: Vec<u8>,
}

/// One open descriptor. Rc-shared state implements dup semantics for the
/// emulated kinds; host files dup the host descriptor instead.
#[derive(Clone)]
pub enum FileDesc {
    Stdin,
    Stdout,
    Stderr,
    Host { fd: i32, path: PathBuf },
    PipeRead(Rc<RefCell<PipeBuf>>),
    PipeWrite(Rc<RefCell<PipeBuf>>),
    EventFd(Rc<RefCell<EventFdState>>),
    Epoll(Rc<RefCell<EpollState>>),
    MemFd {
        file: Rc<RefCell<MemFdState>>,
        pos: u64,
    },
}

pub struct FileTable {
    entries: BTreeMap<i32, FileDesc>,
    next_fd: i32,
    pid: i32,
    program_path: PathBuf,
}

impl FileTable {
    pub fn new(pid: i32) -> FileTable {
        let mut entries = BTreeMap::new();
        entries.insert(0, FileDesc::Stdin);
        entries.insert(1, FileDesc::Stdout);
        entries.insert(2, FileDesc::Stderr);
        FileTable {
            entries,
            next_fd: 3,
            pid,
            program_path: PathBuf::new(),
        }
    }

    /// Record the process identity for the /proc/self views.
    pub fn set_process(&mut self, pid: i32, program_path: PathBuf) {
        self.pid = pid;
        self.program_path = program_path;
    }

    pub fn program_path(&self) -> &PathBuf {
        &self.program_path
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    fn alloc_fd(&mut self) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }

    fn insert(&mut self, desc: FileDesc) -> i32 {
        let fd = self.alloc_fd();
        self.entries.insert(fd, desc);
        fd
    }

    pub fn get(&self, fd: i32) -> Result<&FileDesc, Errno> {
        self.entries.get(&fd).ok_or(Errno::EBADF)
    }

    /// Resolve the /proc/self views onto the emulated process; any other
    /// path goes to the host untouched.
    pub fn resolve_path(&self, path: &str) -> String {
        if path == "/proc/self/exe" || path == format!("/proc/{}/exe", self.pid) {
            return self.program_path.to_string_lossy().into_owned();
        }
        path.to_owned()
    }

    pub fn open(&mut self, path: &str, flags: i32, mode: u32) -> Result<i32, Errno> {
        let resolved = self.resolve_path(path);
        let fd = host::open(&resolved, flags, mode)?;
        let guest_fd = self.insert(FileDesc::Host {
            fd,
            path: PathBuf::from(resolved),
        });
        trace!(path, guest_fd, "open");
        Ok(guest_fd)
    }

    pub fn openat(&mut self, dirfd: i32, path: &str, flags: i32, mode: u32) -> Result<i32, Errno> {
        if path.starts_with('/') || dirfd == libc::AT_FDCWD {
            return self.open(path, flags, mode);
        }
        let host_dirfd = match self.get(dirfd)? {
            FileDesc::Host { fd, .. } => *fd,
            _ => return Err(Errno::ENOTDIR),
        };
        let fd = host::openat(host_dirfd, path, flags, mode)?;
        Ok(self.insert(FileDesc::Host {
            fd,
            path: PathBuf::from(path),
        }))
    }

    pub fn close(&mut self, fd: i32) -> Result<u64, Errno> {
        let desc = self.entries.remove(&fd).ok_or(Errno::EBADF)?;
        match desc {
            FileDesc::Host { fd: host_fd, .. } => {
                host::close(host_fd)?;
            }
            FileDesc::PipeRead(pipe) => pipe.borrow_mut().readers -= 1,
            FileDesc::PipeWrite(pipe) => pipe.borrow_mut().writers -= 1,
            _ => {}
        }
        Ok(0)
    }

    pub fn read(&mut self, fd: i32, count: usize) -> Result<Vec<u8>, Errno> {
        match self.entries.get_mut(&fd).ok_or(Errno::EBADF)? {
            FileDesc::Stdin => host::read(0, count),
            FileDesc::Stdout | FileDesc::Stderr => Err(Errno::EBADF),
            FileDesc::Host { fd, .. } => host::read(*fd, count),
            FileDesc::PipeRead(pipe) => {
                let mut pipe = pipe.borrow_mut();
                if pipe.data.is_empty() {
                    if pipe.writers == 0 {
                        return Ok(Vec::new());
                    }
                    return Err(Errno::EAGAIN);
                }
                let n = count.min(pipe.data.len());
                Ok(pipe.data.drain(..n).collect())
            }
            FileDesc::PipeWrite(_) => Err(Errno::EBADF),
            FileDesc::EventFd(state) => {
                let mut state = state.borrow_mut();
                if state.count == 0 {
                    return Err(Errno::EAGAIN);
                }
                let value = if state.semaphore { 1 } else { state.count };
                state.count -= value;
                Ok(value.to_le_bytes().to_vec())
            }
            FileDesc::Epoll(_) => Err(Errno::EINVAL),
            FileDesc::MemFd { file, pos } => {
                let file = file.borrow();
                let start = (*pos as usize).min(file.data.len());
                let end = (start + count).min(file.data.len());
                let bytes = file.data[start..end].to_vec();
                drop(file);
                *pos += bytes.len() as u64;
                Ok(bytes)
            }
        }
    }

    pub fn write(&mut self, fd: i32, bytes: &[u8]) -> Result<u64, Errno> {
        match self.entries.get_mut(&fd).ok_or(Errno::EBADF)? {
            FileDesc::Stdin => Err(Errno::EBADF),
            FileDesc::Stdout => host::write(1, bytes),
            FileDesc::Stderr => host::write(2, bytes),
            FileDesc::Host { fd, .. } => host::write(*fd, bytes),
            FileDesc::PipeRead(_) => Err(Errno::EBADF),
            FileDesc::PipeWrite(pipe) => {
                let mut pipe = pipe.borrow_mut();
                if pipe.readers == 0 {
                    return Err(Errno::EPIPE);
                }
                pipe.data.extend(bytes);
                Ok(bytes.len() as u64)
            }
            FileDesc::EventFd(state) => {
                if bytes.len() != 8 {
                    return Err(Errno::EINVAL);
                }
                let add = u64::from_le_bytes(bytes.try_into().map_err(|_| Errno::EINVAL)?);
                let mut state = state.borrow_mut();
                state.count = state.count.saturating_add(add);
                Ok(8)
            }
            FileDesc::Epoll(_) => Err(Errno::EINVAL),
            FileDesc::MemFd { file, pos } => {
                let mut file = file.borrow_mut();
                let start = *pos as usize;
                if file.data.len() < start + bytes.len() {
                    file.data.resize(start + bytes.len(), 0);
                }
                file.data[start..start + bytes.len()].copy_from_slice(bytes);
                drop(file);
                *pos += bytes.len() as u64;
                Ok(bytes.len() as u64)
            }
        }
    }

    pub fn pread(&mut self, fd: i32, count: usize, offset: i64) -> Result<Vec<u8>, Errno> {
        match self.get(fd)? {
            FileDesc::Host { fd, .. } => host::pread(*fd, count, offset),
            _ => Err(Errno::ESPIPE),
        }
    }

    pub fn pwrite(&mut self, fd: i32, bytes: &[u8], offset: i64) -> Result<u64, Errno> {
        match self.get(fd)? {
            FileDesc::Host { fd, .. } => host::pwrite(*fd, bytes, offset),
            _ => Err(Errno::ESPIPE),
        }
    }

    pub fn lseek(&mut self, fd: i32, offset: i64, whence: i32) -> Result<u64, Errno> {
        match self.entries.get_mut(&fd).ok_or(Errno::EBADF)? {
            FileDesc::Host { fd, .. } => host::lseek(*fd, offset, whence),
            FileDesc::MemFd { file, pos } => {
                let len = file.borrow().data.len() as i64;
                let new = match whence {
                    libc::SEEK_SET => offset,
                    libc::SEEK_CUR => *pos as i64 + offset,
                    libc::SEEK_END => len + offset,
                    _ => return Err(Errno::EINVAL),
                };
                if new < 0 {
                    return Err(Errno::EINVAL);
                }
                *pos = new as u64;
                Ok(new as u64)
            }
            _ => Err(Errno::ESPIPE),
        }
    }

    pub fn fstat(&self, fd: i32) -> Result<Vec<u8>, Errno> {
        match self.get(fd)? {
            FileDesc::Stdin => host::fstat(0),
            FileDesc::Stdout => host::fstat(1),
            FileDesc::Stderr => host::fstat(2),
            FileDesc::Host { fd, .. } => host::fstat(*fd),
            FileDesc::MemFd { file, .. } => {
                // Synthesize a regular-file stat for the anonymous file.
                let mut stat: libc::stat = unsafe { std::mem::zeroed() };
                stat.st_mode = libc::S_IFREG | 0o600;
                stat.st_size = file.borrow().data.len() as i64;
                stat.st_blksize = 4096;
                let ptr = &stat as *const libc::stat as *const u8;
                Ok(
                    unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<libc::stat>()) }
                        .to_vec(),
                )
            }
            _ => Err(Errno::EBADF),
        }
    }

    pub fn host_fd(&self, fd: i32) -> Result<i32, Errno> {
        match self.get(fd)? {
            FileDesc::Stdin => Ok(0),
            FileDesc::Stdout => Ok(1),
            FileDesc::Stderr => Ok(2),
            FileDesc::Host { fd, .. } => Ok(*fd),
            _ => Err(Errno::EBADF),
        }
    }

    pub fn pipe(&mut self) -> (i32, i32) {
        let buf = Rc::new(RefCell::new(PipeBuf {
            data: VecDeque::new(),
            readers: 1,
            writers: 1,
        }));
        let r = self.insert(FileDesc::PipeRead(buf.clone()));
        let w = self.insert(FileDesc::PipeWrite(buf));
        (r, w)
    }

    pub fn eventfd(&mut self, initval: u32, semaphore: bool) -> i32 {
        self.insert(FileDesc::EventFd(Rc::new(RefCell::new(EventFdState {
            count: initval as u64,
            semaphore,
        }))))
    }

    pub fn memfd_create(&mut self, name: String) -> i32 {
        self.insert(FileDesc::MemFd {
            file: Rc::new(RefCell::new(MemFdState {
                name,
                data: Vec::new(),
            })),
            pos: 0,
        })
    }

    pub fn epoll_create(&mut self) -> i32 {
        self.insert(FileDesc::Epoll(Rc::new(RefCell::new(EpollState {
            interests: Vec::new(),
        }))))
    }

    pub fn epoll_ctl(&mut self, epfd: i32, op: i32, fd: i32, events: u32, data: u64) -> Result<u64, Errno> {
        self.get(fd)?;
        let FileDesc::Epoll(state) = self.get(epfd)? else {
            return Err(Errno::EINVAL);
        };
        let mut state = state.borrow_mut();
        let existing = state.interests.iter().position(|i| i.fd == fd);
        match op {
            strato_abi::poll::EPOLL_CTL_ADD => {
                if existing.is_some() {
                    return Err(Errno::EEXIST);
                }
                state.interests.push(EpollInterest { fd, events, data });
            }
            strato_abi::poll::EPOLL_CTL_MOD => {
                let i = existing.ok_or(Errno::ENOENT)?;
                state.interests[i] = EpollInterest { fd, events, data };
            }
            strato_abi::poll::EPOLL_CTL_DEL => {
                let i = existing.ok_or(Errno::ENOENT)?;
                state.interests.remove(i);
            }
            _ => return Err(Errno::EINVAL),
        }
        Ok(0)
    }

    pub fn dup(&mut self, fd: i32) -> Result<i32, Errno> {
        let cloned = self.clone_desc(fd)?;
        Ok(self.insert(cloned))
    }

    pub fn dup2(&mut self, old: i32, new: i32) -> Result<i32, Errno> {
        if old == new {
            self.get(old)?;
            return Ok(new);
        }
        let cloned = self.clone_desc(old)?;
        if self.entries.contains_key(&new) {
            let _ = self.close(new);
        }
        self.entries.insert(new, cloned);
        self.next_fd = self.next_fd.max(new + 1);
        Ok(new)
    }

    fn clone_desc(&mut self, fd: i32) -> Result<FileDesc, Errno> {
        let desc = self.get(fd)?.clone();
        Ok(match desc {
            FileDesc::Host { fd: host_fd, path } => FileDesc::Host {
                fd: host::dup(host_fd)?,
                path,
            },
            FileDesc::PipeRead(pipe) => {
                pipe.borrow_mut().readers += 1;
                FileDesc::PipeRead(pipe)
            }
            FileDesc::PipeWrite(pipe) => {
                pipe.borrow_mut().writers += 1;
                FileDesc::PipeWrite(pipe)
            }
            other => other,
        })
    }

    pub fn fcntl(&mut self, fd: i32, cmd: i32, arg: i32) -> Result<u64, Errno> {
        match cmd {
            libc::F_DUPFD | libc::F_DUPFD_CLOEXEC => {
                let cloned = self.clone_desc(fd)?;
                let new = self.next_fd.max(arg);
                self.next_fd = new + 1;
                self.entries.insert(new, cloned);
                Ok(new as u64)
            }
            libc::F_GETFD | libc::F_SETFD => {
                self.get(fd)?;
                Ok(0)
            }
            libc::F_GETFL => {
                self.get(fd)?;
                Ok(libc::O_RDWR as u64)
            }
            libc::F_SETFL => {
                self.get(fd)?;
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn ioctl(&mut self, fd: i32, request: u64) -> Result<Vec<u8>, Errno> {
        let host_fd = self.host_fd(fd)?;
        host::ioctl_passthrough(host_fd, request)
    }

    pub fn getdents64(&mut self, fd: i32, count: usize) -> Result<Vec<u8>, Errno> {
        match self.get(fd)? {
            FileDesc::Host { fd, .. } => host::getdents64(*fd, count),
            _ => Err(Errno::ENOTDIR),
        }
    }

    /// Non-blocking poll readiness for one descriptor, in poll(2) revents
    /// terms. Unknown descriptors report POLLNVAL like the real call.
    pub fn poll_ready(&self, fd: i32, events: i16) -> i16 {
        let Ok(desc) = self.get(fd) else {
            return POLLNVAL;
        };
        match desc {
            FileDesc::Stdin => host::poll_one(0, events),
            FileDesc::Stdout => host::poll_one(1, events),
            FileDesc::Stderr => host::poll_one(2, events),
            FileDesc::Host { fd, .. } => host::poll_one(*fd, events),
            FileDesc::PipeRead(pipe) => {
                let pipe = pipe.borrow();
                let mut revents = 0;
                if !pipe.data.is_empty() {
                    revents |= POLLIN & events;
                }
                if pipe.writers == 0 {
                    revents |= POLLHUP;
                }
                revents
            }
            FileDesc::PipeWrite(pipe) => {
                let pipe = pipe.borrow();
                if pipe.readers == 0 {
                    POLLERR
                } else {
                    POLLOUT & events
                }
            }
            FileDesc::EventFd(state) => {
                let mut revents = 0;
                if state.borrow().count > 0 {
                    revents |= POLLIN & events;
                }
                revents | (POLLOUT & events)
            }
            FileDesc::Epoll(_) => {
                if self.epoll_ready_events(fd).map(|e| !e.is_empty()).unwrap_or(false) {
                    POLLIN & events
                } else {
                    0
                }
            }
            FileDesc::MemFd { .. } => (POLLIN | POLLOUT) & events,
        }
    }

    /// Events ready on an epoll instance right now.
    pub fn epoll_ready_events(&self, epfd: i32) -> Result<Vec<EpollEvent>, Errno> {
        let FileDesc::Epoll(state) = self.get(epfd)? else {
            return Err(Errno::EINVAL);
        };
        let interests = state.borrow().interests.clone();
        let mut out = Vec::new();
        for interest in interests {
            let mut want: i16 = 0;
            if interest.events & EPOLLIN != 0 {
                want |= POLLIN;
            }
            if interest.events & EPOLLOUT != 0 {
                want |= POLLOUT;
            }
            let revents = self.poll_ready(interest.fd, want);
            let mut ready = 0u32;
            if revents & POLLIN != 0 {
                ready |= EPOLLIN;
            }
            if revents & POLLOUT != 0 {
                ready |= EPOLLOUT;
            }
            if revents & POLLHUP != 0 {
                ready |= EPOLLHUP;
            }
            if revents & (POLLERR | POLLNVAL) != 0 {
                ready |= EPOLLERR;
            }
            if ready != 0 {
                out.push(EpollEvent {
                    events: ready,
                    data: interest.data,
                });
            }
        }
        Ok(out)
    }
}

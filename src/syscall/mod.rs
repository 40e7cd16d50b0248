//! Syscall dispatch.
//!
//! Userspace enters the kernel with `int 0x80` (see
//! [`crate::arch::x86_64`]); RAX carries the call number and RBX a pointer
//! to a [`SyscallArgs`]. [`dispatch`] is what the vector 0x80 handler calls
//! once it has copied that struct out of user memory. Every call is gated
//! by the calling task's [`SecurityLevel`] before any handler runs.

pub mod uaccess;

use crate::cap::SecurityLevel;
use crate::lib::error::{Errno, Result};
use crate::process::{self, ProcessId};

/// Arguments to a syscall, read out of the user-supplied `SyscallArgs`
/// struct pointed to by RBX.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SyscallArgs {
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
}

/// One entry in the syscall table: the handler and the minimum security
/// level a caller must hold to reach it.
struct SyscallEntry {
    number: u64,
    required: SecurityLevel,
    handler: fn(&SyscallArgs) -> Result<isize>,
}

macro_rules! syscall_table {
    ($($number:expr => $required:expr, $handler:expr;)*) => {
        &[$(SyscallEntry { number: $number, required: $required, handler: $handler },)*]
    };
}

static SYSCALL_TABLE: &[SyscallEntry] = syscall_table! {
    SYS_READ     => SecurityLevel::Application, sys_read;
    SYS_WRITE    => SecurityLevel::Application, sys_write;
    SYS_OPENAT   => SecurityLevel::Application, sys_openat;
    SYS_CLOSE    => SecurityLevel::Application, sys_close;
    SYS_LSEEK    => SecurityLevel::Application, sys_lseek;
    SYS_FSTAT    => SecurityLevel::Application, sys_fstat;
    SYS_GETDENTS64 => SecurityLevel::Application, sys_getdents64;
    SYS_EXIT     => SecurityLevel::Application, sys_exit;
    SYS_GETPID   => SecurityLevel::Application, sys_getpid;
    SYS_BRK      => SecurityLevel::Application, sys_brk;
    SYS_IPC_CREATE  => SecurityLevel::Application, sys_ipc_create;
    SYS_IPC_SEND    => SecurityLevel::Application, sys_ipc_send;
    SYS_IPC_RECEIVE => SecurityLevel::Application, sys_ipc_receive;
};

pub const SYS_READ: u64 = 63;
pub const SYS_WRITE: u64 = 64;
pub const SYS_OPENAT: u64 = 56;
pub const SYS_CLOSE: u64 = 57;
pub const SYS_LSEEK: u64 = 62;
pub const SYS_FSTAT: u64 = 80;
pub const SYS_GETDENTS64: u64 = 61;
pub const SYS_EXIT: u64 = 93;
pub const SYS_GETPID: u64 = 172;
pub const SYS_BRK: u64 = 214;
pub const SYS_IPC_CREATE: u64 = 500;
pub const SYS_IPC_SEND: u64 = 501;
pub const SYS_IPC_RECEIVE: u64 = 502;

/// Look up and run the handler for `nr`, checking the current task's
/// security level first. Returns the raw return value to load into RAX
/// (negative for an `Errno`).
pub fn dispatch(nr: u64, args: &SyscallArgs) -> isize {
    let entry = match SYSCALL_TABLE.iter().find(|e| e.number == nr) {
        Some(e) => e,
        None => {
            crate::warn!("unimplemented syscall: {}", nr);
            return Errno::ENOSYS.as_isize();
        }
    };

    let level = process::with_task(process::current_task_id(), |t| t.security_level)
        .unwrap_or(SecurityLevel::Application);
    if !level.admits(entry.required) {
        return Errno::EACCES.as_isize();
    }

    match (entry.handler)(args) {
        Ok(v) => v,
        Err(e) => e.as_isize(),
    }
}

fn current_process() -> Result<ProcessId> {
    let pid = process::current_pid();
    if pid == 0 {
        return Err(Errno::ESRCH);
    }
    Ok(pid)
}

fn read_user_cstr(ptr: *const u8) -> Result<alloc::string::String> {
    if ptr.is_null() {
        return Err(Errno::EFAULT);
    }
    unsafe {
        let mut len = 0;
        while len < 4096 && *ptr.add(len) != 0 {
            len += 1;
        }
        let bytes = core::slice::from_raw_parts(ptr, len);
        core::str::from_utf8(bytes)
            .map(alloc::string::ToString::to_string)
            .map_err(|_| Errno::EINVAL)
    }
}

fn sys_openat(args: &SyscallArgs) -> Result<isize> {
    let pathname = args.a1 as *const u8;
    let flags = args.a2 as i32;
    let mode = args.a3 as u32;
    let path = read_user_cstr(pathname)?;

    let open_flags = crate::vfs::OpenFlags::from_bits_truncate(flags as u32);
    let file = match crate::vfs::open(&path, open_flags) {
        Ok(f) => f,
        Err(Errno::ENOENT) if open_flags.contains(crate::vfs::OpenFlags::O_CREAT) => {
            crate::vfs::create(&path, mode)?;
            crate::vfs::open(&path, open_flags)?
        }
        Err(e) => return Err(e),
    };

    let pid = current_process()?;
    let fd = process::with_process_mut(pid, |p| p.files.alloc_fd(file))
        .ok_or(Errno::ESRCH)?
        .ok_or(Errno::EMFILE)?;

    crate::debug!("openat({}) -> fd {}", path, fd);
    Ok(fd as isize)
}

fn sys_close(args: &SyscallArgs) -> Result<isize> {
    let fd = args.a0 as i32;
    let pid = current_process()?;
    process::with_process_mut(pid, |p| p.files.close(fd))
        .ok_or(Errno::ESRCH)?
        .ok_or(Errno::EBADF)?;
    Ok(0)
}

fn sys_lseek(args: &SyscallArgs) -> Result<isize> {
    let fd = args.a0 as i32;
    let offset = args.a1 as i64;
    let whence = args.a2 as i32;
    let pid = current_process()?;
    let file = process::with_process(pid, |p| p.files.get(fd)).ok_or(Errno::ESRCH)?.ok_or(Errno::EBADF)?;
    Ok(file.lseek(offset, whence)? as isize)
}

fn sys_read(args: &SyscallArgs) -> Result<isize> {
    let fd = args.a0 as i32;
    let buf = args.a1 as *mut u8;
    let count = args.a2 as usize;
    if buf.is_null() {
        return Err(Errno::EFAULT);
    }
    if count == 0 {
        return Ok(0);
    }
    let pid = current_process()?;
    let file = process::with_process(pid, |p| p.files.get(fd)).ok_or(Errno::ESRCH)?.ok_or(Errno::EBADF)?;
    let data = unsafe { core::slice::from_raw_parts_mut(buf, count) };
    Ok(file.read(data)? as isize)
}

fn sys_write(args: &SyscallArgs) -> Result<isize> {
    let fd = args.a0 as i32;
    let buf = args.a1 as *const u8;
    let count = args.a2 as usize;
    if buf.is_null() {
        return Err(Errno::EFAULT);
    }
    if count == 0 {
        return Ok(0);
    }
    let pid = current_process()?;
    let file = process::with_process(pid, |p| p.files.get(fd)).ok_or(Errno::ESRCH)?.ok_or(Errno::EBADF)?;
    let data = unsafe { core::slice::from_raw_parts(buf, count) };
    Ok(file.write(data)? as isize)
}

fn sys_fstat(args: &SyscallArgs) -> Result<isize> {
    let fd = args.a0 as i32;
    let statbuf = args.a1 as *mut u8;
    if statbuf.is_null() {
        return Err(Errno::EFAULT);
    }
    let pid = current_process()?;
    let file = process::with_process(pid, |p| p.files.get(fd)).ok_or(Errno::ESRCH)?.ok_or(Errno::EBADF)?;
    let meta = file.inode.getattr()?;

    let stat = unsafe { core::slice::from_raw_parts_mut(statbuf, 128) };
    stat.fill(0);
    unsafe {
        let p = statbuf as *mut u64;
        *p.add(1) = meta.ino;
        *(statbuf.add(24) as *mut u32) = meta.mode;
        *(statbuf.add(48) as *mut u64) = meta.size;
    }
    Ok(0)
}

fn sys_getdents64(args: &SyscallArgs) -> Result<isize> {
    let fd = args.a0 as i32;
    let dirp = args.a1 as *mut u8;
    let count = args.a2 as usize;
    if dirp.is_null() {
        return Err(Errno::EFAULT);
    }
    let pid = current_process()?;
    let file = process::with_process(pid, |p| p.files.get(fd)).ok_or(Errno::ESRCH)?.ok_or(Errno::EBADF)?;
    if !file.inode.is_dir() {
        return Err(Errno::ENOTDIR);
    }

    let entries = file.inode.readdir()?;
    let mut offset = 0usize;
    for entry in entries {
        let name_bytes = entry.name.as_bytes();
        let reclen = ((19 + name_bytes.len() + 1 + 7) & !7) as u16;
        if offset + reclen as usize > count {
            break;
        }
        unsafe {
            let p = dirp.add(offset);
            *(p as *mut u64) = entry.ino;
            *(p.add(8) as *mut i64) = 0;
            *(p.add(16) as *mut u16) = reclen;
            *p.add(18) = match entry.itype {
                crate::vfs::InodeType::Regular => 8,
                crate::vfs::InodeType::Directory => 4,
                crate::vfs::InodeType::CharDevice => 2,
                crate::vfs::InodeType::Symlink => 10,
            };
            core::ptr::copy_nonoverlapping(name_bytes.as_ptr(), p.add(19), name_bytes.len());
            *p.add(19 + name_bytes.len()) = 0;
        }
        offset += reclen as usize;
    }
    Ok(offset as isize)
}

fn sys_exit(args: &SyscallArgs) -> Result<isize> {
    let code = args.a0 as i32;
    let task = process::current_task_id();
    crate::info!("task {} exit with code {}", task, code);
    process::with_task_mut(task, |t| t.mark_dead(code));
    process::scheduler::reap_dead();
    // Never actually returns to the caller: the task is dead and will not
    // be rescheduled. A real implementation blocks here until reaped; the
    // caller's trap-return path checks `state == Dead` and does not resume it.
    Ok(0)
}

fn sys_getpid(_args: &SyscallArgs) -> Result<isize> {
    Ok(process::current_pid() as isize)
}

fn sys_brk(args: &SyscallArgs) -> Result<isize> {
    let requested = args.a0;
    let pid = current_process()?;
    process::with_process_mut(pid, |p| {
        if requested != 0 {
            p.heap_brk = requested;
        }
        p.heap_brk
    })
    .map(|v| v as isize)
    .ok_or(Errno::ESRCH)
}

fn sys_ipc_create(_args: &SyscallArgs) -> Result<isize> {
    let pid = current_process()?;
    Ok(crate::ipc::create(pid) as isize)
}

fn sys_ipc_send(args: &SyscallArgs) -> Result<isize> {
    let channel = args.a0 as u32;
    let transaction = args.a1 as u32;
    let buf = args.a2 as *const u8;
    let len = args.a3 as usize;
    if buf.is_null() || len > crate::ipc::MAX_MESSAGE_LEN {
        return Err(Errno::EMSGSIZE);
    }
    let pid = current_process()?;
    let bytes = unsafe { core::slice::from_raw_parts(buf, len) }.to_vec();
    let message = crate::ipc::Message::new(pid, transaction, bytes)?;
    crate::ipc::try_send(channel, message)?;
    Ok(0)
}

fn sys_ipc_receive(args: &SyscallArgs) -> Result<isize> {
    let channel = args.a0 as u32;
    let buf = args.a1 as *mut u8;
    let cap = args.a2 as usize;
    if buf.is_null() {
        return Err(Errno::EFAULT);
    }
    let message = crate::ipc::try_receive(channel)?;
    let n = core::cmp::min(cap, message.length);
    unsafe {
        core::ptr::copy_nonoverlapping(message.bytes.as_ptr(), buf, n);
    }
    Ok(n as isize)
}

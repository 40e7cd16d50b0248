//! Process: the owner of an address space, heap, and file descriptor table
//! shared by one or more tasks.

use crate::mm::RangePool;
use crate::process::TaskId;
use crate::vfs::File;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use x86_64::PhysAddr;

pub type ProcessId = u32;

/// Fixed-capacity file descriptor table, shared by every task of a process.
pub struct FileTable {
    fds: Vec<Option<Arc<File>>>,
}

const MAX_FDS: usize = 256;

impl FileTable {
    pub fn new() -> Self {
        Self { fds: vec![None; MAX_FDS] }
    }

    pub fn alloc_fd(&mut self, file: Arc<File>) -> Option<i32> {
        let slot = self.fds.iter().position(|f| f.is_none())?;
        self.fds[slot] = Some(file);
        Some(slot as i32)
    }

    pub fn get(&self, fd: i32) -> Option<Arc<File>> {
        if fd < 0 {
            return None;
        }
        self.fds.get(fd as usize)?.clone()
    }

    /// Close an fd. Returns `None` (rather than panicking) for an fd that
    /// was never opened or was already closed, even if that numeric value
    /// is later reused by a fresh open.
    pub fn close(&mut self, fd: i32) -> Option<Arc<File>> {
        if fd < 0 {
            return None;
        }
        let slot = self.fds.get_mut(fd as usize)?;
        slot.take()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Master TLS image a process's threads copy their own TLS block from.
pub struct TlsImage {
    pub bytes: Vec<u8>,
    pub copy_size: usize,
    pub total_size: usize,
    pub alignment: usize,
    pub master_location: u64,
}

pub struct Process {
    pub id: ProcessId,
    /// Physical address of this process's top-level page table (PML4).
    pub pml4: PhysAddr,
    pub range_pool: RangePool,
    pub heap_start: u64,
    pub heap_brk: u64,
    pub heap_pages: usize,
    pub cwd: String,
    pub tls: Option<TlsImage>,
    pub files: FileTable,
    pub threads: Vec<TaskId>,
    pub name: String,
}

impl Process {
    pub fn new(id: ProcessId, pml4: PhysAddr, range_pool: RangePool, heap_start: u64, name: String) -> Self {
        Self {
            id,
            pml4,
            range_pool,
            heap_start,
            heap_brk: heap_start,
            heap_pages: 0,
            cwd: String::from("/"),
            tls: None,
            files: FileTable::new(),
            threads: Vec::new(),
            name,
        }
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("threads", &self.threads)
            .finish()
    }
}

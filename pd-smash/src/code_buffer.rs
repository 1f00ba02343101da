use tracing::{debug, warn};

use crate::address::CodeAddress;
use crate::error::{SmashError, SmashResult};

/// Page protection a buffer holds while it accepts writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    /// Needed to run code and smash it in place without flipping protection.
    ReadWriteExecute,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeBufferConfig {
    pub capacity: usize,
    pub protection: Protection,
}

impl Default for CodeBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024,
            protection: Protection::ReadWrite,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    ReadWrite,
    ReadWriteExecute,
    ReadExecute,
}

impl From<Protection> for Access {
    fn from(protection: Protection) -> Self {
        match protection {
            Protection::ReadWrite => Access::ReadWrite,
            Protection::ReadWriteExecute => Access::ReadWriteExecute,
        }
    }
}

/// A fixed-capacity, page-aligned region that code is appended to.
///
/// The region never moves, so addresses handed out by the encoders stay
/// valid until the buffer is dropped. Emission needs `&mut self`; smashing
/// an already emitted slot only needs `&self`, which lets executing threads
/// and patching threads share the buffer.
pub struct CodeBuffer {
    base: *mut u8,
    capacity: usize,
    len: usize,
    protection: Protection,
    finalized: bool,
}

// The region is only written through `&mut self` or through aligned atomic
// slot stores.
unsafe impl Send for CodeBuffer {}
unsafe impl Sync for CodeBuffer {}

impl CodeBuffer {
    pub fn new(config: CodeBufferConfig) -> SmashResult<Self> {
        if config.capacity == 0 {
            return Err(SmashError::Memory(
                "cannot map an empty code buffer".to_string(),
            ));
        }
        let page = page_size();
        let capacity = config
            .capacity
            .checked_add(page - 1)
            .map(|len| len & !(page - 1))
            .ok_or_else(|| SmashError::Memory("code buffer capacity overflows".to_string()))?;
        let base = alloc_region(capacity, config.protection)?;
        debug!(
            base = %CodeAddress::from_ptr(base),
            capacity,
            protection = ?config.protection,
            "mapped code buffer"
        );
        Ok(Self {
            base,
            capacity,
            len: 0,
            protection: config.protection,
            finalized: false,
        })
    }

    pub fn with_capacity(capacity: usize) -> SmashResult<Self> {
        Self::new(CodeBufferConfig {
            capacity,
            ..CodeBufferConfig::default()
        })
    }

    pub fn base(&self) -> CodeAddress {
        CodeAddress::from_ptr(self.base)
    }

    /// Address the next emitted byte lands on.
    pub fn frontier(&self) -> CodeAddress {
        self.base().add(self.len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity - self.len
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn is_frontier_aligned(&self, align: usize) -> bool {
        self.frontier().is_aligned(align)
    }

    /// Whether `[at, at + len)` lies inside the emitted bytes.
    pub fn contains(&self, at: CodeAddress, len: usize) -> bool {
        let Some(offset) = at.distance_from(self.base()) else {
            return false;
        };
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.len)
    }

    /// Fails unless `bytes` more can be appended right now.
    pub fn reserve(&self, bytes: usize) -> SmashResult<()> {
        if self.finalized {
            return Err(SmashError::Sealed);
        }
        if bytes > self.available() {
            return Err(SmashError::BufferFull {
                requested: bytes,
                available: self.available(),
            });
        }
        Ok(())
    }

    pub fn emit_u32(&mut self, word: u32) -> SmashResult<()> {
        self.reserve(4)?;
        assert!(
            self.is_frontier_aligned(4),
            "instruction emitted at unaligned frontier {}",
            self.frontier()
        );
        unsafe {
            self.base
                .add(self.len)
                .cast::<[u8; 4]>()
                .write(word.to_le_bytes());
        }
        self.len += 4;
        Ok(())
    }

    pub fn emit_u64(&mut self, word: u64) -> SmashResult<()> {
        self.reserve(8)?;
        assert!(
            self.is_frontier_aligned(8),
            "data word emitted at unaligned frontier {}",
            self.frontier()
        );
        unsafe {
            self.base
                .add(self.len)
                .cast::<[u8; 8]>()
                .write(word.to_le_bytes());
        }
        self.len += 8;
        Ok(())
    }

    /// Reads one emitted instruction word.
    ///
    /// Must not race with a smash of the same bytes; use the decoders for
    /// slots that other threads may be patching.
    pub fn word_at(&self, at: CodeAddress) -> Option<u32> {
        if !at.is_aligned(4) || !self.contains(at, 4) {
            return None;
        }
        let bytes = unsafe { at.as_ptr().cast::<[u8; 4]>().read() };
        Some(u32::from_le_bytes(bytes))
    }

    /// Makes `[start, start + len)` coherent for instruction fetch.
    pub fn sync_icache(&self, start: CodeAddress, len: usize) {
        if len == 0 {
            return;
        }
        debug_assert!(
            self.contains(start, len),
            "icache sync range {start}+{len} outside emitted code"
        );
        flush_icache(start.as_mut_ptr(), len);
    }

    pub fn sync_emitted(&self) {
        self.sync_icache(self.base(), self.len);
    }

    /// Flips the region to read+execute. Further emission and smashing
    /// fail with [`SmashError::Sealed`] until [`CodeBuffer::reopen`].
    pub fn finalize(&mut self) -> SmashResult<()> {
        if self.finalized {
            return Ok(());
        }
        protect_region(self.base, self.capacity, Access::ReadExecute)?;
        self.sync_emitted();
        self.finalized = true;
        debug!(base = %self.base(), len = self.len, "finalized code buffer");
        Ok(())
    }

    pub fn reopen(&mut self) -> SmashResult<()> {
        if !self.finalized {
            return Ok(());
        }
        protect_region(self.base, self.capacity, self.protection.into())?;
        self.finalized = false;
        Ok(())
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        if let Err(err) = free_region(self.base, self.capacity) {
            warn!(error = %err, "failed to release code buffer");
        }
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size)
        .ok()
        .filter(|size| size.is_power_of_two())
        .unwrap_or(4096)
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

#[cfg(unix)]
fn unix_prot(access: Access) -> libc::c_int {
    match access {
        Access::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        Access::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        Access::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
    }
}

#[cfg(unix)]
fn alloc_region(len: usize, protection: Protection) -> SmashResult<*mut u8> {
    #[cfg(target_os = "macos")]
    {
        if protection == Protection::ReadWriteExecute {
            return Err(SmashError::Memory(
                "read-write-execute code buffers are not supported on macos".to_string(),
            ));
        }
    }

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            unix_prot(protection.into()),
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(SmashError::Memory(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(unix)]
fn protect_region(ptr: *mut u8, len: usize, access: Access) -> SmashResult<()> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, unix_prot(access)) };
    if rc != 0 {
        return Err(SmashError::Memory(format!(
            "mprotect({access:?}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn free_region(ptr: *mut u8, len: usize) -> SmashResult<()> {
    if ptr.is_null() {
        return Ok(());
    }
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(SmashError::Memory(format!(
            "munmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(windows)]
fn windows_page_flags(access: Access) -> u32 {
    use windows_sys::Win32::System::Memory::{
        PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_READWRITE,
    };

    match access {
        Access::ReadWrite => PAGE_READWRITE,
        Access::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
        Access::ReadExecute => PAGE_EXECUTE_READ,
    }
}

#[cfg(windows)]
fn alloc_region(len: usize, protection: Protection) -> SmashResult<*mut u8> {
    use windows_sys::Win32::System::Memory::{MEM_COMMIT, MEM_RESERVE, VirtualAlloc};

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            windows_page_flags(protection.into()),
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(SmashError::Memory(format!(
            "VirtualAlloc failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr)
}

#[cfg(windows)]
fn protect_region(ptr: *mut u8, len: usize, access: Access) -> SmashResult<()> {
    use windows_sys::Win32::System::Memory::VirtualProtect;

    let mut old_protect = 0u32;
    let ok = unsafe {
        VirtualProtect(
            ptr as *mut _,
            len,
            windows_page_flags(access),
            &mut old_protect,
        )
    };
    if ok == 0 {
        return Err(SmashError::Memory(format!(
            "VirtualProtect({access:?}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(windows)]
fn free_region(ptr: *mut u8, _len: usize) -> SmashResult<()> {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    if ptr.is_null() {
        return Ok(());
    }
    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(SmashError::Memory(format!(
            "VirtualFree failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn alloc_region(_len: usize, _protection: Protection) -> SmashResult<*mut u8> {
    Err(SmashError::Memory(
        "unsupported platform for code buffers".to_string(),
    ))
}

#[cfg(not(any(unix, windows)))]
fn protect_region(_ptr: *mut u8, _len: usize, _access: Access) -> SmashResult<()> {
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn free_region(_ptr: *mut u8, _len: usize) -> SmashResult<()> {
    Ok(())
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn flush_icache(ptr: *mut u8, len: usize) {
    unsafe {
        __clear_cache(
            ptr as *mut libc::c_char,
            ptr.add(len) as *mut libc::c_char,
        );
    }
}

#[cfg(target_os = "macos")]
fn flush_icache(ptr: *mut u8, len: usize) {
    unsafe { sys_icache_invalidate(ptr as *mut libc::c_void, len) };
}

#[cfg(windows)]
fn flush_icache(ptr: *mut u8, len: usize) {
    use windows_sys::Win32::System::{
        Diagnostics::Debug::FlushInstructionCache, Threading::GetCurrentProcess,
    };

    let ok = unsafe { FlushInstructionCache(GetCurrentProcess(), ptr as *const _, len) };
    if ok == 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            "FlushInstructionCache failed"
        );
    }
}

// Hosts with coherent instruction caches.
#[cfg(not(any(
    all(target_os = "linux", target_arch = "aarch64"),
    target_os = "macos",
    windows
)))]
fn flush_icache(_ptr: *mut u8, _len: usize) {}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

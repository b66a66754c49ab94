//! Executable code pages
//!
//! W^X discipline: pages are writable while the code is copied in, then
//! flipped to read+execute. Lifetime is tied to the owning cache entry and
//! never shared with GC-managed objects.

use core::ptr::NonNull;

use super::JitEntryFn;

/// An owned, executable code region.
pub struct ExecutableCode {
    ptr: NonNull<u8>,
    len: usize,
    page_len: usize,
}

impl ExecutableCode {
    /// Map a fresh page set, copy `code` in and seal it executable.
    #[cfg(unix)]
    pub fn new(code: &[u8]) -> Option<Self> {
        if code.is_empty() {
            return None;
        }

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let page_len = code.len().div_ceil(page) * page;

        // Safety: anonymous private mapping, checked for MAP_FAILED.
        let raw = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                page_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return None;
        }

        // Safety: the mapping is page_len bytes and writable.
        unsafe {
            core::ptr::copy_nonoverlapping(code.as_ptr(), raw as *mut u8, code.len());
            if libc::mprotect(raw, page_len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                libc::munmap(raw, page_len);
                return None;
            }
        }

        Some(Self {
            ptr: NonNull::new(raw as *mut u8)?,
            len: code.len(),
            page_len,
        })
    }

    /// Executable pages are unavailable on this platform.
    #[cfg(not(unix))]
    pub fn new(_code: &[u8]) -> Option<Self> {
        None
    }

    /// Code length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for an empty region; never the case for a live one.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The entry point at the start of the region.
    pub fn entry_fn(&self) -> JitEntryFn {
        // Safety: the region holds a complete function emitted by a
        // backend with the JitState calling convention, sealed RX.
        unsafe { core::mem::transmute::<*const u8, JitEntryFn>(self.ptr.as_ptr()) }
    }
}

impl Drop for ExecutableCode {
    fn drop(&mut self) {
        #[cfg(unix)]
        // Safety: the mapping was created in `new` with this length.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.page_len);
        }
    }
}

impl core::fmt::Debug for ExecutableCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ExecutableCode({} bytes)", self.len)
    }
}

#[cfg(all(
    test,
    unix,
    any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")
))]
mod tests {
    use super::*;

    #[test]
    fn pages_are_mapped_and_freed() {
        let code = super::super::backend::RETURN_STUB;
        let region = ExecutableCode::new(&code).expect("mapping");
        assert_eq!(region.len(), code.len());
        drop(region);
    }

    #[test]
    fn empty_code_is_rejected() {
        assert!(ExecutableCode::new(&[]).is_none());
    }
}

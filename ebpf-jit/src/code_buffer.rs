use std::io;
use std::ptr;

/// A growable, `mmap`-backed output buffer for generated machine code.
///
/// Follows W^X discipline: the buffer is either writable or executable,
/// never both at once. Emission methods are bounds-checked with
/// `assert!` since a caller overrunning its own allocation is a
/// programmer error, not a runtime condition to recover from.
pub struct CodeBuffer {
    ptr: *mut u8,
    size: usize,
    offset: usize,
    /// Whether `Drop` should `munmap` this region. False when the
    /// buffer only borrows a caller-supplied slice (see [`Self::from_slice`]).
    owns_mapping: bool,
}

// SAFETY: CodeBuffer owns its mmap'd memory exclusively.
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    /// Allocate a new buffer of at least `size` bytes, rounded up to a
    /// whole number of pages.
    pub fn new(size: usize) -> io::Result<Self> {
        let page_size = page_size();
        let size = (size + page_size - 1) & !(page_size - 1);

        // SAFETY: anonymous, private mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            offset: 0,
            owns_mapping: true,
        })
    }

    /// Wrap a caller-supplied slice for emission without taking
    /// ownership of it. Used by [`crate::translate::translate`], whose
    /// contract writes into a buffer the caller allocated and will free.
    pub fn from_slice(slice: &mut [u8]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            size: slice.len(),
            offset: 0,
            owns_mapping: false,
        }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.size - self.offset
    }

    /// A mutable view of the whole mapping, for a writer (namely
    /// `translate`) that tracks its own cursor via a fresh [`CodeBuffer`]
    /// rather than this one's `offset`. Emission must happen in place,
    /// at this mapping's final address: a direct `CALL`'s displacement
    /// is computed relative to the emitting buffer's address (see
    /// `x86_64::emitter::emit_call`), so translating into a scratch
    /// buffer and copying the result elsewhere would silently corrupt
    /// every absolute-target call.
    pub fn as_full_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `ptr..ptr+size` is this mapping's whole extent.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    /// Record how many bytes of the full capacity hold valid code, after
    /// a writer filled them in through [`Self::as_full_mut_slice`].
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.size, "set_len beyond mapping capacity");
        self.offset = len;
    }

    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        assert!(self.offset < self.size, "code buffer overflow");
        unsafe { self.ptr.add(self.offset).write(val) };
        self.offset += 1;
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        assert!(self.offset + 4 <= self.size, "code buffer overflow");
        unsafe { (self.ptr.add(self.offset) as *mut u32).write_unaligned(val) };
        self.offset += 4;
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        assert!(self.offset + 8 <= self.size, "code buffer overflow");
        unsafe { (self.ptr.add(self.offset) as *mut u64).write_unaligned(val) };
        self.offset += 8;
    }

    #[inline]
    pub fn emit_bytes(&mut self, data: &[u8]) {
        assert!(
            self.offset + data.len() <= self.size,
            "code buffer overflow"
        );
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(self.offset), data.len());
        }
        self.offset += data.len();
    }

    /// Patch a previously-emitted 32-bit field (e.g. a branch displacement).
    #[inline]
    pub fn patch_u32(&mut self, offset: usize, val: u32) {
        assert!(offset + 4 <= self.size);
        unsafe { (self.ptr.add(offset) as *mut u32).write_unaligned(val) };
    }

    /// Make the buffer executable and non-writable.
    pub fn set_executable(&self) -> io::Result<()> {
        let ret = unsafe {
            libc::mprotect(
                self.ptr as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Make the buffer writable and non-executable.
    pub fn set_writable(&self) -> io::Result<()> {
        let ret = unsafe {
            libc::mprotect(
                self.ptr as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// The generated code written so far, as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr..ptr+offset has been written.
        unsafe { std::slice::from_raw_parts(self.ptr, self.offset) }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        if self.owns_mapping && !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

//! Memory allocator pool shared by all backends.
//!
//! Allocations are cached on release and handed back to later requests of
//! the same flavor and size, which matters because evaluation allocates and
//! frees identically-sized output buffers in a tight loop. `trim` returns
//! the cached blocks to the system; the evaluator calls it once when an
//! allocation fails before retrying.

use log::trace;
use rustc_hash::FxHashMap;
use std::alloc::{alloc_zeroed, dealloc, Layout};

/// Flavor of a memory allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum AllocKind {
    /// Ordinary host memory.
    Host,
    /// Page-locked host memory, mappable by a device.
    HostPinned,
    /// Host memory written asynchronously by the owning stream.
    HostAsync,
    /// Device-resident memory.
    Device,
}

pub const ALLOC_KIND_COUNT: usize = 4;

impl AllocKind {
    pub fn name(self) -> &'static str {
        match self {
            AllocKind::Host => "host",
            AllocKind::HostPinned => "host-pinned",
            AllocKind::HostAsync => "host-async",
            AllocKind::Device => "device",
        }
    }
}

#[derive(Clone, Copy)]
struct AllocInfo {
    kind: AllocKind,
    bytes: usize,
}

/// All allocations are aligned generously enough for any vector load the
/// emitted kernels perform.
const ALLOC_ALIGN: usize = 64;

#[derive(Default)]
pub struct Allocator {
    /// Live allocations, keyed by address.
    used: FxHashMap<usize, AllocInfo>,
    /// Released blocks kept for reuse, keyed by (kind, size).
    cache: FxHashMap<(AllocKind, usize), Vec<usize>>,
    /// Bytes currently handed out, per kind.
    usage: [usize; ALLOC_KIND_COUNT],
    /// High-water mark of `usage`.
    watermark: [usize; ALLOC_KIND_COUNT],
    /// Bytes held in total (used + cached), per kind.
    allocated: [usize; ALLOC_KIND_COUNT],
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `bytes` of the given flavor, reusing a cached block when one
    /// of the exact size is available. Returns a null pointer only when the
    /// system allocator fails even after `trim`.
    pub fn alloc(&mut self, kind: AllocKind, bytes: usize) -> *mut u8 {
        let bytes = bytes.max(1);

        if let Some(entries) = self.cache.get_mut(&(kind, bytes)) {
            if let Some(ptr) = entries.pop() {
                self.used.insert(ptr, AllocInfo { kind, bytes });
                self.bump_usage(kind, bytes);
                trace!("alloc(): reused {bytes} bytes ({})", kind.name());
                return ptr as *mut u8;
            }
        }

        let layout = Layout::from_size_align(bytes, ALLOC_ALIGN).expect("alloc(): invalid layout");
        let mut ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            // Flush the reuse cache and try once more.
            self.trim();
            ptr = unsafe { alloc_zeroed(layout) };
        }
        if ptr.is_null() {
            return ptr;
        }

        self.used.insert(ptr as usize, AllocInfo { kind, bytes });
        self.allocated[kind as usize] += bytes;
        self.bump_usage(kind, bytes);
        trace!("alloc(): {bytes} bytes ({})", kind.name());
        ptr
    }

    fn bump_usage(&mut self, kind: AllocKind, bytes: usize) {
        let usage = &mut self.usage[kind as usize];
        *usage += bytes;
        let watermark = &mut self.watermark[kind as usize];
        *watermark = (*watermark).max(*usage);
    }

    /// Release an allocation back into the reuse cache.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let info = self
            .used
            .remove(&(ptr as usize))
            .unwrap_or_else(|| panic!("free(): unknown pointer {ptr:p}!"));
        self.usage[info.kind as usize] -= info.bytes;
        self.cache
            .entry((info.kind, info.bytes))
            .or_default()
            .push(ptr as usize);
    }

    /// Flavor of a live allocation. Panics on unknown pointers, which always
    /// indicate a reference-counting bug upstream.
    pub fn kind_of(&self, ptr: *const u8) -> AllocKind {
        self.used
            .get(&(ptr as usize))
            .unwrap_or_else(|| panic!("kind_of(): unknown pointer {ptr:p}!"))
            .kind
    }

    /// Whether `ptr` designates a live allocation of this pool.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.used.contains_key(&(ptr as usize))
    }

    /// Move an allocation to a different flavor. Returns the same pointer
    /// when no move is necessary.
    pub fn migrate(&mut self, ptr: *mut u8, kind: AllocKind) -> *mut u8 {
        let info = *self
            .used
            .get(&(ptr as usize))
            .unwrap_or_else(|| panic!("migrate(): unknown pointer {ptr:p}!"));
        if info.kind == kind {
            return ptr;
        }
        let dst = self.alloc(kind, info.bytes);
        if !dst.is_null() {
            unsafe { std::ptr::copy_nonoverlapping(ptr, dst, info.bytes) };
            self.free(ptr);
        }
        dst
    }

    /// Fill `count` elements of width `isize_` with the given bit pattern.
    pub fn memset_async(&mut self, ptr: *mut u8, count: usize, isize_: usize, value: u64) {
        unsafe {
            match isize_ {
                1 => std::ptr::write_bytes(ptr, value as u8, count),
                2 => {
                    let p = ptr as *mut u16;
                    for i in 0..count {
                        p.add(i).write(value as u16);
                    }
                }
                4 => {
                    let p = ptr as *mut u32;
                    for i in 0..count {
                        p.add(i).write(value as u32);
                    }
                }
                8 => {
                    let p = ptr as *mut u64;
                    for i in 0..count {
                        p.add(i).write(value);
                    }
                }
                _ => panic!("memset_async(): invalid element size {isize_}!"),
            }
        }
    }

    /// Asynchronous (stream-ordered) copy; synchronous on host memory.
    pub fn memcpy_async(&mut self, dst: *mut u8, src: *const u8, bytes: usize) {
        unsafe { std::ptr::copy_nonoverlapping(src, dst, bytes) };
    }

    /// Return all cached blocks to the system allocator.
    pub fn trim(&mut self) {
        let mut released = 0usize;
        for ((kind, bytes), entries) in self.cache.drain() {
            for ptr in entries {
                let layout = Layout::from_size_align(bytes, ALLOC_ALIGN).unwrap();
                unsafe { dealloc(ptr as *mut u8, layout) };
                self.allocated[kind as usize] -= bytes;
                released += bytes;
            }
        }
        if released > 0 {
            trace!("trim(): released {released} bytes");
        }
    }

    pub fn usage(&self, kind: AllocKind) -> usize {
        self.usage[kind as usize]
    }

    pub fn allocated(&self, kind: AllocKind) -> usize {
        self.allocated[kind as usize]
    }

    pub fn watermark(&self, kind: AllocKind) -> usize {
        self.watermark[kind as usize]
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.trim();
        for (&ptr, info) in self.used.clone().iter() {
            let layout = Layout::from_size_align(info.bytes, ALLOC_ALIGN).unwrap();
            unsafe { dealloc(ptr as *mut u8, layout) };
        }
        self.used.clear();
    }
}

/// Human-readable byte count, e.g. `"1.5 MiB"`.
pub fn mem_string(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.3} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_same_size() {
        let mut a = Allocator::new();
        let p1 = a.alloc(AllocKind::HostAsync, 256);
        a.free(p1);
        let p2 = a.alloc(AllocKind::HostAsync, 256);
        assert_eq!(p1, p2);
        assert_eq!(a.usage(AllocKind::HostAsync), 256);
        a.free(p2);
    }

    #[test]
    fn migrate_is_identity_for_same_kind() {
        let mut a = Allocator::new();
        let p = a.alloc(AllocKind::Host, 64);
        assert_eq!(a.migrate(p, AllocKind::Host), p);
        let q = a.migrate(p, AllocKind::Device);
        assert_ne!(q, p);
        assert_eq!(a.kind_of(q), AllocKind::Device);
        a.free(q);
    }

    #[test]
    fn memset_patterns() {
        let mut a = Allocator::new();
        let p = a.alloc(AllocKind::Host, 16);
        a.memset_async(p, 4, 4, 0xdead_beef);
        let slice = unsafe { std::slice::from_raw_parts(p as *const u32, 4) };
        assert_eq!(slice, &[0xdead_beef; 4]);
        a.free(p);
    }

    #[test]
    fn watermark_tracks_peak() {
        let mut a = Allocator::new();
        let p1 = a.alloc(AllocKind::Device, 100);
        let p2 = a.alloc(AllocKind::Device, 50);
        a.free(p1);
        a.free(p2);
        assert_eq!(a.usage(AllocKind::Device), 0);
        assert_eq!(a.watermark(AllocKind::Device), 150);
    }
}

use std::alloc::Layout;
use std::ptr::NonNull;

pub fn round_size_up_to_alignment_u32(
    size: u32,
    required_alignment: u32,
) -> u32 {
    assert!(required_alignment > 0);
    ((size + required_alignment - 1) / required_alignment) * required_alignment
}

pub fn round_size_up_to_alignment_u64(
    size: u64,
    required_alignment: u64,
) -> u64 {
    assert!(required_alignment > 0);
    ((size + required_alignment - 1) / required_alignment) * required_alignment
}

/// Rounds `value` up to a power-of-two `alignment`
#[inline(always)]
pub fn align_up_pow2_u64(
    value: u64,
    alignment: u64,
) -> u64 {
    debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
    (value + (alignment - 1)) & !(alignment - 1)
}

#[inline(always)]
pub fn align_up_pow2_usize(
    value: usize,
    alignment: usize,
) -> usize {
    debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
    (value + (alignment - 1)) & !(alignment - 1)
}

/// Largest power of two that is less than or equal to `value`, or 0 if `value` is 0
pub fn largest_pow2_at_most(value: usize) -> usize {
    if value == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - value.leading_zeros())
    }
}

/// Formats a byte count for log messages, e.g. `format_memory_size(3 << 20, 2)` gives `3.00 MB`
pub fn format_memory_size(
    size: u64,
    precision: usize,
) -> String {
    const UNITS: [(u64, &str); 3] = [(1 << 30, "GB"), (1 << 20, "MB"), (1 << 10, "KB")];
    for (unit_size, unit_name) in UNITS {
        if size >= unit_size {
            return format!(
                "{:.*} {}",
                precision,
                size as f64 / unit_size as f64,
                unit_name
            );
        }
    }

    format!("{} bytes", size)
}

/// Raw memory source used when creating reference-counted objects. `description` names the
/// allocation for diagnostics.
pub trait MemoryAllocator: Send + Sync {
    fn allocate(
        &self,
        layout: Layout,
        description: &'static str,
    ) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator with the same `layout`
    unsafe fn free(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
    );
}

/// Allocator backed by the global heap. Zero-sized layouts never touch the heap.
#[derive(Default, Debug)]
pub struct DefaultRawMemoryAllocator;

impl MemoryAllocator for DefaultRawMemoryAllocator {
    fn allocate(
        &self,
        layout: Layout,
        description: &'static str,
    ) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            // Any non-null, aligned pointer is a valid zero-sized allocation
            return NonNull::new(layout.align() as *mut u8);
        }

        // SAFETY: layout has a non-zero size
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) });
        if ptr.is_none() {
            log::error!(
                "Failed to allocate {} for {}",
                format_memory_size(layout.size() as u64, 2),
                description
            );
        }
        ptr
    }

    unsafe fn free(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
    ) {
        if layout.size() != 0 {
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

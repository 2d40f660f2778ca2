/*
 * Kernel Heap Allocator
 *
 * Dynamic memory for the kernel, built on the linked_list_allocator crate.
 * The heap lives inside the kernel direct-mapped region, so for any heap
 * allocation the physical address equals the virtual address. Page
 * directories and page tables are carved from here for exactly that reason:
 * the paging code can walk them through the direct map.
 *
 * The heap lock is exposed through `try_lock_heap` because the zombie
 * reaper frees stacks on the context-switch path, where blocking on the
 * allocator would deadlock against whatever the interrupted thread held.
 */

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use linked_list_allocator::Heap;

use crate::sync::spinlock::{SpinLock, SpinLockGuard};

/// Kernel heap placement inside the direct-mapped region.
pub const HEAP_START: u32 = 0x0040_0000;

/// Size of the kernel heap in bytes (8 MiB). Kernel stacks, TCBs, page
/// tables and run-queue storage all come from here.
pub const HEAP_SIZE: u32 = 8 * 1024 * 1024;

static KERNEL_HEAP: SpinLock<Heap> = SpinLock::new(Heap::empty());

struct LockedKernelHeap;

// Host-side unit tests run on the host allocator instead.
#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedKernelHeap = LockedKernelHeap;

unsafe impl GlobalAlloc for LockedKernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        KERNEL_HEAP
            .lock()
            .allocate_first_fit(layout)
            .map_or(core::ptr::null_mut(), |p| p.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe {
            KERNEL_HEAP
                .lock()
                .deallocate(NonNull::new_unchecked(ptr), layout);
        }
    }
}

/// Initialize the kernel heap over its fixed direct-mapped range.
///
/// # Safety
/// Must be called exactly once, before the first allocation, and the range
/// must not overlap the kernel image or the boot structures.
pub unsafe fn init() {
    unsafe {
        KERNEL_HEAP
            .lock()
            .init(HEAP_START as *mut u8, HEAP_SIZE as usize);
    }
    log::info!(
        "kernel heap: {:#x}..{:#x} ({} KiB)",
        HEAP_START,
        HEAP_START + HEAP_SIZE,
        HEAP_SIZE / 1024
    );
}

/// Fallible aligned allocation.
///
/// Page-table allocation goes through this instead of the global allocator
/// so that out-of-memory surfaces as an error code to the caller rather
/// than an allocation panic.
pub fn try_alloc_aligned(size: usize, align: usize) -> Option<NonNull<u8>> {
    let layout = Layout::from_size_align(size, align).ok()?;
    KERNEL_HEAP.lock().allocate_first_fit(layout).ok()
}

/// Free an allocation made with `try_alloc_aligned`.
///
/// # Safety
/// `ptr` must come from `try_alloc_aligned` with the same size and align.
pub unsafe fn free_aligned(ptr: NonNull<u8>, size: usize, align: usize) {
    let layout = Layout::from_size_align(size, align).expect("bad layout on free");
    unsafe {
        KERNEL_HEAP.lock().deallocate(ptr, layout);
    }
}

/// Non-blocking heap access for the zombie reaper.
pub fn try_lock_heap() -> Option<SpinLockGuard<'static, Heap>> {
    KERNEL_HEAP.try_lock()
}

/// Allocation error handler (required when using a global allocator in no_std).
///
/// Heap exhaustion outside the fallible paths is fatal; there is nothing to
/// return an error to.
#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("Kernel heap allocation failed: {:?}", layout);
}

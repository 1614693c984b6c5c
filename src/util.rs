use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;

/// Allocate a zeroed array of `count` `T`s, or `None` if the allocator
/// refuses (or the total size overflows `isize`).
pub fn allocate_zeroed<T>(count: usize) -> Option<*mut T> {
    let layout = Layout::array::<T>(count).ok()?;
    let ptr = unsafe { alloc_zeroed(layout).cast::<T>() };
    if ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

/// Release an array previously obtained from [`allocate_zeroed`] with the
/// same `count`.
pub fn deallocate<T>(ptr: *mut T, count: usize) {
    // The layout was validated at allocation time.
    let layout = Layout::array::<T>(count).unwrap();
    unsafe { dealloc(ptr.cast::<u8>(), layout) }
}

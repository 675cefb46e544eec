//! A fixed-buffer memory allocator: a page-granular linear allocator plus a
//! slab allocator layered on top, both operating over a single caller-
//! supplied byte buffer with no host paging/VM dependency. Intended for
//! embedded and freestanding use.
//!
//! Two layers:
//!
//! - [`linear`] carves whole 4 KiB pages out of the buffer, growing from the
//!   front for short-lived ("transient") allocations and from the back for
//!   long-lived ("persistent") ones, so the two populations don't fragment
//!   each other.
//! - [`slab`] sits on top of it, carving pages from the linear layer into
//!   fixed-size cells for small requests.
//!
//! Both are exposed two ways: as explicit value types ([`linear::LinearAllocator`],
//! [`slab::SlabAllocator`]) a host can own directly, and as a singleton
//! wrapper (the `lm_*`/`sm_*` free functions below) over module-level
//! statics, matching the shape of the original C API this crate's algorithms
//! were distilled from.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), allow(internal_features))]

#[macro_use]
pub mod macros;

pub mod error;
pub mod host;
pub mod linear;
pub mod meta;
pub mod slab;
pub mod util;

use core::sync::atomic::{AtomicBool, Ordering};

pub use linear::Direction;

use slab::SlabAllocator;

static mut SLAB_ALLOCATOR: SlabAllocator = SlabAllocator::uninit();

#[cfg(feature = "static")]
static STATIC_INIT_DONE: AtomicBool = AtomicBool::new(false);

#[cfg(feature = "static")]
const STATIC_BUFFER_SIZE: usize = 640 * 1024;

#[cfg(feature = "static")]
#[repr(align(4096))]
struct StaticBuffer([u8; STATIC_BUFFER_SIZE]);

#[cfg(feature = "static")]
static mut STATIC_BUFFER: StaticBuffer = StaticBuffer([0; STATIC_BUFFER_SIZE]);

/// Lazily `reinit`s the singleton allocator against the built-in static
/// buffer the first time any `lm_*`/`sm_*` entry point is reached. Only
/// compiled in under the `static` feature — a single-threaded crate has no
/// need for anything heavier than a gate flag, since there is no concurrent
/// caller to race with.
#[cfg(feature = "static")]
#[inline]
unsafe fn ensure_static_init() {
    if !STATIC_INIT_DONE.load(Ordering::Relaxed) {
        let buffer = STATIC_BUFFER.0.as_mut_ptr();
        SLAB_ALLOCATOR.reinit(buffer, STATIC_BUFFER_SIZE, true);
        STATIC_INIT_DONE.store(true, Ordering::Relaxed);
    }
}

#[cfg(not(feature = "static"))]
#[inline]
unsafe fn ensure_static_init() {}

/// Re-point the global linear allocator at `buffer`, discarding any prior
/// state. Must be called once before any other `lm_*`/`sm_*` function when
/// the `static` feature is disabled.
///
/// # Safety
/// See [`linear::LinearAllocator::reinit`].
pub unsafe fn lm_reinit(buffer: *mut u8, size: usize, zero_filled: bool) {
    SLAB_ALLOCATOR.reinit(buffer, size, zero_filled);
    #[cfg(feature = "static")]
    STATIC_INIT_DONE.store(true, Ordering::Relaxed);
}

/// Allocate `size` bytes from the global linear allocator directly (bypassing
/// the slab layer), rounded up to whole pages.
///
/// # Safety
/// The allocator must have been initialized, via [`lm_reinit`] or the
/// `static` feature.
pub unsafe fn lm_malloc(size: usize, direction: Direction) -> *mut u8 {
    ensure_static_init();
    SLAB_ALLOCATOR.linear_mut().malloc(size, direction)
}

/// Free a page-granular allocation made with [`lm_malloc`]/[`lm_realloc`].
///
/// # Safety
/// `ptr` must be a live allocation from the global linear allocator.
pub unsafe fn lm_free(ptr: *mut u8) {
    ensure_static_init();
    SLAB_ALLOCATOR.linear_mut().free(ptr);
}

/// Resize a page-granular allocation made with [`lm_malloc`]/[`lm_realloc`].
///
/// # Safety
/// See [`lm_free`].
pub unsafe fn lm_realloc(ptr: *mut u8, size: usize, direction: Direction) -> *mut u8 {
    ensure_static_init();
    SLAB_ALLOCATOR.linear_mut().realloc(ptr, size, direction)
}

/// Re-point the global slab allocator (and the linear allocator beneath it)
/// at `buffer`, discarding any prior state.
///
/// # Safety
/// See [`linear::LinearAllocator::reinit`].
pub unsafe fn sm_reinit(buffer: *mut u8, size: usize, zero_filled: bool) {
    SLAB_ALLOCATOR.reinit(buffer, size, zero_filled);
    #[cfg(feature = "static")]
    STATIC_INIT_DONE.store(true, Ordering::Relaxed);
}

/// Allocate `size` bytes, routed through a slab size class when one fits.
///
/// # Safety
/// The allocator must have been initialized, via [`sm_reinit`] or the
/// `static` feature.
pub unsafe fn sm_malloc(size: usize) -> *mut u8 {
    ensure_static_init();
    SLAB_ALLOCATOR.malloc(size)
}

/// Free an allocation made with [`sm_malloc`]/[`sm_realloc`].
///
/// # Safety
/// `ptr` must be a live allocation from the global slab allocator.
pub unsafe fn sm_free(ptr: *mut u8) {
    ensure_static_init();
    SLAB_ALLOCATOR.free(ptr);
}

/// Resize an allocation made with [`sm_malloc`]/[`sm_realloc`].
///
/// # Safety
/// See [`sm_free`].
pub unsafe fn sm_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    ensure_static_init();
    SLAB_ALLOCATOR.realloc(ptr, size)
}

//! Page-granular linear allocator.
//!
//! Carves whole 4 KiB pages out of a caller-supplied buffer. Free-region
//! records live inside the pages they describe — there is no separate
//! bookkeeping arena — so a region's address moves whenever its front is
//! carved off, and every operation here works over raw pointers rather than
//! borrows (see [`crate::util::list`]).

use core::ptr;

use crate::container_of_mut;
use crate::error::AbortReason;
use crate::host;
use crate::meta::MetaTable;
use crate::util::align::align_up;
use crate::util::list::{self, List};

/// Page size this allocator carves the buffer into.
pub const PAGE_SIZE: usize = 4096;
const PAGE_ORDER: usize = 12;

const MIN_BUFFER_SIZE: usize = 128 * 1024;
const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Growth direction for an allocation, matching spec.md's TRANSIENT/PERSISTENT
/// split: short-lived, high-churn allocations grow from the front of the
/// buffer; long-lived allocations grow from the back, so the two populations
/// don't interleave and fragment each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Transient = 0,
    Persistent = 1,
}

/// A run of free pages, linked into the sorted free-region list. Embedded
/// directly in the first page of the run it describes.
#[repr(C)]
struct FreeRegion {
    link: List,
    start_page: usize,
    pages: usize,
}

/// A run of pages a caller just freed, linked into the deferred-free list
/// until the next failed `malloc` triggers a drain. Embedded in the first
/// page of the run being freed.
#[repr(C)]
struct DeferredRegion {
    link: List,
    start_page: usize,
    pages: usize,
}

fn region_of(link: *mut List) -> *mut FreeRegion {
    unsafe { container_of_mut!(link, FreeRegion, link) }
}

fn deferred_of(link: *mut List) -> *mut DeferredRegion {
    unsafe { container_of_mut!(link, DeferredRegion, link) }
}

/// Page-granular linear allocator over a single fixed buffer.
///
/// Holds no heap allocation of its own: all bookkeeping (the metadata table,
/// the free-region list nodes, the deferred-free list nodes) lives inside the
/// caller's buffer.
pub struct LinearAllocator {
    buffer_start: *mut u8,
    buffer_pages: usize,
    meta: MetaTable,
    free_regions: List,
    deferred: List,
}

impl LinearAllocator {
    /// An allocator with no backing buffer. Must be [`reinit`](Self::reinit)
    /// before use.
    pub const fn uninit() -> Self {
        LinearAllocator {
            buffer_start: ptr::null_mut(),
            buffer_pages: 0,
            meta: unsafe { MetaTable::new(ptr::null_mut()) },
            free_regions: List::new(),
            deferred: List::new(),
        }
    }

    /// Re-point this allocator at `buffer`, discarding any previous state.
    ///
    /// `buffer` must be page-aligned and `size` a page-aligned value in
    /// `[128 KiB, 16 MiB)`. Violations abort via [`host::abort`] — these are
    /// programmer errors, not recoverable runtime conditions.
    ///
    /// If `zero_filled` is `false`, the first page (the metadata table) is
    /// zeroed before use.
    ///
    /// # Safety
    /// `buffer` must be valid for reads and writes for `size` bytes for as
    /// long as this allocator (or anything it hands out) is in use.
    pub unsafe fn reinit(&mut self, buffer: *mut u8, size: usize, zero_filled: bool) {
        if (buffer as usize) & (PAGE_SIZE - 1) != 0 {
            host::abort(AbortReason::BufferMisaligned);
        }
        if size & (PAGE_SIZE - 1) != 0 {
            host::abort(AbortReason::SizeMisaligned);
        }
        if size < MIN_BUFFER_SIZE || size >= MAX_BUFFER_SIZE {
            host::abort(AbortReason::SizeOutOfRange);
        }

        self.buffer_start = buffer;
        self.buffer_pages = size / PAGE_SIZE;
        self.meta = MetaTable::new(buffer);
        if !zero_filled {
            self.meta.clear();
        }

        self.free_regions.init();
        self.deferred.init();

        let region = (buffer.add(PAGE_SIZE)) as *mut FreeRegion;
        (*region).start_page = 1;
        (*region).pages = self.buffer_pages - 1;
        list::link_after(&mut self.free_regions, &mut (*region).link);
    }

    #[inline]
    fn page_to_ptr(&self, page: usize) -> *mut u8 {
        unsafe { self.buffer_start.add(page * PAGE_SIZE) }
    }

    #[inline]
    fn ptr_to_page(&self, ptr: *const u8) -> usize {
        (ptr as usize - self.buffer_start as usize) / PAGE_SIZE
    }

    /// Move `src`'s contents to the page its own `start_page` now names and
    /// fix up its neighbors' links. A no-op if the region is already there.
    /// Needed because carving pages off the front of a region shrinks it
    /// in place while its backing storage — the very pages it describes —
    /// moves out from under the old record.
    unsafe fn move_region(&self, src: *mut FreeRegion) -> *mut FreeRegion {
        let dst = self.page_to_ptr((*src).start_page) as *mut FreeRegion;
        if dst == src {
            return dst;
        }
        ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, core::mem::size_of::<FreeRegion>());
        let next = (*dst).link.next;
        let prev = (*dst).link.prev;
        (*next).prev = &mut (*dst).link;
        (*prev).next = &mut (*dst).link;
        dst
    }

    unsafe fn alloc_designated_free_pages(&mut self, start_page: usize, requested_pages: usize) -> usize {
        let head = &mut self.free_regions as *mut List;
        let mut iter = (*head).next;
        while iter != head {
            let region = region_of(iter);
            if (*region).start_page == start_page && (*region).pages >= requested_pages {
                let result = (*region).start_page;
                (*region).start_page += requested_pages;
                (*region).pages -= requested_pages;
                if (*region).pages == 0 {
                    list::unlink(&mut (*region).link);
                } else {
                    self.move_region(region);
                }
                return result;
            }
            iter = (*iter).next;
        }
        0
    }

    unsafe fn alloc_free_pages(&mut self, requested_pages: usize) -> usize {
        let head = &mut self.free_regions as *mut List;
        let mut iter = (*head).next;
        while iter != head {
            let region = region_of(iter);
            if (*region).pages >= requested_pages {
                let result = (*region).start_page;
                (*region).start_page += requested_pages;
                (*region).pages -= requested_pages;
                if (*region).pages == 0 {
                    list::unlink(&mut (*region).link);
                } else {
                    self.move_region(region);
                }
                return result;
            }
            iter = (*iter).next;
        }
        0
    }

    unsafe fn alloc_free_pages_reverse(&mut self, requested_pages: usize) -> usize {
        let head = &mut self.free_regions as *mut List;
        let mut iter = (*head).prev;
        while iter != head {
            let region = region_of(iter);
            if (*region).pages >= requested_pages {
                let result = (*region).start_page + (*region).pages - requested_pages;
                (*region).pages -= requested_pages;
                if (*region).pages == 0 {
                    list::unlink(&mut (*region).link);
                }
                // The region's first page (and thus its record) is untouched.
                return result;
            }
            iter = (*iter).prev;
        }
        0
    }

    unsafe fn alloc(&mut self, pages: usize, direction: Direction) -> usize {
        match direction {
            Direction::Transient => self.alloc_free_pages(pages),
            Direction::Persistent => self.alloc_free_pages_reverse(pages),
        }
    }

    /// Fold `current_item` into its predecessor wherever two free regions
    /// abut, making one pass over the (address-sorted) free list.
    unsafe fn merge_consecutive_pages(&mut self) {
        let head = &mut self.free_regions as *mut List;
        let mut prev_item = (*head).next;
        let mut current_item = (*prev_item).next;
        while prev_item != head && current_item != head {
            let prev_region = region_of(prev_item);
            let current_region = region_of(current_item);
            if (*prev_region).start_page + (*prev_region).pages == (*current_region).start_page {
                (*prev_region).pages += (*current_region).pages;
                list::unlink(&mut (*current_region).link);
                current_item = (*prev_item).next;
            } else {
                prev_item = current_item;
                current_item = (*current_item).next;
            }
        }
    }

    /// Insert one deferred free region back into the sorted free-region
    /// list, merging with a neighbor when the freed run abuts one, then
    /// sweeping the whole list for any other now-adjacent pair.
    unsafe fn restore_freed_region(&mut self, free_region: *mut DeferredRegion) {
        let head = &mut self.free_regions as *mut List;
        let mut prev_item = head;
        let mut iter = (*head).next;
        while iter != head {
            let region = region_of(iter);
            if (*free_region).start_page < (*region).start_page {
                let mut inserted = false;
                if prev_item != head {
                    let prev_region = region_of(prev_item);
                    if (*prev_region).start_page + (*prev_region).pages == (*free_region).start_page {
                        (*prev_region).pages += (*free_region).pages;
                        inserted = true;
                    }
                }
                if !inserted
                    && (*free_region).start_page + (*free_region).pages == (*region).start_page
                {
                    (*region).start_page = (*free_region).start_page;
                    (*region).pages += (*free_region).pages;
                    self.move_region(region);
                    inserted = true;
                }
                if inserted {
                    self.merge_consecutive_pages();
                } else {
                    // Same layout as FreeRegion (link, start_page, pages); the
                    // deferred record's storage becomes the free-region record
                    // in place.
                    let region = free_region as *mut FreeRegion;
                    list::link_before(iter, &mut (*region).link);
                }
                return;
            }
            prev_item = iter;
            iter = (*iter).next;
        }
        let region = free_region as *mut FreeRegion;
        list::link_tail(head, &mut (*region).link);
        self.merge_consecutive_pages();
    }

    unsafe fn restore_all_freed_memories(&mut self) {
        let head = &mut self.deferred as *mut List;
        let mut iter = (*head).next;
        while iter != head {
            let region = deferred_of(iter);
            iter = (*iter).next;
            self.restore_freed_region(region);
        }
        self.deferred.init();
    }

    unsafe fn mark_alloced_pages(&self, first_page: usize, pages: usize) {
        self.meta.mark_run(first_page, pages);
    }

    unsafe fn fetch_alloced_pages(&self, first_page: usize) -> usize {
        self.meta.run_len(first_page)
    }

    /// Allocate `size` bytes, rounded up to whole pages, growing from the
    /// front (`Transient`) or back (`Persistent`) of the free-region list.
    /// On first-fit failure, drains the deferred-free list into the sorted
    /// free list and retries once before reporting failure as `None`.
    pub unsafe fn malloc(&mut self, size: usize, direction: Direction) -> *mut u8 {
        let size = align_up(size, PAGE_ORDER);
        let pages = size / PAGE_SIZE;

        let mut page = self.alloc(pages, direction);
        if page == 0 {
            self.restore_all_freed_memories();
            page = self.alloc(pages, direction);
        }
        if page == 0 {
            return ptr::null_mut();
        }
        self.mark_alloced_pages(page, pages);
        self.page_to_ptr(page)
    }

    /// Queue `ptr`'s backing pages for deferred free. The pages are not
    /// merged back into the free-region list until the next `malloc` first-
    /// fit scan fails.
    ///
    /// # Safety
    /// `ptr` must be a pointer previously returned by [`Self::malloc`] or
    /// [`Self::realloc`] on this allocator, not yet freed.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        #[cfg(feature = "guards")]
        if (ptr as usize) & (PAGE_SIZE - 1) != 0 {
            host::abort(AbortReason::PointerTampered);
        }

        let first_page = self.ptr_to_page(ptr);
        let pages = self.fetch_alloced_pages(first_page);
        let region = ptr as *mut DeferredRegion;
        (*region).start_page = first_page;
        (*region).pages = pages;
        list::link_tail(&mut self.deferred, &mut (*region).link);
    }

    /// Resize a previous allocation in place when trailing free pages allow
    /// it; otherwise allocate a fresh run, copy, and free the original.
    /// `ptr == null` behaves like `malloc`.
    ///
    /// # Safety
    /// Same preconditions as [`Self::free`] when `ptr` is non-null.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize, direction: Direction) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(size, direction);
        }
        #[cfg(feature = "guards")]
        if (ptr as usize) & (PAGE_SIZE - 1) != 0 {
            host::abort(AbortReason::PointerTampered);
        }

        let size = align_up(size, PAGE_ORDER);
        let new_pages = size / PAGE_SIZE;
        let first_page = self.ptr_to_page(ptr);
        let pages = self.fetch_alloced_pages(first_page);
        if new_pages <= pages {
            return ptr;
        }

        let succeeding = self.alloc_designated_free_pages(first_page + pages, new_pages - pages);
        if succeeding != 0 {
            self.mark_alloced_pages(first_page, new_pages);
            return ptr;
        }

        let p = self.malloc(size, direction);
        if !p.is_null() {
            ptr::copy_nonoverlapping(ptr, p, pages * PAGE_SIZE);
            self.free(ptr);
        }
        p
    }

    /// Number of pages this allocator's buffer spans, including the
    /// metadata page.
    #[inline]
    pub fn buffer_pages(&self) -> usize {
        self.buffer_pages
    }
}

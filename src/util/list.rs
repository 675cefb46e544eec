//! Circular doubly linked list implementation.
//!
//! A node's address is not a stable identity: the free-region records this
//! primitive backs live inside the very pages malloc hands out, so a node may
//! be relocated (rewritten at a new address, neighbors patched) at any time.
//! Every operation here therefore works over raw `*mut List` pointers rather
//! than borrows — holding a `&mut List` across a call that might relocate a
//! *different* node in the same list would be unsound.

use core::ptr;

/// Double linked list. Embedded in the actual entry struct to give the entry struct
/// the linked list capability.
#[repr(C)]
pub struct List {
    pub prev: *mut List,
    pub next: *mut List,
}

impl List {
    /// An uninitialized node. Must be [`init`](List::init)ed — self-looped —
    /// before use; a list head in particular must be its own `prev`/`next`.
    pub const fn new() -> Self {
        List { prev: ptr::null_mut(), next: ptr::null_mut() }
    }

    /// Initialize (or re-initialize) this node as an empty, self-looped list.
    #[inline]
    pub fn init(&mut self) {
        let self_ptr = self as *mut List;
        self.prev = self_ptr;
        self.next = self_ptr;
    }
}

/// Returns `true` if `node` is linked into some list (its `next` does not
/// point back to itself).
#[inline]
pub unsafe fn is_linked(node: *const List) -> bool {
    (*node).next != node as *mut List
}

/// Returns `true` if `head` has no entries linked into it.
#[inline]
pub unsafe fn is_empty(head: *const List) -> bool {
    !is_linked(head)
}

/// Link `what` directly in front of `where_`. If `where_` is a list head,
/// this links `what` as the new tail element (see [`link_tail`]).
///
/// `what` is not inspected before linking — it must not already be linked
/// into another list.
pub unsafe fn link_before(where_: *mut List, what: *mut List) {
    let prev = (*where_).prev;
    let next = where_;

    (*next).prev = what;
    (*what).next = next;
    (*what).prev = prev;
    (*prev).next = what;
}

/// Link `what` directly after `where_`. If `where_` is a list head, this
/// links `what` as the new front element (see [`link_front`]).
pub unsafe fn link_after(where_: *mut List, what: *mut List) {
    let prev = where_;
    let next = (*where_).next;

    (*next).prev = what;
    (*what).next = next;
    (*what).prev = prev;
    (*prev).next = what;
}

/// Append `what` at the tail of `list_head`.
#[inline]
pub unsafe fn link_tail(list_head: *mut List, what: *mut List) {
    link_before(list_head, what)
}

/// Prepend `what` at the front of `list_head`.
#[inline]
pub unsafe fn link_front(list_head: *mut List, what: *mut List) {
    link_after(list_head, what)
}

/// Unlink `what` from its list without re-initializing it. Only safe to call
/// if `what` is about to be discarded or overwritten — a stray `prev`/`next`
/// pair is left behind.
pub unsafe fn unlink_stale(what: *mut List) {
    let prev = (*what).prev;
    let next = (*what).next;
    (*next).prev = prev;
    (*prev).next = next;
}

/// Unlink `what` from its list and re-initialize it as an empty, self-looped
/// node, so a repeated `unlink` call on the same node is a no-op.
pub unsafe fn unlink(what: *mut List) {
    if is_linked(what) {
        unlink_stale(what);
        (*what).init();
    }
}

/// Unlink every entry from `head` and reinitialize each as an empty,
/// self-looped node. `head` itself is left empty. Entries are not otherwise
/// modified and their backing memory is not released — this just resets the
/// list nodes, handy for temporary lists whose entries outlive the list.
pub unsafe fn flush(head: *mut List) {
    let mut iter = (*head).next;
    while iter != head {
        let next = (*iter).next;
        unlink(iter);
        iter = next;
    }
}

/// Exchange the contents of two list heads.
pub unsafe fn swap(list1: *mut List, list2: *mut List) {
    let t1_next = (*list1).next;
    let t1_prev = (*list1).prev;
    let t2_next = (*list2).next;
    let t2_prev = (*list2).prev;

    (*t1_next).prev = list2;
    (*t1_prev).next = list2;
    (*t2_next).prev = list1;
    (*t2_prev).next = list1;

    (*list1).next = t2_next;
    (*list1).prev = t2_prev;
    (*list2).next = t1_next;
    (*list2).prev = t1_prev;
}

/// Move every entry out of `source` and append them, in order, to the tail
/// of `target`. `source` is empty on return.
pub unsafe fn splice(target: *mut List, source: *mut List) {
    if is_empty(source) {
        return;
    }

    let source_next = (*source).next;
    let source_prev = (*source).prev;
    let target_prev = (*target).prev;

    (*source_next).prev = target_prev;
    (*target_prev).next = source_next;
    (*source_prev).next = target;
    (*target).prev = source_prev;

    (*source).init();
}

/// Split `source` in two: every entry from `where_` (inclusive) to the end
/// moves to `target`, replacing whatever `target` held. If `where_` is
/// `source` itself, `target` ends up empty.
pub unsafe fn split(source: *mut List, where_: *mut List, target: *mut List) {
    if where_ == source {
        (*target).init();
        return;
    }

    let source_prev = (*source).prev;

    (*target).next = where_;
    (*target).prev = source_prev;

    (*(*where_).prev).next = source;
    (*source).prev = (*where_).prev;

    (*where_).prev = target;
    (*(*target).prev).next = target;
}

/// Count the number of entries linked into `head`. `O(n)`; intended for
/// diagnostics and tests, not hot paths.
pub unsafe fn count(head: *const List) -> usize {
    let mut n = 0usize;
    let mut iter = (*head).next;
    while iter != head as *mut List {
        n += 1;
        iter = (*iter).next;
    }
    n
}

/// Direct forward walk: `f` runs on each entry and may return `false` to stop
/// early. `f` must not unlink `cur` itself — the next pointer is read only
/// *after* `f` returns, so an in-body unlink of the current node corrupts the
/// walk. Use [`Iter`] when the body needs to unlink the node it was handed.
pub unsafe fn for_each<F: FnMut(*mut List) -> bool>(head: *mut List, mut f: F) {
    let mut iter = (*head).next;
    while iter != head {
        let next = iter;
        if !f(next) {
            return;
        }
        iter = (*next).next;
    }
}

/// Forward iterator that captures the next pointer before yielding the
/// current one, so the consumer may unlink (or relocate) the node it was
/// just handed without corrupting the walk.
pub struct Iter {
    cur: *mut List,
    head: *const List,
}

impl Iterator for Iter {
    type Item = *mut List;

    fn next(&mut self) -> Option<*mut List> {
        unsafe {
            if self.cur as *const List == self.head {
                return None;
            }
            let item = self.cur;
            self.cur = (*self.cur).next;
            Some(item)
        }
    }
}

/// Reverse counterpart of [`Iter`].
pub struct IterRev {
    cur: *mut List,
    head: *const List,
}

impl Iterator for IterRev {
    type Item = *mut List;

    fn next(&mut self) -> Option<*mut List> {
        unsafe {
            if self.cur as *const List == self.head {
                return None;
            }
            let item = self.cur;
            self.cur = (*self.cur).prev;
            Some(item)
        }
    }
}

/// Safe (relocation-tolerant) forward iteration starting at `head`'s first entry.
pub unsafe fn iter(head: *const List) -> Iter {
    Iter { cur: (*head).next, head }
}

/// Safe forward iteration starting at an arbitrary `node` already in the list
/// (the "from-current" variant), stopping once `head` is reached again.
pub unsafe fn iter_from(node: *mut List, head: *const List) -> Iter {
    Iter { cur: node, head }
}

/// Safe (relocation-tolerant) reverse iteration starting at `head`'s last entry.
pub unsafe fn iter_rev(head: *const List) -> IterRev {
    IterRev { cur: (*head).prev, head }
}

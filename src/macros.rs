//! `offsetof`/`container_of` helpers for recovering a containing struct from
//! a pointer to one of its embedded fields — used throughout `linear` and
//! `slab` to go from a `*mut List` back to the `FreeRegion`/`SlabPage` it is
//! embedded in.

/// Cast a pointer to a member of a structure out to the containing structure.
///
/// - `ptr`: pointer to the member, as a `*const _`.
/// - `ty`: the type of the containing struct.
/// - `field`: the name of the member within the struct.
#[macro_export]
macro_rules! container_of {
    ($ptr:expr, $ty:path, $field:ident) => {{
        let ptr: *const _ = $ptr;
        ptr.cast::<u8>()
            .sub(::core::mem::offset_of!($ty, $field))
            .cast::<$ty>()
    }};
}

/// Mutable counterpart of [`container_of!`].
#[macro_export]
macro_rules! container_of_mut {
    ($ptr:expr, $ty:path, $field:ident) => {{
        let ptr: *mut _ = $ptr;
        ptr.cast::<u8>()
            .sub(::core::mem::offset_of!($ty, $field))
            .cast::<$ty>()
    }};
}

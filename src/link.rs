//! Raw `wl_list` primitives.
//!
//! These operate on the native `{prev, next}` layout directly, so a list built
//! here can be walked by libwayland and the other way around. With the
//! `native` feature they forward to the functions exported by
//! `libwayland-server` instead, which must then be loadable at runtime.
//!
//! Nothing here checks for misuse. Inserting a node that is already linked,
//! removing a node twice or removing a node that was never linked corrupts the
//! lists involved, exactly like it does in C.

use std::ptr;

use wayland_sys::common::wl_list;

/// Makes `list` an empty list head: both pointers refer back to it.
///
/// # Safety
///
/// `list` must be valid for writes. Any list it was part of is left dangling.
pub unsafe fn init(list: *mut wl_list) {
    imp::init(list)
}

/// Links `elm` right after `list`, which is either a head or a node.
///
/// # Safety
///
/// `list` must be part of an initialized list and `elm` must not be linked
/// anywhere.
pub unsafe fn insert(list: *mut wl_list, elm: *mut wl_list) {
    debug_assert!(!list.is_null() && !elm.is_null());
    imp::insert(list, elm)
}

/// Unlinks `elm` from its list and clears its pointers.
///
/// # Safety
///
/// `elm` must currently be linked into a valid list.
pub unsafe fn remove(elm: *mut wl_list) {
    debug_assert!(!(*elm).prev.is_null(), "removing an unlinked node");
    imp::remove(elm);

    // libwayland leaves them dangling; a cleared node is at least recognizable.
    (*elm).prev = ptr::null_mut();
    (*elm).next = ptr::null_mut();
}

/// Counts the nodes in `list`, not including the head.
///
/// # Safety
///
/// `list` must be an initialized list head.
pub unsafe fn length(list: *mut wl_list) -> usize {
    imp::length(list)
}

/// Whether `list` has no nodes.
///
/// # Safety
///
/// `list` must be an initialized list head.
pub unsafe fn is_empty(list: *mut wl_list) -> bool {
    imp::is_empty(list)
}

/// Whether `elm` is currently part of a list. Only meaningful for nodes that
/// start out cleared and are only ever unlinked through [`remove`].
///
/// # Safety
///
/// `elm` must be valid for reads.
pub unsafe fn is_linked(elm: *const wl_list) -> bool {
    !(*elm).next.is_null()
}

#[cfg(not(feature = "native"))]
mod imp {
    use wayland_sys::common::wl_list;

    pub(super) unsafe fn init(list: *mut wl_list) {
        (*list).prev = list;
        (*list).next = list;
    }

    pub(super) unsafe fn insert(list: *mut wl_list, elm: *mut wl_list) {
        (*elm).prev = list;
        (*elm).next = (*list).next;
        (*list).next = elm;
        (*(*elm).next).prev = elm;
    }

    pub(super) unsafe fn remove(elm: *mut wl_list) {
        (*(*elm).prev).next = (*elm).next;
        (*(*elm).next).prev = (*elm).prev;
    }

    pub(super) unsafe fn length(list: *mut wl_list) -> usize {
        let mut count = 0;
        let mut e = (*list).next;
        while e != list {
            e = (*e).next;
            count += 1;
        }
        count
    }

    pub(super) unsafe fn is_empty(list: *mut wl_list) -> bool {
        (*list).next == list
    }
}

#[cfg(feature = "native")]
mod imp {
    use wayland_sys::{common::wl_list, ffi_dispatch, server::WAYLAND_SERVER_HANDLE};

    use crate::invariant_violation;

    pub(super) unsafe fn init(list: *mut wl_list) {
        ffi_dispatch!(WAYLAND_SERVER_HANDLE, wl_list_init, list)
    }

    pub(super) unsafe fn insert(list: *mut wl_list, elm: *mut wl_list) {
        ffi_dispatch!(WAYLAND_SERVER_HANDLE, wl_list_insert, list, elm)
    }

    pub(super) unsafe fn remove(elm: *mut wl_list) {
        ffi_dispatch!(WAYLAND_SERVER_HANDLE, wl_list_remove, elm)
    }

    pub(super) unsafe fn length(list: *mut wl_list) -> usize {
        let count = ffi_dispatch!(WAYLAND_SERVER_HANDLE, wl_list_length, list);
        match usize::try_from(count) {
            Ok(count) => count,
            Err(_) => invariant_violation(format_args!("wl_list_length returned {}", count)),
        }
    }

    pub(super) unsafe fn is_empty(list: *mut wl_list) -> bool {
        match ffi_dispatch!(WAYLAND_SERVER_HANDLE, wl_list_empty, list) {
            0 => false,
            1 => true,
            other => invariant_violation(format_args!("wl_list_empty returned {}", other)),
        }
    }
}

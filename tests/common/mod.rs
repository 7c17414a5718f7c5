#![allow(dead_code)]

use std::{os::raw::c_void, ptr};

use wayland_sys::{
    common::wl_list,
    server::{wl_listener, wl_signal},
};

/// 24 bytes, link at offset 8.
#[repr(C)]
pub struct Node {
    pub tag: u64,
    pub link: wl_list,
}

wlsignal::unsafe_impl_element!(Node, link);

impl Node {
    pub fn boxed(tag: u64) -> Box<Node> {
        Box::new(Node {
            tag,
            link: unlinked(),
        })
    }
}

pub fn unlinked() -> wl_list {
    wl_list {
        prev: ptr::null_mut(),
        next: ptr::null_mut(),
    }
}

pub fn new_signal() -> Box<wl_signal> {
    let mut signal = Box::new(wl_signal {
        listener_list: unlinked(),
    });
    unsafe { wlsignal::signal::init(&mut *signal) };
    signal
}

/// Walks the listeners of `signal` the way `wl_signal_emit` does: the next
/// node is read before the current listener runs.
pub unsafe fn emit(signal: *mut wl_signal, data: *mut c_void) {
    let head = ptr::addr_of_mut!((*signal).listener_list);
    let mut pos = (*head).next;
    while pos != head {
        let next = (*pos).next;
        let listener = (pos as *mut u8).sub(memoffset::offset_of!(wl_listener, link)) as *mut wl_listener;
        ((*listener).notify)(listener, data);
        pos = next;
    }
}

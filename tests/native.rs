//! Checks the list primitives against the ones in `libwayland-server`. Does
//! nothing when the library cannot be loaded.
#![cfg(feature = "native")]

mod common;

use std::ptr::NonNull;

use common::{emit, new_signal, Node};
use wayland_sys::server::is_lib_available;
use wlsignal::{OwnedList, Sentinel, Signal};

#[test]
fn native_list_operations() {
    if !is_lib_available() {
        return;
    }
    let (mut a, mut b) = (Node::boxed(1), Node::boxed(2));
    let (a, b): (*mut Node, *mut Node) = (&mut *a, &mut *b);
    let list = OwnedList::<Node>::new();
    assert!(list.is_empty());

    unsafe {
        list.append(a);
        list.append(b);
    }
    assert_eq!(list.length(), 2);
    assert_eq!(list.first().map(NonNull::as_ptr), Some(a));
    assert_eq!(list.last().map(NonNull::as_ptr), Some(b));

    unsafe { list.remove(a) };
    assert_eq!(list.length(), 1);
    assert_eq!(list.first().map(NonNull::as_ptr), Some(b));
    unsafe { list.remove(b) };
    assert!(list.is_empty());
}

#[test]
fn native_signal_round_trip() -> anyhow::Result<()> {
    if !is_lib_available() {
        return Ok(());
    }
    let mut raw = new_signal();
    let signal = unsafe { Signal::unit(&mut *raw, Sentinel::Null) }?;
    let hits = std::rc::Rc::new(std::cell::Cell::new(0));
    let h = hits.clone();
    let listener = signal.add(move |()| h.set(h.get() + 1));

    unsafe { emit(&mut *raw, std::ptr::null_mut()) };
    assert_eq!(hits.get(), 1);
    signal.remove(listener)?;
    assert!(signal.is_empty());
    Ok(())
}

//! Intrusive list and signal/listener primitives for bindings to
//! `libwayland-server` and wlroots.
//!
//! Native libraries embed a `wl_list` link inside their structs and dispatch
//! events by walking a `wl_signal`'s list of `wl_listener`s. This crate models
//! both halves from the rust side: [`List`] views a native list head and
//! recovers owning structs with container-of arithmetic, and [`Signal`] links
//! rust closures into a native signal so that native emission calls them.
//!
//! Emission itself is never performed here; it belongs to the native library.
//! Everything in this crate must be used from the thread that pumps the native
//! event loop.

pub mod link;
pub mod list;
pub mod listener;
pub mod signal;
pub mod slab;

pub use list::{Element, ElementLayout, List, OwnedList};
pub use listener::{panic_policy, registered_count, set_panic_policy, Listener, PanicPolicy};
pub use signal::{Sentinel, Signal};
pub use slab::IndexList;

use std::{
    any::type_name,
    cell::{Cell, RefCell},
    fmt,
    ptr::NonNull,
};

use wayland_sys::server::wl_signal;

#[doc(hidden)]
pub mod __private {
    pub use memoffset::offset_of;
}

/// A trait for native objects that have a destroy signal.
pub trait Destroyable {
    fn destroy_signal(&mut self) -> *mut wl_signal;

    /// The payload the destroy signal is emitted with. wlroots usually passes
    /// the object itself, libwayland passes various things.
    fn destroy_payload(&mut self) -> Sentinel {
        Sentinel::Unchecked
    }
}

/// A weak reference to a native object. Memory is generally managed by the
/// native library itself, which allocates and destroys it, "borrowing" it to
/// rust in the meantime. In C, user code is notified by a callback just before
/// the object is free'd, to let the user remove any dangling references.
///
/// The handle tracks that destroy callback, and does a runtime check to ensure
/// that the callback has not yet been called before handing out the
/// underlying pointer. Every listener registered through the handle is removed
/// once the object is destroyed, or when the handle is dropped.
///
/// Technically, this means that any operation on a Handle can panic; in normal
/// usage, this is unlikely to happen.
pub struct Handle<T: Destroyable> {
    ptr: Cell<Option<NonNull<T>>>,
    listeners: RefCell<Vec<Listener>>,
}

impl<T: Destroyable + 'static> Handle<T> {
    /// Starts tracking `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object whose destroy signal is initialized.
    /// The returned box must stay where it is; the destroy callback refers to
    /// it by address.
    pub unsafe fn new(ptr: *mut T) -> Result<Box<Self>, WlError> {
        let ptr = NonNull::new(ptr).ok_or(WlError::NullPointer(type_name::<T>()))?;

        // We return a box so that the handle is findable by callbacks.
        let handle = Box::new(Self {
            ptr: Cell::new(Some(ptr)),
            listeners: RefCell::new(Vec::new()),
        });

        // Attach a callback to the destroy signal; if it fires, we know the
        // underlying object is about to be freed.
        let object = &mut *ptr.as_ptr();
        let destroy = Signal::unit(object.destroy_signal(), object.destroy_payload())?;
        let raw = &*handle as *const Self;
        let listener = destroy.add(move |()| {
            // SAFETY: dropping the handle removes this listener first.
            unsafe { (*raw).on_destroy() }
        });
        handle.listeners.borrow_mut().push(listener);

        Ok(handle)
    }
}

impl<T: Destroyable> Handle<T> {
    /// Returns the underlying pointer to the native object. This will panic
    /// if the object has since been destroyed. Holding on to the pointer while
    /// control is passed back to the native library is unsafe.
    pub fn as_ptr(&self) -> *mut T {
        match self.ptr.get() {
            Some(ptr) => ptr.as_ptr(),
            None => panic!("operation on destroyed {}", type_name::<T>()),
        }
    }

    /// Returns the underlying pointer to the native object.
    pub fn try_as_ptr(&self) -> Result<*mut T, WlError> {
        self.ptr
            .get()
            .map(NonNull::as_ptr)
            .ok_or_else(|| WlError::ObjectDestroyed(type_name::<T>().into()))
    }

    pub fn is_destroyed(&self) -> bool {
        self.ptr.get().is_none()
    }

    /// Registers `callback` on `signal` for as long as both the handle and the
    /// object live.
    pub fn on<A: 'static>(&self, signal: &Signal<A>, callback: impl Fn(A) + 'static) -> Listener {
        let listener = signal.add(callback);
        self.listeners.borrow_mut().push(listener);
        listener
    }

    /// Number of listeners (including the destroy listener) this handle keeps.
    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    fn on_destroy(&self) {
        log::debug!("{} destroyed", type_name::<T>());
        self.ptr.set(None);
        self.cleanup_listeners();
    }

    fn cleanup_listeners(&self) {
        // Take the list first; removing a listener may drop closures that
        // reach back into this handle.
        let listeners = std::mem::take(&mut *self.listeners.borrow_mut());
        for listener in listeners {
            if let Err(err) = listener.remove() {
                log::warn!("failed to remove listener {:p}: {}", listener.as_ptr(), err);
            }
        }
    }
}

impl<T: Destroyable> Drop for Handle<T> {
    fn drop(&mut self) {
        // Dropping the handle doesn't necessarily mean the underlying object
        // is freed. Most objects are managed by the native library. However,
        // we should remove and drop any rust listeners.
        self.cleanup_listeners();
    }
}

/// Like a Handle, but with a borrowed reference to a parent object.
pub struct ChildHandle<'parent, T, P: Destroyable> {
    ptr: NonNull<T>,
    parent: &'parent Handle<P>,
}

impl<'parent, T, P: Destroyable> ChildHandle<'parent, T, P> {
    pub fn new(ptr: NonNull<T>, parent: &'parent Handle<P>) -> Self {
        Self { ptr, parent }
    }

    /// Returns the underlying pointer, checking that the parent pointer is
    /// still valid. Holding on to the pointer while control is passed back to
    /// the native library is unsafe.
    pub fn as_ptr(&self) -> *mut T {
        // Make sure the parent is still valid.
        let _ = self.parent.as_ptr();

        self.ptr.as_ptr()
    }

    pub fn try_as_ptr(&self) -> Result<*mut T, WlError> {
        // Make sure the parent is still valid.
        let _ = self.parent.try_as_ptr()?;

        Ok(self.ptr.as_ptr())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum WlError {
    #[error("use of destroyed {0}")]
    ObjectDestroyed(String),
    #[error("null {0} pointer")]
    NullPointer(&'static str),
    #[error("listener is not registered on this signal")]
    UnknownListener,
    #[error("unexpected event payload: expected {expected}, got {got:#x}")]
    UnexpectedPayload { expected: &'static str, got: usize },
    #[error("invalid element layout: {0}")]
    InvalidLayout(String),
}

/// Aborts the process. Used when native memory no longer matches what the
/// bindings expect; continuing would corrupt it.
#[cold]
pub(crate) fn invariant_violation(args: fmt::Arguments<'_>) -> ! {
    log::error!("invariant violation: {}", args);
    std::process::abort()
}

pub(crate) mod macros {
    // Stolen from wayland-rs.
    macro_rules! container_of(
        ($ptr: expr, $container: ident, $field: ident) => {
            ($ptr as *mut u8).sub(memoffset::offset_of!($container, $field)) as *mut $container
        }
    );

    macro_rules! list_for_each(
        ($pos: ident, $head:expr, $container: ident, $field: ident, $action: block) => {
            let mut $pos = container_of!((*$head).next, $container, $field);
            while &mut (*$pos).$field as *mut _ != $head {
                $action;
                $pos = container_of!((*$pos).$field.next, $container, $field);
            }
        }
    );

    pub(crate) use container_of;
    pub(crate) use list_for_each;
}

/// Implements [`Element`] for a `#[repr(C)]` struct embedding a `wl_list`
/// field.
///
/// ```
/// use wayland_sys::common::wl_list;
///
/// #[repr(C)]
/// struct Mode {
///     width: i32,
///     height: i32,
///     link: wl_list,
/// }
///
/// wlsignal::unsafe_impl_element!(Mode, link);
/// ```
///
/// The field must really be a `wl_list`, and nodes handed to a list of this
/// type must really be embedded in a `Mode`.
#[macro_export]
macro_rules! unsafe_impl_element(
    ($container: path, $field: ident) => {
        unsafe impl $crate::Element for $container {
            const LINK_OFFSET: usize = $crate::__private::offset_of!($container, $field);
        }
    }
);

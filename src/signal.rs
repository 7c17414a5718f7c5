//! Observer registration on native `wl_signal`s.
//!
//! ```c
//! struct wl_signal {
//!     struct wl_list listener_list;
//! };
//! ```
//!
//! A signal is emitted by native code walking `listener_list` and calling each
//! listener's `notify`; the bindings only add and remove listeners. Native
//! emission reads the next listener before calling the current one, so
//! listeners removed from inside a callback stay linked, and are skipped,
//! until the outermost dispatch returns (see [`crate::listener`]).

use std::{fmt, ptr::NonNull, rc::Rc};

use libc::c_void;
use wayland_sys::server::{wl_listener, wl_notify_func_t, wl_signal};

use crate::{
    link,
    list::List,
    listener::Listener,
    macros::{container_of, list_for_each},
    WlError,
};

/// The payload a zero-argument signal is emitted with. Native events are not
/// consistent about it, so it has to be chosen per signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// The event data is always null.
    Null,
    /// The event data is the object that owns the signal.
    Emitter(*mut c_void),
    /// Whatever is passed is ignored.
    Unchecked,
}

impl Sentinel {
    pub fn check(&self, data: *mut c_void) -> Result<(), WlError> {
        let expected = match *self {
            Sentinel::Null if !data.is_null() => "null event data",
            Sentinel::Emitter(emitter) if data != emitter => "the emitting object",
            _ => return Ok(()),
        };
        Err(WlError::UnexpectedPayload {
            expected,
            got: data as usize,
        })
    }
}

type Decode<T> = dyn Fn(*mut c_void) -> Result<T, WlError>;

/// A source of a type of observable event, carrying values of type `T` to its
/// observers. `Signal<()>` is the zero-argument case.
pub struct Signal<T> {
    ptr: NonNull<wl_signal>,
    decode: Rc<Decode<T>>,
}

impl<T: 'static> Signal<T> {
    /// A signal whose event data is turned into a `T` by `decode`. Every
    /// observer of the signal sees values decoded the same way.
    ///
    /// A decoder error when the signal fires means the native library does
    /// not emit what the bindings expect, and aborts the process.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized `wl_signal` that outlives this
    /// value and every listener added through it.
    pub unsafe fn with_decoder(
        ptr: *mut wl_signal,
        decode: impl Fn(*mut c_void) -> Result<T, WlError> + 'static,
    ) -> Result<Self, WlError> {
        let ptr = NonNull::new(ptr).ok_or(WlError::NullPointer("wl_signal"))?;
        Ok(Self {
            ptr,
            decode: Rc::new(decode),
        })
    }

    /// A one-argument signal. The event data must never be null.
    ///
    /// # Safety
    ///
    /// As for [`with_decoder`](Self::with_decoder).
    pub unsafe fn new(
        ptr: *mut wl_signal,
        decode: impl Fn(NonNull<c_void>) -> T + 'static,
    ) -> Result<Self, WlError> {
        Self::with_decoder(ptr, move |data| match NonNull::new(data) {
            Some(data) => Ok(decode(data)),
            None => Err(WlError::UnexpectedPayload {
                expected: "non-null event data",
                got: 0,
            }),
        })
    }

    /// Observes the signal. Observers are called in the order they were
    /// added.
    pub fn add(&self, callback: impl Fn(T) + 'static) -> Listener {
        self.add_with_listener(move |_, value| callback(value))
    }

    /// Observes the signal, also handing the callback its own listener, e.g.
    /// to remove itself.
    pub fn add_with_listener(&self, callback: impl Fn(Listener, T) + 'static) -> Listener {
        let decode = self.decode.clone();
        let listener = Listener::with_callback(move |listener, data| {
            let value = decode(data)?;
            callback(listener, value);
            Ok(())
        });
        unsafe { listener.link_to(self.ptr.as_ptr()) };
        log::trace!(
            "added listener {:p} to signal {:p}",
            listener.as_ptr(),
            self.ptr
        );
        listener
    }
}

impl Signal<()> {
    /// A zero-argument signal whose event data must match `sentinel`.
    ///
    /// # Safety
    ///
    /// As for [`with_decoder`](Self::with_decoder).
    pub unsafe fn unit(ptr: *mut wl_signal, sentinel: Sentinel) -> Result<Self, WlError> {
        Self::with_decoder(ptr, move |data| sentinel.check(data))
    }
}

impl<T> Signal<T> {
    pub fn as_ptr(&self) -> *mut wl_signal {
        self.ptr.as_ptr()
    }

    /// Removes a listener added through this signal. Listeners that are not
    /// on this signal, or were already removed, are left untouched. From
    /// inside a callback, the listener is not called again by the emission in
    /// progress.
    pub fn remove(&self, listener: Listener) -> Result<(), WlError> {
        if listener.signal() != Some(self.as_ptr()) {
            return Err(WlError::UnknownListener);
        }
        listener.remove()
    }

    /// Removes every listener added through the bindings, typically because
    /// the object owning the signal is going away. Listeners added by native
    /// code stay. Returns how many were removed.
    pub fn remove_all(&self) -> usize {
        let listeners = Listener::linked_to(self.as_ptr());
        let count = listeners.len();
        for listener in listeners {
            if let Err(err) = listener.remove() {
                log::warn!("failed to remove listener {:p}: {}", listener.as_ptr(), err);
            }
        }
        count
    }

    /// The first listener whose notify function is `notify`, like
    /// `wl_signal_get`.
    pub fn get(&self, notify: wl_notify_func_t) -> Option<NonNull<wl_listener>> {
        let head = self.listeners().as_ptr();
        unsafe {
            list_for_each!(l, head, wl_listener, link, {
                if std::ptr::fn_addr_eq((*l).notify, notify) {
                    return NonNull::new(l);
                }
            });
        }
        None
    }

    /// All listeners, including the ones native code added.
    pub fn listeners(&self) -> List<wl_listener> {
        unsafe {
            let head = std::ptr::addr_of_mut!((*self.as_ptr()).listener_list);
            List::from_non_null(NonNull::new_unchecked(head))
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().length()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners().is_empty()
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr,
            decode: self.decode.clone(),
        }
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signal").field(&self.ptr).finish()
    }
}

/// Initializes a signal's listener list, like `wl_signal_init`.
///
/// # Safety
///
/// `signal` must be valid for writes and not have listeners.
pub unsafe fn init(signal: *mut wl_signal) {
    link::init(std::ptr::addr_of_mut!((*signal).listener_list));
}

/// What `wl_signal_emit` does.
#[cfg(test)]
pub(crate) unsafe fn emit(signal: *mut wl_signal, data: *mut c_void) {
    let head = std::ptr::addr_of_mut!((*signal).listener_list);
    let mut pos = (*head).next;
    while pos != head {
        let next = (*pos).next;
        let l = container_of!(pos, wl_listener, link);
        ((*l).notify)(l, data);
        pos = next;
    }
}

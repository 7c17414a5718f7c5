//! Typed views over intrusive `wl_list`s.

use std::{marker::PhantomData, mem::size_of, ptr::NonNull};

use wayland_sys::{common::wl_list, server::wl_listener};

use crate::{invariant_violation, link, WlError};

/// A struct that embeds a `wl_list` link, so that it can be a member of a
/// [`List`]. Use [`unsafe_impl_element!`](crate::unsafe_impl_element) to
/// implement it.
///
/// # Safety
///
/// `LINK_OFFSET` must be the byte offset of a `wl_list` field inside `Self`.
/// Lists only ever produce element pointers by subtracting it from link
/// pointers they found while walking, so a wrong offset yields pointers to
/// garbage.
pub unsafe trait Element: Sized {
    const LINK_OFFSET: usize;

    fn layout() -> ElementLayout {
        ElementLayout {
            offset: Self::LINK_OFFSET,
            size: size_of::<Self>(),
        }
    }

    /// The embedded link of `element`.
    ///
    /// # Safety
    ///
    /// `element` must point to a `Self` (it does not need to be initialized).
    unsafe fn link(element: *mut Self) -> *mut wl_list {
        (element as *mut u8).add(Self::LINK_OFFSET) as *mut wl_list
    }

    /// The element whose link is `link` (container-of).
    ///
    /// # Safety
    ///
    /// `link` must be the link field of a `Self`, never a list head.
    unsafe fn from_link(link: *mut wl_list) -> *mut Self {
        (link as *mut u8).sub(Self::LINK_OFFSET) as *mut Self
    }

    /// The raw link following `element`'s own.
    ///
    /// # Safety
    ///
    /// `element` must be linked into a list.
    unsafe fn next_of(element: *mut Self) -> *mut wl_list {
        (*Self::link(element)).next
    }

    /// The raw link preceding `element`'s own.
    ///
    /// # Safety
    ///
    /// `element` must be linked into a list.
    unsafe fn prev_of(element: *mut Self) -> *mut wl_list {
        (*Self::link(element)).prev
    }
}

unsafe impl Element for wl_listener {
    const LINK_OFFSET: usize = memoffset::offset_of!(wl_listener, link);
}

/// Where a link lives inside a struct whose type is only known at runtime,
/// e.g. a layout described by a code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementLayout {
    offset: usize,
    size: usize,
}

impl ElementLayout {
    /// A struct of `size` bytes with a `wl_list` at byte `offset`.
    pub fn new(offset: usize, size: usize) -> Result<Self, WlError> {
        match offset.checked_add(size_of::<wl_list>()) {
            Some(end) if end <= size => Ok(Self { offset, size }),
            _ => Err(WlError::InvalidLayout(format!(
                "link at offset {} does not fit in {} bytes",
                offset, size
            ))),
        }
    }

    pub fn of<T: Element>() -> Self {
        T::layout()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The `size` bytes of the struct whose link is at `link`.
    ///
    /// # Safety
    ///
    /// `link` must really be the link field of a struct with this layout.
    pub unsafe fn container_of(&self, link: *mut wl_list) -> *mut [u8] {
        let owner = (link as *mut u8).sub(self.offset);
        std::ptr::slice_from_raw_parts_mut(owner, self.size)
    }

    /// The link inside the struct starting at `owner`.
    ///
    /// # Safety
    ///
    /// `owner` must point to a struct with this layout.
    pub unsafe fn link_of(&self, owner: *mut u8) -> *mut wl_list {
        owner.add(self.offset) as *mut wl_list
    }
}

/// A view over a list head whose nodes are all embedded in `T`s.
///
/// The head itself is usually owned by native code (`wlr_output.modes`,
/// `wl_signal.listener_list`); see [`OwnedList`] for a head owned by rust.
pub struct List<T: Element> {
    head: NonNull<wl_list>,
    _marker: PhantomData<*mut T>,
}

impl<T: Element> List<T> {
    /// # Safety
    ///
    /// `head` must point to an initialized list head that outlives the view,
    /// and every node on it must be embedded in a `T`.
    pub unsafe fn from_raw(head: *mut wl_list) -> Result<Self, WlError> {
        let head = NonNull::new(head).ok_or(WlError::NullPointer("wl_list"))?;
        if (*head.as_ptr()).next.is_null() || (*head.as_ptr()).prev.is_null() {
            invariant_violation(format_args!("list head {:p} is not initialized", head));
        }
        Ok(Self::from_non_null(head))
    }

    /// # Safety
    ///
    /// As for [`from_raw`](Self::from_raw), and the head must be initialized.
    pub(crate) unsafe fn from_non_null(head: NonNull<wl_list>) -> Self {
        Self {
            head,
            _marker: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *mut wl_list {
        self.head.as_ptr()
    }

    pub fn is_empty(&self) -> bool {
        unsafe { link::is_empty(self.as_ptr()) }
    }

    /// Walks the whole list; there is no stored count.
    pub fn length(&self) -> usize {
        unsafe { link::length(self.as_ptr()) }
    }

    pub fn first(&self) -> Option<NonNull<T>> {
        unsafe { self.element((*self.as_ptr()).next) }
    }

    pub fn last(&self) -> Option<NonNull<T>> {
        unsafe { self.element((*self.as_ptr()).prev) }
    }

    /// Links `element` at the tail.
    ///
    /// # Safety
    ///
    /// `element` must be valid for as long as it stays linked and must not be
    /// linked anywhere yet.
    pub unsafe fn append(&self, element: *mut T) {
        link::insert((*self.as_ptr()).prev, T::link(element));
    }

    /// Links `element` at the head.
    ///
    /// # Safety
    ///
    /// Same as [`append`](Self::append).
    pub unsafe fn prepend(&self, element: *mut T) {
        link::insert(self.as_ptr(), T::link(element));
    }

    /// Links `element` right after `after`.
    ///
    /// # Safety
    ///
    /// `after` must be linked into this list; `element` as for
    /// [`append`](Self::append).
    pub unsafe fn insert_after(&self, after: *mut T, element: *mut T) {
        link::insert(T::link(after), T::link(element));
    }

    /// Unlinks `element`. Its link is cleared afterwards.
    ///
    /// # Safety
    ///
    /// `element` must currently be linked into this list.
    pub unsafe fn remove(&self, element: *mut T) {
        link::remove(T::link(element));
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            head: self.as_ptr(),
            current: self.as_ptr(),
            _marker: PhantomData,
        }
    }

    /// Like [`iter`](Self::iter), but reads each node's successor before
    /// yielding it, so the element just yielded may be unlinked.
    pub fn iter_safe(&self) -> IterSafe<'_, T> {
        IterSafe {
            head: self.as_ptr(),
            next: unsafe { (*self.as_ptr()).next },
            _marker: PhantomData,
        }
    }

    unsafe fn element(&self, link: *mut wl_list) -> Option<NonNull<T>> {
        if link == self.as_ptr() {
            None
        } else {
            NonNull::new(T::from_link(link))
        }
    }
}

/// Forward traversal; see [`List::iter`].
pub struct Iter<'a, T: Element> {
    head: *mut wl_list,
    current: *mut wl_list,
    _marker: PhantomData<&'a List<T>>,
}

impl<T: Element> Iterator for Iter<'_, T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<Self::Item> {
        unsafe {
            let next = (*self.current).next;
            if next == self.head {
                None
            } else {
                self.current = next;
                NonNull::new(T::from_link(next))
            }
        }
    }
}

/// Removal-tolerant traversal; see [`List::iter_safe`].
pub struct IterSafe<'a, T: Element> {
    head: *mut wl_list,
    next: *mut wl_list,
    _marker: PhantomData<&'a List<T>>,
}

impl<T: Element> Iterator for IterSafe<'_, T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == self.head {
            return None;
        }
        unsafe {
            let current = self.next;
            self.next = (*current).next;
            NonNull::new(T::from_link(current))
        }
    }
}

/// A list head allocated and owned by rust.
///
/// Dropping it unlinks whatever is still on the list, leaving those nodes
/// cleared rather than pointing at a freed head.
pub struct OwnedList<T: Element> {
    list: List<T>,
}

impl<T: Element> OwnedList<T> {
    pub fn new() -> Self {
        let head = Box::into_raw(Box::new(wl_list {
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
        }));
        unsafe {
            link::init(head);
            Self {
                list: List::from_non_null(NonNull::new_unchecked(head)),
            }
        }
    }
}

impl<T: Element> Default for OwnedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> std::ops::Deref for OwnedList<T> {
    type Target = List<T>;

    fn deref(&self) -> &List<T> {
        &self.list
    }
}

impl<T: Element> Drop for OwnedList<T> {
    fn drop(&mut self) {
        unsafe {
            for element in self.list.iter_safe() {
                link::remove(T::link(element.as_ptr()));
            }
            drop(Box::from_raw(self.list.as_ptr()));
        }
    }
}

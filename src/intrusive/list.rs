//! Intrusive doubly linked list.

#![allow(unsafe_code)]

use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};

/// A link record embedded in list elements.
///
/// The node carries the element's payload plus the prev/next links the list
/// threads through. Nodes deref to their payload.
#[derive(Debug)]
pub struct ListNode<T> {
    prev: *mut ListNode<T>,
    next: *mut ListNode<T>,
    data: T,
}

impl<T> ListNode<T> {
    /// Creates an unlinked node around `data`.
    pub const fn new(data: T) -> Self {
        Self {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            data,
        }
    }

    /// Consumes the node and returns its payload.
    pub fn into_inner(self) -> T {
        self.data
    }

    /// Raw access to the `next` link, for the atomic queue's chain building.
    pub(crate) fn next_raw(&self) -> *mut ListNode<T> {
        self.next
    }

    pub(crate) fn set_next_raw(&mut self, next: *mut ListNode<T>) {
        self.next = next;
    }
}

impl<T> Deref for ListNode<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for ListNode<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

/// A non-owning doubly linked list of caller-embedded [`ListNode`]s.
///
/// All operations are O(1) and never allocate. The list stores raw pointers
/// only; the caller keeps ownership of every node and must keep each node
/// alive and pinned while it is linked.
#[derive(Debug)]
pub struct IntrusiveList<T> {
    head: *mut ListNode<T>,
    tail: *mut ListNode<T>,
    len: usize,
}

impl<T> IntrusiveList<T> {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    /// Returns whether the list has no linked nodes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Returns the number of linked nodes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns the front node without unlinking it.
    #[must_use]
    pub fn front(&self) -> Option<NonNull<ListNode<T>>> {
        NonNull::new(self.head)
    }

    /// Links `node` at the back of the list.
    ///
    /// # Safety
    ///
    /// `node` must not currently be linked into any list, and must stay alive
    /// and pinned until it is unlinked again.
    pub unsafe fn push_back(&mut self, mut node: NonNull<ListNode<T>>) {
        let n = node.as_mut();
        n.next = ptr::null_mut();
        n.prev = self.tail;
        if self.tail.is_null() {
            self.head = node.as_ptr();
        } else {
            (*self.tail).next = node.as_ptr();
        }
        self.tail = node.as_ptr();
        self.len += 1;
    }

    /// Links `node` at the front of the list.
    ///
    /// # Safety
    ///
    /// Same contract as [`push_back`](Self::push_back).
    pub unsafe fn push_front(&mut self, mut node: NonNull<ListNode<T>>) {
        let n = node.as_mut();
        n.prev = ptr::null_mut();
        n.next = self.head;
        if self.head.is_null() {
            self.tail = node.as_ptr();
        } else {
            (*self.head).prev = node.as_ptr();
        }
        self.head = node.as_ptr();
        self.len += 1;
    }

    /// Unlinks and returns the front node.
    pub fn pop_front(&mut self) -> Option<NonNull<ListNode<T>>> {
        let mut node = NonNull::new(self.head)?;
        // Safety: head nodes are linked by contract of push_back/push_front.
        unsafe {
            let n = node.as_mut();
            self.head = n.next;
            if self.head.is_null() {
                self.tail = ptr::null_mut();
            } else {
                (*self.head).prev = ptr::null_mut();
            }
            n.prev = ptr::null_mut();
            n.next = ptr::null_mut();
        }
        self.len -= 1;
        Some(node)
    }

    /// Unlinks and returns the back node.
    pub fn pop_back(&mut self) -> Option<NonNull<ListNode<T>>> {
        let mut node = NonNull::new(self.tail)?;
        // Safety: tail nodes are linked by contract of push_back/push_front.
        unsafe {
            let n = node.as_mut();
            self.tail = n.prev;
            if self.tail.is_null() {
                self.head = ptr::null_mut();
            } else {
                (*self.tail).next = ptr::null_mut();
            }
            n.prev = ptr::null_mut();
            n.next = ptr::null_mut();
        }
        self.len -= 1;
        Some(node)
    }

    /// Unlinks `node` from this list.
    ///
    /// # Safety
    ///
    /// `node` must currently be linked into *this* list.
    pub unsafe fn remove(&mut self, mut node: NonNull<ListNode<T>>) {
        let n = node.as_mut();
        if n.prev.is_null() {
            debug_assert_eq!(self.head, node.as_ptr());
            self.head = n.next;
        } else {
            (*n.prev).next = n.next;
        }
        if n.next.is_null() {
            debug_assert_eq!(self.tail, node.as_ptr());
            self.tail = n.prev;
        } else {
            (*n.next).prev = n.prev;
        }
        n.prev = ptr::null_mut();
        n.next = ptr::null_mut();
        self.len -= 1;
    }

    /// Splices all of `other`'s nodes onto the back of this list, leaving
    /// `other` empty. O(1).
    pub fn append(&mut self, other: &mut Self) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.head = other.head;
            self.tail = other.tail;
        } else {
            // Safety: both boundary nodes are linked, so non-null.
            unsafe {
                (*self.tail).next = other.head;
                (*other.head).prev = self.tail;
            }
            self.tail = other.tail;
        }
        self.len += other.len;
        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
        other.len = 0;
    }

    /// Splices all of `other`'s nodes onto the front of this list, leaving
    /// `other` empty. O(1).
    pub fn prepend(&mut self, other: &mut Self) {
        other.append(self);
        core::mem::swap(&mut self.head, &mut other.head);
        core::mem::swap(&mut self.tail, &mut other.tail);
        core::mem::swap(&mut self.len, &mut other.len);
    }
}

impl<T> Default for IntrusiveList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for IntrusiveList<T> {
    fn drop(&mut self) {
        debug_assert!(
            self.is_empty(),
            "intrusive list dropped with {} node(s) still linked",
            self.len
        );
    }
}

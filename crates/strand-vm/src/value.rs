//! Tagged references and heap object headers.
//!
//! A [`Value`] is one machine word. Small integers, booleans and symbols are
//! encoded directly in the word and are never dereferenced; everything else is
//! a pointer to an [`ObjectHeader`] living in a managed chunk.
//!
//! # Encoding
//!
//! | Low bits | Tag        | Payload                      |
//! |----------|------------|------------------------------|
//! | `...1`   | `SmallInt` | `word >> 1` (arithmetic)     |
//! | `.010`   | `Boolean`  | bit 3                        |
//! | `.110`   | `Symbol`   | `word >> 3`                  |
//! | `.000`   | `HeapRef`  | the word is the header address |

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

const INT_TAG: usize = 0b1;
const TAG_MASK: usize = 0b111;
const BOOL_TAG: usize = 0b010;
const SYMBOL_TAG: usize = 0b110;
const BOOL_BIT: usize = 0b1000;

/// Alignment every heap object is placed at. Keeps the low tag bits clear.
pub const OBJECT_ALIGN: usize = 8;

/// Largest integer representable as a [`Tag::SmallInt`].
pub const SMALL_INT_MAX: isize = isize::MAX >> 1;
/// Smallest integer representable as a [`Tag::SmallInt`].
pub const SMALL_INT_MIN: isize = isize::MIN >> 1;

/// The closed set of things a [`Value`] can be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Immediate signed integer.
    SmallInt,
    /// Immediate `true`/`false`.
    Boolean,
    /// Immediate interned-symbol id.
    Symbol,
    /// Pointer to a heap object.
    HeapRef,
}

/// A tagged, pointer-sized managed reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(usize);

impl Value {
    /// The `false` immediate.
    pub const FALSE: Self = Self(BOOL_TAG);
    /// The `true` immediate.
    pub const TRUE: Self = Self(BOOL_TAG | BOOL_BIT);

    /// Encode a small integer.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `n` does not fit in 63 (or 31) bits.
    #[inline]
    #[must_use]
    pub const fn from_int(n: isize) -> Self {
        debug_assert!(n >= SMALL_INT_MIN && n <= SMALL_INT_MAX);
        #[allow(clippy::cast_sign_loss)]
        Self(((n << 1) as usize) | INT_TAG)
    }

    /// Encode a boolean.
    #[inline]
    #[must_use]
    pub const fn from_bool(b: bool) -> Self {
        if b {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }

    /// Encode an interned symbol id.
    #[inline]
    #[must_use]
    pub const fn from_symbol(id: u32) -> Self {
        Self(((id as usize) << 3) | SYMBOL_TAG)
    }

    /// Wrap a heap reference.
    #[inline]
    #[must_use]
    pub fn from_object(obj: ObjectRef) -> Self {
        Self(obj.addr())
    }

    /// Rebuild a value from its raw word.
    ///
    /// # Safety
    ///
    /// `word` must have been produced by [`Value::raw`], and if it is a heap
    /// reference the object must still be alive.
    #[inline]
    #[must_use]
    pub const unsafe fn from_raw(word: usize) -> Self {
        Self(word)
    }

    /// The raw machine word.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Extract the tag. Must be consulted before treating a value as a pointer.
    #[inline]
    #[must_use]
    pub const fn tag(self) -> Tag {
        if self.0 & INT_TAG != 0 {
            return Tag::SmallInt;
        }
        match self.0 & TAG_MASK {
            BOOL_TAG => Tag::Boolean,
            SYMBOL_TAG => Tag::Symbol,
            _ => Tag::HeapRef,
        }
    }

    /// The integer payload, if this is a small integer.
    #[inline]
    #[must_use]
    pub const fn as_int(self) -> Option<isize> {
        match self.tag() {
            #[allow(clippy::cast_possible_wrap)]
            Tag::SmallInt => Some((self.0 as isize) >> 1),
            _ => None,
        }
    }

    /// The boolean payload, if this is a boolean.
    #[inline]
    #[must_use]
    pub const fn as_bool(self) -> Option<bool> {
        match self.tag() {
            Tag::Boolean => Some(self.0 & BOOL_BIT != 0),
            _ => None,
        }
    }

    /// The symbol id, if this is a symbol.
    #[inline]
    #[must_use]
    pub const fn as_symbol(self) -> Option<u32> {
        match self.tag() {
            #[allow(clippy::cast_possible_truncation)]
            Tag::Symbol => Some((self.0 >> 3) as u32),
            _ => None,
        }
    }

    /// The heap reference, if this is one.
    #[inline]
    #[must_use]
    pub fn as_object(self) -> Option<ObjectRef> {
        match self.tag() {
            Tag::HeapRef => NonNull::new(self.0 as *mut ObjectHeader).map(ObjectRef),
            _ => None,
        }
    }

    /// Whether this value is a heap reference.
    #[inline]
    #[must_use]
    pub const fn is_heap_ref(self) -> bool {
        matches!(self.tag(), Tag::HeapRef)
    }

    /// Apply `f` to the heap reference (if any) and return the rewritten value.
    ///
    /// Immediates pass through unchanged. This is how root slots are handed to
    /// a moving collector.
    #[inline]
    #[must_use]
    pub fn map_object(self, f: impl FnOnce(ObjectRef) -> ObjectRef) -> Self {
        match self.as_object() {
            Some(obj) => Self::from_object(f(obj)),
            None => self,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::FALSE
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Tag::SmallInt => write!(f, "Int({})", (self.0 as isize) >> 1),
            Tag::Boolean => write!(f, "Bool({})", self.0 & BOOL_BIT != 0),
            Tag::Symbol => write!(f, "Symbol({})", self.0 >> 3),
            Tag::HeapRef => write!(f, "Ref({:#x})", self.0),
        }
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Self::from_object(obj)
    }
}

// ============================================================================
// Heap objects
// ============================================================================

/// Opaque type identifier supplied by the object model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectType(pub u32);

/// Header flag: the object survived at least one collection.
const FLAG_OLD: u32 = 1 << 0;
/// Header flag: the object is recorded in the remembered set.
const FLAG_REMEMBERED: u32 = 1 << 1;

/// Header placed in front of every heap object.
#[repr(C, align(8))]
pub struct ObjectHeader {
    type_id: ObjectType,
    size: u32,
    flags: AtomicU32,
}

/// Size of [`ObjectHeader`] in bytes.
pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

impl ObjectHeader {
    pub(crate) const fn new(type_id: ObjectType, size: u32) -> Self {
        Self {
            type_id,
            size,
            flags: AtomicU32::new(0),
        }
    }
}

/// A non-null pointer to a heap object.
///
/// `ObjectRef`s are plain handles. Nothing ties them to the chunk holding
/// the object: the chunk space may be dropped, or a collector may release
/// the chunk, while copies of the reference are still around. Comparing and
/// moving them is always fine; reading the header is `unsafe` and requires
/// the object to still be allocated.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectRef(NonNull<ObjectHeader>);

// SAFETY: the header's mutable state is atomic and the remaining fields are
// written once before the reference escapes the allocator.
unsafe impl Send for ObjectRef {}
// SAFETY: see above.
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// Wrap a raw header pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized [`ObjectHeader`] aligned to
    /// [`OBJECT_ALIGN`].
    #[inline]
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<ObjectHeader>) -> Self {
        Self(ptr)
    }

    /// # Safety
    ///
    /// The chunk holding the object has not been freed.
    #[inline]
    const unsafe fn header(&self) -> &ObjectHeader {
        // SAFETY: initialized at construction, alive per the caller.
        unsafe { self.0.as_ref() }
    }

    /// Address of the header.
    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Pointer to the first payload byte following the header.
    ///
    /// Computing the pointer never reads the object.
    #[inline]
    #[must_use]
    pub fn payload(self) -> NonNull<u8> {
        let ptr = self.0.as_ptr().cast::<u8>().wrapping_add(HEADER_SIZE);
        // SAFETY: headers are OBJECT_ALIGN aligned and no chunk ends in the
        // last bytes of the address space, so this cannot wrap to null.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Type id recorded at allocation.
    ///
    /// # Safety
    ///
    /// The object is still allocated: its chunk space is alive and no
    /// collection has released its chunk.
    #[inline]
    #[must_use]
    pub unsafe fn object_type(self) -> ObjectType {
        // SAFETY: forwarded to the caller.
        unsafe { self.header() }.type_id
    }

    /// Payload size in bytes (excluding the header).
    ///
    /// # Safety
    ///
    /// As for [`ObjectRef::object_type`].
    #[inline]
    #[must_use]
    pub unsafe fn size(self) -> usize {
        // SAFETY: forwarded to the caller.
        unsafe { self.header() }.size as usize
    }

    /// Whether the object has been promoted out of the young generation.
    ///
    /// # Safety
    ///
    /// As for [`ObjectRef::object_type`].
    #[inline]
    #[must_use]
    pub unsafe fn is_old(self) -> bool {
        // SAFETY: forwarded to the caller.
        unsafe { self.header() }.flags.load(Ordering::Relaxed) & FLAG_OLD != 0
    }

    /// Whether the object still lives in the young generation.
    ///
    /// # Safety
    ///
    /// As for [`ObjectRef::object_type`].
    #[inline]
    #[must_use]
    pub unsafe fn is_young(self) -> bool {
        // SAFETY: forwarded to the caller.
        !unsafe { self.is_old() }
    }

    /// Mark the object as old. Called by a collector after it survives.
    ///
    /// # Safety
    ///
    /// As for [`ObjectRef::object_type`].
    #[inline]
    pub unsafe fn promote(self) {
        // SAFETY: forwarded to the caller.
        unsafe { self.header() }
            .flags
            .fetch_or(FLAG_OLD, Ordering::Relaxed);
    }

    /// Whether the object is currently in the remembered set.
    ///
    /// # Safety
    ///
    /// As for [`ObjectRef::object_type`].
    #[inline]
    #[must_use]
    pub unsafe fn is_remembered(self) -> bool {
        // SAFETY: forwarded to the caller.
        unsafe { self.header() }.flags.load(Ordering::Acquire) & FLAG_REMEMBERED != 0
    }

    /// Set the remembered flag. Returns `true` if this call set it.
    ///
    /// # Safety
    ///
    /// As for [`ObjectRef::object_type`].
    #[inline]
    pub(crate) unsafe fn try_remember(self) -> bool {
        // SAFETY: forwarded to the caller.
        unsafe { self.header() }
            .flags
            .fetch_or(FLAG_REMEMBERED, Ordering::AcqRel)
            & FLAG_REMEMBERED
            == 0
    }

    /// # Safety
    ///
    /// As for [`ObjectRef::object_type`].
    #[inline]
    pub(crate) unsafe fn forget(self) {
        // SAFETY: forwarded to the caller.
        unsafe { self.header() }
            .flags
            .fetch_and(!FLAG_REMEMBERED, Ordering::Release);
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

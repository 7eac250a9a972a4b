//! Two-semispace copying collector.
//!
//! All language-visible aggregate state lives in a heap managed here.
//! Allocation bumps a pointer through the active semispace; when a request
//! does not fit, every reachable object is copied to the opposite space
//! (Cheney scan, forwarding pointers installed in from-space headers) and
//! the spaces swap. Roots come from the auxiliary [`RootList`] of scoped
//! handles plus a [`RootProvider`] supplied at each allocation site — in
//! practice the machine, which walks every live call frame.

pub mod roots;

use core::alloc::Layout;
use core::fmt;
use core::mem;
use core::ptr::{self, NonNull};

use katsu_asm::ConditionTag;
use katsu_types::{
    align_up_usize, HeapKind, Obj, ObjectHeader, ObjectTag, Value, VALUE_ALIGN_BITS,
};

use crate::consts::POISON_BYTE;
use crate::error::{VmError, VmResult};
use crate::interpreter::frame::Frame;
use crate::object::{
    Array, Assoc, ByteArray, CallSegment, Closure, Code, DataclassInstance, Foreign, Method,
    MultiMethod, Ref, Str, Tuple, Type, Vector,
};
use self::roots::RootList;

/// A source of GC roots enumerated at collection time.
pub trait RootProvider {
    /// Call `visitor` on every root slot so the collector can relocate it.
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// Provider with no roots, for contexts with no machine (tests, bootstrap
/// of the machine itself).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExtraRoots;

impl RootProvider for NoExtraRoots {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {}
}

/// The collector: two equally sized, value-aligned semispaces and a bump
/// pointer into the active one.
pub struct Gc {
    mem: NonNull<u8>,
    mem_opp: NonNull<u8>,
    size: usize,
    spot: usize,
    /// Collect on every allocation. Slow, but quickly finds missing roots.
    stress: bool,
}

impl Gc {
    /// Create a collector managing `size` bytes per semispace. The size
    /// must be value-aligned.
    pub fn new(size: usize) -> Self {
        assert_eq!(
            size,
            align_up_usize(size, VALUE_ALIGN_BITS),
            "heap size must be value-aligned"
        );
        let layout = Layout::from_size_align(size, 1 << VALUE_ALIGN_BITS)
            .expect("heap layout is well-formed");
        // Safety: non-zero size, valid layout.
        let mem = unsafe { std::alloc::alloc(layout) };
        let mem = NonNull::new(mem).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        let mem_opp = unsafe { std::alloc::alloc(layout) };
        let mem_opp =
            NonNull::new(mem_opp).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        if cfg!(debug_assertions) {
            // Safety: both regions are `size` bytes.
            unsafe {
                ptr::write_bytes(mem.as_ptr(), POISON_BYTE, size);
                ptr::write_bytes(mem_opp.as_ptr(), POISON_BYTE, size);
            }
        }
        Gc {
            mem,
            mem_opp,
            size,
            spot: 0,
            stress: false,
        }
    }

    /// Bytes currently in use in the active space.
    pub const fn used(&self) -> usize {
        self.spot
    }

    /// Bytes per semispace.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Collect on every allocation from now on. Slow; for tests hunting
    /// missing roots.
    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    /// Whether `ptr` lies inside the active semispace. Diagnostic aid.
    pub fn contains(&self, ptr: NonNull<ObjectHeader>) -> bool {
        let p = ptr.as_ptr() as usize;
        let base = self.mem.as_ptr() as usize;
        p >= base && p < base + self.size
    }

    /// Allocate `size` bytes, value-aligned, collecting first if the
    /// request does not fit. Signals `out-of-memory` when even a fresh
    /// collection cannot make room.
    pub fn alloc_raw(
        &mut self,
        size: usize,
        roots: &RootList,
        provider: &mut dyn RootProvider,
    ) -> VmResult<NonNull<u8>> {
        let size = align_up_usize(size, VALUE_ALIGN_BITS);
        if size > self.size {
            return Err(VmError::condition(
                ConditionTag::OutOfMemory,
                "allocation request exceeds the heap size",
            ));
        }

        if self.stress || size > self.size - self.spot {
            self.collect(roots, provider);
            if size > self.size - self.spot {
                return Err(VmError::condition(
                    ConditionTag::OutOfMemory,
                    "out of heap memory even after collection",
                ));
            }
        }

        let spot = self.spot;
        self.spot += size;
        // Safety: spot + size <= self.size.
        let allocation = unsafe { NonNull::new_unchecked(self.mem.as_ptr().add(spot)) };
        if cfg!(debug_assertions) {
            // Safety: the region was just reserved.
            unsafe { ptr::write_bytes(allocation.as_ptr(), POISON_BYTE, size) };
        }
        Ok(allocation)
    }

    /// Copy every reachable object into the opposite semispace and swap
    /// spaces. Every root slot is rewritten to the object's new address.
    pub fn collect(&mut self, roots: &RootList, provider: &mut dyn RootProvider) {
        tracing::debug!(used = self.spot, "collecting");

        let mut ev = Evacuator {
            to: self.mem_opp.as_ptr(),
        };
        roots.visit_slots(&mut |slot| ev.move_value(slot));
        provider.visit_roots(&mut |slot| ev.move_value(slot));

        // Breadth-first scan of the objects copied so far; scanning appends
        // more until the space closes over the live set.
        let mut queue = self.mem_opp.as_ptr();
        while queue < ev.to {
            let obj = queue.cast::<ObjectHeader>();
            // Safety: queue walks whole, initialized objects previously
            // copied by the evacuator.
            let size = unsafe { ev.scan_object(obj) };
            queue = unsafe { queue.add(align_up_usize(size, VALUE_ALIGN_BITS)) };
        }
        debug_assert_eq!(queue, ev.to, "scan overran the copied region");

        mem::swap(&mut self.mem, &mut self.mem_opp);
        self.spot = queue as usize - self.mem.as_ptr() as usize;
        if cfg!(debug_assertions) {
            // Safety: the old space holds no live objects any more.
            unsafe { ptr::write_bytes(self.mem_opp.as_ptr(), POISON_BYTE, self.size) };
        }

        tracing::debug!(live = self.spot, "collection finished");
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, 1 << VALUE_ALIGN_BITS)
            .expect("heap layout is well-formed");
        // Safety: both pointers were allocated with this layout.
        unsafe {
            std::alloc::dealloc(self.mem.as_ptr(), layout);
            std::alloc::dealloc(self.mem_opp.as_ptr(), layout);
        }
    }
}

impl fmt::Debug for Gc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gc")
            .field("size", &self.size)
            .field("used", &self.spot)
            .field("stress", &self.stress)
            .finish_non_exhaustive()
    }
}

/// An allocation context: the collector, its auxiliary root list, and the
/// machine roots of the current call site.
///
/// Constructed by splitting the machine's fields so that scoped handles
/// (which borrow the root list shared) coexist with allocation (which
/// borrows the collector and provider exclusively).
pub struct Heap<'h> {
    gc: &'h mut Gc,
    roots: &'h RootList,
    provider: &'h mut dyn RootProvider,
}

impl<'h> Heap<'h> {
    /// Bundle an allocation context.
    pub fn new(gc: &'h mut Gc, roots: &'h RootList, provider: &'h mut dyn RootProvider) -> Self {
        Heap {
            gc,
            roots,
            provider,
        }
    }

    /// The root list, for constructing scoped handles that outlive this
    /// context's exclusive borrows.
    pub fn roots(&self) -> &'h RootList {
        self.roots
    }

    /// Allocate an object of kind `T` spanning `size` bytes (the kind's
    /// `size()`/`size_for(..)`), write its header, and return it.
    ///
    /// The body past the header is uninitialized (poisoned in debug
    /// builds); the caller must fully initialize it before the next
    /// operation that may collect.
    pub fn alloc<T: HeapKind>(&mut self, size: usize) -> VmResult<Obj<T>> {
        debug_assert!(size >= mem::size_of::<T>());
        let raw = self.gc.alloc_raw(size, self.roots, &mut *self.provider)?;
        let header = raw.cast::<ObjectHeader>();
        // Safety: `raw` is a fresh region of at least a header's worth of
        // bytes.
        unsafe { header.as_ptr().write(ObjectHeader::new(T::TAG)) };
        Ok(unsafe { Obj::from_raw(raw.cast()) })
    }

    /// Force a collection.
    pub fn collect(&mut self) {
        self.gc.collect(self.roots, &mut *self.provider);
    }

    /// Bytes currently in use.
    pub fn used(&self) -> usize {
        self.gc.used()
    }
}

/// Copying machinery for one collection: the bump pointer into to-space.
struct Evacuator {
    to: *mut u8,
}

impl Evacuator {
    /// Relocate the object a slot refers to, if it refers to one.
    fn move_value(&mut self, slot: &mut Value) {
        if slot.is_object() {
            self.move_object(slot);
        }
    }

    /// Relocate an object slot: follow an existing forwarding pointer, or
    /// copy the object to to-space and install one.
    fn move_object(&mut self, slot: &mut Value) {
        let obj = slot.expect_object().as_ptr();
        // Safety: object values point at live (or forwarded) headers in
        // from-space.
        unsafe {
            if !(*obj).is_forwarding() {
                let size = object_size(obj);
                ptr::copy_nonoverlapping(obj.cast::<u8>(), self.to, size);
                let dest = NonNull::new_unchecked(self.to.cast::<ObjectHeader>());
                (*obj).set_forwarding(dest);
                self.to = self.to.add(align_up_usize(size, VALUE_ALIGN_BITS));
            }
            *slot = Value::object((*obj).forwarding()).expect("forwarded objects stay aligned");
        }
    }

    /// Walk one to-space object's fields by kind, relocating everything it
    /// references. Returns the object's size in bytes.
    ///
    /// # Safety
    ///
    /// `obj` must point at a whole, initialized object in to-space.
    unsafe fn scan_object(&mut self, obj: *mut ObjectHeader) -> usize {
        let tag = unsafe { (*obj).tag() };
        match tag {
            ObjectTag::Ref => {
                let v = obj.cast::<Ref>();
                unsafe { self.move_value(&mut (*v).referent) };
                Ref::size()
            }
            ObjectTag::Tuple => {
                let v = obj.cast::<Tuple>();
                unsafe {
                    let length = (*v).length;
                    let components = Tuple::components_ptr(v);
                    for i in 0..length {
                        self.move_value(&mut *components.add(i as usize));
                    }
                    Tuple::size_for(length)
                }
            }
            ObjectTag::Array => {
                let v = obj.cast::<Array>();
                unsafe {
                    let length = (*v).length;
                    let components = Array::components_ptr(v);
                    for i in 0..length {
                        self.move_value(&mut *components.add(i as usize));
                    }
                    Array::size_for(length)
                }
            }
            ObjectTag::Vector => {
                let v = obj.cast::<Vector>();
                unsafe { self.move_value(&mut (*v).backing) };
                Vector::size()
            }
            ObjectTag::Assoc => {
                let v = obj.cast::<Assoc>();
                unsafe { self.move_value(&mut (*v).backing) };
                Assoc::size()
            }
            // No internal values to trace; copied byte-exact.
            ObjectTag::Str => unsafe { (*obj.cast::<Str>()).size() },
            ObjectTag::ByteArray => unsafe { (*obj.cast::<ByteArray>()).size() },
            ObjectTag::Foreign => Foreign::size(),
            ObjectTag::Code => {
                let v = obj.cast::<Code>();
                unsafe {
                    self.move_value(&mut (*v).module);
                    self.move_value(&mut (*v).upreg_map);
                    self.move_value(&mut (*v).insts);
                    self.move_value(&mut (*v).args);
                    self.move_value(&mut (*v).span);
                    self.move_value(&mut (*v).inst_spans);
                }
                Code::size()
            }
            ObjectTag::Closure => {
                let v = obj.cast::<Closure>();
                unsafe {
                    self.move_value(&mut (*v).code);
                    self.move_value(&mut (*v).upregs);
                }
                Closure::size()
            }
            ObjectTag::Method => {
                let v = obj.cast::<Method>();
                unsafe {
                    self.move_value(&mut (*v).param_matchers);
                    self.move_value(&mut (*v).return_type);
                    self.move_value(&mut (*v).code);
                    self.move_value(&mut (*v).attributes);
                }
                Method::size()
            }
            ObjectTag::MultiMethod => {
                let v = obj.cast::<MultiMethod>();
                unsafe {
                    self.move_value(&mut (*v).name);
                    self.move_value(&mut (*v).methods);
                    self.move_value(&mut (*v).attributes);
                }
                MultiMethod::size()
            }
            ObjectTag::Type => {
                let v = obj.cast::<Type>();
                unsafe {
                    self.move_value(&mut (*v).name);
                    self.move_value(&mut (*v).bases);
                    self.move_value(&mut (*v).linearization);
                    self.move_value(&mut (*v).subtypes);
                    self.move_value(&mut (*v).slots);
                }
                Type::size()
            }
            ObjectTag::Instance => {
                let v = obj.cast::<DataclassInstance>();
                // The slot count must be read before the type slot is
                // rewritten, following the forwarding chain if the type
                // already moved.
                unsafe {
                    let num_slots = instance_num_slots((*v).ty);
                    self.move_value(&mut (*v).ty);
                    let slots = DataclassInstance::slots_ptr(v);
                    for i in 0..num_slots {
                        self.move_value(&mut *slots.add(i as usize));
                    }
                    DataclassInstance::size_for(num_slots)
                }
            }
            ObjectTag::CallSegment => {
                let v = obj.cast::<CallSegment>();
                // The embedded frames get the same walk the machine's own
                // stack gets as a root provider.
                unsafe {
                    let length = (*v).length;
                    let mut frame = CallSegment::frames_ptr(v).cast::<Frame>();
                    let past_end = CallSegment::frames_ptr(v).add(length as usize).cast::<Frame>();
                    while frame < past_end {
                        self.move_frame_values(frame);
                        frame = (*frame).next();
                    }
                    debug_assert_eq!(frame, past_end, "segment frame walk overran");
                    CallSegment::size_for(length)
                }
            }
        }
    }

    /// Relocate every value a frame holds: code, module, marker, all
    /// registers, and the live prefix of the data stack (`data_depth`
    /// entries, not `num_data`).
    ///
    /// # Safety
    ///
    /// `frame` must point at a whole, initialized frame.
    pub(crate) unsafe fn move_frame_values(&mut self, frame: *mut Frame) {
        unsafe {
            self.move_value(&mut (*frame).code);
            self.move_value(&mut (*frame).module);
            self.move_value(&mut (*frame).marker);

            let regs = Frame::regs_ptr(frame);
            for i in 0..(*frame).num_regs {
                self.move_value(&mut *regs.add(i as usize));
            }

            let data = Frame::data_ptr(frame);
            for i in 0..(*frame).data_depth {
                self.move_value(&mut *data.add(i as usize));
            }
        }
    }
}

/// Size of a live from-space object, in bytes.
///
/// # Safety
///
/// `obj` must point at a whole, initialized, non-forwarded object.
unsafe fn object_size(obj: *mut ObjectHeader) -> usize {
    let tag = unsafe { (*obj).tag() };
    unsafe {
        match tag {
            ObjectTag::Ref => Ref::size(),
            ObjectTag::Tuple => (*obj.cast::<Tuple>()).size(),
            ObjectTag::Array => (*obj.cast::<Array>()).size(),
            ObjectTag::Vector => Vector::size(),
            ObjectTag::Assoc => Assoc::size(),
            ObjectTag::Str => (*obj.cast::<Str>()).size(),
            ObjectTag::ByteArray => (*obj.cast::<ByteArray>()).size(),
            ObjectTag::Code => Code::size(),
            ObjectTag::Closure => Closure::size(),
            ObjectTag::Method => Method::size(),
            ObjectTag::MultiMethod => MultiMethod::size(),
            ObjectTag::Type => Type::size(),
            // The instance's type may already be a forwarding pointer.
            ObjectTag::Instance => {
                DataclassInstance::size_for(instance_num_slots((*obj.cast::<DataclassInstance>()).ty))
            }
            ObjectTag::CallSegment => (*obj.cast::<CallSegment>()).size(),
            ObjectTag::Foreign => Foreign::size(),
        }
    }
}

/// Slot count of a dataclass instance's type, following the forwarding
/// chain if the type object has already been moved this collection.
///
/// # Safety
///
/// `ty` must be an object value referring to a [`Type`] (live or
/// forwarded).
unsafe fn instance_num_slots(ty: Value) -> u64 {
    let mut header = ty.expect_object();
    unsafe {
        if (*header.as_ptr()).is_forwarding() {
            header = (*header.as_ptr()).forwarding();
        }
        debug_assert_eq!((*header.as_ptr()).tag(), ObjectTag::Type);
        u64::from((*header.as_ptr().cast::<Type>()).num_total_slots)
    }
}

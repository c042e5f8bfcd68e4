// SPDX-License-Identifier: BSD-3-Clause
//! Abstract locations.
//!
//! An *object* is a static proxy for the runtime allocations made at one
//! site (or the storage of one global, one function, ...). Objects with a
//! known, fixed layout are split into *cells*, one per field; every other
//! object has a single cell. Cells are the abstract locations that points-to
//! sets range over, and are identified by dense [`LocId`]s.
//!
//! Interning is idempotent: asking twice for the object of the same site
//! yields the same locations.

// TODO: Heap cloning, with two optimizations:
//
// - Stack allocations with non-pointer-containing types need not have contexts
// - Heap allocations smaller than a pointer need not have contexts

use std::fmt::Display;

use rustc_hash::FxHashMap;

use crate::analysis::{Error, Resource};
use crate::ir::layout::{Cell, Layout, Overflow};
use crate::ir::{FunctionName, GlobalName, Site};
use crate::union::UnionFind;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct LocId(u32);

impl LocId {
    /// External or unanalyzed memory
    pub const UNKNOWN: LocId = LocId(0);
    pub const NULL: LocId = LocId(1);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn from_index(i: usize) -> Self {
        LocId(i as u32)
    }
}

impl Display for LocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Alloc {
    Function(FunctionName),
    Global(GlobalName),
    Heap(Site),
    Stack(Site),
    /// Memory owned by the environment, e.g. what `stderr` or `argv` point to
    External(String),
    /// The variadic arguments of a function
    VarArgs(FunctionName),
    //
    Null,
    Unknown,
}

impl Display for Alloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Alloc::Function(n) => write!(f, "*{}", n),
            Alloc::Global(n) => write!(f, "*{}", n),
            Alloc::Heap(s) => write!(f, "*heap:{}", s),
            Alloc::Stack(s) => write!(f, "*{}", s),
            Alloc::External(n) => write!(f, "*{}", n),
            Alloc::VarArgs(n) => write!(f, "*{}(...)", n),
            Alloc::Null => write!(f, "*null"),
            Alloc::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Object {
    pub alloc: Alloc,
    /// In bytes; `None` if unknown or unbounded
    pub size: Option<u64>,
    pub constant: bool,
    /// Only kept for field-sensitive objects
    layout: Option<Layout>,
    /// Sorted by offset; the first is the base, at offset 0
    cells: Vec<(Cell, LocId)>,
    collapsed: bool,
}

impl Object {
    #[inline]
    pub fn base(&self) -> LocId {
        self.cells[0].1
    }

    pub fn cells(&self) -> impl Iterator<Item = LocId> + '_ {
        self.cells.iter().map(|(_, l)| *l)
    }

    pub fn is_collapsed(&self) -> bool {
        self.collapsed
    }

    pub fn is_field_sensitive(&self) -> bool {
        self.layout.is_some() && !self.collapsed && self.cells.len() > 1
    }

    fn cell_at(&self, offset: u64) -> Option<LocId> {
        self.cells
            .binary_search_by_key(&offset, |(c, _)| c.offset)
            .ok()
            .map(|i| self.cells[i].1)
    }

    pub(crate) fn freeable(&self) -> bool {
        match self.alloc {
            Alloc::Heap(_) => true,
            Alloc::Unknown => true,
            // No `_` pattern to ensure this is updated if the type changes
            Alloc::External(_) => false,
            Alloc::Function(_) => false,
            Alloc::Global(_) => false,
            Alloc::Null => false,
            Alloc::Stack(_) => false,
            Alloc::VarArgs(_) => false,
        }
    }

    pub(crate) fn loadable(&self) -> bool {
        match self.alloc {
            Alloc::Function(_) => false,
            Alloc::Null => false,
            // No `_` pattern to ensure this is updated if the type changes
            Alloc::External(_) => true,
            Alloc::Global(_) => true,
            Alloc::Heap(_) => true,
            Alloc::Stack(_) => true,
            Alloc::Unknown => true,
            Alloc::VarArgs(_) => true,
        }
    }

    pub(crate) fn storable(&self) -> bool {
        match self.alloc {
            Alloc::Function(_) => false,
            Alloc::Global(_) => !self.constant,
            Alloc::Null => false,
            // No `_` pattern to ensure this is updated if the type changes
            Alloc::External(_) => true,
            Alloc::Heap(_) => true,
            Alloc::Stack(_) => true,
            Alloc::Unknown => true,
            Alloc::VarArgs(_) => true,
        }
    }
}

/// A cell: an object and the offset of one of its fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Location {
    pub object: ObjectId,
    pub offset: u64,
}

/// Result of resolving a field address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Field(LocId),
    /// The access can't be resolved to a field, the object must be collapsed
    Collapse(ObjectId),
}

#[derive(Clone, Debug)]
pub struct Locations {
    objects: Vec<Object>,
    locations: Vec<Location>,
    index: FxHashMap<Alloc, ObjectId>,
    classes: UnionFind,
    max_locations: usize,
    max_fields: usize,
    overflows: Vec<(ObjectId, Overflow)>,
}

impl Locations {
    pub fn new(max_locations: usize, max_fields: usize) -> Self {
        let mut locs = Locations {
            objects: Vec::new(),
            locations: Vec::new(),
            index: FxHashMap::default(),
            classes: UnionFind::new(),
            max_locations: max_locations.max(2),
            max_fields: max_fields.max(1),
            overflows: Vec::new(),
        };
        for alloc in [Alloc::Unknown, Alloc::Null] {
            let size = if alloc == Alloc::Null { Some(0) } else { None };
            // Can't fail, the budget is at least 2
            let _ = locs.intern(alloc, size, false, None);
        }
        debug_assert_eq!(LocId::UNKNOWN, locs.objects[0].base());
        debug_assert_eq!(LocId::NULL, locs.objects[1].base());
        locs
    }

    fn intern(
        &mut self,
        alloc: Alloc,
        size: Option<u64>,
        constant: bool,
        layout: Option<&Layout>,
    ) -> Result<LocId, Error> {
        if let Some(o) = self.index.get(&alloc) {
            return Ok(self.objects[o.index()].base());
        }
        let id = ObjectId(self.objects.len() as u32);
        let (cells, layout) = match layout.map(|l| l.cells(self.max_fields)) {
            Some(Ok(cells)) => (cells, layout.cloned()),
            Some(Err(overflow)) => {
                self.overflows.push((id, overflow));
                (vec![Cell::default()], None)
            }
            None => (vec![Cell::default()], None),
        };
        if self.locations.len() + cells.len() > self.max_locations {
            return Err(Error::Incomplete {
                resource: Resource::Locations,
                limit: self.max_locations,
            });
        }
        let cells = cells
            .into_iter()
            .map(|c| {
                let loc = LocId::from_index(self.locations.len());
                self.locations.push(Location {
                    object: id,
                    offset: c.offset,
                });
                self.classes.ensure(loc.index());
                (c, loc)
            })
            .collect();
        self.objects.push(Object {
            alloc: alloc.clone(),
            size,
            constant,
            layout,
            cells,
            collapsed: false,
        });
        self.index.insert(alloc, id);
        Ok(self.objects[id.index()].base())
    }

    pub fn new_stack_slot(&mut self, site: Site, layout: Option<&Layout>) -> Result<LocId, Error> {
        let size = layout.and_then(Layout::size);
        self.intern(Alloc::Stack(site), size, false, layout)
    }

    /// Heap objects are field-insensitive.
    pub fn new_heap_object(&mut self, site: Site, size: Option<u64>) -> Result<LocId, Error> {
        self.intern(Alloc::Heap(site), size, false, None)
    }

    pub fn new_global(
        &mut self,
        name: GlobalName,
        constant: bool,
        layout: Option<&Layout>,
    ) -> Result<LocId, Error> {
        let size = layout.and_then(Layout::size);
        self.intern(Alloc::Global(name), size, constant, layout)
    }

    pub fn new_function(&mut self, name: FunctionName) -> Result<LocId, Error> {
        self.intern(Alloc::Function(name), None, true, None)
    }

    pub fn new_external(&mut self, name: &str) -> Result<LocId, Error> {
        self.intern(Alloc::External(name.to_string()), None, false, None)
    }

    pub fn new_varargs(&mut self, function: FunctionName) -> Result<LocId, Error> {
        self.intern(Alloc::VarArgs(function), None, false, None)
    }

    /// Base location of an existing object.
    pub fn get(&self, alloc: &Alloc) -> Option<LocId> {
        self.index
            .get(alloc)
            .map(|o| self.objects[o.index()].base())
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn objects(&self) -> impl Iterator<Item = (ObjectId, &Object)> {
        self.objects
            .iter()
            .enumerate()
            .map(|(i, o)| (ObjectId(i as u32), o))
    }

    #[inline]
    pub fn location(&self, loc: LocId) -> Location {
        self.locations[loc.index()]
    }

    #[inline]
    pub fn object(&self, loc: LocId) -> &Object {
        &self.objects[self.locations[loc.index()].object.index()]
    }

    #[inline]
    pub fn object_by_id(&self, id: ObjectId) -> &Object {
        &self.objects[id.index()]
    }

    /// Objects whose layouts were too big or too deep to flatten.
    pub(crate) fn take_overflows(&mut self) -> Vec<(ObjectId, Overflow)> {
        std::mem::take(&mut self.overflows)
    }

    /// Representative of the location's class, see [`Locations::union`].
    pub fn find(&self, loc: LocId) -> LocId {
        LocId::from_index(self.classes.find(loc.index()))
    }

    /// Record that two locations stand for the same memory. Returns true if
    /// they weren't already known to.
    pub(crate) fn union(&mut self, a: LocId, b: LocId) -> bool {
        self.classes.merge(a.index(), b.index())
    }

    /// Resolve the address `loc + offset + sum(i_k * strides[k])` for unknown
    /// `i_k` to a cell of the same object.
    pub fn resolve(&self, loc: LocId, offset: i64, strides: &[u64]) -> Resolution {
        let Location {
            object,
            offset: base,
        } = self.location(loc);
        let obj = &self.objects[object.index()];
        if !obj.is_field_sensitive() {
            return Resolution::Field(obj.base());
        }
        let Some(layout) = &obj.layout else {
            return Resolution::Field(obj.base());
        };
        let abs = match (base as i64).checked_add(offset) {
            Some(a) if a >= 0 => a as u64,
            _ => return Resolution::Collapse(object),
        };
        if !strides.iter().all(|s| layout.absorbs(abs, *s)) {
            return Resolution::Collapse(object);
        }
        layout
            .canonical(abs)
            .and_then(|c| obj.cell_at(c))
            .map(Resolution::Field)
            .unwrap_or(Resolution::Collapse(object))
    }

    /// Mark an object as collapsed, returning the cells (other than the base)
    /// that have to be unified with the base. Empty if already collapsed.
    pub(crate) fn collapse(&mut self, object: ObjectId) -> Vec<LocId> {
        let obj = &mut self.objects[object.index()];
        if obj.collapsed {
            return Vec::new();
        }
        obj.collapsed = true;
        let base = obj.base();
        let rest: Vec<LocId> = obj.cells().skip(1).collect();
        for l in &rest {
            self.classes.merge(base.index(), l.index());
        }
        rest
    }

    /// Cells read or written by an access of `width` bytes at `loc`.
    pub fn cells_in_range(&self, loc: LocId, width: Option<u64>) -> Vec<LocId> {
        let obj = self.object(loc);
        match width {
            Some(w) if obj.is_field_sensitive() => self.cells_from(loc, Some(w)),
            _ => vec![loc],
        }
    }

    fn cells_from(&self, loc: LocId, size: Option<u64>) -> Vec<LocId> {
        let obj = self.object(loc);
        if !obj.is_field_sensitive() {
            return vec![loc];
        }
        let start = self.location(loc).offset;
        let mut out: Vec<LocId> = obj
            .cells
            .iter()
            .filter(|(c, _)| {
                c.offset >= start
                    && size
                        .and_then(|s| start.checked_add(s))
                        .map_or(true, |end| c.offset < end)
            })
            .map(|(_, l)| *l)
            .collect();
        if out.is_empty() {
            out.push(loc);
        }
        out
    }

    /// Bytes between the location and the end of its object, if known.
    pub fn remaining(&self, loc: LocId) -> Option<u64> {
        let obj = self.object(loc);
        obj.size
            .map(|s| s.saturating_sub(self.location(loc).offset))
    }

    /// Pairs of (destination, source) cells for a copy of `size` bytes from
    /// `src` to `dst`. `None` if the copy can't happen in a well-defined
    /// program: the source isn't loadable, the destination isn't storable,
    /// or the size exceeds either object.
    pub fn copy_pairs(
        &self,
        dst: LocId,
        src: LocId,
        size: Option<u64>,
    ) -> Option<Vec<(LocId, LocId)>> {
        if !self.object(src).loadable() || !self.object(dst).storable() {
            return None;
        }
        if let Some(n) = size {
            if self.remaining(src).is_some_and(|r| n > r)
                || self.remaining(dst).is_some_and(|r| n > r)
            {
                return None;
            }
        }
        let srcs = self.cells_from(src, size);
        let dsts = self.cells_from(dst, size);
        let dst_obj = self.object(dst);
        let mut pairs = Vec::new();
        if self.object(src).is_field_sensitive() && dst_obj.is_field_sensitive() {
            let s0 = self.location(src).offset;
            let d0 = self.location(dst).offset;
            for s in srcs {
                let rel = self.location(s).offset - s0;
                let target = dst_obj
                    .layout
                    .as_ref()
                    .and_then(|l| l.canonical(d0.checked_add(rel)?))
                    .and_then(|c| dst_obj.cell_at(c));
                match target {
                    Some(d) => pairs.push((d, s)),
                    None => pairs.extend(dsts.iter().map(|d| (*d, s))),
                }
            }
        } else {
            for s in &srcs {
                pairs.extend(dsts.iter().map(|d| (*d, *s)));
            }
        }
        Some(pairs)
    }

    /// Whether unification may merge these objects: both on the stack, both
    /// on the heap with equal sizes, or both globals of the same constness.
    pub(crate) fn mergeable(&self, a: LocId, b: LocId) -> bool {
        let (oa, ob) = (self.object(a), self.object(b));
        match (&oa.alloc, &ob.alloc) {
            (Alloc::Global(_), Alloc::Global(_)) => oa.constant == ob.constant,
            (Alloc::Heap(_), Alloc::Heap(_)) => oa.size == ob.size,
            (Alloc::Stack(_), Alloc::Stack(_)) => true,
            _ => false,
        }
    }

    pub(crate) fn object_id(&self, loc: LocId) -> ObjectId {
        self.location(loc).object
    }

    /// Human-readable name of a location, e.g. `*main:2+8`.
    pub fn name(&self, loc: LocId) -> String {
        let Location { object, offset } = self.location(loc);
        let alloc = &self.objects[object.index()].alloc;
        if offset == 0 {
            alloc.to_string()
        } else {
            format!("{}+{}", alloc, offset)
        }
    }
}

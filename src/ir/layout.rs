// SPDX-License-Identifier: BSD-3-Clause
//! Type layouts, as far as the analysis cares about them: sizes, and the
//! offsets of the fields of aggregates.

/// Layouts nested deeper than this are not flattened.
pub const MAX_DEPTH: usize = 16;

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    Scalar(u64),
    Struct(Struct),
    Array(Array),
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Struct {
    pub size: u64,
    pub fields: Vec<Field>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Field {
    pub offset: u64,
    pub layout: Layout,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Array {
    pub element: Box<Layout>,
    /// `None` for flexible array members and other arrays of unknown length.
    #[serde(default)]
    pub len: Option<u64>,
}

/// One flattened field of a layout. Offsets of array elements are folded onto
/// the first element, so a cell inside an array stands for every element.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct Cell {
    pub offset: u64,
}

/// Why a layout could not be flattened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overflow {
    Depth,
    Fields(usize),
}

impl Layout {
    /// Size in bytes, or `None` if the layout ends in a flexible array.
    pub fn size(&self) -> Option<u64> {
        match self {
            Layout::Scalar(s) => Some(*s),
            Layout::Struct(s) => Some(s.size),
            Layout::Array(a) => a.element.size()?.checked_mul(a.len?),
        }
    }

    /// Flatten into the distinct cell offsets, sorted. Always contains offset
    /// 0.
    pub fn cells(&self, max_fields: usize) -> Result<Vec<Cell>, Overflow> {
        let mut out = Vec::new();
        self.flatten(0, 0, &mut out)?;
        out.sort_by_key(|c| c.offset);
        out.dedup_by_key(|c| c.offset);
        if out.first().map(|c| c.offset) != Some(0) {
            out.insert(0, Cell { offset: 0 });
        }
        if out.len() > max_fields {
            return Err(Overflow::Fields(out.len()));
        }
        Ok(out)
    }

    fn flatten(&self, base: u64, depth: usize, out: &mut Vec<Cell>) -> Result<(), Overflow> {
        if depth > MAX_DEPTH {
            return Err(Overflow::Depth);
        }
        match self {
            Layout::Scalar(_) => out.push(Cell { offset: base }),
            Layout::Struct(s) => {
                if s.fields.is_empty() {
                    out.push(Cell { offset: base });
                }
                for f in &s.fields {
                    f.layout
                        .flatten(base.saturating_add(f.offset), depth + 1, out)?;
                }
            }
            Layout::Array(a) => a.element.flatten(base, depth + 1, out)?,
        }
        Ok(())
    }

    /// Offsets of the scalar leaves, in order, with arrays expanded rather
    /// than folded. `None` if there are more than `limit` of them, or an
    /// array has an unknown length.
    pub fn leaves(&self, limit: usize) -> Option<Vec<u64>> {
        let mut out = Vec::new();
        self.collect_leaves(0, 0, limit, &mut out)?;
        Some(out)
    }

    fn collect_leaves(&self, base: u64, depth: usize, limit: usize, out: &mut Vec<u64>) -> Option<()> {
        if depth > MAX_DEPTH || out.len() > limit {
            return None;
        }
        match self {
            Layout::Scalar(_) => out.push(base),
            Layout::Struct(s) => {
                for f in &s.fields {
                    f.layout
                        .collect_leaves(base.checked_add(f.offset)?, depth + 1, limit, out)?;
                }
            }
            Layout::Array(a) => {
                let elem = a.element.size()?;
                for i in 0..a.len? {
                    let at = base.checked_add(i.checked_mul(elem)?)?;
                    a.element.collect_leaves(at, depth + 1, limit, out)?;
                    if out.len() > limit {
                        return None;
                    }
                }
            }
        }
        Some(())
    }

    /// Canonical offset of byte `offset` within this layout: array element
    /// positions fold onto the first element. `None` when out of bounds.
    pub fn canonical(&self, offset: u64) -> Option<u64> {
        self.canonical_at(offset, 0)
    }

    fn canonical_at(&self, offset: u64, depth: usize) -> Option<u64> {
        if depth > MAX_DEPTH {
            return None;
        }
        match self {
            Layout::Scalar(s) => (offset < (*s).max(1)).then_some(0),
            Layout::Struct(st) => {
                if offset >= st.size.max(1) {
                    return None;
                }
                // The last field starting at or before the offset.
                match st.fields.iter().rev().find(|f| f.offset <= offset) {
                    Some(f) => f
                        .layout
                        .canonical_at(offset - f.offset, depth + 1)
                        .and_then(|o| o.checked_add(f.offset))
                        // Padding.
                        .or(Some(offset)),
                    None => Some(offset),
                }
            }
            Layout::Array(a) => {
                let elem = a.element.size()?.max(1);
                // A length whose byte size overflows is as good as unbounded.
                if let Some(bytes) = a.len.and_then(|len| elem.checked_mul(len)) {
                    if offset >= bytes {
                        return None;
                    }
                }
                a.element.canonical_at(offset % elem, depth + 1)
            }
        }
    }

    /// Whether a dynamic index with the given stride, applied at `offset`,
    /// stays within one array of this layout (i.e. only moves between
    /// elements that share canonical offsets).
    pub fn absorbs(&self, offset: u64, stride: u64) -> bool {
        self.absorbs_at(offset, stride, 0)
    }

    fn absorbs_at(&self, offset: u64, stride: u64, depth: usize) -> bool {
        if depth > MAX_DEPTH || stride == 0 {
            return stride == 0;
        }
        match self {
            Layout::Scalar(_) => false,
            Layout::Struct(st) => st
                .fields
                .iter()
                .rev()
                .find(|f| f.offset <= offset)
                .is_some_and(|f| f.layout.absorbs_at(offset - f.offset, stride, depth + 1)),
            Layout::Array(a) => match a.element.size() {
                Some(elem) if elem > 0 && stride % elem == 0 => true,
                Some(elem) if elem > 0 => a.element.absorbs_at(offset % elem, stride, depth + 1),
                _ => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> Layout {
        Layout::Struct(Struct {
            size: 16,
            fields: vec![
                Field {
                    offset: 0,
                    layout: Layout::Scalar(8),
                },
                Field {
                    offset: 8,
                    layout: Layout::Scalar(8),
                },
            ],
        })
    }

    fn points(len: Option<u64>) -> Layout {
        Layout::Array(Array {
            element: Box::new(point()),
            len,
        })
    }

    #[test]
    fn struct_cells() {
        let cells = point().cells(64).unwrap();
        assert_eq!(vec![0, 8], cells.iter().map(|c| c.offset).collect::<Vec<_>>());
    }

    #[test]
    fn array_cells_fold() {
        let cells = points(Some(10)).cells(64).unwrap();
        assert_eq!(vec![0, 8], cells.iter().map(|c| c.offset).collect::<Vec<_>>());
        assert_eq!(Some(160), points(Some(10)).size());
        assert_eq!(None, points(None).size());
    }

    #[test]
    fn field_cap() {
        assert_eq!(Err(Overflow::Fields(2)), point().cells(1));
    }

    #[test]
    fn leaves_expand_arrays() {
        assert_eq!(Some(vec![0, 8, 16, 24]), points(Some(2)).leaves(16));
        assert_eq!(None, points(Some(2)).leaves(3));
        assert_eq!(None, points(None).leaves(16));
    }

    #[test]
    fn canonical_offsets() {
        let l = points(Some(4));
        assert_eq!(Some(0), l.canonical(0));
        assert_eq!(Some(8), l.canonical(24));
        assert_eq!(Some(0), l.canonical(48));
        assert_eq!(None, l.canonical(64));
        assert_eq!(Some(8), points(None).canonical(1000));
        assert_eq!(None, Layout::Scalar(8).canonical(8));
    }

    #[test]
    fn strides() {
        let l = points(Some(4));
        assert!(l.absorbs(0, 16));
        assert!(l.absorbs(8, 32));
        assert!(!l.absorbs(0, 8));
        assert!(!point().absorbs(0, 8));
    }

    #[test]
    fn huge_arrays() {
        let l = Layout::Array(Array {
            element: Box::new(point()),
            len: Some(u64::MAX),
        });
        assert_eq!(None, l.size());
        assert_eq!(Some(8), l.canonical(u64::MAX - 7));
        assert_eq!(vec![0, 8], l.cells(64).unwrap().iter().map(|c| c.offset).collect::<Vec<_>>());
        let outer = Layout::Array(Array {
            element: Box::new(l),
            len: Some(2),
        });
        assert_eq!(None, outer.size());
        assert_eq!(None, outer.leaves(16));
    }
}

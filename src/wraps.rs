// Copyright © 2018 Cormac O'Brien.
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software
// and associated documentation files (the "Software"), to deal in the Software without
// restriction, including without limitation the rights to use, copy, modify, merge, publish,
// distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or
// substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING
// BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
// DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Field wraps.
//!
//! Some script-visible fields must mirror into host-side structure members of a different type
//! or location (a float written by script landing as a scaled short in a network structure,
//! say). A wrap maps one field cell offset to a destination byte offset inside the entity
//! record — or the entity's client record — with an optional conversion setter. The tracked
//! write paths consult the wrap table after every entity-region store.

/// Converts and stores one freshly written cell into a host structure.
///
/// The destination slice starts at the wrap's registered offset and runs to the end of the
/// record; the source is the 4-byte cell the script wrote.
pub type FieldSetter = fn(&mut [u8], &[u8; 4]);

#[derive(Clone, Copy, Debug)]
pub struct FieldWrap {
    /// Index of the wrapped field in the field table.
    pub field: usize,
    /// Absolute cell offset this wrap listens on.
    pub field_offset: usize,
    /// Mirror into the entity's client record instead of the entity record.
    pub is_client: bool,
    /// Destination byte offset within the record.
    pub struct_offset: usize,
    /// Conversion; a plain 4-byte copy if absent.
    pub setter: Option<FieldSetter>,
}

/// Sparse wrap table, indexed by field cell offset.
#[derive(Debug, Default)]
pub struct FieldWraps {
    wraps: Box<[Option<FieldWrap>]>,
}

impl FieldWraps {
    pub fn new(field_real_size: usize) -> FieldWraps {
        FieldWraps {
            wraps: vec![None; field_real_size].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.wraps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wraps.is_empty()
    }

    pub fn set(&mut self, offset: usize, wrap: FieldWrap) {
        self.wraps[offset] = Some(wrap);
    }

    pub fn get(&self, offset: usize) -> Option<&FieldWrap> {
        self.wraps.get(offset).and_then(|w| w.as_ref())
    }
}

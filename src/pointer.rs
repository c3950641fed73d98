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

//! Tagged script pointers.
//!
//! Scripts store pointers in single 32-bit cells, so the tag must be packed into the value
//! itself. Two shapes share the encoding, distinguished by the 2-bit tag in the top bits:
//!
//! ```text
//! raw:    | type: 2 | byte offset: 30           |
//! handle: | type: 2 | handle index: 10 | byte offset: 20 |
//! ```
//!
//! Raw pointers address the global slab or the entity array; handle pointers address the
//! payload of a live handle (max 1024 handles, max 1 MiB payload each).

const TAG_SHIFT: u32 = 30;

const TAG_NULL: u32 = 0;
const TAG_GLOBAL: u32 = 1;
const TAG_ENTITY: u32 = 2;
const TAG_HANDLE: u32 = 3;

const RAW_OFFSET_MASK: u32 = (1 << 30) - 1;

const HANDLE_OFFSET_BITS: u32 = 20;
const HANDLE_OFFSET_MASK: u32 = (1 << HANDLE_OFFSET_BITS) - 1;
const HANDLE_INDEX_MASK: u32 = (1 << 10) - 1;

/// A packed script pointer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Pointer(pub u32);

/// The unpacked view of a [`Pointer`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PointerKind {
    Null { offset: u32 },
    Global { offset: u32 },
    Entity { offset: u32 },
    Handle { index: u32, offset: u32 },
}

impl Pointer {
    pub fn null() -> Pointer {
        Pointer(TAG_NULL << TAG_SHIFT)
    }

    pub fn global(offset: u32) -> Pointer {
        Pointer((offset & RAW_OFFSET_MASK) | (TAG_GLOBAL << TAG_SHIFT))
    }

    pub fn entity(offset: u32) -> Pointer {
        Pointer((offset & RAW_OFFSET_MASK) | (TAG_ENTITY << TAG_SHIFT))
    }

    pub fn handle(index: u32, offset: u32) -> Pointer {
        Pointer(
            (offset & HANDLE_OFFSET_MASK)
                | ((index & HANDLE_INDEX_MASK) << HANDLE_OFFSET_BITS)
                | (TAG_HANDLE << TAG_SHIFT),
        )
    }

    pub fn kind(self) -> PointerKind {
        match self.0 >> TAG_SHIFT {
            TAG_GLOBAL => PointerKind::Global {
                offset: self.0 & RAW_OFFSET_MASK,
            },
            TAG_ENTITY => PointerKind::Entity {
                offset: self.0 & RAW_OFFSET_MASK,
            },
            TAG_HANDLE => PointerKind::Handle {
                index: (self.0 >> HANDLE_OFFSET_BITS) & HANDLE_INDEX_MASK,
                offset: self.0 & HANDLE_OFFSET_MASK,
            },
            _ => PointerKind::Null {
                offset: self.0 & RAW_OFFSET_MASK,
            },
        }
    }

    /// Advances the byte offset, staying in the same shape. Handle pointers stay in-handle.
    pub fn offset_by(self, bytes: i32) -> Pointer {
        match self.kind() {
            PointerKind::Handle { index, offset } => {
                Pointer::handle(index, offset.wrapping_add(bytes as u32))
            }
            _ => {
                let tag = self.0 & !RAW_OFFSET_MASK;
                let offset = (self.0 & RAW_OFFSET_MASK).wrapping_add(bytes as u32);
                Pointer(tag | (offset & RAW_OFFSET_MASK))
            }
        }
    }

    pub fn to_i32(self) -> i32 {
        self.0 as i32
    }

    pub fn from_i32(bits: i32) -> Pointer {
        Pointer(bits as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_roundtrip() {
        let p = Pointer::global(1234);
        assert_eq!(p.kind(), PointerKind::Global { offset: 1234 });

        let p = Pointer::entity(0x3fff_fffc);
        assert_eq!(
            p.kind(),
            PointerKind::Entity {
                offset: 0x3fff_fffc
            }
        );
    }

    #[test]
    fn test_handle_roundtrip() {
        let p = Pointer::handle(1023, 0xf_fffc);
        assert_eq!(
            p.kind(),
            PointerKind::Handle {
                index: 1023,
                offset: 0xf_fffc
            }
        );
    }

    #[test]
    fn test_null() {
        assert_eq!(Pointer::null().kind(), PointerKind::Null { offset: 0 });
        assert_eq!(Pointer::default(), Pointer::null());
    }

    #[test]
    fn test_offset() {
        let p = Pointer::global(16).offset_by(8);
        assert_eq!(p.kind(), PointerKind::Global { offset: 24 });

        let p = Pointer::handle(7, 16).offset_by(-4);
        assert_eq!(
            p.kind(),
            PointerKind::Handle {
                index: 7,
                offset: 12
            }
        );
    }

    #[test]
    fn test_negative_offset_leaves_bounds() {
        // backing up past the start of a region wraps the 30-bit offset into a value that can
        // never resolve
        let p = Pointer::entity(0).offset_by(-4);
        match p.kind() {
            PointerKind::Entity { offset } => assert_eq!(offset, RAW_OFFSET_MASK - 3),
            k => panic!("wrong kind: {:?}", k),
        }
    }

    #[test]
    fn test_cell_roundtrip() {
        let p = Pointer::handle(12, 64);
        assert_eq!(Pointer::from_i32(p.to_i32()), p);
    }
}

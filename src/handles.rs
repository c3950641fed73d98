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

//! Opaque handles.
//!
//! Hosts hand scripts typed references to objects the script language cannot express — file
//! streams, lists, sets, cvars. A handle is a 1-indexed integer (0 is null) naming a slot that
//! owns the object; slots are reused through a freelist. A handle type may optionally expose a
//! window into its payload so scripts can form pointers into it (a typed list's backing
//! storage, for instance).

use std::any::Any;

use crate::error::ProgsError;

pub const HANDLES_RESERVE: usize = 128;

/// A host object referable from script.
///
/// Dropping the box is the free hook. Implement [`HandleData::resolve_pointer`] to let
/// handle-shaped pointers dereference into the payload.
pub trait HandleData: Any {
    /// Returns `len` bytes of payload starting at `offset`, if this handle exposes its payload
    /// to the pointer model.
    fn resolve_pointer(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let _ = (offset, len);
        None
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct Slot {
    data: Option<Box<dyn HandleData>>,
}

#[derive(Default)]
pub struct Handles {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Handles {
    pub fn new() -> Handles {
        Handles {
            slots: Vec::with_capacity(HANDLES_RESERVE),
            free: Vec::new(),
        }
    }

    /// Number of slots ever allocated (live and freed).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn alloc(&mut self, data: Box<dyn HandleData>) -> i32 {
        let index = match self.free.pop() {
            Some(i) => {
                self.slots[i].data = Some(data);
                i
            }
            None => {
                if self.slots.len() == self.slots.capacity() {
                    self.slots.reserve(HANDLES_RESERVE);
                }

                self.slots.push(Slot { data: Some(data) });
                self.slots.len() - 1
            }
        };

        (index as i32) + 1
    }

    pub fn fetch(&self, id: i32) -> Result<&dyn HandleData, ProgsError> {
        if id <= 0 || id as usize > self.slots.len() {
            return Err(ProgsError::BadHandle(id));
        }

        match self.slots[(id - 1) as usize].data {
            Some(ref data) => Ok(data.as_ref()),
            None => Err(ProgsError::BadHandle(id)),
        }
    }

    pub fn fetch_mut(&mut self, id: i32) -> Result<&mut dyn HandleData, ProgsError> {
        if id <= 0 || id as usize > self.slots.len() {
            return Err(ProgsError::BadHandle(id));
        }

        match self.slots[(id - 1) as usize].data {
            Some(ref mut data) => Ok(data.as_mut()),
            None => Err(ProgsError::BadHandle(id)),
        }
    }

    /// Frees a handle, dropping its payload and recycling the slot.
    pub fn free(&mut self, id: i32) -> Result<(), ProgsError> {
        if id <= 0 || id as usize > self.slots.len() {
            return Err(ProgsError::BadHandle(id));
        }

        let slot = &mut self.slots[(id - 1) as usize];

        if slot.data.take().is_none() {
            return Err(ProgsError::BadHandle(id));
        }

        self.free.push((id - 1) as usize);
        Ok(())
    }

    /// Resolves `len` bytes at `offset` inside the payload of handle `index`.
    pub fn resolve(
        &mut self,
        index: u32,
        offset: usize,
        len: usize,
    ) -> Result<&mut [u8], ProgsError> {
        let data = self.fetch_mut(index as i32)?;

        match data.resolve_pointer(offset, len) {
            Some(bytes) if bytes.len() == len => Ok(bytes),
            Some(_) => Err(ProgsError::BadPointer(format!(
                "handle {} returned a short payload window",
                index
            ))),
            None => Err(ProgsError::BadPointer(format!(
                "handle {} has no pointer routine",
                index
            ))),
        }
    }
}

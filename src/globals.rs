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

//! The global slab.
//!
//! One contiguous array of 32-bit cells holds every global, every function's register window
//! (parameters and locals), the eight parameter slots and the return slot. The parameter and
//! return slots sit at fixed addresses below [`GLOBAL_STATIC_START`]; each parameter slot is
//! three cells wide so a vector can pass through it.

use std::error::Error;
use std::fmt;

use crate::entity::EntityId;
use crate::pointer::Pointer;
use crate::StringId;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub const GLOBAL_ADDR_NULL: u32 = 0;
pub const GLOBAL_ADDR_RETURN: u32 = 1;
pub const GLOBAL_ADDR_PARM0: u32 = 4;
pub const GLOBAL_ADDR_PARM1: u32 = 7;
pub const GLOBAL_ADDR_PARM2: u32 = 10;
pub const GLOBAL_ADDR_PARM3: u32 = 13;
pub const GLOBAL_ADDR_PARM4: u32 = 16;
pub const GLOBAL_ADDR_PARM5: u32 = 19;
pub const GLOBAL_ADDR_PARM6: u32 = 22;
pub const GLOBAL_ADDR_PARM7: u32 = 25;
pub const GLOBAL_STATIC_START: u32 = 28;

/// The address of the `i`th parameter slot.
pub fn parm_addr(i: u8) -> u32 {
    GLOBAL_ADDR_PARM0 + u32::from(i) * 3
}

#[derive(Debug)]
pub enum GlobalsError {
    Io(::std::io::Error),
    Address(isize),
    Other(String),
}

impl GlobalsError {
    pub fn with_msg<S>(msg: S) -> Self
    where
        S: AsRef<str>,
    {
        GlobalsError::Other(msg.as_ref().to_owned())
    }
}

impl fmt::Display for GlobalsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            GlobalsError::Io(ref err) => {
                write!(f, "I/O error: ")?;
                err.fmt(f)
            }
            GlobalsError::Address(val) => write!(f, "Invalid address ({})", val),
            GlobalsError::Other(ref msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for GlobalsError {}

impl From<::std::io::Error> for GlobalsError {
    fn from(error: ::std::io::Error) -> Self {
        GlobalsError::Io(error)
    }
}

#[derive(Debug)]
pub struct Globals {
    addrs: Box<[[u8; 4]]>,
}

impl Globals {
    pub fn new(addrs: Box<[[u8; 4]]>) -> Globals {
        Globals { addrs }
    }

    pub fn count(&self) -> usize {
        self.addrs.len()
    }

    /// Returns a reference to the memory at the given address.
    pub fn get_addr(&self, addr: u32) -> Result<&[u8], GlobalsError> {
        let addr = addr as usize;

        if addr >= self.addrs.len() {
            return Err(GlobalsError::Address(addr as isize));
        }

        Ok(&self.addrs[addr])
    }

    /// Returns a mutable reference to the memory at the given address.
    pub fn get_addr_mut(&mut self, addr: u32) -> Result<&mut [u8], GlobalsError> {
        let addr = addr as usize;

        if addr >= self.addrs.len() {
            return Err(GlobalsError::Address(addr as isize));
        }

        Ok(&mut self.addrs[addr])
    }

    /// Returns a copy of the memory at the given address.
    pub fn get_bytes(&self, addr: u32) -> Result<[u8; 4], GlobalsError> {
        let addr = addr as usize;

        if addr >= self.addrs.len() {
            return Err(GlobalsError::Address(addr as isize));
        }

        Ok(self.addrs[addr])
    }

    /// Writes the provided data to the memory at the given address.
    pub fn put_bytes(&mut self, val: [u8; 4], addr: u32) -> Result<(), GlobalsError> {
        let addr = addr as usize;

        if addr >= self.addrs.len() {
            return Err(GlobalsError::Address(addr as isize));
        }

        self.addrs[addr] = val;
        Ok(())
    }

    /// Loads an `i32` from the given virtual address.
    pub fn get_int(&self, addr: u32) -> Result<i32, GlobalsError> {
        Ok(self.get_addr(addr)?.read_i32::<LittleEndian>()?)
    }

    /// Stores an `i32` at the given virtual address.
    pub fn put_int(&mut self, val: i32, addr: u32) -> Result<(), GlobalsError> {
        self.get_addr_mut(addr)?.write_i32::<LittleEndian>(val)?;
        Ok(())
    }

    /// Loads an `f32` from the given virtual address.
    pub fn get_float(&self, addr: u32) -> Result<f32, GlobalsError> {
        Ok(self.get_addr(addr)?.read_f32::<LittleEndian>()?)
    }

    /// Stores an `f32` at the given virtual address.
    pub fn put_float(&mut self, val: f32, addr: u32) -> Result<(), GlobalsError> {
        self.get_addr_mut(addr)?.write_f32::<LittleEndian>(val)?;
        Ok(())
    }

    /// Loads an `[f32; 3]` from the given virtual address.
    pub fn get_vector(&self, addr: u32) -> Result<[f32; 3], GlobalsError> {
        let mut v = [0.0; 3];

        for (i, c) in v.iter_mut().enumerate() {
            *c = self.get_float(addr + i as u32)?;
        }

        Ok(v)
    }

    /// Stores an `[f32; 3]` at the given virtual address.
    pub fn put_vector(&mut self, val: [f32; 3], addr: u32) -> Result<(), GlobalsError> {
        for (i, c) in val.iter().enumerate() {
            self.put_float(*c, addr + i as u32)?;
        }

        Ok(())
    }

    /// Loads a `StringId` from the given virtual address.
    pub fn string_id(&self, addr: u32) -> Result<StringId, GlobalsError> {
        Ok(StringId(self.get_int(addr)?))
    }

    pub fn put_string_id(&mut self, val: StringId, addr: u32) -> Result<(), GlobalsError> {
        self.put_int(val.0, addr)
    }

    /// Loads an `EntityId` from the given virtual address.
    pub fn entity_id(&self, addr: u32) -> Result<EntityId, GlobalsError> {
        Ok(EntityId(self.get_int(addr)?))
    }

    pub fn put_entity_id(&mut self, val: EntityId, addr: u32) -> Result<(), GlobalsError> {
        self.put_int(val.0, addr)
    }

    /// Loads a function id (as stored by scripts) from the given virtual address.
    pub fn function_id(&self, addr: u32) -> Result<i32, GlobalsError> {
        self.get_int(addr)
    }

    /// Loads a packed pointer from the given virtual address.
    pub fn pointer(&self, addr: u32) -> Result<Pointer, GlobalsError> {
        Ok(Pointer::from_i32(self.get_int(addr)?))
    }

    pub fn put_pointer(&mut self, val: Pointer, addr: u32) -> Result<(), GlobalsError> {
        self.put_int(val.to_i32(), addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn globals(count: usize) -> Globals {
        Globals::new(vec![[0; 4]; count].into_boxed_slice())
    }

    #[test]
    fn test_float_roundtrip() {
        let mut g = globals(32);
        g.put_float(365.0, 28).unwrap();
        assert_eq!(g.get_float(28).unwrap(), 365.0);
    }

    #[test]
    fn test_vector_roundtrip() {
        let mut g = globals(32);
        g.put_vector([1.0, -2.0, 3.5], 28).unwrap();
        assert_eq!(g.get_vector(28).unwrap(), [1.0, -2.0, 3.5]);
        assert_eq!(g.get_float(29).unwrap(), -2.0);
    }

    #[test]
    fn test_out_of_range() {
        let g = globals(8);
        assert!(g.get_bytes(8).is_err());
        assert!(g.get_bytes(7).is_ok());
    }

    #[test]
    fn test_parm_addrs() {
        assert_eq!(parm_addr(0), GLOBAL_ADDR_PARM0);
        assert_eq!(parm_addr(7), GLOBAL_ADDR_PARM7);
    }
}

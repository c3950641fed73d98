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

//! An embeddable QuakeC bytecode virtual machine.
//!
//! # Loading
//!
//! Compiled modules are typically loaded from `progs.dat`. A module begins with a fixed-size
//! header:
//!
//! ```text
//! version: u32,           // 6 (classic) or 7 (extended)
//! crc: u16,
//! skip: u16,
//! ```
//!
//! followed by six section descriptors, each an `(offset, count)` pair of `u32`s, covering (in
//! order) statements, global definitions, field definitions, functions, string data and the
//! global slab. Offsets are in bytes from the beginning of the file and are not guaranteed to be
//! in order.
//!
//! The extended header continues with an advisory entity-field count, two file offsets and two
//! further section descriptors (all unused here), a compression flag (rejected if set), and a
//! secondary version tag which selects between the 16-bit and 32-bit statement/definition
//! encodings.
//!
//! ## Statements
//!
//! Each statement is a three-address instruction `(opcode, a, b, c)` whose operands are indices
//! into the global slab. In the 16-bit encoding a statement is four `u16`s (operands are signed
//! and sign-extended on load); in the 32-bit encoding, four `u32`s. Statement indices serve as
//! program counters.
//!
//! ## Functions
//!
//! ```text
//! statement_id: i32,        // > 0: entry point; 0: unresolved builtin; < 0: legacy builtin
//! first_arg: i32,           // start of the function's register window
//! num_args_and_locals: i32, // size of the register window
//! profile: i32,             // unused
//! fnc_name_ofs: i32,        // offset of function name in string data
//! srcfile_name_ofs: i32,    // offset of source file name in string data
//! arg_count: i32,           // number of arguments (max. 8)
//! arg_sizes: [u8; 8],       // sizes of each argument, in cells
//! ```
//!
//! Builtins are resolved by name at run time via [`Vm::register_builtin`]; legacy
//! negative-indexed builtins are accepted with a warning and treated as unresolved.
//!
//! # Execution
//!
//! The host drives the machine through [`Vm`]: load a module, register system fields, builtins
//! and field wraps, run the layout pass with [`Vm::check`], then call [`Vm::execute`]. Execution
//! is synchronous and re-entrant only through builtins calling back into the machine.

#[macro_use]
extern crate log;
#[macro_use]
extern crate num_derive;

pub mod entity;
pub mod error;
pub mod exec;
pub mod functions;
pub mod globals;
pub mod handles;
pub mod load;
pub mod ops;
pub mod pointer;
pub mod strings;
pub mod vm;
pub mod wraps;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::entity::{EntityConfig, EntityId};
pub use crate::error::ProgsError;
pub use crate::functions::{Builtin, FunctionDef, FunctionKind};
pub use crate::handles::HandleData;
pub use crate::pointer::{Pointer, PointerKind};
pub use crate::vm::Vm;
pub use crate::wraps::FieldSetter;

use num::FromPrimitive;

/// A string id.
///
/// Zero is the empty string. Positive values are byte offsets into the module's static string
/// data; negative values identify ref-counted dynamic strings (see [`strings`]).
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct StringId(pub i32);

pub const STRING_EMPTY: StringId = StringId(0);

impl StringId {
    pub fn is_dynamic(self) -> bool {
        self.0 < 0
    }

    /// The index of a dynamic string in the dynamic-string table.
    pub fn dynamic_index(self) -> usize {
        debug_assert!(self.is_dynamic());
        (-(self.0 as i64) - 1) as usize
    }

    pub fn from_dynamic_index(index: usize) -> StringId {
        StringId(-((index as i32) + 1))
    }
}

/// A function id: an index into the module's function table.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct FunctionId(pub usize);

/// Value types of definitions and fields.
#[derive(Copy, Clone, Debug, FromPrimitive, PartialEq)]
#[repr(u16)]
pub enum Type {
    QVoid = 0,
    QString = 1,
    QFloat = 2,
    QVector = 3,
    QEntity = 4,
    QField = 5,
    QFunction = 6,
    QPointer = 7,
    QInt = 8,
}

/// Flag bit set on definition types that should be persisted in save games.
pub const SAVE_GLOBAL: u16 = 1 << 15;

impl Type {
    pub fn from_disk(value: u16) -> Result<(Type, bool), ProgsError> {
        let save = value & SAVE_GLOBAL != 0;
        match Type::from_u16(value & !SAVE_GLOBAL) {
            Some(t) => Ok((t, save)),
            None => Err(ProgsError::Load(format!("unknown type tag {:#x}", value))),
        }
    }

    /// The number of cells a value of this type occupies.
    pub fn span(self) -> usize {
        match self {
            Type::QVector => 3,
            _ => 1,
        }
    }
}

/// A named, typed definition: a global (with a slab index) or an entity field (with a cell
/// offset inside the entity record, once the layout pass has run).
#[derive(Debug)]
pub struct Def {
    pub save: bool,
    pub type_: Type,
    pub offset: u32,
    pub name_id: StringId,
}

/// The address of a single cell in one of the two tracked memory regions.
///
/// The string subsystem keys its storage-slot map on these, and the tracked write paths use
/// them to name their destinations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CellAddr {
    /// A cell index into the global slab.
    Global(u32),
    /// A cell index into the entity array.
    Entity(u32),
}

impl CellAddr {
    pub fn offset(self, cells: usize) -> CellAddr {
        match self {
            CellAddr::Global(i) => CellAddr::Global(i + cells as u32),
            CellAddr::Entity(i) => CellAddr::Entity(i + cells as u32),
        }
    }
}

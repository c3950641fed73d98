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

use crate::error::ProgsError;
use crate::vm::Vm;
use crate::StringId;

pub const MAX_ARGS: usize = 8;

/// How a function is entered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FunctionKind {
    /// A scripted function; the value is the statement index at which execution begins.
    QuakeC(usize),
    /// A native function; the value is a slot in the builtin registry.
    BuiltIn(usize),
    /// A native function the host has not registered yet. Calling it is fatal.
    Unresolved,
}

#[derive(Debug)]
pub struct FunctionDef {
    pub kind: FunctionKind,
    pub first_arg: u32,
    pub num_args_and_locals: usize,
    pub name_id: StringId,
    pub file_id: StringId,
    pub argc: usize,
    pub argsz: [u8; MAX_ARGS],
}

impl FunctionDef {
    /// Whether entering this function clobbers a register window that must be saved.
    pub fn has_locals(&self) -> bool {
        self.num_args_and_locals > 0
    }
}

/// A native function callable from script.
///
/// Builtins pull their arguments with the `Vm::argv_*` accessors and deliver results with
/// `Vm::return_*`; the live argument count is `Vm::argc`.
pub type Builtin = fn(&mut Vm) -> Result<(), ProgsError>;

/// The builtin registry.
///
/// The module declares how many of its functions are unresolved natives; that count fixes the
/// registry size up front, and registering past it is fatal.
pub struct BuiltinList {
    list: Vec<Option<Builtin>>,
    registered: usize,
}

impl BuiltinList {
    pub fn new(count: usize) -> BuiltinList {
        BuiltinList {
            list: vec![None; count],
            registered: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.list.len()
    }

    /// Claims the next free slot for `builtin`, returning the slot index.
    pub fn register(&mut self, builtin: Builtin) -> Result<usize, ProgsError> {
        if self.registered == self.list.len() {
            return Err(ProgsError::BuiltinOverflow);
        }

        let slot = self.registered;
        self.list[slot] = Some(builtin);
        self.registered += 1;

        Ok(slot)
    }

    pub fn get(&self, slot: usize) -> Option<Builtin> {
        self.list.get(slot).copied().flatten()
    }
}

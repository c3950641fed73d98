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

use std::error::Error;
use std::fmt;

use crate::globals::GlobalsError;

/// Faults raised by the virtual machine.
///
/// All of these are fatal to the current execution: the frame stack is left as it was at the
/// point of the fault, so the host can still format a trace with `Vm::stack_trace` before
/// discarding the machine or its state.
#[derive(Debug)]
pub enum ProgsError {
    Io(::std::io::Error),
    Globals(GlobalsError),
    /// The module file could not be parsed or validated.
    Load(String),
    /// A pointer failed to resolve to an addressable region.
    BadPointer(String),
    /// A call targeted function 0, an unresolved builtin, or an out-of-range id.
    BadFunction(String),
    /// A return was executed with no frame on the stack.
    StackUnderflow,
    /// More builtins were registered than the module declares.
    BuiltinOverflow,
    /// A `BOUNDCHECK` instruction failed.
    BoundsCheck { value: u32, min: u32, max: u32 },
    /// A handle id did not name a live handle.
    BadHandle(i32),
    Other(String),
}

impl ProgsError {
    pub fn with_msg<S>(msg: S) -> Self
    where
        S: AsRef<str>,
    {
        ProgsError::Other(msg.as_ref().to_owned())
    }
}

impl fmt::Display for ProgsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::ProgsError::*;
        match *self {
            Io(ref err) => {
                write!(f, "I/O error: ")?;
                err.fmt(f)
            }
            Globals(ref err) => {
                write!(f, "Globals error: ")?;
                err.fmt(f)
            }
            Load(ref msg) => write!(f, "Load error: {}", msg),
            BadPointer(ref msg) => write!(f, "Invalid address: {}", msg),
            BadFunction(ref msg) => write!(f, "Bad function: {}", msg),
            StackUnderflow => write!(f, "Stack underflow"),
            BuiltinOverflow => write!(f, "Builtin list overrun"),
            BoundsCheck { value, min, max } => {
                write!(f, "Bounds check failed: {} not in [{}, {})", value, min, max)
            }
            BadHandle(id) => write!(f, "Invalid handle ID {}", id),
            Other(ref msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for ProgsError {}

impl From<::std::io::Error> for ProgsError {
    fn from(error: ::std::io::Error) -> Self {
        ProgsError::Io(error)
    }
}

impl From<GlobalsError> for ProgsError {
    fn from(error: GlobalsError) -> Self {
        ProgsError::Globals(error)
    }
}

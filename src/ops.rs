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

use num::FromPrimitive;

use crate::error::ProgsError;

/// The instruction set.
///
/// Discriminants follow the on-disk numbering, which includes a number of extended opcodes this
/// interpreter does not execute; statements using those are rejected at load time. The three
/// intrinsics at the end never appear on disk — they are substituted for known builtin calls
/// during the layout pass.
#[derive(Copy, Clone, Debug, Eq, FromPrimitive, PartialEq)]
#[repr(u16)]
pub enum Opcode {
    Done = 0,
    MulF = 1,
    MulV = 2,
    MulFV = 3,
    MulVF = 4,
    DivF = 5,
    AddF = 6,
    AddV = 7,
    SubF = 8,
    SubV = 9,

    EqF = 10,
    EqV = 11,
    EqS = 12,
    EqE = 13,
    EqFnc = 14,

    NeF = 15,
    NeV = 16,
    NeS = 17,
    NeE = 18,
    NeFnc = 19,

    LeF = 20,
    GeF = 21,
    LtF = 22,
    GtF = 23,

    LoadF = 24,
    LoadV = 25,
    LoadS = 26,
    LoadEnt = 27,
    LoadFld = 28,
    LoadFnc = 29,

    Address = 30,

    StoreF = 31,
    StoreV = 32,
    StoreS = 33,
    StoreEnt = 34,
    StoreFld = 35,
    StoreFnc = 36,

    StorePF = 37,
    StorePV = 38,
    StorePS = 39,
    StorePEnt = 40,
    StorePFld = 41,
    StorePFnc = 42,

    Return = 43,
    NotF = 44,
    NotV = 45,
    NotS = 46,
    NotEnt = 47,
    NotFnc = 48,
    IfI = 49,
    IfNotI = 50,
    Call0 = 51,
    Call1 = 52,
    Call2 = 53,
    Call3 = 54,
    Call4 = 55,
    Call5 = 56,
    Call6 = 57,
    Call7 = 58,
    Call8 = 59,
    State = 60,
    Goto = 61,
    AndF = 62,
    OrF = 63,

    BitAndF = 64,
    BitOrF = 65,

    MulStoreF = 66,
    MulStoreVF = 67,
    MulStorePF = 68,
    MulStorePVF = 69,

    DivStoreF = 70,
    DivStorePF = 71,

    AddStoreF = 72,
    AddStoreV = 73,
    AddStorePF = 74,
    AddStorePV = 75,

    SubStoreF = 76,
    SubStoreV = 77,
    SubStorePF = 78,
    SubStorePV = 79,

    FetchGblF = 80,
    FetchGblV = 81,
    FetchGblS = 82,
    FetchGblE = 83,
    FetchGblFnc = 84,

    CState = 85,
    CWState = 86,

    ThinkTime = 87,

    BitSetStoreF = 88,
    BitSetStorePF = 89,
    BitClrStoreF = 90,
    BitClrStorePF = 91,

    Rand0 = 92,
    Rand1 = 93,
    Rand2 = 94,
    RandV0 = 95,
    RandV1 = 96,
    RandV2 = 97,

    SwitchF = 98,
    SwitchV = 99,
    SwitchS = 100,
    SwitchE = 101,
    SwitchFnc = 102,

    Case = 103,
    CaseRange = 104,

    Call1H = 105,
    Call2H = 106,
    Call3H = 107,
    Call4H = 108,
    Call5H = 109,
    Call6H = 110,
    Call7H = 111,
    Call8H = 112,

    StoreI = 113,
    StoreIF = 114,
    StoreFI = 115,

    AddI = 116,
    AddFI = 117,
    AddIF = 118,

    SubI = 119,
    SubFI = 120,
    SubIF = 121,

    ConvItoF = 122,
    ConvFtoI = 123,
    CpItoF = 124,
    CpFtoI = 125,
    LoadI = 126,
    StorePI = 127,
    StorePIF = 128,
    StorePFI = 129,

    BitAndI = 130,
    BitOrI = 131,

    MulI = 132,
    DivI = 133,
    EqI = 134,
    NeI = 135,

    IfNotS = 136,
    IfS = 137,

    NotI = 138,

    DivVF = 139,

    BitXorI = 140,
    RShiftI = 141,
    LShiftI = 142,

    GlobalAddress = 143,
    AddPIW = 144,

    LoadAF = 145,
    LoadAV = 146,
    LoadAS = 147,
    LoadAEnt = 148,
    LoadAFld = 149,
    LoadAFnc = 150,
    LoadAI = 151,

    StoreP = 152,
    LoadP = 153,

    LoadPF = 154,
    LoadPV = 155,
    LoadPS = 156,
    LoadPEnt = 157,
    LoadPFld = 158,
    LoadPFnc = 159,
    LoadPI = 160,

    LeI = 161,
    GeI = 162,
    LtI = 163,
    GtI = 164,

    LeIF = 165,
    GeIF = 166,
    LtIF = 167,
    GtIF = 168,

    LeFI = 169,
    GeFI = 170,
    LtFI = 171,
    GtFI = 172,

    EqIF = 173,
    EqFI = 174,

    AddSF = 175,
    SubS = 176,
    StorePC = 177,
    LoadPC = 178,

    MulIF = 179,
    MulFI = 180,
    MulVI = 181,
    MulIV = 182,
    DivIF = 183,
    DivFI = 184,
    BitAndIF = 185,
    BitOrIF = 186,
    BitAndFI = 187,
    BitOrFI = 188,
    AndI = 189,
    OrI = 190,
    AndIF = 191,
    OrIF = 192,
    AndFI = 193,
    OrFI = 194,
    NeIF = 195,
    NeFI = 196,

    GStorePI = 197,
    GStorePF = 198,
    GStorePEnt = 199,
    GStorePFld = 200,
    GStorePS = 201,
    GStorePFnc = 202,
    GStorePV = 203,
    GAddress = 204,
    GLoadI = 205,
    GLoadF = 206,
    GLoadFld = 207,
    GLoadEnt = 208,
    GLoadS = 209,
    GLoadFnc = 210,

    BoundCheck = 211,
    Unused = 212,
    Push = 213,
    Pop = 214,

    SwitchI = 215,
    GLoadV = 216,
    IfF = 217,
    IfNotF = 218,

    // store a value into an entity field named by id
    StorefV = 219,
    StorefF = 220,
    StorefS = 221,
    StorefI = 222,

    StorePB = 223,
    LoadPB = 224,

    IntrinSqrt = 225,
    IntrinSin = 226,
    IntrinCos = 227,
}

/// The first opcode id past the on-disk instruction set.
pub const OP_NUMOPS: u16 = Opcode::IntrinSqrt as u16;

impl Opcode {
    /// Whether the interpreter has an implementation for this opcode.
    ///
    /// Mirrors the dispatch table: extended opcodes without semantics here (the compound
    /// non-pointer stores, global-remapped loads/stores, switch/case, and a few others) are
    /// valid ids but cannot be executed, and statements using them fail the load-time scan.
    pub fn implemented(self) -> bool {
        use self::Opcode::*;
        !matches!(
            self,
            State
                | MulStoreF
                | MulStoreVF
                | DivStoreF
                | AddStoreF
                | AddStoreV
                | SubStoreF
                | SubStoreV
                | FetchGblF
                | FetchGblV
                | FetchGblS
                | FetchGblE
                | FetchGblFnc
                | CState
                | CWState
                | ThinkTime
                | BitSetStoreF
                | BitSetStorePF
                | BitClrStoreF
                | BitClrStorePF
                | SwitchF
                | SwitchV
                | SwitchS
                | SwitchE
                | SwitchFnc
                | Case
                | CaseRange
                | AddSF
                | SubS
                | StorePC
                | GStorePI
                | GStorePF
                | GStorePEnt
                | GStorePFld
                | GStorePS
                | GStorePFnc
                | GStorePV
                | GAddress
                | GLoadI
                | GLoadF
                | GLoadFld
                | GLoadEnt
                | GLoadS
                | GLoadFnc
                | Unused
                | Push
                | Pop
                | SwitchI
                | GLoadV
                | StorePB
        )
    }
}

/// A three-address instruction, normalized to the 32-bit shape.
#[derive(Copy, Clone, Debug)]
pub struct Statement {
    pub opcode: Opcode,
    pub a: u32,
    pub b: u32,
    pub c: u32,
}

impl Statement {
    pub fn new(op: u32, a: u32, b: u32, c: u32) -> Result<Statement, ProgsError> {
        if op >= u32::from(OP_NUMOPS) {
            return Err(ProgsError::Load(format!("bad opcode {:#x}", op)));
        }

        let opcode = match Opcode::from_u32(op) {
            Some(o) => o,
            None => return Err(ProgsError::Load(format!("bad opcode {:#x}", op))),
        };

        if !opcode.implemented() {
            return Err(ProgsError::Load(format!(
                "opcode invalid or not implemented: {:?}",
                opcode
            )));
        }

        Ok(Statement { opcode, a, b, c })
    }

    /// The signed 16-bit view of an operand, used by the branch instructions.
    pub fn branch_offset(arg: u32) -> i16 {
        arg as u16 as i16
    }
}

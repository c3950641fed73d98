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

//! In-memory module images for tests.
//!
//! Assembles a syntactically valid module the same way a compiler would lay one out: statement
//! 0 and function 0 are dummies, string data leads with the empty string, and the mandatory
//! `strcasesensitive` int definition is pinned to the last global cell (value 1).

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::load::{PROGS_FTE, PROGS_Q1, PROG_SECONDARYVERSION16, PROG_SECONDARYVERSION32};
use crate::ops::Opcode;
use crate::vm::Vm;
use crate::Type;

struct FnRecord {
    id: i32,
    first_arg: u32,
    locals: u32,
    name: i32,
    file: i32,
    argc: u32,
    argsz: [u8; 8],
}

pub(crate) struct ModuleBuilder {
    blob: Vec<u8>,
    statements: Vec<(u32, u32, u32, u32)>,
    defs: Vec<(u16, u32, i32)>,
    fields: Vec<(u16, u32, i32)>,
    functions: Vec<FnRecord>,
    globals: Vec<[u8; 4]>,
}

impl ModuleBuilder {
    pub fn new(global_count: usize) -> ModuleBuilder {
        assert!(global_count >= 32);

        let mut b = ModuleBuilder {
            blob: vec![0],
            statements: vec![(Opcode::Done as u32, 0, 0, 0)],
            defs: Vec::new(),
            fields: vec![(Type::QVoid as u16, 0, 0)],
            functions: Vec::new(),
            globals: vec![[0; 4]; global_count],
        };

        b.functions.push(FnRecord {
            id: 0,
            first_arg: 0,
            locals: 0,
            name: 0,
            file: 0,
            argc: 0,
            argsz: [0; 8],
        });

        let strcase = b.intern("strcasesensitive");
        let idx = (global_count - 1) as u32;
        b.defs.push((Type::QInt as u16, idx, strcase));
        b.set_global_i32(idx as usize, 1);

        b
    }

    /// The global cell holding the `strcasesensitive` flag.
    pub fn strcase_global(&self) -> u32 {
        (self.globals.len() - 1) as u32
    }

    pub fn intern(&mut self, s: &str) -> i32 {
        let ofs = self.blob.len() as i32;
        self.blob.extend_from_slice(s.as_bytes());
        self.blob.push(0);
        ofs
    }

    /// Index the next pushed statement will occupy.
    pub fn next_statement(&self) -> usize {
        self.statements.len()
    }

    pub fn statement(&mut self, op: Opcode, a: u32, b: u32, c: u32) -> usize {
        self.statements.push((op as u32, a, b, c));
        self.statements.len() - 1
    }

    pub fn global_def(&mut self, name: &str, type_: Type, offset: u32) {
        let n = self.intern(name);
        self.defs.push((type_ as u16, offset, n));
    }

    /// Declares an entity field along with its `TYPE_FIELD` definition; `def_global` is the
    /// global cell (three for vectors) that will receive the runtime offset.
    pub fn field(&mut self, name: &str, type_: Type, def_global: u32) {
        let n = self.intern(name);
        self.fields.push((type_ as u16, 0, n));
        self.defs.push((Type::QField as u16, def_global, n));
    }

    /// Declares a function. `entry > 0` is the statement index where execution begins;
    /// `entry == 0` declares a native to be resolved by name.
    pub fn function(
        &mut self,
        name: &str,
        entry: i32,
        first_arg: u32,
        locals: u32,
        argsz: &[u8],
    ) -> i32 {
        let n = self.intern(name);
        let mut sz = [0u8; 8];
        sz[..argsz.len()].copy_from_slice(argsz);

        self.functions.push(FnRecord {
            id: entry,
            first_arg,
            locals,
            name: n,
            file: 0,
            argc: argsz.len() as u32,
            argsz: sz,
        });

        (self.functions.len() - 1) as i32
    }

    pub fn set_global_i32(&mut self, idx: usize, v: i32) {
        LittleEndian::write_i32(&mut self.globals[idx], v);
    }

    pub fn set_global_f32(&mut self, idx: usize, v: f32) {
        LittleEndian::write_f32(&mut self.globals[idx], v);
    }

    fn header_size() -> usize {
        // version + crc/skip + 6 lumps + entityfields + 2 file offsets + 2 lumps + compression
        // flag + secondary version
        4 + 4 + 48 + 4 + 8 + 16 + 4 + 4
    }

    /// Emits the 32-bit (version 7) encoding.
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();

        let statements_ofs = Self::header_size();
        let statements_len = self.statements.len() * 16;
        let defs_ofs = statements_ofs + statements_len;
        let defs_len = self.defs.len() * 12;
        let fields_ofs = defs_ofs + defs_len;
        let fields_len = self.fields.len() * 12;
        let functions_ofs = fields_ofs + fields_len;
        let functions_len = self.functions.len() * 36;
        let strings_ofs = functions_ofs + functions_len;
        let strings_len = self.blob.len();
        let globals_ofs = strings_ofs + strings_len;

        self.write_header(
            &mut out,
            PROGS_FTE,
            PROG_SECONDARYVERSION32,
            statements_ofs,
            defs_ofs,
            fields_ofs,
            functions_ofs,
            strings_ofs,
            globals_ofs,
        );

        for &(op, a, b, c) in &self.statements {
            out.write_u32::<LittleEndian>(op).unwrap();
            out.write_u32::<LittleEndian>(a).unwrap();
            out.write_u32::<LittleEndian>(b).unwrap();
            out.write_u32::<LittleEndian>(c).unwrap();
        }

        for &(t, ofs, name) in &self.defs {
            out.write_u32::<LittleEndian>(u32::from(t)).unwrap();
            out.write_u32::<LittleEndian>(ofs).unwrap();
            out.write_i32::<LittleEndian>(name).unwrap();
        }

        for &(t, ofs, name) in &self.fields {
            out.write_u32::<LittleEndian>(u32::from(t)).unwrap();
            out.write_u32::<LittleEndian>(ofs).unwrap();
            out.write_i32::<LittleEndian>(name).unwrap();
        }

        self.write_functions(&mut out);

        out.extend_from_slice(&self.blob);

        for cell in &self.globals {
            out.extend_from_slice(cell);
        }

        out
    }

    /// Emits the classic 16-bit (version 6) encoding. Operands are truncated to 16 bits.
    pub fn build_v6(&self) -> Vec<u8> {
        let mut out = Vec::new();

        let statements_ofs = Self::header_size();
        let statements_len = self.statements.len() * 8;
        let defs_ofs = statements_ofs + statements_len;
        let defs_len = self.defs.len() * 8;
        let fields_ofs = defs_ofs + defs_len;
        let fields_len = self.fields.len() * 8;
        let functions_ofs = fields_ofs + fields_len;
        let functions_len = self.functions.len() * 36;
        let strings_ofs = functions_ofs + functions_len;
        let strings_len = self.blob.len();
        let globals_ofs = strings_ofs + strings_len;

        self.write_header(
            &mut out,
            PROGS_Q1,
            PROG_SECONDARYVERSION16,
            statements_ofs,
            defs_ofs,
            fields_ofs,
            functions_ofs,
            strings_ofs,
            globals_ofs,
        );

        for &(op, a, b, c) in &self.statements {
            out.write_u16::<LittleEndian>(op as u16).unwrap();
            out.write_u16::<LittleEndian>(a as u16).unwrap();
            out.write_u16::<LittleEndian>(b as u16).unwrap();
            out.write_u16::<LittleEndian>(c as u16).unwrap();
        }

        for &(t, ofs, name) in &self.defs {
            out.write_u16::<LittleEndian>(t).unwrap();
            out.write_u16::<LittleEndian>(ofs as u16).unwrap();
            out.write_i32::<LittleEndian>(name).unwrap();
        }

        for &(t, ofs, name) in &self.fields {
            out.write_u16::<LittleEndian>(t).unwrap();
            out.write_u16::<LittleEndian>(ofs as u16).unwrap();
            out.write_i32::<LittleEndian>(name).unwrap();
        }

        self.write_functions(&mut out);

        out.extend_from_slice(&self.blob);

        for cell in &self.globals {
            out.extend_from_slice(cell);
        }

        out
    }

    #[allow(clippy::too_many_arguments)]
    fn write_header(
        &self,
        out: &mut Vec<u8>,
        version: u32,
        secondary: u32,
        statements_ofs: usize,
        defs_ofs: usize,
        fields_ofs: usize,
        functions_ofs: usize,
        strings_ofs: usize,
        globals_ofs: usize,
    ) {
        out.write_u32::<LittleEndian>(version).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap(); // crc
        out.write_u16::<LittleEndian>(0).unwrap(); // skip

        let lumps = [
            (statements_ofs, self.statements.len()),
            (defs_ofs, self.defs.len()),
            (fields_ofs, self.fields.len()),
            (functions_ofs, self.functions.len()),
            (strings_ofs, self.blob.len()),
            (globals_ofs, self.globals.len()),
        ];

        for &(ofs, count) in &lumps {
            out.write_u32::<LittleEndian>(ofs as u32).unwrap();
            out.write_u32::<LittleEndian>(count as u32).unwrap();
        }

        out.write_u32::<LittleEndian>(0).unwrap(); // entityfields (advisory)
        out.write_u32::<LittleEndian>(0).unwrap(); // ofs_files
        out.write_u32::<LittleEndian>(0).unwrap(); // ofs_linenums
        out.write_u32::<LittleEndian>(0).unwrap(); // bodyless funcs
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap(); // types
        out.write_u32::<LittleEndian>(0).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap(); // blockscompressed
        out.write_u32::<LittleEndian>(secondary).unwrap();
    }

    fn write_functions(&self, out: &mut Vec<u8>) {
        for f in &self.functions {
            out.write_i32::<LittleEndian>(f.id).unwrap();
            out.write_u32::<LittleEndian>(f.first_arg).unwrap();
            out.write_u32::<LittleEndian>(f.locals).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap(); // profile
            out.write_i32::<LittleEndian>(f.name).unwrap();
            out.write_i32::<LittleEndian>(f.file).unwrap();
            out.write_u32::<LittleEndian>(f.argc).unwrap();
            out.extend_from_slice(&f.argsz);
        }
    }

    pub fn load(&self) -> Vm {
        Vm::from_bytes("test", &self.build()).expect("test module failed to load")
    }
}

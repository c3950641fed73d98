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

//! Module loading.
//!
//! See the crate docs for the file layout. Loading populates every immutable table, builds the
//! name and suffix hash indices, counts the builtin slots the host may register, and validates
//! each statement's opcode; the layout pass (`Vm::check`) runs separately once the host has
//! registered its system fields.

use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::entity::{Entities, EntityConfig};
use crate::error::ProgsError;
use crate::exec::{ExecState, LOCALS_FIX};
use crate::functions::{BuiltinList, FunctionDef, FunctionKind, MAX_ARGS};
use crate::globals::{Globals, GLOBAL_STATIC_START};
use crate::handles::Handles;
use crate::ops::Statement;
use crate::strings::{hash_string, StringTable};
use crate::vm::Vm;
use crate::wraps::FieldWraps;
use crate::{Def, StringId, Type, STRING_EMPTY};

pub(crate) const PROGS_Q1: u32 = 6;
pub(crate) const PROGS_FTE: u32 = 7;

pub(crate) const PROG_SECONDARYVERSION16: u32 =
    u32::from_le_bytes(*b"1FTE") ^ u32::from_le_bytes(*b"PROG");
pub(crate) const PROG_SECONDARYVERSION32: u32 =
    u32::from_le_bytes(*b"1FTE") ^ u32::from_le_bytes(*b"32B ");

const LNO_MAGIC: i32 = 0x464f_4e4c; // "LNOF"
const LNO_VERSION: i32 = 1;

#[derive(Copy, Clone, Debug, Default)]
struct Lump {
    offset: usize,
    count: usize,
}

fn read_lump<R: Read>(src: &mut R) -> Result<Lump, ProgsError> {
    Ok(Lump {
        offset: src.read_u32::<LittleEndian>()? as usize,
        count: src.read_u32::<LittleEndian>()? as usize,
    })
}

struct Header {
    version: u32,
    statement: Lump,
    definition: Lump,
    field: Lump,
    function: Lump,
    string: Lump,
    globals: Lump,
    blockscompressed: u32,
    secondary_version: u32,
}

impl Header {
    fn read<R: Read>(src: &mut R) -> Result<Header, ProgsError> {
        let version = src.read_u32::<LittleEndian>()?;
        let _crc = src.read_u16::<LittleEndian>()?;
        let _skip = src.read_u16::<LittleEndian>()?;

        let statement = read_lump(src)?;
        let definition = read_lump(src)?;
        let field = read_lump(src)?;
        let function = read_lump(src)?;
        let string = read_lump(src)?;
        let globals = read_lump(src)?;

        let _entityfields = src.read_u32::<LittleEndian>()?;
        let _ofs_files = src.read_u32::<LittleEndian>()?;
        let _ofs_linenums = src.read_u32::<LittleEndian>()?;
        let _bodyless_funcs = read_lump(src)?;
        let _types = read_lump(src)?;

        let blockscompressed = src.read_u32::<LittleEndian>()?;
        let secondary_version = src.read_u32::<LittleEndian>()?;

        Ok(Header {
            version,
            statement,
            definition,
            field,
            function,
            string,
            globals,
            blockscompressed,
            secondary_version,
        })
    }

    /// Whether statements and definitions use the 32-bit encoding.
    fn wide(&self) -> bool {
        self.version == PROGS_FTE && self.secondary_version == PROG_SECONDARYVERSION32
    }
}

fn load_statements<R: Read + Seek>(
    src: &mut R,
    header: &Header,
) -> Result<Vec<Statement>, ProgsError> {
    src.seek(SeekFrom::Start(header.statement.offset as u64))?;

    let mut statements = Vec::with_capacity(header.statement.count);

    for _ in 0..header.statement.count {
        let statement = if header.wide() {
            Statement::new(
                src.read_u32::<LittleEndian>()?,
                src.read_u32::<LittleEndian>()?,
                src.read_u32::<LittleEndian>()?,
                src.read_u32::<LittleEndian>()?,
            )?
        } else {
            // operands are signed in the classic encoding
            let op = src.read_u16::<LittleEndian>()?;
            let a = src.read_i16::<LittleEndian>()?;
            let b = src.read_i16::<LittleEndian>()?;
            let c = src.read_i16::<LittleEndian>()?;

            Statement::new(
                u32::from(op),
                a as i32 as u32,
                b as i32 as u32,
                c as i32 as u32,
            )?
        };

        statements.push(statement);
    }

    Ok(statements)
}

fn load_definitions<R: Read + Seek>(
    src: &mut R,
    lump: &Lump,
    wide: bool,
    strings: &StringTable,
    allow_save: bool,
) -> Result<Vec<Def>, ProgsError> {
    src.seek(SeekFrom::Start(lump.offset as u64))?;

    let mut defs = Vec::with_capacity(lump.count);

    for _ in 0..lump.count {
        let (raw_type, offset, name) = if wide {
            let t = src.read_u32::<LittleEndian>()?;
            let ofs = src.read_u32::<LittleEndian>()?;
            let name = src.read_i32::<LittleEndian>()?;
            (t as u16, ofs, name)
        } else {
            // offsets are unsigned in the classic encoding
            let t = src.read_u16::<LittleEndian>()?;
            let ofs = src.read_u16::<LittleEndian>()?;
            let name = src.read_i32::<LittleEndian>()?;
            (t, u32::from(ofs), name)
        };

        let (type_, save) = Type::from_disk(raw_type)?;

        if save && !allow_save {
            return Err(ProgsError::Load(
                "save flag not allowed in field definitions".to_owned(),
            ));
        }

        if name < 0 {
            return Err(ProgsError::Load(format!("bad name offset {}", name)));
        }

        let name_id = StringId(name);

        strings
            .get(name_id)
            .map_err(|_| ProgsError::Load(format!("bad name offset {}", name)))?;

        defs.push(Def {
            save,
            type_,
            offset,
            name_id,
        });
    }

    Ok(defs)
}

struct LoadedFunctions {
    functions: Vec<FunctionDef>,
    builtin_count: usize,
    highest_stack: usize,
}

fn load_functions<R: Read + Seek>(
    src: &mut R,
    header: &Header,
    strings: &StringTable,
    statement_count: usize,
) -> Result<LoadedFunctions, ProgsError> {
    src.seek(SeekFrom::Start(header.function.offset as u64))?;

    let mut functions = Vec::with_capacity(header.function.count);
    let mut builtin_count = 0;
    let mut highest_stack = 0;

    for _ in 0..header.function.count {
        let id = src.read_i32::<LittleEndian>()?;
        let first_arg = src.read_u32::<LittleEndian>()?;
        let num_args_and_locals = src.read_u32::<LittleEndian>()? as usize;

        // profile counter, only meaningful to compilers
        let _profile = src.read_u32::<LittleEndian>()?;

        let name_id = StringId(src.read_i32::<LittleEndian>()?);
        let file_id = StringId(src.read_i32::<LittleEndian>()?);

        let argc = src.read_u32::<LittleEndian>()? as usize;
        let mut argsz = [0u8; MAX_ARGS];
        src.read_exact(&mut argsz)?;

        let name = strings
            .get(name_id)
            .map_err(|_| ProgsError::Load("bad function name offset".to_owned()))?;

        let kind = match id {
            x if x < 0 => {
                warn!(
                    "progs contains old-school negative-indexed builtin \"{}\"; use #0 for all builtins",
                    name
                );
                FunctionKind::Unresolved
            }
            0 => FunctionKind::Unresolved,
            x => {
                if x as usize >= statement_count {
                    return Err(ProgsError::Load(format!(
                        "function \"{}\" starts past the statement table",
                        name
                    )));
                }

                FunctionKind::QuakeC(x as usize)
            }
        };

        if kind == FunctionKind::Unresolved && name_id != STRING_EMPTY {
            builtin_count += 1;
        }

        if num_args_and_locals > 128 {
            warn!(
                "func \"{}\" has a pretty big stack ({} locals)",
                name, num_args_and_locals
            );
        }

        highest_stack = highest_stack.max(num_args_and_locals + LOCALS_FIX);

        functions.push(FunctionDef {
            kind,
            first_arg,
            num_args_and_locals,
            name_id,
            file_id,
            argc: argc.min(MAX_ARGS),
            argsz,
        });
    }

    Ok(LoadedFunctions {
        functions,
        builtin_count,
        highest_stack,
    })
}

/// Builds a chained name hash over a definition table.
fn build_name_hash(
    defs: &[Def],
    strings: &StringTable,
) -> (Vec<Option<u32>>, Vec<Option<u32>>) {
    let mut buckets: Vec<Option<u32>> = vec![None; defs.len()];
    let mut next: Vec<Option<u32>> = vec![None; defs.len()];

    for (i, def) in defs.iter().enumerate() {
        if def.name_id == STRING_EMPTY {
            continue;
        }

        let name = match strings.get(def.name_id) {
            Ok(n) => n,
            Err(_) => continue,
        };

        let bucket = hash_string(name, defs.len()) as usize;
        next[i] = buckets[bucket];
        buckets[bucket] = Some(i as u32);
    }

    (buckets, next)
}

impl Vm {
    /// Loads a compiled module from disk, along with a `progs.lno` line-number sidecar if one
    /// sits next to it.
    pub fn load<P: AsRef<Path>>(engine_name: &str, path: P) -> Result<Vm, ProgsError> {
        let path = path.as_ref();

        let data = std::fs::read(path)
            .map_err(|_| ProgsError::Load(format!("no progs at {}", path.display())))?;

        let mut vm = Vm::from_bytes(engine_name, &data)?;
        vm.path = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let lno_path = vm.path.join("progs.lno");

        if let Ok(lno) = std::fs::read(&lno_path) {
            match vm.load_line_numbers(&lno) {
                Ok(()) => debug!("loaded line numbers from {}", lno_path.display()),
                Err(e) => debug!("ignoring {}: {}", lno_path.display(), e),
            }
        }

        Ok(vm)
    }

    /// Loads a compiled module from memory.
    pub fn from_bytes(engine_name: &str, data: &[u8]) -> Result<Vm, ProgsError> {
        let mut src = BufReader::new(Cursor::new(data));

        let header = Header::read(&mut src)?;

        if header.version != PROGS_Q1 && header.version != PROGS_FTE {
            return Err(ProgsError::Load(
                "bad version (only version 6 & 7 progs are supported)".to_owned(),
            ));
        }

        if header.version == PROGS_FTE
            && header.secondary_version != PROG_SECONDARYVERSION16
            && header.secondary_version != PROG_SECONDARYVERSION32
        {
            return Err(ProgsError::Load("bad secondary version".to_owned()));
        }

        if header.blockscompressed != 0 {
            return Err(ProgsError::Load(
                "compressed blocks are not supported".to_owned(),
            ));
        }

        // string data first; every other section resolves names against it
        src.seek(SeekFrom::Start(header.string.offset as u64))?;
        let mut blob = vec![0u8; header.string.count];
        src.read_exact(&mut blob)?;
        let strings = StringTable::new(blob)?;

        let statements = load_statements(&mut src, &header)?;

        let definitions =
            load_definitions(&mut src, &header.definition, header.wide(), &strings, true)?;
        let fields = load_definitions(&mut src, &header.field, header.wide(), &strings, false)?;

        let loaded_functions =
            load_functions(&mut src, &header, &strings, statements.len())?;

        if header.globals.count < GLOBAL_STATIC_START as usize {
            return Err(ProgsError::Load(
                "global count lower than static global count".to_owned(),
            ));
        }

        src.seek(SeekFrom::Start(header.globals.offset as u64))?;
        let mut global_cells = Vec::with_capacity(header.globals.count);

        for _ in 0..header.globals.count {
            let mut cell = [0u8; 4];
            src.read_exact(&mut cell)?;
            global_cells.push(cell);
        }

        let globals = Globals::new(global_cells.into_boxed_slice());

        let (def_buckets, def_next) = build_name_hash(&definitions, &strings);
        let (field_buckets, field_next) = build_name_hash(&fields, &strings);

        let mut def_map_by_id: Vec<Option<u32>> = vec![None; globals.count()];

        for (i, def) in definitions.iter().enumerate() {
            if let Some(slot) = def_map_by_id.get_mut(def.offset as usize) {
                *slot = Some(i as u32);
            }
        }

        debug!(
            "loaded module: {} statements, {} definitions, {} fields, {} functions, {} globals, {} builtin slots",
            statements.len(),
            definitions.len(),
            fields.len(),
            loaded_functions.functions.len(),
            globals.count(),
            loaded_functions.builtin_count,
        );

        let mut vm = Vm {
            engine_name: engine_name.to_owned(),
            path: PathBuf::new(),
            statements: statements.into_boxed_slice(),
            linenumbers: None,
            definitions: definitions.into_boxed_slice(),
            def_buckets: def_buckets.into_boxed_slice(),
            def_next: def_next.into_boxed_slice(),
            def_map_by_id: def_map_by_id.into_boxed_slice(),
            fields: fields.into_boxed_slice(),
            field_buckets: field_buckets.into_boxed_slice(),
            field_next: field_next.into_boxed_slice(),
            field_map_by_id: Box::new([]),
            field_real_size: 0,
            functions: loaded_functions.functions.into_boxed_slice(),
            highest_stack: loaded_functions.highest_stack,
            globals,
            strings,
            string_case_sensitive: 0,
            builtins: BuiltinList::new(loaded_functions.builtin_count),
            system_fields: Vec::new(),
            wraps: FieldWraps::default(),
            entity_config: EntityConfig::default(),
            entities: Entities::empty(),
            handles: Handles::new(),
            state: ExecState::new(),
            checked: false,
        };

        // the string comparison opcodes consult this global at run time
        vm.string_case_sensitive = match vm.find_definition("strcasesensitive", Type::QInt) {
            Some(def) => vm.definitions[def].offset,
            None => {
                return Err(ProgsError::Load(
                    "can't find required definition \"strcasesensitive\"".to_owned(),
                ))
            }
        };

        Ok(vm)
    }

    /// Loads a `progs.lno` line-number sidecar. The sidecar must match the loaded module's
    /// section counts exactly.
    pub fn load_line_numbers(&mut self, data: &[u8]) -> Result<(), ProgsError> {
        let mut src = BufReader::new(Cursor::new(data));

        let magic = src.read_i32::<LittleEndian>()?;
        let version = src.read_i32::<LittleEndian>()?;
        let num_globaldefs = src.read_i32::<LittleEndian>()? as usize;
        let num_globals = src.read_i32::<LittleEndian>()? as usize;
        let num_fielddefs = src.read_i32::<LittleEndian>()? as usize;
        let num_statements = src.read_i32::<LittleEndian>()? as usize;

        if magic != LNO_MAGIC || version != LNO_VERSION {
            return Err(ProgsError::Load("bad line number file header".to_owned()));
        }

        if num_globaldefs != self.definitions.len()
            || num_globals != self.globals.count()
            || num_fielddefs != self.fields.len()
            || num_statements != self.statements.len()
        {
            return Err(ProgsError::Load(
                "line number file does not match progs".to_owned(),
            ));
        }

        let mut lines = Vec::with_capacity(self.statements.len());

        for _ in 0..self.statements.len() {
            lines.push(src.read_i32::<LittleEndian>()?);
        }

        self.linenumbers = Some(lines.into_boxed_slice());
        Ok(())
    }
}

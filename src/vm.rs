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

use std::io::{Read, Write};
use std::path::PathBuf;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use smallvec::SmallVec;

use crate::entity::{Entities, EntityConfig, EntityId};
use crate::error::ProgsError;
use crate::exec::ExecState;
use crate::functions::{Builtin, BuiltinList, FunctionDef, FunctionKind};
use crate::globals::{Globals, GLOBAL_ADDR_NULL, GLOBAL_ADDR_RETURN};
use crate::globals::parm_addr;
use crate::handles::{HandleData, Handles};
use crate::ops::{Opcode, Statement};
use crate::pointer::{Pointer, PointerKind};
use crate::strings::{hash_string, StringTable};
use crate::wraps::{FieldSetter, FieldWrap, FieldWraps};
use crate::{CellAddr, Def, FunctionId, StringId, Type, STRING_EMPTY};

const SAVE_STATE_VERSION: u32 = 1;

/// A host-pinned entity field: its offset is dictated by the host structure layout rather than
/// assigned by the layout pass.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SystemField {
    pub def: usize,
    pub field: usize,
    pub offset: u32,
    pub span: usize,
}

/// The virtual machine: one loaded module plus all mutable run state.
pub struct Vm {
    pub(crate) engine_name: String,
    pub(crate) path: PathBuf,

    pub(crate) statements: Box<[Statement]>,
    pub(crate) linenumbers: Option<Box<[i32]>>,

    pub(crate) definitions: Box<[Def]>,
    pub(crate) def_buckets: Box<[Option<u32>]>,
    pub(crate) def_next: Box<[Option<u32>]>,
    pub(crate) def_map_by_id: Box<[Option<u32>]>,

    pub(crate) fields: Box<[Def]>,
    pub(crate) field_buckets: Box<[Option<u32>]>,
    pub(crate) field_next: Box<[Option<u32>]>,
    pub(crate) field_map_by_id: Box<[Option<u32>]>,
    pub(crate) field_real_size: usize,

    pub(crate) functions: Box<[FunctionDef]>,
    pub(crate) highest_stack: usize,

    pub(crate) globals: Globals,
    pub(crate) strings: StringTable,
    pub(crate) string_case_sensitive: u32,

    pub(crate) builtins: BuiltinList,
    pub(crate) system_fields: Vec<SystemField>,
    pub(crate) wraps: FieldWraps,

    pub(crate) entity_config: EntityConfig,
    pub(crate) entities: Entities,

    pub(crate) handles: Handles,

    pub(crate) state: ExecState,
    pub(crate) checked: bool,
}

/// A resolved pointer: either a cell in one of the tracked regions, or a window into a handle
/// payload.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Resolved {
    Cells(CellAddr),
    Handle { index: u32, offset: u32 },
}

pub(crate) fn cell_from_i32(v: i32) -> [u8; 4] {
    let mut c = [0; 4];
    LittleEndian::write_i32(&mut c, v);
    c
}

pub(crate) fn cell_from_f32(v: f32) -> [u8; 4] {
    let mut c = [0; 4];
    LittleEndian::write_f32(&mut c, v);
    c
}

pub(crate) fn cell_to_i32(c: [u8; 4]) -> i32 {
    LittleEndian::read_i32(&c)
}

pub(crate) fn cell_to_f32(c: [u8; 4]) -> f32 {
    LittleEndian::read_f32(&c)
}

impl Vm {
    // Memory primitives. Every script-visible write funnels through these so the string
    // subsystem and the field wrap table see it.

    pub(crate) fn read_cell(&self, addr: CellAddr) -> Result<[u8; 4], ProgsError> {
        match addr {
            CellAddr::Global(i) => Ok(self.globals.get_bytes(i)?),
            CellAddr::Entity(i) => self.entities.read_cell(i as usize),
        }
    }

    pub(crate) fn read_cell_i32(&self, addr: CellAddr) -> Result<i32, ProgsError> {
        Ok(cell_to_i32(self.read_cell(addr)?))
    }

    pub(crate) fn write_cell_raw(&mut self, addr: CellAddr, val: [u8; 4]) -> Result<(), ProgsError> {
        match addr {
            CellAddr::Global(i) => Ok(self.globals.put_bytes(val, i)?),
            CellAddr::Entity(i) => self.entities.write_cell(i as usize, val),
        }
    }

    /// Releases tracked strings in a span whose cells no longer hold their tracked ids.
    pub(crate) fn check_unset(
        &mut self,
        addr: CellAddr,
        span: usize,
        assume_changed: bool,
    ) -> Result<(), ProgsError> {
        let mut current: SmallVec<[i32; 3]> = SmallVec::new();

        for i in 0..span {
            current.push(self.read_cell_i32(addr.offset(i))?);
        }

        self.strings.check_ref_unset(addr, &current, assume_changed)?;
        Ok(())
    }

    /// Mirrors freshly written entity cells through the field wrap table.
    pub(crate) fn wrap_check(&mut self, addr: CellAddr, span: usize) -> Result<(), ProgsError> {
        let base = match addr {
            CellAddr::Entity(i) => i as usize,
            CellAddr::Global(_) => return Ok(()),
        };

        if self.wraps.is_empty() {
            return Ok(());
        }

        for i in 0..span {
            let cell = base + i;

            if cell >= self.entities.cell_count() {
                break;
            }

            let (ent, offset) = self.entities.locate_cell(cell);

            let wrap = match self.wraps.get(offset) {
                Some(w) => *w,
                None => continue,
            };

            if wrap.field_offset != offset {
                continue;
            }

            // client wraps are skipped for entities without a client record; a bulk copy may
            // sweep over them
            if wrap.is_client && !self.entities.has_client(ent) {
                continue;
            }

            let src = self.entities.read_cell(cell)?;

            let dst = if wrap.is_client {
                self.entities.client_bytes_mut(ent)?
            } else {
                self.entities.record_bytes_mut(ent)?
            };

            let dst = match dst.get_mut(wrap.struct_offset..) {
                Some(d) => d,
                None => {
                    return Err(ProgsError::with_msg(format!(
                        "field wrap destination {} out of range",
                        wrap.struct_offset
                    )))
                }
            };

            match wrap.setter {
                Some(setter) => setter(dst, &src),
                None => dst[..4].copy_from_slice(&src),
            }
        }

        Ok(())
    }

    /// Writes a span of cells to the global slab, releasing any strings the write clobbered.
    pub fn write_global(&mut self, addr: u32, cells: &[[u8; 4]]) -> Result<(), ProgsError> {
        if addr == GLOBAL_ADDR_NULL {
            return Err(ProgsError::with_msg("attempt to overwrite global 0"));
        }

        for (i, c) in cells.iter().enumerate() {
            self.globals.put_bytes(*c, addr + i as u32)?;
        }

        self.check_unset(CellAddr::Global(addr), cells.len(), false)
    }

    pub fn set_global_float(&mut self, addr: u32, val: f32) -> Result<(), ProgsError> {
        self.write_global(addr, &[cell_from_f32(val)])
    }

    pub fn set_global_int(&mut self, addr: u32, val: i32) -> Result<(), ProgsError> {
        self.write_global(addr, &[cell_from_i32(val)])
    }

    pub fn set_global_vector(&mut self, addr: u32, val: [f32; 3]) -> Result<(), ProgsError> {
        self.write_global(
            addr,
            &[
                cell_from_f32(val[0]),
                cell_from_f32(val[1]),
                cell_from_f32(val[2]),
            ],
        )
    }

    pub fn set_global_entity(&mut self, addr: u32, val: EntityId) -> Result<(), ProgsError> {
        self.set_global_int(addr, val.0)
    }

    pub fn set_global_pointer(&mut self, addr: u32, val: Pointer) -> Result<(), ProgsError> {
        self.set_global_int(addr, val.to_i32())
    }

    pub fn get_global(&self, addr: u32) -> Result<[u8; 4], ProgsError> {
        Ok(self.globals.get_bytes(addr)?)
    }

    /// Copies cells between two global addresses, transferring string tracking along with the
    /// values.
    pub(crate) fn copy_globals(
        &mut self,
        dst: u32,
        src: u32,
        span: usize,
    ) -> Result<(), ProgsError> {
        for i in 0..span as u32 {
            let bytes = self.globals.get_bytes(src + i)?;
            self.globals.put_bytes(bytes, dst + i)?;
        }

        self.strings
            .mark_refs_copied(CellAddr::Global(src), CellAddr::Global(dst), span)?;

        Ok(())
    }

    /// Copies cells between arbitrary tracked regions, transferring string tracking and
    /// mirroring the destination through the wrap table.
    pub(crate) fn copy_cells(
        &mut self,
        src: CellAddr,
        dst: CellAddr,
        span: usize,
    ) -> Result<(), ProgsError> {
        for i in 0..span {
            let bytes = self.read_cell(src.offset(i))?;
            self.write_cell_raw(dst.offset(i), bytes)?;
        }

        self.strings.mark_refs_copied(src, dst, span)?;
        self.wrap_check(dst, span)
    }

    /// Resolves a pointer against the addressable regions, for an access of `len` bytes.
    pub(crate) fn resolve(&self, ptr: Pointer, len: usize) -> Result<Resolved, ProgsError> {
        match ptr.kind() {
            PointerKind::Null { .. } => {
                Err(ProgsError::BadPointer("null pointer".to_owned()))
            }
            PointerKind::Global { offset } => {
                let offset = offset as usize;

                if offset % 4 != 0 {
                    return Err(ProgsError::BadPointer(format!(
                        "misaligned global pointer {:#x}",
                        offset
                    )));
                }

                if offset + len > self.globals.count() * 4 {
                    return Err(ProgsError::BadPointer(format!(
                        "global pointer {:#x} out of range",
                        offset
                    )));
                }

                Ok(Resolved::Cells(CellAddr::Global((offset / 4) as u32)))
            }
            PointerKind::Entity { offset } => {
                let offset = offset as usize;

                if offset % 4 != 0 {
                    return Err(ProgsError::BadPointer(format!(
                        "misaligned entity pointer {:#x}",
                        offset
                    )));
                }

                if offset + len > self.entities.byte_size() {
                    return Err(ProgsError::BadPointer(format!(
                        "entity pointer {:#x} out of range",
                        offset
                    )));
                }

                Ok(Resolved::Cells(CellAddr::Entity((offset / 4) as u32)))
            }
            PointerKind::Handle { index, offset } => Ok(Resolved::Handle { index, offset }),
        }
    }

    /// Stores a string value into a tracked cell, interning it if necessary.
    pub(crate) fn set_cell_string(
        &mut self,
        addr: CellAddr,
        value: &str,
    ) -> Result<StringId, ProgsError> {
        let id = self.strings.store_or_find(value);

        self.write_cell_raw(addr, cell_from_i32(id.0))?;
        self.check_unset(addr, 1, false)?;
        self.wrap_check(addr, 1)?;

        if self.strings.is_ref_counted(id) {
            self.strings.mark_ref_copy(id, addr)?;
        }

        Ok(id)
    }

    /// Stores a string value into a global, returning its id.
    pub fn set_global_string(&mut self, addr: u32, value: &str) -> Result<StringId, ProgsError> {
        if addr == GLOBAL_ADDR_NULL {
            return Err(ProgsError::with_msg("attempt to overwrite global 0"));
        }

        // bounds-check before the raw cell write
        self.globals.get_bytes(addr)?;

        self.set_cell_string(CellAddr::Global(addr), value)
    }

    pub fn get_string(&self, id: StringId) -> Result<&str, ProgsError> {
        self.strings.get(id)
    }

    pub fn string_table(&self) -> &StringTable {
        &self.strings
    }

    pub fn strings_case_sensitive(&self) -> bool {
        self.globals
            .get_int(self.string_case_sensitive)
            .map(|v| v != 0)
            .unwrap_or(true)
    }

    // Lookups.

    /// Finds a definition by name and type.
    pub fn find_definition(&self, name: &str, type_: Type) -> Option<usize> {
        if self.definitions.is_empty() {
            return None;
        }

        let bucket = hash_string(name, self.definitions.len()) as usize;
        let mut cursor = self.def_buckets[bucket];

        while let Some(i) = cursor {
            let def = &self.definitions[i as usize];

            if def.type_ == type_ {
                if let Ok(def_name) = self.strings.get(def.name_id) {
                    if def_name == name {
                        return Some(i as usize);
                    }
                }
            }

            cursor = self.def_next[i as usize];
        }

        None
    }

    /// Finds a field by name.
    pub fn find_field(&self, name: &str) -> Option<usize> {
        if self.fields.is_empty() {
            return None;
        }

        let bucket = hash_string(name, self.fields.len()) as usize;
        let mut cursor = self.field_buckets[bucket];

        while let Some(i) = cursor {
            let field = &self.fields[i as usize];

            if let Ok(field_name) = self.strings.get(field.name_id) {
                if field_name == name {
                    return Some(i as usize);
                }
            }

            cursor = self.field_next[i as usize];
        }

        None
    }

    /// The definition whose storage starts at a global slab index, if any.
    pub fn definition_for_global(&self, global: u32) -> Option<&Def> {
        self.def_map_by_id
            .get(global as usize)
            .copied()
            .flatten()
            .map(|i| &self.definitions[i as usize])
    }

    pub fn find_function_id(&self, name: &str) -> Option<FunctionId> {
        for (i, func) in self.functions.iter().enumerate() {
            if let Ok(func_name) = self.strings.get(func.name_id) {
                if func_name == name {
                    return Some(FunctionId(i));
                }
            }
        }

        None
    }

    pub fn get_function(&self, id: FunctionId) -> Result<&FunctionDef, ProgsError> {
        self.functions
            .get(id.0)
            .ok_or_else(|| ProgsError::BadFunction(format!("no function with ID {}", id.0)))
    }

    // Host registration.

    /// Fixes the entity array sizing used by the layout pass. Must precede [`Vm::check`].
    pub fn configure_entities(&mut self, config: EntityConfig) {
        self.entity_config = config;
    }

    /// Resolves the first unresolved native function named `name` to `builtin`.
    pub fn register_builtin(&mut self, name: &str, builtin: Builtin) -> Result<(), ProgsError> {
        for i in 0..self.functions.len() {
            if self.functions[i].kind != FunctionKind::Unresolved
                || self.functions[i].name_id == STRING_EMPTY
            {
                continue;
            }

            if self.strings.get(self.functions[i].name_id)? == name {
                let slot = self.builtins.register(builtin)?;
                self.functions[i].kind = FunctionKind::BuiltIn(slot);
                return Ok(());
            }
        }

        debug!("no builtin to assign to {}", name);
        Ok(())
    }

    /// Pins a field to a host-defined offset inside the system region of the entity record.
    pub fn register_system_field(
        &mut self,
        field_name: &str,
        field_offset: usize,
        field_span: usize,
    ) -> Result<(), ProgsError> {
        if self.checked {
            return Err(ProgsError::with_msg(
                "system fields must be registered before check()",
            ));
        }

        let def = match self.find_definition(field_name, Type::QField) {
            Some(d) => d,
            None => {
                debug!("field definition not found for mapping: {}", field_name);
                return Ok(());
            }
        };

        let field = match self.find_field(field_name) {
            Some(f) => f,
            None => {
                debug!("field not found for mapping: {}", field_name);
                return Ok(());
            }
        };

        if self.system_fields.len() == self.fields.len() {
            return Err(ProgsError::with_msg("system fields overrun"));
        }

        if field_offset + field_span > self.entity_config.system_size {
            return Err(ProgsError::with_msg("system fields overrun"));
        }

        self.system_fields.push(SystemField {
            def,
            field,
            offset: field_offset as u32,
            span: field_span,
        });

        Ok(())
    }

    /// Registers a mirror from a field cell to a host structure member.
    ///
    /// `field_offset` selects a cell within the field's span (for vector components);
    /// `struct_offset` is the destination byte offset inside the entity record, or inside the
    /// client record for `client.`-prefixed field names. Must follow [`Vm::check`].
    pub fn register_field_wrap(
        &mut self,
        field_name: &str,
        field_offset: usize,
        struct_offset: usize,
        setter: Option<FieldSetter>,
    ) -> Result<(), ProgsError> {
        let field = match self.find_field(field_name) {
            Some(f) => f,
            None => {
                warn!("can't find field {} to wrap", field_name);
                return Ok(());
            }
        };

        let abs = self.fields[field].offset as usize + field_offset;

        if abs >= self.wraps.len() {
            return Err(ProgsError::with_msg(format!(
                "field wrap offset {} out of range",
                abs
            )));
        }

        self.wraps.set(
            abs,
            FieldWrap {
                field,
                field_offset: abs,
                is_client: field_name.starts_with("client."),
                struct_offset,
                setter,
            },
        );

        Ok(())
    }

    // Layout pass.

    /// Runs the layout pass: assigns every script field its final offset in the entity record,
    /// sizes and allocates the entity array and the wrap table, warns about unresolved
    /// builtins, and rewrites recognized intrinsic calls.
    pub fn check(&mut self) -> Result<(), ProgsError> {
        self.setup_fields()?;
        self.init_field_map()?;

        self.entities = Entities::new(self.entity_config, self.field_real_size);
        self.wraps = FieldWraps::new(self.field_real_size);

        self.check_builtins()?;

        self.checked = true;
        Ok(())
    }

    fn setup_fields(&mut self) -> Result<(), ProgsError> {
        let mut field_offset = self.entity_config.system_size as u32;

        for f_idx in 1..self.fields.len() {
            if self.fields[f_idx].name_id == STRING_EMPTY {
                continue;
            }

            let name = self.strings.get(self.fields[f_idx].name_id)?.to_owned();

            // vector component fields are assigned along with their parent vector
            if let Some(parent) = vector_component_parent(&name) {
                if self.find_field(parent).is_some() {
                    continue;
                }
            }

            let sysfield = self
                .system_fields
                .iter()
                .find(|sf| sf.field == f_idx)
                .copied();

            let (real_offset, def_idx) = match sysfield {
                Some(sf) => {
                    if sf.span != self.fields[f_idx].type_.span() {
                        warn!(
                            "system field {} registered with span {}, type wants {}",
                            name,
                            sf.span,
                            self.fields[f_idx].type_.span()
                        );
                    }

                    (sf.offset, sf.def)
                }
                None => {
                    let ofs = field_offset;
                    field_offset += self.fields[f_idx].type_.span() as u32;

                    let def = self
                        .find_definition(&name, Type::QField)
                        .ok_or_else(|| {
                            ProgsError::with_msg(format!("field {} has no def", name))
                        })?;

                    (ofs, def)
                }
            };

            self.fields[f_idx].offset = real_offset;

            // the TYPE_FIELD global now holds the field's runtime offset
            let def_global = self.definitions[def_idx].offset;
            self.write_global(def_global, &[cell_from_i32(real_offset as i32)])?;

            if self.fields[f_idx].type_ == Type::QVector {
                for i in 1..3u32 {
                    self.write_global(
                        def_global + i,
                        &[cell_from_i32((real_offset + i) as i32)],
                    )?;
                }

                for (i, suffix) in ["_x", "_y", "_z"].iter().enumerate() {
                    let alias = format!("{}{}", name, suffix);

                    if let Some(alias_idx) = self.find_field(&alias) {
                        self.fields[alias_idx].offset = real_offset + i as u32;
                    }
                }
            }
        }

        Ok(())
    }

    fn init_field_map(&mut self) -> Result<(), ProgsError> {
        self.field_real_size = self.entity_config.system_size;

        for field in self.fields.iter().skip(1) {
            self.field_real_size = self
                .field_real_size
                .max(field.offset as usize + field.type_.span());
        }

        let mut map: Vec<Option<u32>> = vec![None; self.field_real_size];

        for (i, field) in self.fields.iter().enumerate().skip(1) {
            map[field.offset as usize] = Some(i as u32);
        }

        self.field_map_by_id = map.into_boxed_slice();
        Ok(())
    }

    fn check_builtins(&mut self) -> Result<(), ProgsError> {
        for func in self.functions.iter() {
            if func.kind == FunctionKind::Unresolved && func.name_id != STRING_EMPTY {
                if let Ok(name) = self.strings.get(func.name_id) {
                    warn!("Missing builtin function: {}", name);
                }
            }
        }

        let sqrt = self.find_function_id("sqrt");
        let sin = self.find_function_id("sin");
        let cos = self.find_function_id("cos");

        for i in 0..self.statements.len() {
            if self.statements[i].opcode != Opcode::Call1H {
                continue;
            }

            let target = self.globals.get_int(self.statements[i].a)?;

            if target <= 0 {
                continue;
            }

            let target = FunctionId(target as usize);

            if Some(target) == sqrt {
                self.statements[i].opcode = Opcode::IntrinSqrt;
            } else if Some(target) == sin {
                self.statements[i].opcode = Opcode::IntrinSin;
            } else if Some(target) == cos {
                self.statements[i].opcode = Opcode::IntrinCos;
            }
        }

        Ok(())
    }

    // Builtin argument and return plumbing.

    /// The argument count of the innermost native call.
    pub fn argc(&self) -> u8 {
        self.state.argc
    }

    pub fn argv_float(&self, i: u8) -> Result<f32, ProgsError> {
        Ok(self.globals.get_float(parm_addr(i))?)
    }

    pub fn argv_int(&self, i: u8) -> Result<i32, ProgsError> {
        Ok(self.globals.get_int(parm_addr(i))?)
    }

    pub fn argv_vector(&self, i: u8) -> Result<[f32; 3], ProgsError> {
        Ok(self.globals.get_vector(parm_addr(i))?)
    }

    pub fn argv_string_id(&self, i: u8) -> Result<StringId, ProgsError> {
        Ok(self.globals.string_id(parm_addr(i))?)
    }

    pub fn argv_string(&self, i: u8) -> Result<&str, ProgsError> {
        self.strings.get(self.argv_string_id(i)?)
    }

    pub fn argv_entity(&self, i: u8) -> Result<EntityId, ProgsError> {
        Ok(self.globals.entity_id(parm_addr(i))?)
    }

    pub fn argv_pointer(&self, i: u8) -> Result<Pointer, ProgsError> {
        Ok(self.globals.pointer(parm_addr(i))?)
    }

    pub fn argv_handle<T: 'static>(&self, i: u8) -> Result<&T, ProgsError> {
        let id = self.argv_int(i)?;

        self.handles
            .fetch(id)?
            .as_any()
            .downcast_ref::<T>()
            .ok_or(ProgsError::BadHandle(id))
    }

    pub fn return_float(&mut self, val: f32) -> Result<(), ProgsError> {
        self.set_global_float(GLOBAL_ADDR_RETURN, val)
    }

    pub fn return_int(&mut self, val: i32) -> Result<(), ProgsError> {
        self.set_global_int(GLOBAL_ADDR_RETURN, val)
    }

    pub fn return_vector(&mut self, val: [f32; 3]) -> Result<(), ProgsError> {
        self.set_global_vector(GLOBAL_ADDR_RETURN, val)
    }

    pub fn return_entity(&mut self, val: EntityId) -> Result<(), ProgsError> {
        self.set_global_entity(GLOBAL_ADDR_RETURN, val)
    }

    pub fn return_pointer(&mut self, val: Pointer) -> Result<(), ProgsError> {
        self.set_global_pointer(GLOBAL_ADDR_RETURN, val)
    }

    pub fn return_func(&mut self, f: FunctionId) -> Result<(), ProgsError> {
        self.set_global_int(GLOBAL_ADDR_RETURN, f.0 as i32)
    }

    pub fn return_string_id(&mut self, id: StringId) -> Result<(), ProgsError> {
        self.set_global_int(GLOBAL_ADDR_RETURN, id.0)?;

        if self.strings.is_ref_counted(id) {
            self.strings
                .mark_ref_copy(id, CellAddr::Global(GLOBAL_ADDR_RETURN))?;
        }

        Ok(())
    }

    pub fn return_string(&mut self, val: &str) -> Result<StringId, ProgsError> {
        self.set_global_string(GLOBAL_ADDR_RETURN, val)
    }

    /// Allocates a handle for `data` and returns its id to the script.
    pub fn return_handle(&mut self, data: Box<dyn HandleData>) -> Result<i32, ProgsError> {
        let id = self.handles.alloc(data);
        self.return_int(id)?;
        Ok(id)
    }

    pub fn handles(&self) -> &Handles {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut Handles {
        &mut self.handles
    }

    // Entity access for hosts and builtins.

    pub fn entity_field_pointer(&self, ent: EntityId, field: i32) -> Pointer {
        self.entities.field_pointer(ent, field)
    }

    pub fn entity_bytes(&self, ent: EntityId) -> Result<&[u8], ProgsError> {
        self.entities.record_bytes(ent)
    }

    pub fn client_bytes(&self, ent: EntityId) -> Result<&[u8], ProgsError> {
        self.entities.client_bytes(ent)
    }

    /// Size of one entity record, in cells, as fixed by the layout pass.
    pub fn edict_size(&self) -> usize {
        self.entities.edict_size()
    }

    // Diagnostics.

    /// The source line of a statement, if a line-number sidecar was loaded.
    pub fn line_number_for(&self, statement: usize) -> i32 {
        match self.linenumbers {
            Some(ref lines) => lines.get(statement).copied().unwrap_or(0),
            None => 0,
        }
    }

    fn stack_entry(&self, func: usize, pc: usize, compact: bool) -> String {
        let name = self
            .functions
            .get(func)
            .and_then(|f| self.strings.get(f.name_id).ok())
            .filter(|n| !n.is_empty())
            .unwrap_or("dunno");

        let file = self
            .functions
            .get(func)
            .and_then(|f| self.strings.get(f.file_id).ok())
            .filter(|n| !n.is_empty())
            .unwrap_or("dunno.qc");

        if compact {
            format!("{}:{}", name, self.line_number_for(pc))
        } else {
            format!(
                "{} ({}:{} @ stmt {})",
                name,
                file,
                self.line_number_for(pc),
                pc
            )
        }
    }

    /// Formats the live call stack, oldest frame first.
    pub fn stack_trace(&self, compact: bool) -> String {
        let mut out = String::new();

        if !compact {
            out.push_str("> ");
        }

        for i in 0..=self.state.current {
            let frame = &self.state.stack[i as usize];

            if compact {
                out.push_str("->");
                out.push_str(&self.stack_entry(frame.func, frame.pc, compact));
            } else {
                out.push_str(&self.stack_entry(frame.func, frame.pc, compact));
                out.push('\n');
            }
        }

        out
    }

    /// Expands a printf-style format string against the current native-call arguments,
    /// starting at argument `first`.
    pub fn parse_format(&self, format_id: StringId, first: u8) -> Result<String, ProgsError> {
        let format = self.strings.get(format_id)?.to_owned();
        let mut out = String::with_capacity(format.len());
        let mut chars = format.chars().peekable();
        let mut arg = first;

        while let Some(ch) = chars.next() {
            if ch != '%' {
                out.push(ch);
                continue;
            }

            let mut left_align = false;
            let mut zero_pad = false;
            let mut width = 0usize;
            let mut precision: Option<usize> = None;

            while let Some(&c) = chars.peek() {
                match c {
                    '-' => {
                        left_align = true;
                        chars.next();
                    }
                    '0' if width == 0 => {
                        zero_pad = true;
                        chars.next();
                    }
                    '0'..='9' => {
                        width = width * 10 + c.to_digit(10).unwrap() as usize;
                        chars.next();
                    }
                    '.' => {
                        chars.next();
                        let mut p = 0;

                        while let Some(&d) = chars.peek() {
                            match d.to_digit(10) {
                                Some(v) => {
                                    p = p * 10 + v as usize;
                                    chars.next();
                                }
                                None => break,
                            }
                        }

                        precision = Some(p);
                    }
                    _ => break,
                }
            }

            let spec = chars
                .next()
                .ok_or_else(|| ProgsError::with_msg("truncated format specifier"))?;

            let formatted = match spec {
                '%' => {
                    out.push('%');
                    continue;
                }
                'd' | 'i' => format!("{}", self.argv_int(arg)?),
                'o' => format!("{:o}", self.argv_int(arg)?),
                'x' => format!("{:x}", self.argv_int(arg)?),
                'X' => format!("{:X}", self.argv_int(arg)?),
                'p' => format!("{:#x}", self.argv_int(arg)?),
                'c' => match std::char::from_u32(self.argv_int(arg)? as u32) {
                    Some(c) => c.to_string(),
                    None => String::new(),
                },
                'f' | 'F' => format!(
                    "{:.*}",
                    precision.unwrap_or(6),
                    self.argv_float(arg)?
                ),
                'e' | 'E' | 'a' | 'A' => format!("{:e}", self.argv_float(arg)?),
                'g' | 'G' => format!("{}", self.argv_float(arg)?),
                's' => self.argv_string(arg)?.to_owned(),
                _ => return Err(ProgsError::with_msg("invalid format specifier")),
            };

            arg += 1;

            if formatted.len() >= width {
                out.push_str(&formatted);
            } else if left_align {
                out.push_str(&formatted);
                out.push_str(&" ".repeat(width - formatted.len()));
            } else {
                let pad = if zero_pad { "0" } else { " " };
                out.push_str(&pad.repeat(width - formatted.len()));
                out.push_str(&formatted);
            }
        }

        Ok(out)
    }

    // Persistence.

    /// Serializes the machine's own persistent state: a version tag and the dynamic-string
    /// table.
    pub fn write_state<W: Write>(&self, writer: &mut W) -> Result<(), ProgsError> {
        writer.write_u32::<LittleEndian>(SAVE_STATE_VERSION)?;
        self.strings.write_state(writer)
    }

    /// Restores state written by [`Vm::write_state`]. Dynamic strings are re-interned without
    /// acquiring; the host's own loading re-acquires them as it restores cells.
    pub fn read_state<R: Read>(&mut self, reader: &mut R) -> Result<(), ProgsError> {
        let version = reader.read_u32::<LittleEndian>()?;

        if version != SAVE_STATE_VERSION {
            return Err(ProgsError::Load(format!("bad VM state version {}", version)));
        }

        self.strings.read_state(reader)
    }

    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    /// Directory the module was loaded from; sidecar files live here.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// If `name` is a vector component alias (`foo_x`/`foo_y`/`foo_z`), its base name.
fn vector_component_parent(name: &str) -> Option<&str> {
    let bytes = name.as_bytes();

    if bytes.len() > 2
        && bytes[bytes.len() - 2] == b'_'
        && matches!(bytes[bytes.len() - 1], b'x' | b'y' | b'z')
    {
        Some(&name[..name.len() - 2])
    } else {
        None
    }
}

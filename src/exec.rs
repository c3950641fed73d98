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

//! The execution engine.
//!
//! Functions do not get stack-allocated locals: each one owns a fixed *register window* in the
//! global slab, starting at its `first_arg`. A call therefore saves the callee's window into
//! the caller's frame and restores it on return, carrying any string-tracking records for the
//! saved cells along as backups so the ref counts survive the round trip untouched.
//!
//! The dispatch loop itself is a dense `match` over the opcode enum, one short handler per
//! instruction, with the regular typed families stamped out by local macros.

use cgmath::{InnerSpace, Vector3};
use smallvec::SmallVec;

use crate::entity::EntityId;
use crate::error::ProgsError;
use crate::functions::FunctionKind;
use crate::globals::{parm_addr, Globals, GLOBAL_ADDR_PARM0, GLOBAL_ADDR_PARM1, GLOBAL_ADDR_RETURN};
use crate::ops::{Opcode, Statement};
use crate::pointer::Pointer;
use crate::strings::StringBackup;
use crate::vm::{cell_from_f32, cell_from_i32, cell_to_f32, cell_to_i32, Resolved, Vm};
use crate::{CellAddr, FunctionId, STRING_EMPTY};

/// Extra cells carried with every register window save; works around compilers that undercount
/// `num_args_and_locals`.
pub(crate) const LOCALS_FIX: usize = 2;

const STACK_RESERVE: usize = 32;

#[derive(Debug)]
pub(crate) struct StackFrame {
    pub func: usize,
    /// Index of the most recently executed statement; the loop pre-increments.
    pub pc: usize,
    /// The callee's register window as it was before this frame called into it.
    pub locals: Box<[[u8; 4]]>,
    /// Tracking records popped from the saved window, restored on return.
    pub ref_strings: SmallVec<[StringBackup; 8]>,
}

#[derive(Debug)]
pub(crate) struct ExecState {
    pub stack: Vec<StackFrame>,
    /// Index of the live frame; -1 when idle.
    pub current: i32,
    /// Argument count of the innermost native call.
    pub argc: u8,
}

impl ExecState {
    pub fn new() -> ExecState {
        ExecState {
            stack: Vec::new(),
            current: -1,
            argc: 0,
        }
    }
}

impl Vm {
    fn push_frame(&mut self, func: usize, pc: usize) {
        self.state.current += 1;

        if self.state.current as usize == self.state.stack.len() {
            let window = self.highest_stack;

            for _ in 0..STACK_RESERVE {
                self.state.stack.push(StackFrame {
                    func: 0,
                    pc: 0,
                    locals: vec![[0; 4]; window].into_boxed_slice(),
                    ref_strings: SmallVec::new(),
                });
            }
        }

        let frame = &mut self.state.stack[self.state.current as usize];
        frame.func = func;
        frame.pc = pc;
        frame.ref_strings.clear();
    }

    fn enter(&mut self, f: FunctionId) -> Result<(), ProgsError> {
        let (first_arg, window, argc, argsz, entry) = {
            let def = self.get_function(f)?;

            let entry = match def.kind {
                FunctionKind::QuakeC(entry) => entry,
                _ => {
                    return Err(ProgsError::BadFunction(
                        "native functions are not entered".to_owned(),
                    ))
                }
            };

            let window = if def.has_locals() {
                def.num_args_and_locals + LOCALS_FIX
            } else {
                0
            };

            (def.first_arg, window, def.argc, def.argsz, entry)
        };

        // save the callee's register window into the calling frame, popping any string
        // tracking on those cells into backups
        if self.state.current >= 0 && window > 0 {
            let cur = self.state.current as usize;

            for i in 0..window {
                let bytes = self.globals.get_bytes(first_arg + i as u32)?;
                self.state.stack[cur].locals[i] = bytes;
            }

            for i in 0..window {
                let addr = CellAddr::Global(first_arg + i as u32);

                if self.strings.has_ref(addr).is_some() {
                    let backup = self.strings.pop_ref(addr)?;
                    self.state.stack[cur].ref_strings.push(backup);
                }
            }
        }

        self.push_frame(f.0, entry - 1);

        // deliver arguments into the window
        let mut cursor = first_arg;

        for i in 0..argc {
            let size = argsz[i] as usize;
            self.copy_globals(cursor, parm_addr(i as u8), size)?;
            cursor += size as u32;
        }

        Ok(())
    }

    fn leave(&mut self) -> Result<(), ProgsError> {
        if self.state.current < 0 {
            return Err(ProgsError::StackUnderflow);
        }

        let leaving = self.state.stack[self.state.current as usize].func;
        self.state.current -= 1;

        let (first_arg, window) = {
            let def = &self.functions[leaving];

            let window = if def.has_locals() {
                def.num_args_and_locals + LOCALS_FIX
            } else {
                0
            };

            (def.first_arg, window)
        };

        // restore the caller's view of the window, then re-track its strings
        if self.state.current >= 0 && window > 0 {
            let parent = self.state.current as usize;

            for i in 0..window {
                let bytes = self.state.stack[parent].locals[i];
                self.globals.put_bytes(bytes, first_arg + i as u32)?;
            }

            let backups = std::mem::take(&mut self.state.stack[parent].ref_strings);

            for backup in &backups {
                self.strings.push_ref(backup)?;
            }
        }

        Ok(())
    }

    /// Runs a function until its return unwinds the initial call.
    ///
    /// Native targets are invoked directly. Execution is re-entrant: a builtin may call back
    /// into `execute` on the same machine.
    pub fn execute(&mut self, f: FunctionId) -> Result<(), ProgsError> {
        match self.get_function(f)?.kind {
            FunctionKind::Unresolved => {
                let name = self
                    .strings
                    .get(self.functions[f.0].name_id)
                    .unwrap_or("")
                    .to_owned();

                Err(ProgsError::BadFunction(format!(
                    "tried to call missing function {}",
                    name
                )))
            }
            FunctionKind::BuiltIn(slot) => {
                let builtin = self
                    .builtins
                    .get(slot)
                    .ok_or_else(|| ProgsError::BadFunction("bad builtin call number".to_owned()))?;

                builtin(self)
            }
            FunctionKind::QuakeC(_) => {
                let mut enter_depth: i32 = 1;

                self.enter(f)?;

                loop {
                    let cur = self.state.current;

                    if cur < 0 {
                        return Err(ProgsError::StackUnderflow);
                    }

                    let cur = cur as usize;
                    let pc = self.state.stack[cur].pc.wrapping_add(1);
                    self.state.stack[cur].pc = pc;

                    let st = *self.statements.get(pc).ok_or_else(|| {
                        ProgsError::with_msg("program counter out of range")
                    })?;

                    self.dispatch(st, &mut enter_depth)?;

                    if enter_depth == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn execute_by_name(&mut self, name: &str) -> Result<(), ProgsError> {
        let f = self
            .find_function_id(name)
            .ok_or_else(|| ProgsError::BadFunction(format!("no function named {}", name)))?;

        self.execute(f)
    }

    /// Applies a branch: the current statement plus `delta`, minus the loop's pre-increment.
    fn jump(&mut self, delta: i16) {
        let frame = &mut self.state.stack[self.state.current as usize];
        frame.pc = frame
            .pc
            .wrapping_add((i64::from(delta) - 1) as usize);
    }

    fn op_call(
        &mut self,
        st: Statement,
        argc: u8,
        hargs: u8,
        depth: &mut i32,
    ) -> Result<(), ProgsError> {
        self.state.argc = argc;

        // H variants pre-load the first parameter slots from their operands
        if hargs >= 1 {
            self.copy_globals(GLOBAL_ADDR_PARM0, st.b, 3)?;
        }

        if hargs >= 2 {
            self.copy_globals(GLOBAL_ADDR_PARM1, st.c, 3)?;
        }

        let target = self.globals.get_int(st.a)?;

        if target <= 0 || target as usize >= self.functions.len() {
            return Err(ProgsError::BadFunction("NULL function".to_owned()));
        }

        let f = FunctionId(target as usize);

        match self.functions[f.0].kind {
            FunctionKind::BuiltIn(slot) => {
                let builtin = self
                    .builtins
                    .get(slot)
                    .ok_or_else(|| ProgsError::BadFunction("bad builtin call number".to_owned()))?;

                builtin(self)
            }
            FunctionKind::Unresolved => {
                let name = self
                    .strings
                    .get(self.functions[f.0].name_id)
                    .unwrap_or("")
                    .to_owned();

                Err(ProgsError::BadFunction(format!(
                    "tried to call missing function {}",
                    name
                )))
            }
            FunctionKind::QuakeC(_) => {
                *depth += 1;
                self.enter(f)
            }
        }
    }

    /// Reads a span of cells through a pointer. Returns the cells and, for reads out of a
    /// tracked region, the source address for tracking transfer.
    fn loadp_cells(
        &mut self,
        ptr: Pointer,
        span: usize,
    ) -> Result<(SmallVec<[[u8; 4]; 3]>, Option<CellAddr>), ProgsError> {
        match self.resolve(ptr, span * 4)? {
            Resolved::Cells(src) => {
                let mut cells = SmallVec::new();

                for i in 0..span {
                    cells.push(self.read_cell(src.offset(i))?);
                }

                Ok((cells, Some(src)))
            }
            Resolved::Handle { index, offset } => {
                let window = self.handles.resolve(index, offset as usize, span * 4)?;
                let mut cells = SmallVec::new();

                for i in 0..span {
                    let mut cell = [0; 4];
                    cell.copy_from_slice(&window[i * 4..i * 4 + 4]);
                    cells.push(cell);
                }

                Ok((cells, None))
            }
        }
    }

    /// Writes a span of cells through a pointer, maintaining string tracking and field wraps
    /// for writes into the tracked regions.
    fn storep_cells(
        &mut self,
        ptr: Pointer,
        cells: &[[u8; 4]],
        src_track: Option<CellAddr>,
    ) -> Result<(), ProgsError> {
        let span = cells.len();

        match self.resolve(ptr, span * 4)? {
            Resolved::Cells(dst) => {
                for (i, cell) in cells.iter().enumerate() {
                    self.write_cell_raw(dst.offset(i), *cell)?;
                }

                match src_track {
                    Some(src) => self.strings.mark_refs_copied(src, dst, span)?,
                    None => self.check_unset(dst, span, false)?,
                }

                self.wrap_check(dst, span)
            }
            Resolved::Handle { index, offset } => {
                let window = self.handles.resolve(index, offset as usize, span * 4)?;

                for (i, cell) in cells.iter().enumerate() {
                    window[i * 4..i * 4 + 4].copy_from_slice(cell);
                }

                Ok(())
            }
        }
    }

    fn op_load(&mut self, st: Statement, span: usize) -> Result<(), ProgsError> {
        let ent = self.globals.entity_id(st.a)?;
        let field = self.globals.get_int(st.b)?;
        let ptr = self.entities.field_pointer(ent, field);

        match self.resolve(ptr, span * 4)? {
            Resolved::Cells(src) => self.copy_cells(src, CellAddr::Global(st.c), span),
            Resolved::Handle { .. } => {
                Err(ProgsError::BadPointer("entity field in handle".to_owned()))
            }
        }
    }

    fn op_loada(&mut self, st: Statement, span: usize) -> Result<(), ProgsError> {
        let ofs = self.globals.get_int(st.b)?;
        let byte = ((i64::from(st.a as i32) + i64::from(ofs)) * 4) as u32;
        let ptr = Pointer::global(byte);

        match self.resolve(ptr, span * 4)? {
            Resolved::Cells(src) => self.copy_cells(src, CellAddr::Global(st.c), span),
            Resolved::Handle { .. } => {
                Err(ProgsError::BadPointer("global address in handle".to_owned()))
            }
        }
    }

    fn op_loadp(&mut self, st: Statement, span: usize) -> Result<(), ProgsError> {
        let ofs = self.globals.get_int(st.b)?;
        let ptr = self.globals.pointer(st.a)?.offset_by(ofs.wrapping_mul(4));

        let (cells, src) = self.loadp_cells(ptr, span)?;

        match src {
            Some(src) => self.copy_cells(src, CellAddr::Global(st.c), span),
            None => self.write_global(st.c, &cells),
        }
    }

    fn op_storep(&mut self, st: Statement, span: usize) -> Result<(), ProgsError> {
        let offset = self.globals.get_int(st.c)?;
        let ptr = self.globals.pointer(st.b)?.offset_by(offset.wrapping_mul(4));

        let mut cells: SmallVec<[[u8; 4]; 3]> = SmallVec::new();

        for i in 0..span as u32 {
            cells.push(self.globals.get_bytes(st.a + i)?);
        }

        self.storep_cells(ptr, &cells, Some(CellAddr::Global(st.a)))
    }

    /// Converting pointer store: reads the source as one type, stores the other.
    fn op_storep_conv(&mut self, st: Statement, to_float: bool) -> Result<(), ProgsError> {
        let offset = self.globals.get_int(st.c)?;
        let ptr = self.globals.pointer(st.b)?.offset_by(offset.wrapping_mul(4));

        let cell = if to_float {
            cell_from_f32(self.globals.get_int(st.a)? as f32)
        } else {
            cell_from_i32(self.globals.get_float(st.a)? as i32)
        };

        self.storep_cells(ptr, &[cell], Some(CellAddr::Global(st.a)))
    }

    /// Store into an entity field named by id (entity in a, field in b, value in c).
    fn op_storef(&mut self, st: Statement, span: usize) -> Result<(), ProgsError> {
        let ent = self.globals.entity_id(st.a)?;
        let field = self.globals.get_int(st.b)?;
        let ptr = self.entities.field_pointer(ent, field);

        match self.resolve(ptr, span * 4)? {
            Resolved::Cells(dst) => self.copy_cells(CellAddr::Global(st.c), dst, span),
            Resolved::Handle { .. } => {
                Err(ProgsError::BadPointer("entity field in handle".to_owned()))
            }
        }
    }

    fn op_address(&mut self, st: Statement) -> Result<(), ProgsError> {
        let ent = self.globals.entity_id(st.a)?;
        let field = self.globals.get_int(st.b)?;
        let ptr = self.entities.field_pointer(ent, field);

        self.set_global_pointer(st.c, ptr)
    }

    /// Read-modify-write float through a pointer; the result also lands in c.
    fn op_compound_storep_f(
        &mut self,
        st: Statement,
        op: fn(f32, f32) -> f32,
    ) -> Result<(), ProgsError> {
        let ptr = self.globals.pointer(st.b)?;

        let (cells, _) = self.loadp_cells(ptr, 1)?;
        let current = cell_to_f32(cells[0]);
        let operand = self.globals.get_float(st.a)?;
        let result = op(current, operand);

        self.storep_cells(ptr, &[cell_from_f32(result)], None)?;
        self.set_global_float(st.c, result)
    }

    /// Read-modify-write vector through a pointer.
    fn op_compound_storep_v(
        &mut self,
        st: Statement,
        op: fn(Vector3<f32>, Vector3<f32>) -> Vector3<f32>,
    ) -> Result<(), ProgsError> {
        let ptr = self.globals.pointer(st.b)?;

        let (cells, _) = self.loadp_cells(ptr, 3)?;
        let current = Vector3::new(
            cell_to_f32(cells[0]),
            cell_to_f32(cells[1]),
            cell_to_f32(cells[2]),
        );
        let operand = vec3(&self.globals, st.a)?;
        let result = op(current, operand);

        self.storep_cells(
            ptr,
            &[
                cell_from_f32(result.x),
                cell_from_f32(result.y),
                cell_from_f32(result.z),
            ],
            None,
        )?;

        self.set_global_vector(st.c, result.into())
    }

    fn op_loadp_char(&mut self, st: Statement, as_float: bool) -> Result<(), ProgsError> {
        let id = self.globals.string_id(st.a)?;
        let ofs = self.globals.get_int(st.b)?;
        let len = self.strings.get_length(id)?;

        let result = if ofs < 0 || ofs as usize >= len {
            0
        } else {
            i32::from(self.strings.get(id)?.as_bytes()[ofs as usize])
        };

        if as_float {
            self.set_global_float(st.c, result as f32)
        } else {
            self.set_global_int(st.c, result)
        }
    }

    fn dispatch(&mut self, st: Statement, depth: &mut i32) -> Result<(), ProgsError> {
        use self::Opcode::*;

        match st.opcode {
            Done => {
                self.leave()?;
                *depth -= 1;
                Ok(())
            }

            Return => {
                // void returns still clobber all three RETURN cells
                self.copy_globals(GLOBAL_ADDR_RETURN, st.a, 3)?;

                self.leave()?;
                *depth -= 1;
                Ok(())
            }

            MulF => mul_f(self, st.a, st.b, st.c),
            MulV => mul_v(self, st.a, st.b, st.c),
            MulFV => mul_fv(self, st.a, st.b, st.c),
            MulVF => mul_vf(self, st.a, st.b, st.c),
            MulVI => mul_vi(self, st.a, st.b, st.c),
            MulIV => mul_iv(self, st.a, st.b, st.c),
            MulI => mul_i(self, st.a, st.b, st.c),
            MulIF => mul_if(self, st.a, st.b, st.c),
            MulFI => mul_fi(self, st.a, st.b, st.c),

            DivF => div_f(self, st.a, st.b, st.c),
            DivI => div_i(self, st.a, st.b, st.c),
            DivVF => div_vf(self, st.a, st.b, st.c),
            DivIF => div_if(self, st.a, st.b, st.c),
            DivFI => div_fi(self, st.a, st.b, st.c),

            AddF => add_f(self, st.a, st.b, st.c),
            AddV => add_v(self, st.a, st.b, st.c),
            AddI => add_i(self, st.a, st.b, st.c),
            AddFI => add_fi(self, st.a, st.b, st.c),
            AddIF => add_if(self, st.a, st.b, st.c),

            SubF => sub_f(self, st.a, st.b, st.c),
            SubV => sub_v(self, st.a, st.b, st.c),
            SubI => sub_i(self, st.a, st.b, st.c),
            SubFI => sub_fi(self, st.a, st.b, st.c),
            SubIF => sub_if(self, st.a, st.b, st.c),

            EqF => eq_f(self, st.a, st.b, st.c),
            EqV => eq_v(self, st.a, st.b, st.c),
            EqS => eq_s(self, st.a, st.b, st.c),
            EqE => eq_e(self, st.a, st.b, st.c),
            EqFnc => eq_fnc(self, st.a, st.b, st.c),
            EqI => eq_i(self, st.a, st.b, st.c),
            EqIF => eq_if(self, st.a, st.b, st.c),
            EqFI => eq_fi(self, st.a, st.b, st.c),

            NeF => ne_f(self, st.a, st.b, st.c),
            NeV => ne_v(self, st.a, st.b, st.c),
            NeS => ne_s(self, st.a, st.b, st.c),
            NeE => ne_e(self, st.a, st.b, st.c),
            NeFnc => ne_fnc(self, st.a, st.b, st.c),
            NeI => ne_i(self, st.a, st.b, st.c),
            NeIF => ne_if(self, st.a, st.b, st.c),
            NeFI => ne_fi(self, st.a, st.b, st.c),

            LeF => le_f(self, st.a, st.b, st.c),
            LeI => le_i(self, st.a, st.b, st.c),
            LeIF => le_if(self, st.a, st.b, st.c),
            LeFI => le_fi(self, st.a, st.b, st.c),

            GeF => ge_f(self, st.a, st.b, st.c),
            GeI => ge_i(self, st.a, st.b, st.c),
            GeIF => ge_if(self, st.a, st.b, st.c),
            GeFI => ge_fi(self, st.a, st.b, st.c),

            LtF => lt_f(self, st.a, st.b, st.c),
            LtI => lt_i(self, st.a, st.b, st.c),
            LtIF => lt_if(self, st.a, st.b, st.c),
            LtFI => lt_fi(self, st.a, st.b, st.c),

            GtF => gt_f(self, st.a, st.b, st.c),
            GtI => gt_i(self, st.a, st.b, st.c),
            GtIF => gt_if(self, st.a, st.b, st.c),
            GtFI => gt_fi(self, st.a, st.b, st.c),

            LoadF | LoadS | LoadEnt | LoadFld | LoadFnc | LoadI | LoadP => self.op_load(st, 1),
            LoadV => self.op_load(st, 3),

            Address => self.op_address(st),

            StoreF | StoreS | StoreEnt | StoreFld | StoreFnc | StoreI | StoreP => {
                self.copy_globals(st.b, st.a, 1)
            }
            StoreV => self.copy_globals(st.b, st.a, 3),
            StoreIF => store_if(self, st.a, st.b),
            StoreFI => store_fi(self, st.a, st.b),

            StorePF | StorePS | StorePEnt | StorePFld | StorePFnc | StorePI => {
                self.op_storep(st, 1)
            }
            StorePV => self.op_storep(st, 3),
            StorePIF => self.op_storep_conv(st, true),
            StorePFI => self.op_storep_conv(st, false),

            StorefF | StorefS | StorefI => self.op_storef(st, 1),
            StorefV => self.op_storef(st, 3),

            MulStorePF => self.op_compound_storep_f(st, |f, a| f * a),
            DivStorePF => self.op_compound_storep_f(st, |f, a| f / a),
            AddStorePF => self.op_compound_storep_f(st, |f, a| f + a),
            SubStorePF => self.op_compound_storep_f(st, |f, a| f - a),
            MulStorePVF => {
                let scale = self.globals.get_float(st.a)?;
                let ptr = self.globals.pointer(st.b)?;

                let (cells, _) = self.loadp_cells(ptr, 3)?;
                let current = Vector3::new(
                    cell_to_f32(cells[0]),
                    cell_to_f32(cells[1]),
                    cell_to_f32(cells[2]),
                );
                let result = current * scale;

                self.storep_cells(
                    ptr,
                    &[
                        cell_from_f32(result.x),
                        cell_from_f32(result.y),
                        cell_from_f32(result.z),
                    ],
                    None,
                )?;

                self.set_global_vector(st.c, result.into())
            }
            AddStorePV => self.op_compound_storep_v(st, |f, a| f + a),
            SubStorePV => self.op_compound_storep_v(st, |f, a| f - a),

            NotF => not_f(self, st.a, st.c),
            NotV => not_v(self, st.a, st.c),
            NotS => not_s(self, st.a, st.c),
            NotEnt => not_ent(self, st.a, st.c),
            NotFnc => not_fnc(self, st.a, st.c),
            NotI => not_i(self, st.a, st.c),

            IfI => {
                if self.globals.get_float(st.a)? != 0.0 {
                    self.jump(Statement::branch_offset(st.b));
                }

                Ok(())
            }
            IfF => {
                if self.globals.get_int(st.a)? != 0 {
                    self.jump(Statement::branch_offset(st.b));
                }

                Ok(())
            }
            IfS => {
                if string_nonempty(self, st.a)? {
                    self.jump(Statement::branch_offset(st.b));
                }

                Ok(())
            }
            IfNotI => {
                if self.globals.get_float(st.a)? == 0.0 {
                    self.jump(Statement::branch_offset(st.b));
                }

                Ok(())
            }
            IfNotF => {
                if self.globals.get_int(st.a)? == 0 {
                    self.jump(Statement::branch_offset(st.b));
                }

                Ok(())
            }
            IfNotS => {
                if !string_nonempty(self, st.a)? {
                    self.jump(Statement::branch_offset(st.b));
                }

                Ok(())
            }

            Goto => {
                self.jump(Statement::branch_offset(st.a));
                Ok(())
            }

            Call0 => self.op_call(st, 0, 0, depth),
            Call1 => self.op_call(st, 1, 0, depth),
            Call2 => self.op_call(st, 2, 0, depth),
            Call3 => self.op_call(st, 3, 0, depth),
            Call4 => self.op_call(st, 4, 0, depth),
            Call5 => self.op_call(st, 5, 0, depth),
            Call6 => self.op_call(st, 6, 0, depth),
            Call7 => self.op_call(st, 7, 0, depth),
            Call8 => self.op_call(st, 8, 0, depth),

            Call1H => self.op_call(st, 1, 1, depth),
            Call2H => self.op_call(st, 2, 2, depth),
            Call3H => self.op_call(st, 3, 2, depth),
            Call4H => self.op_call(st, 4, 2, depth),
            Call5H => self.op_call(st, 5, 2, depth),
            Call6H => self.op_call(st, 6, 2, depth),
            Call7H => self.op_call(st, 7, 2, depth),
            Call8H => self.op_call(st, 8, 2, depth),

            AndF => and_f(self, st.a, st.b, st.c),
            AndI => and_i(self, st.a, st.b, st.c),
            AndIF => and_if(self, st.a, st.b, st.c),
            AndFI => and_fi(self, st.a, st.b, st.c),

            OrF => or_f(self, st.a, st.b, st.c),
            OrI => or_i(self, st.a, st.b, st.c),
            OrIF => or_if(self, st.a, st.b, st.c),
            OrFI => or_fi(self, st.a, st.b, st.c),

            BitAndF => bit_and_f(self, st.a, st.b, st.c),
            BitAndI => bit_and_i(self, st.a, st.b, st.c),
            BitAndIF => bit_and_if(self, st.a, st.b, st.c),
            BitAndFI => bit_and_fi(self, st.a, st.b, st.c),

            BitOrF => bit_or_f(self, st.a, st.b, st.c),
            BitOrI => bit_or_i(self, st.a, st.b, st.c),
            BitOrIF => bit_or_if(self, st.a, st.b, st.c),
            BitOrFI => bit_or_fi(self, st.a, st.b, st.c),

            BitXorI => bit_xor_i(self, st.a, st.b, st.c),
            RShiftI => rshift_i(self, st.a, st.b, st.c),
            LShiftI => lshift_i(self, st.a, st.b, st.c),

            ConvItoF => {
                let v = self.globals.get_int(st.a)? as f32;
                self.set_global_float(st.c, v)
            }
            ConvFtoI => {
                let v = self.globals.get_float(st.a)? as i32;
                self.set_global_int(st.c, v)
            }
            CpItoF => {
                let ptr = self.globals.pointer(st.a)?;
                let (cells, _) = self.loadp_cells(ptr, 1)?;
                self.set_global_float(st.c, cell_to_i32(cells[0]) as f32)
            }
            CpFtoI => {
                let ptr = self.globals.pointer(st.a)?;
                let (cells, _) = self.loadp_cells(ptr, 1)?;
                self.set_global_int(st.c, cell_to_f32(cells[0]) as i32)
            }

            GlobalAddress => {
                let ofs = self.globals.get_int(st.b)?;
                let byte = ((i64::from(st.a as i32) + i64::from(ofs)) * 4) as u32;
                self.set_global_pointer(st.c, Pointer::global(byte))
            }
            AddPIW => {
                let a = self.globals.get_int(st.a)?;
                let b = self.globals.get_int(st.b)?;
                self.set_global_int(st.c, a.wrapping_add(b.wrapping_mul(4)))
            }

            LoadAF | LoadAS | LoadAEnt | LoadAFld | LoadAFnc | LoadAI => self.op_loada(st, 1),
            LoadAV => self.op_loada(st, 3),

            LoadPF | LoadPS | LoadPEnt | LoadPFld | LoadPFnc | LoadPI => self.op_loadp(st, 1),
            LoadPV => self.op_loadp(st, 3),

            LoadPC => self.op_loadp_char(st, true),
            LoadPB => self.op_loadp_char(st, false),

            BoundCheck => {
                let value = self.globals.get_int(st.a)? as u32;

                if value < st.c || value >= st.b {
                    return Err(ProgsError::BoundsCheck {
                        value,
                        min: st.c,
                        max: st.b,
                    });
                }

                Ok(())
            }

            Rand0 => {
                let v: f32 = rand::random();
                self.set_global_float(st.c, v)
            }
            Rand1 => {
                let hi = self.globals.get_float(st.a)?;
                self.set_global_float(st.c, rand::random::<f32>() * hi)
            }
            Rand2 => {
                let lo = self.globals.get_float(st.a)?;
                let hi = self.globals.get_float(st.b)?;
                self.set_global_float(st.c, lo + rand::random::<f32>() * (hi - lo))
            }
            RandV0 => self.set_global_vector(
                st.c,
                [rand::random(), rand::random(), rand::random()],
            ),
            RandV1 => {
                let a = self.globals.get_vector(st.a)?;
                self.set_global_vector(
                    st.c,
                    [
                        rand::random::<f32>() * a[0],
                        rand::random::<f32>() * a[1],
                        rand::random::<f32>() * a[2],
                    ],
                )
            }
            RandV2 => {
                let a = self.globals.get_vector(st.a)?;
                let b = self.globals.get_vector(st.b)?;
                self.set_global_vector(
                    st.c,
                    [
                        a[0] + rand::random::<f32>() * (b[0] - a[0]),
                        a[1] + rand::random::<f32>() * (b[1] - a[1]),
                        a[2] + rand::random::<f32>() * (b[2] - a[2]),
                    ],
                )
            }

            IntrinSqrt => {
                let v = self.globals.get_float(st.b)?;
                self.set_global_float(GLOBAL_ADDR_RETURN, v.sqrt())
            }
            IntrinSin => {
                let v = self.globals.get_float(st.b)?;
                self.set_global_float(GLOBAL_ADDR_RETURN, v.sin())
            }
            IntrinCos => {
                let v = self.globals.get_float(st.b)?;
                self.set_global_float(GLOBAL_ADDR_RETURN, v.cos())
            }

            op => Err(ProgsError::with_msg(format!(
                "opcode invalid or not implemented: {:?}",
                op
            ))),
        }
    }
}

fn vec3(globals: &Globals, addr: u32) -> Result<Vector3<f32>, ProgsError> {
    Ok(Vector3::from(globals.get_vector(addr)?))
}

fn string_nonempty(vm: &Vm, addr: u32) -> Result<bool, ProgsError> {
    let id = vm.globals.string_id(addr)?;
    Ok(id != STRING_EMPTY && !vm.strings.get(id)?.is_empty())
}

// float arithmetic
macro_rules! op_float {
    ($name:ident, |$x:ident, $y:ident| $body:expr) => {
        fn $name(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
            let $x = vm.globals.get_float(a)?;
            let $y = vm.globals.get_float(b)?;
            vm.set_global_float(c, $body)
        }
    };
}

op_float!(mul_f, |x, y| x * y);
op_float!(div_f, |x, y| x / y);
op_float!(add_f, |x, y| x + y);
op_float!(sub_f, |x, y| x - y);
op_float!(eq_f, |x, y| bool_f(x == y));
op_float!(ne_f, |x, y| bool_f(x != y));
op_float!(le_f, |x, y| bool_f(x <= y));
op_float!(ge_f, |x, y| bool_f(x >= y));
op_float!(lt_f, |x, y| bool_f(x < y));
op_float!(gt_f, |x, y| bool_f(x > y));
op_float!(and_f, |x, y| bool_f(x != 0.0 && y != 0.0));
op_float!(or_f, |x, y| bool_f(x != 0.0 || y != 0.0));
op_float!(bit_and_f, |x, y| ((x as i32) & (y as i32)) as f32);
op_float!(bit_or_f, |x, y| ((x as i32) | (y as i32)) as f32);

// integer arithmetic
macro_rules! op_int {
    ($name:ident, |$x:ident, $y:ident| $body:expr) => {
        fn $name(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
            let $x = vm.globals.get_int(a)?;
            let $y = vm.globals.get_int(b)?;
            vm.set_global_int(c, $body)
        }
    };
}

op_int!(mul_i, |x, y| x.wrapping_mul(y));
op_int!(div_i, |x, y| if y == 0 { 0 } else { x.wrapping_div(y) });
op_int!(add_i, |x, y| x.wrapping_add(y));
op_int!(sub_i, |x, y| x.wrapping_sub(y));
op_int!(eq_i, |x, y| (x == y) as i32);
op_int!(ne_i, |x, y| (x != y) as i32);
op_int!(le_i, |x, y| (x <= y) as i32);
op_int!(ge_i, |x, y| (x >= y) as i32);
op_int!(lt_i, |x, y| (x < y) as i32);
op_int!(gt_i, |x, y| (x > y) as i32);
op_int!(and_i, |x, y| (x != 0 && y != 0) as i32);
op_int!(or_i, |x, y| (x != 0 || y != 0) as i32);
op_int!(bit_and_i, |x, y| x & y);
op_int!(bit_or_i, |x, y| x | y);
op_int!(bit_xor_i, |x, y| x ^ y);
op_int!(rshift_i, |x, y| x.wrapping_shr(y as u32));
op_int!(lshift_i, |x, y| x.wrapping_shl(y as u32));

// mixed int/float: left operand int, right float
macro_rules! op_int_float {
    ($name:ident, |$x:ident, $y:ident| $body:expr, $put:ident) => {
        fn $name(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
            let $x = vm.globals.get_int(a)?;
            let $y = vm.globals.get_float(b)?;
            vm.$put(c, $body)
        }
    };
}

op_int_float!(mul_if, |x, y| (x as f32) * y, set_global_float);
op_int_float!(div_if, |x, y| (x as f32) / y, set_global_float);
op_int_float!(add_if, |x, y| (x as f32) + y, set_global_float);
op_int_float!(sub_if, |x, y| (x as f32) - y, set_global_float);
op_int_float!(eq_if, |x, y| ((x as f32) == y) as i32, set_global_int);
op_int_float!(ne_if, |x, y| ((x as f32) != y) as i32, set_global_int);
op_int_float!(le_if, |x, y| ((x as f32) <= y) as i32, set_global_int);
op_int_float!(ge_if, |x, y| ((x as f32) >= y) as i32, set_global_int);
op_int_float!(lt_if, |x, y| ((x as f32) < y) as i32, set_global_int);
op_int_float!(gt_if, |x, y| ((x as f32) > y) as i32, set_global_int);
op_int_float!(and_if, |x, y| (x != 0 && y != 0.0) as i32, set_global_int);
op_int_float!(or_if, |x, y| (x != 0 || y != 0.0) as i32, set_global_int);
op_int_float!(bit_and_if, |x, y| x & (y as i32), set_global_int);
op_int_float!(bit_or_if, |x, y| x | (y as i32), set_global_int);

// mixed float/int: left operand float, right int
macro_rules! op_float_int {
    ($name:ident, |$x:ident, $y:ident| $body:expr, $put:ident) => {
        fn $name(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
            let $x = vm.globals.get_float(a)?;
            let $y = vm.globals.get_int(b)?;
            vm.$put(c, $body)
        }
    };
}

op_float_int!(mul_fi, |x, y| x * (y as f32), set_global_float);
op_float_int!(div_fi, |x, y| x / (y as f32), set_global_float);
op_float_int!(add_fi, |x, y| x + (y as f32), set_global_float);
op_float_int!(sub_fi, |x, y| x - (y as f32), set_global_float);
op_float_int!(eq_fi, |x, y| (x == (y as f32)) as i32, set_global_int);
op_float_int!(ne_fi, |x, y| (x != (y as f32)) as i32, set_global_int);
op_float_int!(le_fi, |x, y| (x <= (y as f32)) as i32, set_global_int);
op_float_int!(ge_fi, |x, y| (x >= (y as f32)) as i32, set_global_int);
op_float_int!(lt_fi, |x, y| (x < (y as f32)) as i32, set_global_int);
op_float_int!(gt_fi, |x, y| (x > (y as f32)) as i32, set_global_int);
op_float_int!(and_fi, |x, y| (x != 0.0 && y != 0) as i32, set_global_int);
op_float_int!(or_fi, |x, y| (x != 0.0 || y != 0) as i32, set_global_int);
op_float_int!(bit_and_fi, |x, y| (x as i32) & y, set_global_int);
op_float_int!(bit_or_fi, |x, y| (x as i32) | y, set_global_int);

// identity comparisons (entities, functions); the result is a float truth value
macro_rules! op_ident_cmp {
    ($name:ident, $op:tt) => {
        fn $name(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
            let x = vm.globals.get_int(a)?;
            let y = vm.globals.get_int(b)?;
            vm.set_global_float(c, bool_f(x $op y))
        }
    };
}

op_ident_cmp!(eq_e, ==);
op_ident_cmp!(ne_e, !=);
op_ident_cmp!(eq_fnc, ==);
op_ident_cmp!(ne_fnc, !=);

fn bool_f(v: bool) -> f32 {
    v as i32 as f32
}

// MUL_V is the dot product
fn mul_v(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
    let x = vec3(&vm.globals, a)?;
    let y = vec3(&vm.globals, b)?;
    vm.set_global_float(c, x.dot(y))
}

fn mul_vf(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
    let x = vec3(&vm.globals, a)?;
    let y = vm.globals.get_float(b)?;
    vm.set_global_vector(c, (x * y).into())
}

fn mul_fv(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
    let x = vm.globals.get_float(a)?;
    let y = vec3(&vm.globals, b)?;
    vm.set_global_vector(c, (y * x).into())
}

fn mul_vi(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
    let x = vec3(&vm.globals, a)?;
    let y = vm.globals.get_int(b)?;
    vm.set_global_vector(c, (x * y as f32).into())
}

fn mul_iv(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
    let x = vm.globals.get_int(a)?;
    let y = vec3(&vm.globals, b)?;
    vm.set_global_vector(c, (y * x as f32).into())
}

fn div_vf(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
    let x = vec3(&vm.globals, a)?;
    let y = vm.globals.get_float(b)?;
    vm.set_global_vector(c, (x / y).into())
}

fn add_v(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
    let x = vec3(&vm.globals, a)?;
    let y = vec3(&vm.globals, b)?;
    vm.set_global_vector(c, (x + y).into())
}

fn sub_v(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
    let x = vec3(&vm.globals, a)?;
    let y = vec3(&vm.globals, b)?;
    vm.set_global_vector(c, (x - y).into())
}

fn eq_v(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
    let x = vec3(&vm.globals, a)?;
    let y = vec3(&vm.globals, b)?;
    vm.set_global_float(c, bool_f(x == y))
}

fn ne_v(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
    let x = vec3(&vm.globals, a)?;
    let y = vec3(&vm.globals, b)?;
    vm.set_global_float(c, bool_f(x != y))
}

fn eq_s(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
    let x = vm.globals.string_id(a)?;
    let y = vm.globals.string_id(b)?;

    let equal = if x == y {
        true
    } else {
        let xs = vm.strings.get(x)?;
        let ys = vm.strings.get(y)?;

        if vm.strings_case_sensitive() {
            xs == ys
        } else {
            xs.eq_ignore_ascii_case(ys)
        }
    };

    vm.set_global_float(c, bool_f(equal))
}

fn ne_s(vm: &mut Vm, a: u32, b: u32, c: u32) -> Result<(), ProgsError> {
    let x = vm.globals.string_id(a)?;
    let y = vm.globals.string_id(b)?;

    let equal = if x == y {
        true
    } else {
        let xs = vm.strings.get(x)?;
        let ys = vm.strings.get(y)?;

        if vm.strings_case_sensitive() {
            xs == ys
        } else {
            xs.eq_ignore_ascii_case(ys)
        }
    };

    vm.set_global_float(c, bool_f(!equal))
}

fn store_if(vm: &mut Vm, a: u32, b: u32) -> Result<(), ProgsError> {
    let v = vm.globals.get_int(a)? as f32;
    vm.set_global_float(b, v)?;
    vm.strings
        .mark_refs_copied(CellAddr::Global(a), CellAddr::Global(b), 1)
}

fn store_fi(vm: &mut Vm, a: u32, b: u32) -> Result<(), ProgsError> {
    let v = vm.globals.get_float(a)? as i32;
    vm.set_global_int(b, v)?;
    vm.strings
        .mark_refs_copied(CellAddr::Global(a), CellAddr::Global(b), 1)
}

fn not_f(vm: &mut Vm, a: u32, c: u32) -> Result<(), ProgsError> {
    let x = vm.globals.get_float(a)?;
    vm.set_global_float(c, bool_f(x == 0.0))
}

fn not_v(vm: &mut Vm, a: u32, c: u32) -> Result<(), ProgsError> {
    let x = vec3(&vm.globals, a)?;
    vm.set_global_float(c, bool_f(x == Vector3::new(0.0, 0.0, 0.0)))
}

fn not_s(vm: &mut Vm, a: u32, c: u32) -> Result<(), ProgsError> {
    let empty = !string_nonempty(vm, a)?;
    vm.set_global_float(c, bool_f(empty))
}

fn not_ent(vm: &mut Vm, a: u32, c: u32) -> Result<(), ProgsError> {
    let ent = vm.globals.entity_id(a)?;
    vm.set_global_float(c, bool_f(ent == EntityId::WORLD))
}

fn not_fnc(vm: &mut Vm, a: u32, c: u32) -> Result<(), ProgsError> {
    let f = vm.globals.function_id(a)?;
    vm.set_global_float(c, bool_f(f == 0))
}

fn not_i(vm: &mut Vm, a: u32, c: u32) -> Result<(), ProgsError> {
    let x = vm.globals.get_int(a)?;
    vm.set_global_int(c, (x == 0) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::any::Any;

    use byteorder::{ByteOrder, LittleEndian};

    use crate::entity::EntityConfig;
    use crate::handles::HandleData;
    use crate::testutil::ModuleBuilder;
    use crate::Type;

    fn init_logging() {
        let _ = env_logger::try_init();
    }

    #[test]
    fn test_add_f_end_to_end() {
        init_logging();

        let mut b = ModuleBuilder::new(128);
        b.set_global_f32(40, 2.5);
        b.set_global_f32(41, 1.5);

        let entry = b.next_statement();
        b.statement(Opcode::AddF, 40, 41, 42);
        b.statement(Opcode::Return, 42, 0, 0);
        b.function("main", entry as i32, 50, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();
        vm.execute_by_name("main").unwrap();

        assert_eq!(vm.globals.get_float(GLOBAL_ADDR_RETURN).unwrap(), 4.0);
        assert_eq!(vm.globals.get_float(42).unwrap(), 4.0);
    }

    #[test]
    fn test_done_leaves_return_untouched() {
        let mut b = ModuleBuilder::new(128);
        b.set_global_f32(GLOBAL_ADDR_RETURN as usize, 123.0);

        let entry = b.next_statement();
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", entry as i32, 50, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();
        vm.execute_by_name("main").unwrap();

        assert_eq!(vm.globals.get_float(GLOBAL_ADDR_RETURN).unwrap(), 123.0);
    }

    #[test]
    fn test_void_return_clobbers_return_cells() {
        let mut b = ModuleBuilder::new(128);

        let entry = b.next_statement();
        b.statement(Opcode::Return, 0, 0, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", entry as i32, 50, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();

        vm.set_global_vector(GLOBAL_ADDR_RETURN, [1.0, 2.0, 3.0]).unwrap();
        vm.execute_by_name("main").unwrap();

        assert_eq!(
            vm.globals.get_vector(GLOBAL_ADDR_RETURN).unwrap(),
            [0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_return_copies_parm0() {
        let mut b = ModuleBuilder::new(128);

        let entry = b.next_statement();
        b.statement(Opcode::Return, GLOBAL_ADDR_PARM0, 0, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", entry as i32, 50, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();
        vm.set_global_vector(GLOBAL_ADDR_PARM0, [7.0, 8.0, 9.0]).unwrap();
        vm.execute_by_name("main").unwrap();

        assert_eq!(
            vm.globals.get_vector(GLOBAL_ADDR_RETURN).unwrap(),
            [7.0, 8.0, 9.0]
        );
    }

    #[test]
    fn test_call_and_window_restore() {
        let mut b = ModuleBuilder::new(128);

        let sum_entry = b.next_statement();
        b.statement(Opcode::AddF, 40, 41, 45);
        b.statement(Opcode::Return, 45, 0, 0);
        let sum_fn = b.function("sum", sum_entry as i32, 40, 2, &[1, 1]);

        b.set_global_i32(60, sum_fn);
        let main_entry = b.next_statement();
        b.statement(Opcode::Call2, 60, 0, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 70, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();

        vm.set_global_float(parm_addr(0), 2.5).unwrap();
        vm.set_global_float(parm_addr(1), 3.0).unwrap();

        // the callee's register window belongs to the caller before the call
        vm.set_global_float(40, 111.0).unwrap();
        vm.set_global_float(41, 222.0).unwrap();

        vm.execute_by_name("main").unwrap();

        assert_eq!(vm.globals.get_float(GLOBAL_ADDR_RETURN).unwrap(), 5.5);
        assert_eq!(vm.globals.get_float(40).unwrap(), 111.0);
        assert_eq!(vm.globals.get_float(41).unwrap(), 222.0);
    }

    #[test]
    fn test_call8h_delivers_vectors() {
        let mut b = ModuleBuilder::new(128);

        let taker_entry = b.next_statement();
        b.statement(Opcode::StoreV, 40, 70, 0);
        b.statement(Opcode::StoreV, 43, 73, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        let taker_fn = b.function("taker", taker_entry as i32, 40, 6, &[3, 3]);

        b.set_global_i32(60, taker_fn);
        let main_entry = b.next_statement();
        b.statement(Opcode::Call8H, 60, 50, 53);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();

        vm.set_global_vector(50, [1.0, 2.0, 3.0]).unwrap();
        vm.set_global_vector(53, [4.0, 5.0, 6.0]).unwrap();

        vm.execute_by_name("main").unwrap();

        assert_eq!(vm.globals.get_vector(70).unwrap(), [1.0, 2.0, 3.0]);
        assert_eq!(vm.globals.get_vector(73).unwrap(), [4.0, 5.0, 6.0]);
        assert_eq!(
            vm.globals.get_vector(GLOBAL_ADDR_PARM0).unwrap(),
            [1.0, 2.0, 3.0]
        );
        assert_eq!(
            vm.globals.get_vector(GLOBAL_ADDR_PARM1).unwrap(),
            [4.0, 5.0, 6.0]
        );
    }

    fn qc_mk_t(vm: &mut Vm) -> Result<(), ProgsError> {
        vm.return_string("temp-T")?;
        Ok(())
    }

    #[test]
    fn test_nested_call_preserves_string_locals() {
        let mut b = ModuleBuilder::new(128);

        let mk_t_fn = b.function("mk_t", 0, 0, 0, &[]);

        // bar overwrites foo's local at 90 with a fresh dynamic string
        let bar_entry = b.next_statement();
        b.statement(Opcode::Call0, 61, 0, 0);
        b.statement(Opcode::StoreS, GLOBAL_ADDR_RETURN, 90, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        let bar_fn = b.function("bar", bar_entry as i32, 90, 1, &[]);

        let foo_entry = b.next_statement();
        b.statement(Opcode::StoreS, 80, 90, 0);
        b.statement(Opcode::Call0, 60, 0, 0);
        b.statement(Opcode::StoreS, 90, 95, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("foo", foo_entry as i32, 85, 0, &[]);

        b.set_global_i32(60, bar_fn);
        b.set_global_i32(61, mk_t_fn);

        let mut vm = b.load();
        vm.register_builtin("mk_t", qc_mk_t).unwrap();
        vm.check().unwrap();

        let s_id = vm.set_global_string(80, "persist-S").unwrap();
        assert_eq!(vm.strings.ref_count(s_id), Some(1));

        vm.execute_by_name("foo").unwrap();

        // foo's local reads as S again, with a ref per holding cell (80, 90, 95)
        let local = vm.globals.string_id(90).unwrap();
        assert_eq!(local, s_id);
        assert_eq!(vm.get_string(local).unwrap(), "persist-S");
        assert_eq!(vm.strings.ref_count(s_id), Some(3));

        // T survives only in RETURN; clobbering that frees it
        let t_id = vm.globals.string_id(GLOBAL_ADDR_RETURN).unwrap();
        assert!(t_id.is_dynamic());
        assert_eq!(vm.get_string(t_id).unwrap(), "temp-T");
        assert_eq!(vm.strings.ref_count(t_id), Some(1));

        vm.set_global_int(GLOBAL_ADDR_RETURN, 0).unwrap();
        assert!(!vm.strings.is_ref_counted(t_id));
    }

    #[test]
    fn test_intrinsic_rewrite_and_execute() {
        let mut b = ModuleBuilder::new(128);

        let sqrt_fn = b.function("sqrt", 0, 0, 0, &[1]);
        b.set_global_i32(70, sqrt_fn);
        b.set_global_f32(72, 16.0);

        let main_entry = b.next_statement();
        let call_idx = b.statement(Opcode::Call1H, 70, 72, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        assert_eq!(vm.statements[call_idx].opcode, Opcode::Call1H);

        vm.check().unwrap();
        assert_eq!(vm.statements[call_idx].opcode, Opcode::IntrinSqrt);

        // no builtin named sqrt was ever registered, so this succeeding proves the
        // substitution
        vm.execute_by_name("main").unwrap();
        assert_eq!(vm.globals.get_float(GLOBAL_ADDR_RETURN).unwrap(), 4.0);
    }

    fn scale_setter(dst: &mut [u8], src: &[u8; 4]) {
        let v = LittleEndian::read_f32(src);
        LittleEndian::write_i16(&mut dst[..2], (v * 8.0) as i16);
    }

    #[test]
    fn test_field_wrap_scales_to_short() {
        let mut b = ModuleBuilder::new(128);
        b.field("health", Type::QFloat, 51);

        b.set_global_i32(50, 1); // entity 1
        b.set_global_f32(52, 128.0);

        let main_entry = b.next_statement();
        b.statement(Opcode::Address, 50, 51, 53);
        b.statement(Opcode::StorePF, 52, 53, 0);
        b.statement(Opcode::LoadF, 50, 51, 55);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        vm.configure_entities(EntityConfig {
            system_size: 4,
            max_edicts: 4,
            max_clients: 0,
            client_size: 0,
        });
        vm.check().unwrap();

        // layout placed health just past the system region, and published the offset
        assert_eq!(vm.globals.get_int(51).unwrap(), 4);

        vm.register_field_wrap("health", 0, 8, Some(scale_setter)).unwrap();
        vm.execute_by_name("main").unwrap();

        let record = vm.entity_bytes(crate::EntityId(1)).unwrap();
        assert_eq!(LittleEndian::read_i16(&record[8..10]), 1024);

        assert_eq!(vm.globals.get_float(55).unwrap(), 128.0);
    }

    #[test]
    fn test_storep_bad_pointer_is_fatal() {
        let mut b = ModuleBuilder::new(128);
        b.set_global_i32(41, Pointer::entity(0x3000_0000).to_i32());

        let main_entry = b.next_statement();
        b.statement(Opcode::StorePI, 40, 41, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();

        match vm.execute_by_name("main") {
            Err(ProgsError::BadPointer(_)) => (),
            other => panic!("expected bad pointer, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_boundcheck() {
        let mut b = ModuleBuilder::new(128);
        b.set_global_i32(40, 5);

        let main_entry = b.next_statement();
        b.statement(Opcode::BoundCheck, 40, 5, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();

        match vm.execute_by_name("main") {
            Err(ProgsError::BoundsCheck { value: 5, min: 0, max: 5 }) => (),
            other => panic!("expected bounds fault, got {:?}", other.map(|_| ())),
        }

        let mut vm = b.load();
        vm.check().unwrap();
        vm.set_global_int(40, 4).unwrap();
        vm.execute_by_name("main").unwrap();
    }

    #[test]
    fn test_eq_s_honors_case_flag() {
        let mut b = ModuleBuilder::new(128);

        let upper = b.intern("Foo");
        let lower = b.intern("foo");
        b.set_global_i32(40, upper);
        b.set_global_i32(41, lower);

        let main_entry = b.next_statement();
        b.statement(Opcode::EqS, 40, 41, 42);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let strcase = b.strcase_global();

        let mut vm = b.load();
        vm.check().unwrap();

        vm.execute_by_name("main").unwrap();
        assert_eq!(vm.globals.get_float(42).unwrap(), 0.0);

        vm.set_global_int(strcase, 0).unwrap();
        vm.execute_by_name("main").unwrap();
        assert_eq!(vm.globals.get_float(42).unwrap(), 1.0);
    }

    #[test]
    fn test_backward_branch_loop() {
        let mut b = ModuleBuilder::new(128);
        b.set_global_f32(41, 1.0);
        b.set_global_f32(43, 5.0);

        let main_entry = b.next_statement();
        b.statement(Opcode::AddF, 40, 41, 40);
        b.statement(Opcode::LtF, 40, 43, 44);
        b.statement(Opcode::IfI, 44, (-2i32) as u32, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();
        vm.execute_by_name("main").unwrap();

        assert_eq!(vm.globals.get_float(40).unwrap(), 5.0);
    }

    fn qc_recurse(vm: &mut Vm) -> Result<(), ProgsError> {
        vm.execute_by_name("leaf")
    }

    #[test]
    fn test_builtin_reenters_execute() {
        let mut b = ModuleBuilder::new(128);
        b.set_global_f32(40, 42.0);

        let recurse_fn = b.function("recurse", 0, 0, 0, &[]);

        let leaf_entry = b.next_statement();
        b.statement(Opcode::StoreF, 40, 60, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("leaf", leaf_entry as i32, 80, 0, &[]);

        b.set_global_i32(61, recurse_fn);
        let main_entry = b.next_statement();
        b.statement(Opcode::Call0, 61, 0, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 85, 0, &[]);

        let mut vm = b.load();
        vm.register_builtin("recurse", qc_recurse).unwrap();
        vm.check().unwrap();

        vm.execute_by_name("main").unwrap();
        assert_eq!(vm.globals.get_float(60).unwrap(), 42.0);
    }

    #[test]
    fn test_string_byte_indexing() {
        let mut b = ModuleBuilder::new(128);

        let abc = b.intern("abc");
        b.set_global_i32(40, abc);
        b.set_global_i32(41, 1);
        b.set_global_i32(45, 99);

        let main_entry = b.next_statement();
        b.statement(Opcode::LoadPB, 40, 41, 42);
        b.statement(Opcode::LoadPB, 40, 45, 46);
        b.statement(Opcode::LoadPC, 40, 41, 47);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();
        vm.execute_by_name("main").unwrap();

        assert_eq!(vm.globals.get_int(42).unwrap(), i32::from(b'b'));
        assert_eq!(vm.globals.get_int(46).unwrap(), 0);
        assert_eq!(vm.globals.get_float(47).unwrap(), f32::from(b'b'));
    }

    #[test]
    fn test_global_address_store_load_roundtrip() {
        let mut b = ModuleBuilder::new(128);
        b.set_global_f32(43, 9.0);

        let main_entry = b.next_statement();
        b.statement(Opcode::GlobalAddress, 70, 41, 42);
        b.statement(Opcode::StorePF, 43, 42, 44);
        b.statement(Opcode::LoadPF, 42, 44, 45);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();
        vm.execute_by_name("main").unwrap();

        assert_eq!(vm.globals.get_float(70).unwrap(), 9.0);
        assert_eq!(vm.globals.get_float(45).unwrap(), 9.0);
    }

    struct Buf(Vec<u8>);

    impl HandleData for Buf {
        fn resolve_pointer(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
            self.0.get_mut(offset..offset + len)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn qc_alloc_buf(vm: &mut Vm) -> Result<(), ProgsError> {
        let id = vm.handles_mut().alloc(Box::new(Buf(vec![0; 64])));
        vm.return_pointer(Pointer::handle(id as u32, 0))
    }

    #[test]
    fn test_storep_through_handle_payload() {
        let mut b = ModuleBuilder::new(128);

        let alloc_fn = b.function("alloc_buf", 0, 0, 0, &[]);
        b.set_global_i32(60, alloc_fn);
        b.set_global_i32(43, 0x1122_3344);

        let main_entry = b.next_statement();
        b.statement(Opcode::Call0, 60, 0, 0);
        b.statement(Opcode::StoreI, GLOBAL_ADDR_RETURN, 42, 0);
        b.statement(Opcode::StorePI, 43, 42, 0);
        b.statement(Opcode::LoadPI, 42, 0, 45);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        vm.register_builtin("alloc_buf", qc_alloc_buf).unwrap();
        vm.check().unwrap();
        vm.execute_by_name("main").unwrap();

        assert_eq!(vm.globals.get_int(45).unwrap(), 0x1122_3344);

        let buf = vm
            .handles()
            .fetch(1)
            .unwrap()
            .as_any()
            .downcast_ref::<Buf>()
            .unwrap();
        assert_eq!(LittleEndian::read_i32(&buf.0[0..4]), 0x1122_3344);
    }

    #[test]
    fn test_storep_s_releases_tracked_string() {
        let mut b = ModuleBuilder::new(128);
        b.set_global_i32(41, 0); // offset
        b.set_global_i32(99, 0); // the empty string

        let main_entry = b.next_statement();
        b.statement(Opcode::GlobalAddress, 100, 41, 42);
        b.statement(Opcode::StorePS, 99, 42, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();

        let doomed = vm.set_global_string(100, "doomed").unwrap();
        assert_eq!(vm.strings.ref_count(doomed), Some(1));

        vm.execute_by_name("main").unwrap();

        assert_eq!(vm.globals.string_id(100).unwrap(), STRING_EMPTY);
        assert!(!vm.strings.is_ref_counted(doomed));
    }

    #[test]
    fn test_compound_pointer_store() {
        let mut b = ModuleBuilder::new(128);
        b.set_global_f32(70, 6.0);
        b.set_global_f32(43, 7.0);
        b.set_global_i32(41, 0);

        let main_entry = b.next_statement();
        b.statement(Opcode::GlobalAddress, 70, 41, 42);
        b.statement(Opcode::MulStorePF, 43, 42, 44);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();
        vm.execute_by_name("main").unwrap();

        assert_eq!(vm.globals.get_float(70).unwrap(), 42.0);
        assert_eq!(vm.globals.get_float(44).unwrap(), 42.0);
    }

    #[test]
    fn test_conversions() {
        let mut b = ModuleBuilder::new(128);
        b.set_global_i32(40, 7);
        b.set_global_f32(41, -3.75);

        let main_entry = b.next_statement();
        b.statement(Opcode::ConvItoF, 40, 0, 42);
        b.statement(Opcode::ConvFtoI, 41, 0, 43);
        b.statement(Opcode::StoreIF, 40, 44, 0);
        b.statement(Opcode::StoreFI, 41, 45, 0);
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();
        vm.execute_by_name("main").unwrap();

        assert_eq!(vm.globals.get_float(42).unwrap(), 7.0);
        assert_eq!(vm.globals.get_int(43).unwrap(), -3);
        assert_eq!(vm.globals.get_float(44).unwrap(), 7.0);
        assert_eq!(vm.globals.get_int(45).unwrap(), -3);
    }

    #[test]
    fn test_vector_ops() {
        let mut b = ModuleBuilder::new(128);
        b.set_global_f32(40, 1.0);
        b.set_global_f32(41, 2.0);
        b.set_global_f32(42, 3.0);
        b.set_global_f32(43, 4.0);
        b.set_global_f32(44, 5.0);
        b.set_global_f32(45, 6.0);
        b.set_global_f32(50, 2.0);

        let main_entry = b.next_statement();
        b.statement(Opcode::MulV, 40, 43, 60); // dot
        b.statement(Opcode::AddV, 40, 43, 61);
        b.statement(Opcode::MulVF, 40, 50, 64);
        b.statement(Opcode::NotV, 70, 0, 67); // zero vector
        b.statement(Opcode::Done, 0, 0, 0);
        b.function("main", main_entry as i32, 80, 0, &[]);

        let mut vm = b.load();
        vm.check().unwrap();
        vm.execute_by_name("main").unwrap();

        assert_eq!(vm.globals.get_float(60).unwrap(), 32.0);
        assert_eq!(vm.globals.get_vector(61).unwrap(), [5.0, 7.0, 9.0]);
        assert_eq!(vm.globals.get_vector(64).unwrap(), [2.0, 4.0, 6.0]);
        assert_eq!(vm.globals.get_float(67).unwrap(), 1.0);
    }
}

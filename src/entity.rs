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

//! Entity storage.
//!
//! Every entity is a fixed-size block of 32-bit cells in one flat byte array. Offsets below the
//! host's system size hold host-defined (system) fields; script-declared fields are assigned
//! offsets past them by the layout pass, which also determines the final record size. Entities
//! `1..=max_clients` additionally own a client record that field wraps can mirror into.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::ProgsError;
use crate::pointer::Pointer;

/// An entity id. `0` is the world.
///
/// `-1` is the null entity, distinct from the world so that fields like an entity's ground
/// entity can express "none"; memory accesses through it fault.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct EntityId(pub i32);

impl EntityId {
    pub const WORLD: EntityId = EntityId(0);
    pub const INVALID: EntityId = EntityId(-1);
}

/// Host-supplied sizing for the entity array, fixed before the layout pass runs.
#[derive(Copy, Clone, Debug)]
pub struct EntityConfig {
    /// Cells at the front of every record reserved for system fields.
    pub system_size: usize,
    pub max_edicts: usize,
    /// Entities `1..=max_clients` own a client record.
    pub max_clients: usize,
    /// Size of one client record, in bytes.
    pub client_size: usize,
}

impl Default for EntityConfig {
    fn default() -> EntityConfig {
        EntityConfig {
            system_size: 0,
            max_edicts: 1024,
            max_clients: 0,
            client_size: 0,
        }
    }
}

#[derive(Debug)]
pub struct Entities {
    data: Box<[u8]>,
    clients: Box<[u8]>,
    /// Size of one entity record, in cells.
    edict_size: usize,
    max_edicts: usize,
    system_size: usize,
    max_clients: usize,
    client_size: usize,
}

impl Entities {
    /// An empty placeholder; replaced when the layout pass determines the record size.
    pub fn empty() -> Entities {
        Entities {
            data: Box::new([]),
            clients: Box::new([]),
            edict_size: 0,
            max_edicts: 0,
            system_size: 0,
            max_clients: 0,
            client_size: 0,
        }
    }

    pub fn new(config: EntityConfig, edict_size: usize) -> Entities {
        Entities {
            data: vec![0; edict_size * 4 * config.max_edicts].into_boxed_slice(),
            clients: vec![0; config.client_size * config.max_clients].into_boxed_slice(),
            edict_size,
            max_edicts: config.max_edicts,
            system_size: config.system_size,
            max_clients: config.max_clients,
            client_size: config.client_size,
        }
    }

    /// Size of one entity record, in cells.
    pub fn edict_size(&self) -> usize {
        self.edict_size
    }

    pub fn max_edicts(&self) -> usize {
        self.max_edicts
    }

    pub fn system_size(&self) -> usize {
        self.system_size
    }

    /// Total size of the entity array, in bytes.
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// Total size of the entity array, in cells.
    pub fn cell_count(&self) -> usize {
        self.data.len() / 4
    }

    pub fn read_cell(&self, cell: usize) -> Result<[u8; 4], ProgsError> {
        let ofs = cell * 4;

        if ofs + 4 > self.data.len() {
            return Err(ProgsError::BadPointer(format!("entity cell {}", cell)));
        }

        let mut out = [0; 4];
        out.copy_from_slice(&self.data[ofs..ofs + 4]);
        Ok(out)
    }

    pub fn read_cell_i32(&self, cell: usize) -> Result<i32, ProgsError> {
        let ofs = cell * 4;

        if ofs + 4 > self.data.len() {
            return Err(ProgsError::BadPointer(format!("entity cell {}", cell)));
        }

        Ok(LittleEndian::read_i32(&self.data[ofs..ofs + 4]))
    }

    pub fn write_cell(&mut self, cell: usize, val: [u8; 4]) -> Result<(), ProgsError> {
        let ofs = cell * 4;

        if ofs + 4 > self.data.len() {
            return Err(ProgsError::BadPointer(format!("entity cell {}", cell)));
        }

        self.data[ofs..ofs + 4].copy_from_slice(&val);
        Ok(())
    }

    /// The entity record containing an absolute cell index, as `(entity, intra-record offset)`.
    pub fn locate_cell(&self, cell: usize) -> (EntityId, usize) {
        (
            EntityId((cell / self.edict_size) as i32),
            cell % self.edict_size,
        )
    }

    /// The raw bytes of one entity record.
    pub fn record_bytes(&self, ent: EntityId) -> Result<&[u8], ProgsError> {
        let index = self.check_index(ent)?;
        let base = index * self.edict_size * 4;
        Ok(&self.data[base..base + self.edict_size * 4])
    }

    pub fn record_bytes_mut(&mut self, ent: EntityId) -> Result<&mut [u8], ProgsError> {
        let index = self.check_index(ent)?;
        let base = index * self.edict_size * 4;
        Ok(&mut self.data[base..base + self.edict_size * 4])
    }

    pub fn has_client(&self, ent: EntityId) -> bool {
        ent.0 >= 1 && (ent.0 as usize) <= self.max_clients
    }

    pub fn client_bytes(&self, ent: EntityId) -> Result<&[u8], ProgsError> {
        if !self.has_client(ent) {
            return Err(ProgsError::with_msg(format!("entity {} has no client", ent.0)));
        }

        let base = (ent.0 as usize - 1) * self.client_size;
        Ok(&self.clients[base..base + self.client_size])
    }

    pub fn client_bytes_mut(&mut self, ent: EntityId) -> Result<&mut [u8], ProgsError> {
        if !self.has_client(ent) {
            return Err(ProgsError::with_msg(format!("entity {} has no client", ent.0)));
        }

        let base = (ent.0 as usize - 1) * self.client_size;
        Ok(&mut self.clients[base..base + self.client_size])
    }

    fn check_index(&self, ent: EntityId) -> Result<usize, ProgsError> {
        if ent.0 < 0 || (ent.0 as usize) >= self.max_edicts {
            return Err(ProgsError::with_msg(format!("no entity with ID {}", ent.0)));
        }

        Ok(ent.0 as usize)
    }

    /// Forms a pointer to a field of an entity.
    ///
    /// The offset math is signed and then wrapped into the pointer's 30-bit offset, so the
    /// null entity (or an out-of-range field) produces a pointer that can never resolve.
    pub fn field_pointer(&self, ent: EntityId, field: i32) -> Pointer {
        let offset =
            (i64::from(ent.0) * self.edict_size as i64 + i64::from(field)) * 4;

        Pointer::entity(offset as u32)
    }
}

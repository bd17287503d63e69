// ============ GC header and object pool ============

use ahash::RandomState;
use indexmap::IndexMap;
use std::rc::Rc;

use crate::gc::gc_id::*;
use crate::lua_value::{LuaString, LuaTable, LuaUserdata, LuaValue};
use crate::lua_vm::{LuaThread, NativeFn, Proto};

// ============ Age values (generational mode, bits 0-2) ============
pub const G_NEW: u8 = 0; // created in current cycle
pub const G_SURVIVAL: u8 = 1; // survived one minor collection
pub const G_OLD0: u8 = 2; // made old by a forward barrier this cycle
pub const G_OLD1: u8 = 3; // first full cycle as old
pub const G_OLD: u8 = 4; // really old, not visited by minor collections
pub const G_TOUCHED1: u8 = 5; // old object touched this cycle
pub const G_TOUCHED2: u8 = 6; // old object touched in the previous cycle

// Color bit positions in the marked field
pub const WHITE0BIT: u8 = 3;
pub const WHITE1BIT: u8 = 4;
pub const BLACKBIT: u8 = 5;
pub const FINALIZEDBIT: u8 = 6; // object already separated for finalization
pub const FIXEDBIT: u8 = 7; // object is never collected (interned metamethod names etc.)

pub const WHITEBITS: u8 = (1 << WHITE0BIT) | (1 << WHITE1BIT);
pub const AGEBITS: u8 = 0x07;
pub const MASKCOLORS: u8 = (1 << BLACKBIT) | WHITEBITS;

/// Common header embedded in every GC-managed object.
///
/// Bit layout of `marked`:
/// - bits 0-2: age (generational mode)
/// - bit 3: white (type 0)
/// - bit 4: white (type 1)
/// - bit 5: black
/// - bit 6: separated for finalization
/// - bit 7: fixed (never collected)
///
/// Gray is implicit: an object is gray iff it carries neither a white bit
/// nor the black bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcHeader {
    pub marked: u8,
    /// Estimated size of the object in bytes, for debt accounting.
    pub size: u32,
}

impl GcHeader {
    /// New objects are always created with the current white color and age
    /// G_NEW. Creating them gray or black would let the sweep phase miss
    /// them after a white flip.
    #[inline(always)]
    pub fn with_white(current_white: u8, size: u32) -> Self {
        debug_assert!(current_white <= 1);
        GcHeader {
            marked: (1 << (WHITE0BIT + current_white)) | G_NEW,
            size,
        }
    }

    // ===== age =====

    #[inline(always)]
    pub fn age(&self) -> u8 {
        self.marked & AGEBITS
    }

    #[inline(always)]
    pub fn set_age(&mut self, age: u8) {
        debug_assert!(age <= G_TOUCHED2);
        self.marked = (self.marked & !AGEBITS) | age;
    }

    #[inline(always)]
    pub fn is_old(&self) -> bool {
        self.age() > G_SURVIVAL
    }

    // ===== color =====

    #[inline(always)]
    pub fn is_white(&self) -> bool {
        (self.marked & WHITEBITS) != 0
    }

    #[inline(always)]
    pub fn is_black(&self) -> bool {
        (self.marked & (1 << BLACKBIT)) != 0
    }

    #[inline(always)]
    pub fn is_gray(&self) -> bool {
        (self.marked & (WHITEBITS | (1 << BLACKBIT))) == 0
    }

    #[inline(always)]
    pub fn make_white(&mut self, current_white: u8) {
        debug_assert!(current_white <= 1);
        self.marked = (self.marked & !MASKCOLORS) | (1 << (WHITE0BIT + current_white));
    }

    #[inline(always)]
    pub fn make_gray(&mut self) {
        self.marked &= !MASKCOLORS;
    }

    #[inline(always)]
    pub fn make_black(&mut self) {
        self.marked = (self.marked & !WHITEBITS) | (1 << BLACKBIT);
    }

    /// An object with the "other" white is dead: it was not reached during
    /// the cycle whose white has since been flipped.
    #[inline(always)]
    pub fn is_dead(&self, other_white: u8) -> bool {
        (self.marked & (1 << (WHITE0BIT + other_white))) != 0
    }

    // ===== finalization / fixing =====

    #[inline(always)]
    pub fn is_finalized(&self) -> bool {
        (self.marked & (1 << FINALIZEDBIT)) != 0
    }

    #[inline(always)]
    pub fn set_finalized(&mut self) {
        self.marked |= 1 << FINALIZEDBIT;
    }

    #[inline(always)]
    pub fn is_fixed(&self) -> bool {
        (self.marked & (1 << FIXEDBIT)) != 0
    }

    /// Fixed objects are made old and are skipped by sweep entirely.
    #[inline(always)]
    pub fn set_fixed(&mut self) {
        self.marked |= 1 << FIXEDBIT;
        self.set_age(G_OLD);
    }
}

// ============ Closures and upvalues ============

/// Function body: interpreted bytecode closure or a native closure.
pub enum FunctionBody {
    /// Interpreted function: shared prototype plus captured upvalue cells.
    Lua {
        proto: Rc<Proto>,
        upvalues: Vec<UpvalueId>,
    },
    /// Native function with values bound as upvalues (by value, like a C
    /// closure).
    Native {
        func: NativeFn,
        upvalues: Vec<LuaValue>,
    },
}

impl FunctionBody {
    #[inline(always)]
    pub fn is_native(&self) -> bool {
        matches!(self, FunctionBody::Native { .. })
    }

    #[inline(always)]
    pub fn proto(&self) -> Option<&Rc<Proto>> {
        match self {
            FunctionBody::Lua { proto, .. } => Some(proto),
            FunctionBody::Native { .. } => None,
        }
    }
}

/// A captured-variable cell.
///
/// Open upvalues point at a live stack slot of their owning thread; closed
/// upvalues own a private copy. The open->closed transition happens exactly
/// once, when the owning frame exits or the slot is explicitly closed.
/// Indices (never raw pointers) keep the cell valid across stack growth.
pub enum Upvalue {
    Open { owner: ThreadId, slot: usize },
    Closed(LuaValue),
}

impl Upvalue {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, Upvalue::Open { .. })
    }

    #[inline]
    pub fn open_slot(&self) -> Option<usize> {
        match self {
            Upvalue::Open { slot, .. } => Some(*slot),
            Upvalue::Closed(_) => None,
        }
    }

    #[inline]
    pub fn close(&mut self, value: LuaValue) {
        debug_assert!(self.is_open());
        *self = Upvalue::Closed(value);
    }
}

// ============ Pool ============

/// Payload of a GC-managed object.
pub enum GcData {
    String(Box<LuaString>),
    Table(Box<LuaTable>),
    Function(Box<FunctionBody>),
    Upvalue(Box<Upvalue>),
    Userdata(Box<LuaUserdata>),
    Thread(Box<LuaThread>),
}

pub struct GcObject {
    pub header: GcHeader,
    pub data: GcData,
}

impl GcObject {
    pub fn with_white(data: GcData, current_white: u8, size: u32) -> Self {
        GcObject {
            header: GcHeader::with_white(current_white, size),
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.header.size as usize
    }

    pub fn gc_id(&self, id: u32) -> GcId {
        match &self.data {
            GcData::String(_) => GcId::String(StringId(id)),
            GcData::Table(_) => GcId::Table(TableId(id)),
            GcData::Function(_) => GcId::Function(FunctionId(id)),
            GcData::Upvalue(_) => GcId::Upvalue(UpvalueId(id)),
            GcData::Userdata(_) => GcId::Userdata(UserdataId(id)),
            GcData::Thread(_) => GcId::Thread(ThreadId(id)),
        }
    }
}

/// IndexMap-based pool for all GC objects.
/// - O(1) lookup by id
/// - iteration cost proportional to live objects only
/// - freed ids are recycled through a free list
pub struct GcPool {
    map: IndexMap<u32, GcObject, RandomState>,
    free_list: Vec<u32>,
    next_id: u32,
}

impl GcPool {
    pub fn new() -> Self {
        Self {
            map: IndexMap::with_capacity_and_hasher(256, RandomState::new()),
            free_list: Vec::new(),
            next_id: 0,
        }
    }

    /// Allocate a new object, returning its raw id.
    #[inline]
    pub fn alloc(&mut self, obj: GcObject) -> u32 {
        let id = if let Some(free) = self.free_list.pop() {
            free
        } else {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            debug_assert!(self.next_id != 0, "GcPool exhausted u32 ids");
            id
        };
        self.map.insert(id, obj);
        id
    }

    #[inline(always)]
    pub fn get(&self, id: u32) -> Option<&GcObject> {
        self.map.get(&id)
    }

    #[inline(always)]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut GcObject> {
        self.map.get_mut(&id)
    }

    #[inline(always)]
    pub fn contains(&self, id: u32) -> bool {
        self.map.contains_key(&id)
    }

    /// Free an object, recycling its id. Returns the payload so the caller
    /// can run teardown (interner removal, upvalue closing) and its size
    /// for debt accounting.
    #[inline]
    pub fn free(&mut self, id: u32) -> Option<GcObject> {
        let obj = self.map.swap_remove(&id)?;
        self.free_list.push(id);
        Some(obj)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.free_list.clear();
        self.next_id = 0;
    }
}

impl Default for GcPool {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Typed accessors ============
// The VM goes through these to keep the "id kind matches payload kind"
// invariant in one place.

impl GcPool {
    #[inline(always)]
    pub fn get_string(&self, id: StringId) -> Option<&LuaString> {
        match &self.get(id.0)?.data {
            GcData::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn get_table(&self, id: TableId) -> Option<&LuaTable> {
        match &self.get(id.0)?.data {
            GcData::Table(t) => Some(t),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn get_table_mut(&mut self, id: TableId) -> Option<&mut LuaTable> {
        match &mut self.get_mut(id.0)?.data {
            GcData::Table(t) => Some(t),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn get_function(&self, id: FunctionId) -> Option<&FunctionBody> {
        match &self.get(id.0)?.data {
            GcData::Function(f) => Some(f),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn get_function_mut(&mut self, id: FunctionId) -> Option<&mut FunctionBody> {
        match &mut self.get_mut(id.0)?.data {
            GcData::Function(f) => Some(f),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn get_upvalue(&self, id: UpvalueId) -> Option<&Upvalue> {
        match &self.get(id.0)?.data {
            GcData::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn get_upvalue_mut(&mut self, id: UpvalueId) -> Option<&mut Upvalue> {
        match &mut self.get_mut(id.0)?.data {
            GcData::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn get_userdata(&self, id: UserdataId) -> Option<&LuaUserdata> {
        match &self.get(id.0)?.data {
            GcData::Userdata(u) => Some(u),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn get_userdata_mut(&mut self, id: UserdataId) -> Option<&mut LuaUserdata> {
        match &mut self.get_mut(id.0)?.data {
            GcData::Userdata(u) => Some(u),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn get_thread(&self, id: ThreadId) -> Option<&LuaThread> {
        match &self.get(id.0)?.data {
            GcData::Thread(t) => Some(t),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn get_thread_mut(&mut self, id: ThreadId) -> Option<&mut LuaThread> {
        match &mut self.get_mut(id.0)?.data {
            GcData::Thread(t) => Some(t),
            _ => None,
        }
    }
}

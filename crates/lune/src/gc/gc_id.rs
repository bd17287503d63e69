// ============ Object IDs ============
// All IDs are plain u32 indices into the shared GcPool - compact and Copy.
// A typed wrapper per object kind keeps table/string/closure handles from
// being mixed up at compile time.

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct StringId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct TableId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct FunctionId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct UpvalueId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct UserdataId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct ThreadId(pub u32);

/// Unified GC object identifier: a typed id plus its kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GcId {
    String(StringId),
    Table(TableId),
    Function(FunctionId),
    Upvalue(UpvalueId),
    Userdata(UserdataId),
    Thread(ThreadId),
}

impl GcId {
    /// Raw index into the GcPool.
    #[inline(always)]
    pub fn index(self) -> u32 {
        match self {
            GcId::String(StringId(id)) => id,
            GcId::Table(TableId(id)) => id,
            GcId::Function(FunctionId(id)) => id,
            GcId::Upvalue(UpvalueId(id)) => id,
            GcId::Userdata(UserdataId(id)) => id,
            GcId::Thread(ThreadId(id)) => id,
        }
    }
}

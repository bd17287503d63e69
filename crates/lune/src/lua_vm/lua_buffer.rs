// Growable string-buffer builder.
//
// Small results assemble in a fixed inline array with no heap traffic;
// the first append past the threshold upgrades to a heap vector. `finish`
// interns the accumulated bytes as a string value.

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaResult, LuaVM};

/// Inline capacity before upgrading to the heap.
pub const BUFFER_INLINE: usize = 64;

enum Storage {
    Inline { data: [u8; BUFFER_INLINE], len: usize },
    Heap(Vec<u8>),
}

pub struct LuaBuffer {
    storage: Storage,
}

impl LuaBuffer {
    pub fn new() -> Self {
        LuaBuffer {
            storage: Storage::Inline {
                data: [0; BUFFER_INLINE],
                len: 0,
            },
        }
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Inline { len, .. } => *len,
            Storage::Heap(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the builder has spilled to the heap.
    pub fn is_heap(&self) -> bool {
        matches!(self.storage, Storage::Heap(_))
    }

    pub fn push_byte(&mut self, b: u8) {
        self.push_bytes(&[b]);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        match &mut self.storage {
            Storage::Inline { data, len } => {
                if *len + bytes.len() <= BUFFER_INLINE {
                    data[*len..*len + bytes.len()].copy_from_slice(bytes);
                    *len += bytes.len();
                } else {
                    let mut v = Vec::with_capacity((*len + bytes.len()) * 2);
                    v.extend_from_slice(&data[..*len]);
                    v.extend_from_slice(bytes);
                    self.storage = Storage::Heap(v);
                }
            }
            Storage::Heap(v) => v.extend_from_slice(bytes),
        }
    }

    pub fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    /// Append the string/number at stack index `idx` (popped).
    pub fn push_value_from_stack(&mut self, vm: &mut LuaVM, idx: i32) -> LuaResult<()> {
        let Some(s) = vm.to_string_coerce(idx) else {
            let v = vm.value_at(idx);
            return Err(vm.type_error("buffer", &v));
        };
        vm.remove(idx)?;
        self.push_str(&s);
        Ok(())
    }

    fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Inline { data, len } => &data[..*len],
            Storage::Heap(v) => v,
        }
    }

    /// Build the final string value.
    pub fn finish(self, vm: &mut LuaVM) -> LuaResult<LuaValue> {
        let s = String::from_utf8_lossy(self.as_bytes()).into_owned();
        vm.create_string(&s)
    }

    /// Build and push the final string.
    pub fn finish_onto_stack(self, vm: &mut LuaVM) -> LuaResult<()> {
        let v = self.finish(vm)?;
        vm.push_lua_value(v)
    }
}

impl Default for LuaBuffer {
    fn default() -> Self {
        Self::new()
    }
}

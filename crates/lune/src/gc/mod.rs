// Garbage collector.
//
// Tri-color incremental mark-sweep over all heap objects, with an optional
// generational minor mode. Two white shades distinguish "allocated this
// cycle" from "allocated last cycle" so new objects are never swept by the
// cycle that is already in progress.
//
// Phases:
//   Pause -> Propagate (drain gray set one step at a time, interleaved
//   with the mutator) -> Atomic (re-mark roots, resolve ephemerons, clear
//   weak tables, separate finalizable dead, flip white) -> Sweep
//   (incremental over the allocation-ordered object list) -> CallFin
//   (run pending finalizers) -> Pause.
//
// The write barriers keep the invariant that no black object points to a
// white one while any gray object remains: stores into tables re-gray the
// table (back barrier), stores into upvalues/closures/metatables mark the
// stored object immediately (forward barrier). Every mutating path in the
// VM funnels through one of the two.

mod gc_id;
mod gc_object;
mod string_interner;

pub use gc_id::*;
pub use gc_object::*;
pub use string_interner::{SHORT_STRING_LIMIT, StringInterner};

use crate::lua_value::{LuaValue, TableKey};
use crate::lua_vm::{ExecContext, LuaVM};

/// Collection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    /// Incremental mark-sweep.
    Inc,
    /// Generational: single-pulse minor collections over young objects,
    /// full collections when the heap outgrows its post-major baseline.
    GenMinor,
}

/// Collector state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Pause,
    Propagate,
    Atomic,
    Sweep,
    CallFin,
}

impl GcState {
    /// While true, black objects must not point at white ones, so the
    /// barriers have to act.
    #[inline(always)]
    pub fn keep_invariant(self) -> bool {
        matches!(self, GcState::Propagate | GcState::Atomic)
    }
}

/// Tunable collector parameters, plain percentages / byte counts.
#[derive(Debug, Clone)]
pub struct GcParams {
    /// How much the heap may grow over the live estimate before a new
    /// cycle starts (percent; 200 = wait for 2x).
    pub pause: i32,
    /// Marking speed relative to allocation speed (percent).
    pub step_mul: i32,
    /// Bytes of allocation between incremental steps.
    pub step_size: isize,
    /// Allocation budget between minor collections (percent of the heap).
    pub minor_mul: i32,
    /// Heap growth over the post-major baseline that forces a full
    /// collection in generational mode (percent).
    pub minor_major: i32,
}

impl Default for GcParams {
    fn default() -> Self {
        GcParams {
            pause: 200,
            step_mul: 200,
            step_size: 16 * 1024,
            minor_mul: 25,
            minor_major: 100,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub full_collections: usize,
    pub minor_collections: usize,
    pub steps: usize,
    pub objects_collected: usize,
    pub finalizers_run: usize,
}

/// Objects swept per incremental sweep step.
const GC_SWEEPMAX: usize = 100;
/// Tombstone in `allgc` for objects freed mid-sweep.
const SWEPT: u32 = u32::MAX;

pub struct GC {
    pub(crate) pool: GcPool,
    pub(crate) interner: StringInterner,

    /// All collectable objects in allocation order (oldest first). The
    /// vector plays the role of an intrusive sweep list; generational
    /// boundaries are indices into it.
    allgc: Vec<u32>,
    /// Objects found unreachable with a pending finalizer, resurrected
    /// until their `__gc` runs. Popped LIFO.
    tobefnz: Vec<u32>,
    /// Generational boundary: `allgc[first_young..]` is the young region.
    first_young: usize,

    // ===== pacing =====
    /// Bytes allocated and not yet paid for; a step runs when positive.
    pub(crate) debt: isize,
    pub(crate) total_bytes: isize,
    /// Live-byte estimate after the last full cycle.
    estimate: isize,
    /// Heap size after the last major collection (generational trigger).
    major_base: isize,

    pub(crate) state: GcState,
    pub(crate) kind: GcKind,
    pub(crate) current_white: u8,
    running: bool,
    /// True while a minor pulse is marking/sweeping: old objects count as
    /// alive regardless of color.
    minor_pulse: bool,
    /// Re-entrancy guard: finalizers run interpreted code, which must not
    /// start another collection step underneath the collector.
    calling_finalizers: bool,

    // ===== mark lists =====
    gray: Vec<GcId>,
    /// Objects to revisit in the atomic phase (back-barrier targets,
    /// threads) and, in generational mode, touched/renewed old objects
    /// that the next minor collection must scan.
    grayagain: Vec<GcId>,
    weak: Vec<TableId>,
    ephemeron: Vec<TableId>,
    allweak: Vec<TableId>,

    sweep_index: usize,

    pub params: GcParams,
    pub stats: GcStats,
}

impl GC {
    pub fn new() -> Self {
        GC {
            pool: GcPool::new(),
            interner: StringInterner::new(),
            allgc: Vec::with_capacity(256),
            tobefnz: Vec::new(),
            first_young: 0,
            debt: -(16 * 1024),
            total_bytes: 0,
            estimate: 0,
            major_base: 0,
            state: GcState::Pause,
            kind: GcKind::Inc,
            current_white: 0,
            running: true,
            minor_pulse: false,
            calling_finalizers: false,
            gray: Vec::with_capacity(128),
            grayagain: Vec::with_capacity(64),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            sweep_index: 0,
            params: GcParams::default(),
            stats: GcStats::default(),
        }
    }

    // ===== allocation bookkeeping =====

    /// Register a freshly allocated object in the sweep list and charge
    /// its size against the debt.
    pub(crate) fn track(&mut self, id: u32, size: usize) {
        self.allgc.push(id);
        self.total_bytes += size as isize;
        self.debt += size as isize;
    }

    #[inline(always)]
    pub fn should_step(&self) -> bool {
        self.running && self.debt > 0
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn restart(&mut self) {
        self.running = true;
        self.debt = 0;
    }

    /// Total bytes currently accounted to the heap.
    pub fn count_bytes(&self) -> usize {
        self.total_bytes.max(0) as usize
    }

    pub fn object_count(&self) -> usize {
        self.pool.len()
    }

    /// Switch to incremental mode.
    pub fn set_incremental(&mut self) {
        if self.kind != GcKind::Inc {
            self.kind = GcKind::Inc;
            self.grayagain.clear();
            self.gray.clear();
            self.state = GcState::Pause;
        }
    }

    /// Switch to generational mode; everything currently alive becomes old.
    pub fn set_generational(&mut self) {
        if self.kind != GcKind::GenMinor {
            self.kind = GcKind::GenMinor;
            self.state = GcState::Pause;
            self.gray.clear();
            self.grayagain.clear();
            for &id in &self.allgc {
                if id == SWEPT {
                    continue;
                }
                if let Some(obj) = self.pool.get_mut(id) {
                    obj.header.set_age(G_OLD);
                }
            }
            self.allgc.retain(|&id| id != SWEPT);
            self.first_young = self.allgc.len();
            self.major_base = self.total_bytes;
        }
    }

    // ===== marking primitives =====

    #[inline]
    fn header(&self, id: GcId) -> Option<&GcHeader> {
        self.pool.get(id.index()).map(|o| &o.header)
    }

    #[inline]
    fn header_mut(&mut self, id: GcId) -> Option<&mut GcHeader> {
        self.pool.get_mut(id.index()).map(|o| &mut o.header)
    }

    /// Death test for the current phase. During a minor pulse old objects
    /// are alive by definition; otherwise white (or other-white during a
    /// flip) means unreached.
    fn is_dead_now(&self, id: GcId) -> bool {
        match self.header(id) {
            Some(h) => {
                if h.is_fixed() {
                    return false;
                }
                if self.minor_pulse && h.is_old() {
                    return false;
                }
                h.is_white()
            }
            None => true,
        }
    }

    fn is_value_dead(&self, v: &LuaValue) -> bool {
        match v.as_gc_id() {
            Some(id) => self.is_dead_now(id),
            None => false,
        }
    }

    /// Mark a single object reachable: strings blacken immediately, every
    /// traversable object goes gray and onto the gray list.
    fn mark_object(&mut self, id: GcId) {
        if self.minor_pulse {
            if let Some(h) = self.header(id) {
                // Old objects are neither traversed nor re-colored by a
                // minor pulse.
                if h.is_old() {
                    return;
                }
            }
        }
        let Some(header) = self.header_mut(id) else {
            return;
        };
        if !header.is_white() {
            return;
        }
        match id {
            GcId::String(_) => header.make_black(),
            _ => {
                header.make_gray();
                self.gray.push(id);
            }
        }
    }

    #[inline]
    fn mark_value(&mut self, v: &LuaValue) {
        if let Some(id) = v.as_gc_id() {
            self.mark_object(id);
        }
    }

    fn mark_table_key(&mut self, k: &TableKey) {
        match k {
            TableKey::String(id) => self.mark_object(GcId::String(*id)),
            TableKey::Object(id) => self.mark_object(*id),
            _ => {}
        }
    }

    // ===== write barriers =====

    /// Back barrier: a black container had a reference stored into it, so
    /// it must be re-scanned before the cycle can finish. In generational
    /// mode this also records the container as a touched old object.
    pub(crate) fn barrier_back(&mut self, parent: GcId) {
        let keep = self.state.keep_invariant();
        let is_gen = self.kind == GcKind::GenMinor;
        let Some(header) = self.header_mut(parent) else {
            return;
        };
        if keep && header.is_black() {
            header.make_gray();
            self.grayagain.push(parent);
        }
        if is_gen {
            let Some(header) = self.header_mut(parent) else {
                return;
            };
            if header.is_old() && header.age() != G_TOUCHED1 {
                header.set_age(G_TOUCHED1);
                self.grayagain.push(parent);
            }
        }
    }

    /// Forward barrier: a reference to `child` was stored into a black (or
    /// old) `parent` that will not be re-scanned; mark the child now.
    pub(crate) fn barrier_forward(&mut self, parent: GcId, child: &LuaValue) {
        let Some(child_id) = child.as_gc_id() else {
            return;
        };
        let parent_black = self.header(parent).is_some_and(|h| h.is_black());
        if self.state.keep_invariant() && parent_black {
            self.mark_object(child_id);
        }
        if self.kind == GcKind::GenMinor {
            let parent_old = self.header(parent).is_some_and(|h| h.is_old());
            if parent_old {
                let Some(h) = self.header_mut(child_id) else {
                    return;
                };
                if !h.is_old() {
                    // The child escapes the young generation right away,
                    // but its own references have never been scanned as
                    // an old object's - queue it for the next minor mark.
                    h.set_age(G_OLD0);
                    self.grayagain.push(child_id);
                }
            }
        }
    }

    /// Barrier for upvalue-cell stores (forward, by id).
    pub(crate) fn barrier_upvalue(&mut self, upvalue: UpvalueId, value: &LuaValue) {
        self.barrier_forward(GcId::Upvalue(upvalue), value);
    }

    // ===== traversal =====

    /// Traverse one gray object, marking its children. Returns the size
    /// credited toward the step budget.
    fn traverse(&mut self, id: GcId, ctx: &ExecContext, current: ThreadId) -> usize {
        let size = self.pool.get(id.index()).map(|o| o.size()).unwrap_or(0);
        match id {
            GcId::String(_) => {}
            GcId::Table(tid) => self.traverse_table(tid),
            GcId::Function(fid) => self.traverse_function(fid),
            GcId::Upvalue(uid) => self.traverse_upvalue(uid, ctx, current),
            GcId::Userdata(uid) => self.traverse_userdata(uid),
            GcId::Thread(tid) => self.traverse_thread(tid, ctx, current),
        }
        size
    }

    fn traverse_table(&mut self, tid: TableId) {
        let Some(table) = self.pool.get_table(tid) else {
            return;
        };
        let weak_keys = table.weak_keys;
        let weak_values = table.weak_values;
        let meta = table.metatable();

        if let Some(mt) = meta {
            self.mark_object(GcId::Table(mt));
        }

        if !weak_keys && !weak_values {
            // Strong table: copy entries out, then mark. The copy keeps
            // the borrow on the pool short.
            let Some(table) = self.pool.get_table(tid) else {
                return;
            };
            let mut values: Vec<LuaValue> = Vec::with_capacity(table.array_values().len());
            values.extend_from_slice(table.array_values());
            let mut keys: Vec<TableKey> = Vec::new();
            for (k, v) in table.hash_entries() {
                keys.push(*k);
                values.push(*v);
            }
            for k in &keys {
                self.mark_table_key(k);
            }
            for v in &values {
                self.mark_value(v);
            }
        } else if weak_keys && weak_values {
            self.allweak.push(tid);
        } else if weak_keys {
            self.ephemeron.push(tid);
        } else {
            // Weak values: keys are strong.
            self.weak.push(tid);
            let Some(table) = self.pool.get_table(tid) else {
                return;
            };
            let keys: Vec<TableKey> = table.hash_entries().map(|(k, _)| *k).collect();
            for k in &keys {
                self.mark_table_key(k);
            }
        }
        if let Some(h) = self.header_mut(GcId::Table(tid)) {
            h.make_black();
        }
    }

    fn traverse_function(&mut self, fid: FunctionId) {
        enum Parts {
            Lua(Vec<UpvalueId>, Vec<LuaValue>),
            Native(Vec<LuaValue>),
        }
        let parts = match self.pool.get_function(fid) {
            Some(FunctionBody::Lua { proto, upvalues }) => {
                // Prototypes are Rc-shared, not collectable themselves;
                // their string constants (and nested protos') stay alive
                // through every closure instantiated from them.
                let mut consts: Vec<LuaValue> = proto.constants.clone();
                let mut stack: Vec<std::rc::Rc<crate::lua_vm::Proto>> = proto.protos.clone();
                while let Some(p) = stack.pop() {
                    consts.extend_from_slice(&p.constants);
                    stack.extend(p.protos.iter().cloned());
                }
                Parts::Lua(upvalues.clone(), consts)
            }
            Some(FunctionBody::Native { upvalues, .. }) => Parts::Native(upvalues.clone()),
            None => return,
        };
        match parts {
            Parts::Lua(upvalues, consts) => {
                for uv in upvalues {
                    self.mark_object(GcId::Upvalue(uv));
                }
                for c in &consts {
                    self.mark_value(c);
                }
            }
            Parts::Native(upvalues) => {
                for v in &upvalues {
                    self.mark_value(v);
                }
            }
        }
        if let Some(h) = self.header_mut(GcId::Function(fid)) {
            h.make_black();
        }
    }

    fn traverse_upvalue(&mut self, uid: UpvalueId, ctx: &ExecContext, current: ThreadId) {
        let Some(uv) = self.pool.get_upvalue(uid) else {
            return;
        };
        let value = match uv {
            Upvalue::Closed(v) => *v,
            Upvalue::Open { owner, slot } => {
                if *owner == current {
                    ctx.stack.get(*slot).copied().unwrap_or(LuaValue::Nil)
                } else {
                    self.pool
                        .get_thread(*owner)
                        .and_then(|t| t.saved_stack_value(*slot))
                        .unwrap_or(LuaValue::Nil)
                }
            }
        };
        self.mark_value(&value);
        if let Some(h) = self.header_mut(GcId::Upvalue(uid)) {
            h.make_black();
        }
    }

    fn traverse_userdata(&mut self, uid: UserdataId) {
        let Some(ud) = self.pool.get_userdata(uid) else {
            return;
        };
        let meta = ud.metatable();
        let uservalues: Vec<LuaValue> = ud.user_values().to_vec();
        if let Some(mt) = meta {
            self.mark_object(GcId::Table(mt));
        }
        for v in &uservalues {
            self.mark_value(v);
        }
        if let Some(h) = self.header_mut(GcId::Userdata(uid)) {
            h.make_black();
        }
    }

    /// Threads stay gray: their stacks keep changing, so they are queued
    /// for one more scan in the atomic phase instead of ever turning
    /// black. That removes the need for a barrier on every stack write.
    fn traverse_thread(&mut self, tid: ThreadId, ctx: &ExecContext, current: ThreadId) {
        let (values, upvals): (Vec<LuaValue>, Vec<UpvalueId>) = if tid == current {
            (ctx.reachable_values(), ctx.open_upvalues.clone())
        } else {
            match self.pool.get_thread(tid) {
                Some(t) => (t.reachable_values(), t.open_upvalue_ids()),
                None => return,
            }
        };
        for v in &values {
            self.mark_value(v);
        }
        for uv in upvals {
            self.mark_object(GcId::Upvalue(uv));
        }
        if self.state == GcState::Propagate && !self.minor_pulse {
            self.grayagain.push(GcId::Thread(tid));
        }
    }

    // ===== phase pieces =====

    fn mark_roots(&mut self, roots: &[LuaValue], ctx: &ExecContext, current: ThreadId) {
        for v in roots {
            self.mark_value(v);
        }
        // The active execution context is a root of its own, even before
        // the current thread object is reached through a reference.
        self.traverse_thread(current, ctx, current);
    }

    fn propagate_one(&mut self, ctx: &ExecContext, current: ThreadId) -> usize {
        match self.gray.pop() {
            Some(id) => self.traverse(id, ctx, current),
            None => 0,
        }
    }

    fn propagate_all(&mut self, ctx: &ExecContext, current: ThreadId) {
        while let Some(id) = self.gray.pop() {
            self.traverse(id, ctx, current);
        }
    }

    /// Ephemeron convergence: a weak-keyed entry keeps its value alive
    /// only while the key is independently reachable.
    fn converge_ephemerons(&mut self, ctx: &ExecContext, current: ThreadId) {
        loop {
            let mut marked_any = false;
            let tables = self.ephemeron.clone();
            for tid in tables {
                let Some(table) = self.pool.get_table(tid) else {
                    continue;
                };
                let entries: Vec<(TableKey, LuaValue)> =
                    table.hash_entries().map(|(k, v)| (*k, *v)).collect();
                for (k, v) in entries {
                    if v.is_nil() {
                        continue;
                    }
                    if !self.is_value_dead(&k.to_value()) {
                        if let Some(id) = v.as_gc_id() {
                            if self.is_dead_now(id) {
                                self.mark_object(id);
                                marked_any = true;
                            }
                        }
                    }
                }
            }
            self.propagate_all(ctx, current);
            if !marked_any {
                break;
            }
        }
    }

    /// Clear weak-table entries whose weak half died this cycle.
    fn clear_weak_tables(&mut self) {
        let weak = std::mem::take(&mut self.weak);
        let ephemeron = std::mem::take(&mut self.ephemeron);
        let allweak = std::mem::take(&mut self.allweak);

        // Snapshot of everything dead at this point; the mutable table
        // borrow below cannot reach back into the pool.
        let mut dead: ahash::HashSet<GcId> = ahash::HashSet::default();
        for &id in &self.allgc {
            if id == SWEPT {
                continue;
            }
            if let Some(obj) = self.pool.get(id) {
                let gcid = obj.gc_id(id);
                if self.is_dead_now(gcid) {
                    dead.insert(gcid);
                }
            }
        }

        let mut work: Vec<(TableId, bool, bool)> = Vec::new();
        work.extend(weak.into_iter().map(|t| (t, false, true)));
        work.extend(ephemeron.into_iter().map(|t| (t, true, false)));
        work.extend(allweak.into_iter().map(|t| (t, true, true)));

        for (tid, wk, wv) in work {
            if let Some(table) = self.pool.get_table_mut(tid) {
                table.clear_weak_entries(wk, wv, |v| match v.as_gc_id() {
                    Some(id) => dead.contains(&id),
                    None => false,
                });
            }
        }
    }

    /// Close reachable open upvalues whose owning thread died this cycle,
    /// copying the value out before the stack is freed.
    fn close_orphan_upvalues(&mut self, current: ThreadId) {
        let ids: Vec<u32> = self.allgc.iter().copied().filter(|&i| i != SWEPT).collect();
        for id in ids {
            let Some(obj) = self.pool.get(id) else {
                continue;
            };
            let gcid = obj.gc_id(id);
            if self.is_dead_now(gcid) {
                continue; // dies together with its owner
            }
            let (owner, slot) = match &obj.data {
                GcData::Upvalue(uv) => match uv.as_ref() {
                    Upvalue::Open { owner, slot } => (*owner, *slot),
                    Upvalue::Closed(_) => continue,
                },
                _ => continue,
            };
            if owner == current {
                continue;
            }
            if self.is_dead_now(GcId::Thread(owner)) {
                let value = self
                    .pool
                    .get_thread(owner)
                    .and_then(|t| t.saved_stack_value(slot))
                    .unwrap_or(LuaValue::Nil);
                if let Some(GcData::Upvalue(uv)) = self.pool.get_mut(id).map(|o| &mut o.data) {
                    uv.close(value);
                }
                self.mark_value(&value);
            }
        }
    }

    /// Find dead objects carrying an unfinished finalizer, resurrect them
    /// (mark them and their children) and queue them for finalization.
    fn separate_to_be_finalized(&mut self, ctx: &ExecContext, current: ThreadId) {
        let ids: Vec<u32> = self.allgc.iter().copied().filter(|&i| i != SWEPT).collect();
        for id in ids {
            let Some(obj) = self.pool.get(id) else {
                continue;
            };
            if !obj.header.is_finalized() {
                continue;
            }
            let gcid = obj.gc_id(id);
            if !self.is_dead_now(gcid) {
                continue;
            }
            // Resurrect: the finalizer must see a fully live object.
            self.mark_object(gcid);
            self.propagate_all(ctx, current);
            self.tobefnz.push(id);
        }
    }

    // ===== sweeping =====

    fn free_object(&mut self, id: u32) {
        if let Some(obj) = self.pool.free(id) {
            self.total_bytes -= obj.size() as isize;
            self.stats.objects_collected += 1;
            if let GcData::String(s) = &obj.data {
                if s.len() <= SHORT_STRING_LIMIT {
                    self.interner.remove_dead(s.hash, StringId(id));
                }
            }
        }
    }

    /// Sweep a bounded slice of `allgc`. Returns true when the list is
    /// exhausted.
    fn sweep_step(&mut self) -> bool {
        let other = self.current_white ^ 1;
        let end = (self.sweep_index + GC_SWEEPMAX).min(self.allgc.len());
        for i in self.sweep_index..end {
            let id = self.allgc[i];
            if id == SWEPT {
                continue;
            }
            let Some(obj) = self.pool.get_mut(id) else {
                self.allgc[i] = SWEPT;
                continue;
            };
            if obj.header.is_fixed() {
                continue;
            }
            if obj.header.is_dead(other) {
                self.allgc[i] = SWEPT;
                self.free_object(id);
            } else {
                obj.header.make_white(self.current_white);
            }
        }
        self.sweep_index = end;
        if self.sweep_index >= self.allgc.len() {
            self.allgc.retain(|&id| id != SWEPT);
            true
        } else {
            false
        }
    }

    /// Close a finished full cycle: compute the next trigger point.
    fn finish_cycle(&mut self) {
        self.state = GcState::Pause;
        self.estimate = self.total_bytes;
        self.stats.full_collections += 1;
        let threshold = self.estimate.saturating_mul(self.params.pause as isize) / 100;
        self.debt = self.total_bytes - threshold.max(self.params.step_size);
        tracing::debug!(
            total_bytes = self.total_bytes,
            objects = self.pool.len(),
            "gc cycle finished"
        );
    }

    pub(crate) fn has_pending_finalizers(&self) -> bool {
        !self.tobefnz.is_empty()
    }

    pub(crate) fn take_finalizable(&mut self) -> Option<u32> {
        self.tobefnz.pop()
    }
}

impl Default for GC {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Collection driver ============
// The driver lives on LuaVM because the atomic and finalization phases
// need the root set (registry, globals, thread contexts) and the call
// machinery for `__gc`.

impl LuaVM {
    /// Root values: registry, globals, main thread, the running thread,
    /// and every suspended resumer in the chain.
    fn gc_roots(&self) -> Vec<LuaValue> {
        let mut roots = vec![
            LuaValue::Table(self.registry_id()),
            LuaValue::Table(self.globals_id()),
            LuaValue::Thread(self.main_thread_id()),
            LuaValue::Thread(self.current_thread_id()),
        ];
        for &tid in self.resume_chain() {
            roots.push(LuaValue::Thread(tid));
        }
        roots
    }

    /// Run one unit of GC work if the debt demands it. This is the check
    /// point invoked before every allocation the VM performs.
    pub(crate) fn maybe_gc(&mut self) {
        if self.gc.should_step() && !self.gc.calling_finalizers {
            self.gc_step_internal();
        }
    }

    /// One increment of collection work (public single-step API).
    pub fn gc_step(&mut self) {
        self.gc_step_internal();
    }

    fn gc_step_internal(&mut self) {
        self.gc.stats.steps += 1;
        match self.gc.kind {
            GcKind::Inc => self.incremental_step(),
            GcKind::GenMinor => self.generational_step(),
        }
    }

    fn incremental_step(&mut self) {
        let current = self.current_thread_id();
        match self.gc.state {
            GcState::Pause => {
                let roots = self.gc_roots();
                let (gc, ctx) = self.gc_and_ctx();
                gc.gray.clear();
                gc.grayagain.clear();
                gc.weak.clear();
                gc.ephemeron.clear();
                gc.allweak.clear();
                gc.state = GcState::Propagate;
                gc.mark_roots(&roots, ctx, current);
                gc.debt = -gc.params.step_size;
                tracing::trace!("gc: pause -> propagate");
            }
            GcState::Propagate => {
                let budget =
                    (self.gc.params.step_size * self.gc.params.step_mul as isize / 100).max(1);
                let mut done = false;
                {
                    let (gc, ctx) = self.gc_and_ctx();
                    let mut credit: isize = 0;
                    while credit < budget {
                        if gc.gray.is_empty() {
                            done = true;
                            break;
                        }
                        credit += gc.propagate_one(ctx, current) as isize + 16;
                    }
                }
                if done {
                    self.atomic_phase();
                } else {
                    self.gc.debt = -self.gc.params.step_size;
                }
            }
            GcState::Atomic => self.atomic_phase(),
            GcState::Sweep => {
                let finished = self.gc.sweep_step();
                if finished {
                    if self.gc.has_pending_finalizers() {
                        self.gc.state = GcState::CallFin;
                        self.gc.debt = -self.gc.params.step_size;
                    } else {
                        self.gc.finish_cycle();
                    }
                } else {
                    self.gc.debt = -self.gc.params.step_size;
                }
            }
            GcState::CallFin => {
                self.run_pending_finalizers(2);
                if !self.gc.has_pending_finalizers() {
                    self.gc.finish_cycle();
                } else {
                    self.gc.debt = -self.gc.params.step_size;
                }
            }
        }
    }

    /// The non-interruptible turn of the cycle: re-mark everything that
    /// may have changed, resolve weakness, flip the white.
    fn atomic_phase(&mut self) {
        let current = self.current_thread_id();
        let roots = self.gc_roots();
        {
            let (gc, ctx) = self.gc_and_ctx();
            gc.state = GcState::Atomic;
            gc.mark_roots(&roots, ctx, current);
            gc.propagate_all(ctx, current);
            // Re-scan back-barrier targets and thread stacks.
            let again = std::mem::take(&mut gc.grayagain);
            for id in again {
                gc.traverse(id, ctx, current);
            }
            gc.propagate_all(ctx, current);
            gc.converge_ephemerons(ctx, current);
            gc.close_orphan_upvalues(current);
            gc.propagate_all(ctx, current);
            gc.separate_to_be_finalized(ctx, current);
            gc.clear_weak_tables();
            // Flip: everything still carrying the old white is dead.
            gc.current_white ^= 1;
            gc.state = GcState::Sweep;
            gc.sweep_index = 0;
        }
        tracing::trace!("gc: atomic done, sweeping");
    }

    /// Generational step: one minor collection pulse, or a full cycle if
    /// the heap outgrew its baseline.
    fn generational_step(&mut self) {
        let base = self.gc.major_base;
        let grew = base == 0
            || self.gc.total_bytes > base + base * self.gc.params.minor_major as isize / 100;
        if grew {
            // Major collection; gc_full_internal re-ages the survivors
            // and resets the growth baseline.
            self.gc_collect();
            return;
        }
        self.minor_collection();
        let budget = (self.gc.total_bytes * self.gc.params.minor_mul as isize / 100)
            .max(self.gc.params.step_size / 4);
        self.gc.debt = -budget;
    }

    /// A minor collection: mark from the roots traversing only young and
    /// touched-old objects, then sweep the young region, promoting
    /// survivors one age step.
    fn minor_collection(&mut self) {
        let current = self.current_thread_id();
        let roots = self.gc_roots();
        {
            let (gc, ctx) = self.gc_and_ctx();
            gc.minor_pulse = true;
            gc.state = GcState::Propagate;
            gc.gray.clear();
            gc.weak.clear();
            gc.ephemeron.clear();
            gc.allweak.clear();
            gc.mark_roots(&roots, ctx, current);
            // Old objects recorded by the barriers since the last pulse:
            // scan them so their young references survive.
            let touched = std::mem::take(&mut gc.grayagain);
            for id in &touched {
                gc.traverse(*id, ctx, current);
            }
            // Thread stacks mutate without barriers, so every old thread
            // gets rescanned by each minor pulse.
            let old_threads: Vec<ThreadId> = gc
                .allgc
                .iter()
                .filter(|&&id| id != SWEPT)
                .filter_map(|&id| match gc.pool.get(id) {
                    Some(obj) if obj.header.is_old() => match &obj.data {
                        GcData::Thread(_) => Some(ThreadId(id)),
                        _ => None,
                    },
                    _ => None,
                })
                .collect();
            for tid in old_threads {
                gc.traverse_thread(tid, ctx, current);
            }
            gc.propagate_all(ctx, current);
            gc.converge_ephemerons(ctx, current);
            gc.close_orphan_upvalues(current);
            gc.propagate_all(ctx, current);
            gc.separate_to_be_finalized(ctx, current);
            gc.clear_weak_tables();

            // Advance the touched ladder.
            for id in touched {
                let Some(h) = gc.header_mut(id) else { continue };
                match h.age() {
                    G_TOUCHED1 => {
                        h.set_age(G_TOUCHED2);
                        gc.grayagain.push(id);
                    }
                    G_TOUCHED2 | G_OLD0 | G_OLD1 => h.set_age(G_OLD),
                    _ => {}
                }
            }

            // Sweep the young region, partitioning survivors into
            // promoted (old) and still-young.
            let young: Vec<u32> = gc.allgc.split_off(gc.first_young);
            let mut promoted: Vec<u32> = Vec::new();
            let mut still_young: Vec<u32> = Vec::new();
            for id in young {
                if id == SWEPT {
                    continue;
                }
                let Some(obj) = gc.pool.get_mut(id) else {
                    continue;
                };
                if obj.header.is_white() && !obj.header.is_fixed() && !obj.header.is_old() {
                    gc.free_object(id);
                    continue;
                }
                let cw = gc.current_white;
                let Some(obj) = gc.pool.get_mut(id) else {
                    continue;
                };
                obj.header.make_white(cw);
                match obj.header.age() {
                    G_NEW => {
                        obj.header.set_age(G_SURVIVAL);
                        still_young.push(id);
                    }
                    _ => {
                        obj.header.set_age(G_OLD);
                        promoted.push(id);
                    }
                }
            }
            gc.allgc.extend_from_slice(&promoted);
            gc.first_young = gc.allgc.len();
            gc.allgc.extend_from_slice(&still_young);
            // Old objects colored during this pulse go back to white so
            // the next pulse starts clean. Touched objects keep their
            // entry in the scan list, color is irrelevant to it.
            let olds: Vec<u32> = gc.allgc[..gc.first_young].to_vec();
            let cw = gc.current_white;
            for id in olds {
                if let Some(obj) = gc.pool.get_mut(id) {
                    if !obj.header.is_white() && !obj.header.is_fixed() {
                        obj.header.make_white(cw);
                    }
                }
            }
            gc.state = GcState::Pause;
            gc.minor_pulse = false;
            gc.stats.minor_collections += 1;
        }
        self.run_pending_finalizers(usize::MAX);
        tracing::trace!("gc: minor collection done");
    }

    /// Force a complete collection cycle (the `collectgarbage("collect")`
    /// equivalent).
    pub fn gc_collect(&mut self) {
        self.gc_full_internal();
        self.run_pending_finalizers(usize::MAX);
        self.gc.finish_cycle();
    }

    fn gc_full_internal(&mut self) {
        // Abandon any half-finished cycle; colors are reset by a fresh
        // mark from the roots.
        let current = self.current_thread_id();
        let roots = self.gc_roots();
        let (gc, ctx) = self.gc_and_ctx();
        gc.minor_pulse = false;
        gc.gray.clear();
        gc.grayagain.clear();
        gc.weak.clear();
        gc.ephemeron.clear();
        gc.allweak.clear();
        gc.allgc.retain(|&id| id != SWEPT);
        // Whiten everything first so stale black marks from an interrupted
        // cycle cannot shield garbage.
        let cw = gc.current_white;
        let ids: Vec<u32> = gc.allgc.clone();
        for id in &ids {
            if let Some(obj) = gc.pool.get_mut(*id) {
                if !obj.header.is_fixed() {
                    obj.header.make_white(cw);
                }
            }
        }
        gc.state = GcState::Propagate;
        gc.mark_roots(&roots, ctx, current);
        gc.propagate_all(ctx, current);
        gc.state = GcState::Atomic;
        let again = std::mem::take(&mut gc.grayagain);
        for id in again {
            gc.traverse(id, ctx, current);
        }
        gc.propagate_all(ctx, current);
        gc.converge_ephemerons(ctx, current);
        gc.close_orphan_upvalues(current);
        gc.propagate_all(ctx, current);
        gc.separate_to_be_finalized(ctx, current);
        gc.clear_weak_tables();
        gc.current_white ^= 1;
        gc.state = GcState::Sweep;
        gc.sweep_index = 0;
        while !gc.sweep_step() {}
        if gc.kind == GcKind::GenMinor {
            // A full cycle in generational mode is a major collection:
            // every survivor is old and the growth baseline resets.
            let survivors: Vec<u32> = gc.allgc.clone();
            for id in survivors {
                if let Some(obj) = gc.pool.get_mut(id) {
                    obj.header.set_age(G_OLD);
                }
            }
            gc.first_young = gc.allgc.len();
            gc.major_base = gc.total_bytes;
        }
    }

    /// Run up to `limit` pending finalizers. Errors inside a finalizer
    /// are reported through the warning sink, never propagated.
    pub(crate) fn run_pending_finalizers(&mut self, limit: usize) {
        if self.gc.calling_finalizers {
            return;
        }
        self.gc.calling_finalizers = true;
        let mut n = 0;
        while n < limit {
            let Some(id) = self.gc.take_finalizable() else {
                break;
            };
            n += 1;
            // The object goes back into circulation; if it is still
            // unreachable next cycle it will be freed. Its finalized bit
            // is cleared first, so the finalizer cannot run twice.
            if let Some(obj) = self.gc.pool.get_mut(id) {
                obj.header.marked &= !(1 << FINALIZEDBIT);
            }
            let value = match self.gc.pool.get(id) {
                Some(obj) => match &obj.data {
                    GcData::Table(_) => LuaValue::Table(TableId(id)),
                    GcData::Userdata(_) => LuaValue::UserData(UserdataId(id)),
                    _ => continue,
                },
                None => continue,
            };
            self.gc.stats.finalizers_run += 1;
            if let Err(msg) = self.call_finalizer(value) {
                self.warn(&format!("error in __gc finalizer: {msg}"));
            }
        }
        self.gc.calling_finalizers = false;
    }
}

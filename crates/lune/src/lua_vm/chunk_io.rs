// Chunk serialization: dump a prototype tree to bytes and load it back.
//
// The loader is the external compiler's hand-off point: it produces
// prototypes somewhere else and feeds them here as bytes. The contracts
// are deliberately minimal - a pull-based Reader yielding chunks of
// bytes, and a push-based Writer - so hosts can stream from files,
// sockets or memory without the core caring.

use std::rc::Rc;

use crate::gc::Upvalue;
use crate::lua_value::LuaValue;
use crate::lua_vm::{
    ArithOp, CmpOp, Instruction, LuaError, LuaResult, LuaVM, Proto, UnaryOp, UpvalDesc,
};

/// Pull-based byte source: return the next chunk, or None at end of
/// input. Chunks may be any size.
pub trait Reader {
    fn read_chunk(&mut self) -> LuaResult<Option<Vec<u8>>>;
}

/// Push-based byte sink.
pub trait Writer {
    fn write_all(&mut self, bytes: &[u8]) -> LuaResult<()>;
}

/// Reader over an in-memory slice, handed out in one chunk.
pub struct SliceReader<'a> {
    data: Option<&'a [u8]>,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SliceReader { data: Some(data) }
    }
}

impl Reader for SliceReader<'_> {
    fn read_chunk(&mut self) -> LuaResult<Option<Vec<u8>>> {
        Ok(self.data.take().map(|d| d.to_vec()))
    }
}

/// Writer accumulating into a vector.
#[derive(Default)]
pub struct VecWriter {
    pub bytes: Vec<u8>,
}

impl Writer for VecWriter {
    fn write_all(&mut self, bytes: &[u8]) -> LuaResult<()> {
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }
}

const CHUNK_MAGIC: &[u8; 5] = b"\x1bLune";
const CHUNK_VERSION: u8 = 1;

// Constant tags
const K_NIL: u8 = 0;
const K_FALSE: u8 = 1;
const K_TRUE: u8 = 2;
const K_INT: u8 = 3;
const K_FLOAT: u8 = 4;
const K_STRING: u8 = 5;

// ===== encoding primitives =====

struct Enc<'w> {
    w: &'w mut dyn Writer,
}

impl Enc<'_> {
    fn byte(&mut self, b: u8) -> LuaResult<()> {
        self.w.write_all(&[b])
    }

    fn varint(&mut self, mut n: u64) -> LuaResult<()> {
        loop {
            let b = (n & 0x7F) as u8;
            n >>= 7;
            if n == 0 {
                return self.byte(b);
            }
            self.byte(b | 0x80)?;
        }
    }

    fn i64(&mut self, n: i64) -> LuaResult<()> {
        self.w.write_all(&n.to_le_bytes())
    }

    fn f64(&mut self, n: f64) -> LuaResult<()> {
        self.w.write_all(&n.to_le_bytes())
    }

    fn bytes(&mut self, b: &[u8]) -> LuaResult<()> {
        self.varint(b.len() as u64)?;
        self.w.write_all(b)
    }
}

/// Buffering decoder over a Reader.
struct Dec<'r> {
    r: &'r mut dyn Reader,
    buf: Vec<u8>,
    pos: usize,
}

impl Dec<'_> {
    fn fill(&mut self, need: usize) -> LuaResult<()> {
        while self.buf.len() - self.pos < need {
            match self.r.read_chunk()? {
                Some(chunk) => {
                    self.buf.drain(..self.pos);
                    self.pos = 0;
                    self.buf.extend_from_slice(&chunk);
                }
                None => return Err(LuaError::Syntax),
            }
        }
        Ok(())
    }

    fn byte(&mut self) -> LuaResult<u8> {
        self.fill(1)?;
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> LuaResult<u64> {
        let mut n: u64 = 0;
        let mut shift = 0;
        loop {
            let b = self.byte()?;
            n |= ((b & 0x7F) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(n);
            }
            shift += 7;
            if shift >= 64 {
                return Err(LuaError::Syntax);
            }
        }
    }

    fn i64(&mut self) -> LuaResult<i64> {
        self.fill(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(i64::from_le_bytes(arr))
    }

    fn f64(&mut self) -> LuaResult<f64> {
        Ok(f64::from_bits(self.i64()? as u64))
    }

    fn bytes(&mut self) -> LuaResult<Vec<u8>> {
        let n = self.varint()? as usize;
        self.fill(n)?;
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }
}

// ===== instruction codes =====

fn arith_code(op: ArithOp) -> u8 {
    match op {
        ArithOp::Add => 0,
        ArithOp::Sub => 1,
        ArithOp::Mul => 2,
        ArithOp::Div => 3,
        ArithOp::IDiv => 4,
        ArithOp::Mod => 5,
        ArithOp::Pow => 6,
        ArithOp::BAnd => 7,
        ArithOp::BOr => 8,
        ArithOp::BXor => 9,
        ArithOp::Shl => 10,
        ArithOp::Shr => 11,
    }
}

fn arith_from(code: u8) -> LuaResult<ArithOp> {
    Ok(match code {
        0 => ArithOp::Add,
        1 => ArithOp::Sub,
        2 => ArithOp::Mul,
        3 => ArithOp::Div,
        4 => ArithOp::IDiv,
        5 => ArithOp::Mod,
        6 => ArithOp::Pow,
        7 => ArithOp::BAnd,
        8 => ArithOp::BOr,
        9 => ArithOp::BXor,
        10 => ArithOp::Shl,
        11 => ArithOp::Shr,
        _ => return Err(LuaError::Syntax),
    })
}

fn unary_code(op: UnaryOp) -> u8 {
    match op {
        UnaryOp::Neg => 0,
        UnaryOp::Not => 1,
        UnaryOp::Len => 2,
        UnaryOp::BNot => 3,
    }
}

fn unary_from(code: u8) -> LuaResult<UnaryOp> {
    Ok(match code {
        0 => UnaryOp::Neg,
        1 => UnaryOp::Not,
        2 => UnaryOp::Len,
        3 => UnaryOp::BNot,
        _ => return Err(LuaError::Syntax),
    })
}

fn cmp_code(op: CmpOp) -> u8 {
    match op {
        CmpOp::Eq => 0,
        CmpOp::Ne => 1,
        CmpOp::Lt => 2,
        CmpOp::Le => 3,
        CmpOp::Gt => 4,
        CmpOp::Ge => 5,
    }
}

fn cmp_from(code: u8) -> LuaResult<CmpOp> {
    Ok(match code {
        0 => CmpOp::Eq,
        1 => CmpOp::Ne,
        2 => CmpOp::Lt,
        3 => CmpOp::Le,
        4 => CmpOp::Gt,
        5 => CmpOp::Ge,
        _ => return Err(LuaError::Syntax),
    })
}

fn encode_instruction(e: &mut Enc, i: &Instruction) -> LuaResult<()> {
    match *i {
        Instruction::LoadConst { dst, k } => {
            e.byte(0)?;
            e.varint(dst as u64)?;
            e.varint(k as u64)
        }
        Instruction::LoadNil { dst, count } => {
            e.byte(1)?;
            e.varint(dst as u64)?;
            e.varint(count as u64)
        }
        Instruction::LoadBool { dst, value } => {
            e.byte(2)?;
            e.varint(dst as u64)?;
            e.byte(value as u8)
        }
        Instruction::LoadInt { dst, value } => {
            e.byte(3)?;
            e.varint(dst as u64)?;
            e.i64(value as i64)
        }
        Instruction::Move { dst, src } => {
            e.byte(4)?;
            e.varint(dst as u64)?;
            e.varint(src as u64)
        }
        Instruction::GetGlobal { dst, name_k } => {
            e.byte(5)?;
            e.varint(dst as u64)?;
            e.varint(name_k as u64)
        }
        Instruction::SetGlobal { name_k, src } => {
            e.byte(6)?;
            e.varint(name_k as u64)?;
            e.varint(src as u64)
        }
        Instruction::GetUpval { dst, n } => {
            e.byte(7)?;
            e.varint(dst as u64)?;
            e.byte(n)
        }
        Instruction::SetUpval { n, src } => {
            e.byte(8)?;
            e.byte(n)?;
            e.varint(src as u64)
        }
        Instruction::NewTable {
            dst,
            array_hint,
            hash_hint,
        } => {
            e.byte(9)?;
            e.varint(dst as u64)?;
            e.varint(array_hint as u64)?;
            e.varint(hash_hint as u64)
        }
        Instruction::GetTable { dst, table, key } => {
            e.byte(10)?;
            e.varint(dst as u64)?;
            e.varint(table as u64)?;
            e.varint(key as u64)
        }
        Instruction::SetTable { table, key, value } => {
            e.byte(11)?;
            e.varint(table as u64)?;
            e.varint(key as u64)?;
            e.varint(value as u64)
        }
        Instruction::GetField { dst, table, name_k } => {
            e.byte(12)?;
            e.varint(dst as u64)?;
            e.varint(table as u64)?;
            e.varint(name_k as u64)
        }
        Instruction::SetField { table, name_k, value } => {
            e.byte(13)?;
            e.varint(table as u64)?;
            e.varint(name_k as u64)?;
            e.varint(value as u64)
        }
        Instruction::GetIndex { dst, table, imm } => {
            e.byte(14)?;
            e.varint(dst as u64)?;
            e.varint(table as u64)?;
            e.i64(imm as i64)
        }
        Instruction::SetIndex { table, imm, value } => {
            e.byte(15)?;
            e.varint(table as u64)?;
            e.i64(imm as i64)?;
            e.varint(value as u64)
        }
        Instruction::Arith { op, dst, lhs, rhs } => {
            e.byte(16)?;
            e.byte(arith_code(op))?;
            e.varint(dst as u64)?;
            e.varint(lhs as u64)?;
            e.varint(rhs as u64)
        }
        Instruction::Unary { op, dst, src } => {
            e.byte(17)?;
            e.byte(unary_code(op))?;
            e.varint(dst as u64)?;
            e.varint(src as u64)
        }
        Instruction::Compare { op, dst, lhs, rhs } => {
            e.byte(18)?;
            e.byte(cmp_code(op))?;
            e.varint(dst as u64)?;
            e.varint(lhs as u64)?;
            e.varint(rhs as u64)
        }
        Instruction::Concat { dst, first, count } => {
            e.byte(19)?;
            e.varint(dst as u64)?;
            e.varint(first as u64)?;
            e.varint(count as u64)
        }
        Instruction::Test { src, expect } => {
            e.byte(20)?;
            e.varint(src as u64)?;
            e.byte(expect as u8)
        }
        Instruction::Jump { offset } => {
            e.byte(21)?;
            e.i64(offset as i64)
        }
        Instruction::Closure { dst, proto } => {
            e.byte(22)?;
            e.varint(dst as u64)?;
            e.varint(proto as u64)
        }
        Instruction::Call {
            func,
            nargs,
            nresults,
        } => {
            e.byte(23)?;
            e.varint(func as u64)?;
            e.i64(nargs as i64)?;
            e.i64(nresults as i64)
        }
        Instruction::TailCall { func, nargs } => {
            e.byte(24)?;
            e.varint(func as u64)?;
            e.i64(nargs as i64)
        }
        Instruction::Return { first, count } => {
            e.byte(25)?;
            e.varint(first as u64)?;
            e.i64(count as i64)
        }
        Instruction::Vararg { dst, count } => {
            e.byte(26)?;
            e.varint(dst as u64)?;
            e.i64(count as i64)
        }
        Instruction::Close { from } => {
            e.byte(27)?;
            e.varint(from as u64)
        }
        Instruction::Tbc { slot } => {
            e.byte(28)?;
            e.varint(slot as u64)
        }
    }
}

fn decode_instruction(d: &mut Dec) -> LuaResult<Instruction> {
    let tag = d.byte()?;
    Ok(match tag {
        0 => Instruction::LoadConst {
            dst: d.varint()? as u16,
            k: d.varint()? as u32,
        },
        1 => Instruction::LoadNil {
            dst: d.varint()? as u16,
            count: d.varint()? as u16,
        },
        2 => Instruction::LoadBool {
            dst: d.varint()? as u16,
            value: d.byte()? != 0,
        },
        3 => Instruction::LoadInt {
            dst: d.varint()? as u16,
            value: d.i64()? as i32,
        },
        4 => Instruction::Move {
            dst: d.varint()? as u16,
            src: d.varint()? as u16,
        },
        5 => Instruction::GetGlobal {
            dst: d.varint()? as u16,
            name_k: d.varint()? as u32,
        },
        6 => Instruction::SetGlobal {
            name_k: d.varint()? as u32,
            src: d.varint()? as u16,
        },
        7 => Instruction::GetUpval {
            dst: d.varint()? as u16,
            n: d.byte()?,
        },
        8 => Instruction::SetUpval {
            n: d.byte()?,
            src: d.varint()? as u16,
        },
        9 => Instruction::NewTable {
            dst: d.varint()? as u16,
            array_hint: d.varint()? as u16,
            hash_hint: d.varint()? as u16,
        },
        10 => Instruction::GetTable {
            dst: d.varint()? as u16,
            table: d.varint()? as u16,
            key: d.varint()? as u16,
        },
        11 => Instruction::SetTable {
            table: d.varint()? as u16,
            key: d.varint()? as u16,
            value: d.varint()? as u16,
        },
        12 => Instruction::GetField {
            dst: d.varint()? as u16,
            table: d.varint()? as u16,
            name_k: d.varint()? as u32,
        },
        13 => Instruction::SetField {
            table: d.varint()? as u16,
            name_k: d.varint()? as u32,
            value: d.varint()? as u16,
        },
        14 => Instruction::GetIndex {
            dst: d.varint()? as u16,
            table: d.varint()? as u16,
            imm: d.i64()? as i32,
        },
        15 => Instruction::SetIndex {
            table: d.varint()? as u16,
            imm: d.i64()? as i32,
            value: d.varint()? as u16,
        },
        16 => Instruction::Arith {
            op: arith_from(d.byte()?)?,
            dst: d.varint()? as u16,
            lhs: d.varint()? as u16,
            rhs: d.varint()? as u16,
        },
        17 => Instruction::Unary {
            op: unary_from(d.byte()?)?,
            dst: d.varint()? as u16,
            src: d.varint()? as u16,
        },
        18 => Instruction::Compare {
            op: cmp_from(d.byte()?)?,
            dst: d.varint()? as u16,
            lhs: d.varint()? as u16,
            rhs: d.varint()? as u16,
        },
        19 => Instruction::Concat {
            dst: d.varint()? as u16,
            first: d.varint()? as u16,
            count: d.varint()? as u16,
        },
        20 => Instruction::Test {
            src: d.varint()? as u16,
            expect: d.byte()? != 0,
        },
        21 => Instruction::Jump {
            offset: d.i64()? as i32,
        },
        22 => Instruction::Closure {
            dst: d.varint()? as u16,
            proto: d.varint()? as u16,
        },
        23 => Instruction::Call {
            func: d.varint()? as u16,
            nargs: d.i64()? as i32,
            nresults: d.i64()? as i32,
        },
        24 => Instruction::TailCall {
            func: d.varint()? as u16,
            nargs: d.i64()? as i32,
        },
        25 => Instruction::Return {
            first: d.varint()? as u16,
            count: d.i64()? as i32,
        },
        26 => Instruction::Vararg {
            dst: d.varint()? as u16,
            count: d.i64()? as i32,
        },
        27 => Instruction::Close {
            from: d.varint()? as u16,
        },
        28 => Instruction::Tbc {
            slot: d.varint()? as u16,
        },
        _ => return Err(LuaError::Syntax),
    })
}

impl LuaVM {
    fn encode_constant(&self, e: &mut Enc, c: &LuaValue) -> LuaResult<()> {
        match c {
            LuaValue::Nil => e.byte(K_NIL),
            LuaValue::Boolean(false) => e.byte(K_FALSE),
            LuaValue::Boolean(true) => e.byte(K_TRUE),
            LuaValue::Integer(i) => {
                e.byte(K_INT)?;
                e.i64(*i)
            }
            LuaValue::Float(f) => {
                e.byte(K_FLOAT)?;
                e.f64(*f)
            }
            LuaValue::String(_) => {
                e.byte(K_STRING)?;
                let s = self.string_content(c).unwrap_or("");
                e.bytes(s.as_bytes())
            }
            _ => Err(LuaError::Syntax),
        }
    }

    fn decode_constant(&mut self, d: &mut Dec) -> LuaResult<LuaValue> {
        Ok(match d.byte()? {
            K_NIL => LuaValue::Nil,
            K_FALSE => LuaValue::Boolean(false),
            K_TRUE => LuaValue::Boolean(true),
            K_INT => LuaValue::Integer(d.i64()?),
            K_FLOAT => LuaValue::Float(d.f64()?),
            K_STRING => {
                let bytes = d.bytes()?;
                let s = String::from_utf8_lossy(&bytes).into_owned();
                self.create_string(&s)?
            }
            _ => return Err(LuaError::Syntax),
        })
    }

    fn encode_proto(&self, e: &mut Enc, p: &Proto) -> LuaResult<()> {
        e.byte(p.nparams)?;
        e.byte(p.is_vararg as u8)?;
        e.byte(p.max_stack)?;
        e.varint(p.code.len() as u64)?;
        for i in &p.code {
            encode_instruction(e, i)?;
        }
        e.varint(p.constants.len() as u64)?;
        for c in &p.constants {
            self.encode_constant(e, c)?;
        }
        e.varint(p.upvals.len() as u64)?;
        for uv in &p.upvals {
            e.byte(uv.in_stack as u8)?;
            e.byte(uv.index)?;
        }
        e.varint(p.protos.len() as u64)?;
        for sub in &p.protos {
            self.encode_proto(e, sub)?;
        }
        e.bytes(p.source.as_bytes())?;
        e.varint(p.line_defined as u64)?;
        e.varint(p.line_info.len() as u64)?;
        for l in &p.line_info {
            e.varint(*l as u64)?;
        }
        Ok(())
    }

    fn decode_proto(&mut self, d: &mut Dec) -> LuaResult<Rc<Proto>> {
        let nparams = d.byte()?;
        let is_vararg = d.byte()? != 0;
        let max_stack = d.byte()?;
        let ncode = d.varint()? as usize;
        let mut code = Vec::with_capacity(ncode);
        for _ in 0..ncode {
            code.push(decode_instruction(d)?);
        }
        let nconsts = d.varint()? as usize;
        let mut constants = Vec::with_capacity(nconsts);
        for _ in 0..nconsts {
            constants.push(self.decode_constant(d)?);
        }
        let nupvals = d.varint()? as usize;
        let mut upvals = Vec::with_capacity(nupvals);
        for _ in 0..nupvals {
            upvals.push(UpvalDesc {
                in_stack: d.byte()? != 0,
                index: d.byte()?,
            });
        }
        let nprotos = d.varint()? as usize;
        let mut protos = Vec::with_capacity(nprotos);
        for _ in 0..nprotos {
            protos.push(self.decode_proto(d)?);
        }
        let source = String::from_utf8_lossy(&d.bytes()?).into_owned();
        let line_defined = d.varint()? as u32;
        let nlines = d.varint()? as usize;
        let mut line_info = Vec::with_capacity(nlines);
        for _ in 0..nlines {
            line_info.push(d.varint()? as u32);
        }
        Ok(Rc::new(Proto {
            nparams,
            is_vararg,
            max_stack,
            code,
            constants,
            upvals,
            protos,
            source,
            line_info,
            line_defined,
        }))
    }

    /// Serialize an interpreted closure's prototype tree.
    pub fn dump(&mut self, f: &LuaValue, w: &mut dyn Writer) -> LuaResult<()> {
        let proto = match f.as_function_id() {
            Some(fid) => match self.gc.pool.get_function(fid) {
                Some(crate::gc::FunctionBody::Lua { proto, .. }) => proto.clone(),
                _ => return Err(self.rt_error("unable to dump given function")),
            },
            None => return Err(self.rt_error("unable to dump given function")),
        };
        let mut e = Enc { w };
        e.w.write_all(CHUNK_MAGIC)?;
        e.byte(CHUNK_VERSION)?;
        e.byte(8)?; // integer width marker
        self.encode_proto(&mut e, &proto)
    }

    /// Load a serialized chunk through a Reader, producing a closure.
    /// Upvalues of the top-level prototype come up closed over nil.
    pub fn load(&mut self, r: &mut dyn Reader, _chunk_name: &str) -> LuaResult<LuaValue> {
        let mut d = Dec {
            r,
            buf: Vec::new(),
            pos: 0,
        };
        let mut magic = [0u8; 5];
        for slot in magic.iter_mut() {
            *slot = d.byte()?;
        }
        if &magic != CHUNK_MAGIC {
            return Err(LuaError::Syntax);
        }
        if d.byte()? != CHUNK_VERSION || d.byte()? != 8 {
            return Err(LuaError::Syntax);
        }
        let proto = self.decode_proto(&mut d)?;
        self.instantiate_root(proto)
    }

    /// Build a closure from a root prototype, with fresh nil upvalue
    /// cells for any declared upvalues (the `load` result).
    pub fn instantiate_root(&mut self, proto: Rc<Proto>) -> LuaResult<LuaValue> {
        let mut ups = Vec::with_capacity(proto.upvals.len());
        for _ in 0..proto.upvals.len() {
            ups.push(self.create_upvalue(Upvalue::Closed(LuaValue::Nil))?);
        }
        self.create_closure(proto, ups)
    }
}

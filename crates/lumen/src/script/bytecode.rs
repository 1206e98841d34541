//! Reader for the Lua 5.4 binary chunk format produced by `lua_dump`.
//!
//! Only what the sandbox check needs is kept: instructions, constants,
//! upvalue names, nested prototypes and line information.

use thiserror::Error;

const SIGNATURE: &[u8] = b"\x1bLua";
const VERSION: u8 = 0x54;
const FORMAT: u8 = 0;
const LUAC_DATA: &[u8] = b"\x19\x93\r\n\x1a\n";
const LUAC_INT: i64 = 0x5678;
const LUAC_NUM: f64 = 370.5;

/// Marker in `lineinfo` for instructions whose line lives in `abslineinfo`.
const ABSLINEINFO: i8 = -0x80;

const TAG_NIL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x11;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x13;
const TAG_SHORT_STR: u8 = 0x04;
const TAG_LONG_STR: u8 = 0x14;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("truncated chunk at offset {0}")]
    Truncated(usize),
    #[error("bad chunk header: {0}")]
    Header(&'static str),
    #[error("size overflow at offset {0}")]
    Overflow(usize),
    #[error("unknown constant tag {0:#x}")]
    ConstantTag(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Str(Vec<u8>),
}

impl Constant {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

/// One function prototype with its nested functions.
#[derive(Debug, Clone)]
pub struct Prototype {
    pub line_defined: u32,
    pub code: Vec<u32>,
    pub constants: Vec<Constant>,
    pub upvalue_names: Vec<Option<String>>,
    pub protos: Vec<Prototype>,
    line_info: Vec<i8>,
    abs_line_info: Vec<(usize, u32)>,
}

impl Prototype {
    /// Source line of the instruction at `pc`, if line information was kept.
    #[must_use]
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        if self.line_info.is_empty() || pc >= self.line_info.len() {
            return None;
        }
        let (base_pc, base_line) = self
            .abs_line_info
            .iter()
            .rev()
            .find(|(abs_pc, _)| *abs_pc <= pc)
            .map_or((None, i64::from(self.line_defined)), |(abs_pc, line)| {
                (Some(*abs_pc), i64::from(*line))
            });

        let start = base_pc.map_or(0, |p| p + 1);
        let line = self.line_info[start..=pc]
            .iter()
            .filter(|delta| **delta != ABSLINEINFO)
            .fold(base_line, |line, delta| line + i64::from(*delta));
        u32::try_from(line).ok()
    }
}

/// Parses a chunk produced by dumping a compiled function.
///
/// # Errors
/// Returns an error if the chunk is not a Lua 5.4 dump for this platform.
pub fn parse(chunk: &[u8]) -> Result<Prototype, BytecodeError> {
    let mut reader = Reader { data: chunk, pos: 0 };
    reader.header()?;
    let _main_upvalues = reader.byte()?;
    reader.function()
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], BytecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(BytecodeError::Overflow(self.pos))?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(BytecodeError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, BytecodeError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], BytecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// MSB-first groups of 7 bits; the final byte carries the high bit.
    fn size(&mut self) -> Result<usize, BytecodeError> {
        let mut value: usize = 0;
        loop {
            let b = self.byte()?;
            if value > (usize::MAX >> 7) {
                return Err(BytecodeError::Overflow(self.pos));
            }
            value = (value << 7) | usize::from(b & 0x7f);
            if b & 0x80 != 0 {
                return Ok(value);
            }
        }
    }

    fn int(&mut self) -> Result<u32, BytecodeError> {
        let pos = self.pos;
        u32::try_from(self.size()?).map_err(|_| BytecodeError::Overflow(pos))
    }

    fn string(&mut self) -> Result<Option<Vec<u8>>, BytecodeError> {
        match self.size()? {
            0 => Ok(None),
            n => Ok(Some(self.take(n - 1)?.to_vec())),
        }
    }

    fn header(&mut self) -> Result<(), BytecodeError> {
        if self.take(SIGNATURE.len())? != SIGNATURE {
            return Err(BytecodeError::Header("signature"));
        }
        if self.byte()? != VERSION {
            return Err(BytecodeError::Header("version"));
        }
        if self.byte()? != FORMAT {
            return Err(BytecodeError::Header("format"));
        }
        if self.take(LUAC_DATA.len())? != LUAC_DATA {
            return Err(BytecodeError::Header("corrupted"));
        }
        if self.array::<3>()? != [4, 8, 8] {
            return Err(BytecodeError::Header("type sizes"));
        }
        if i64::from_ne_bytes(self.array()?) != LUAC_INT {
            return Err(BytecodeError::Header("integer format"));
        }
        #[allow(clippy::float_cmp)]
        if f64::from_ne_bytes(self.array()?) != LUAC_NUM {
            return Err(BytecodeError::Header("float format"));
        }
        Ok(())
    }

    fn function(&mut self) -> Result<Prototype, BytecodeError> {
        let _source = self.string()?;
        let line_defined = self.int()?;
        let _last_line_defined = self.int()?;
        let _num_params = self.byte()?;
        let _is_vararg = self.byte()?;
        let _max_stack = self.byte()?;

        let n = self.size()?;
        let mut code = Vec::with_capacity(n.min(self.data.len() / 4));
        for _ in 0..n {
            code.push(u32::from_ne_bytes(self.array()?));
        }

        let n = self.size()?;
        let mut constants = Vec::with_capacity(n.min(self.data.len()));
        for _ in 0..n {
            constants.push(self.constant()?);
        }

        let upvalue_count = self.size()?;
        self.take(upvalue_count.checked_mul(3).ok_or(BytecodeError::Overflow(self.pos))?)?;

        let n = self.size()?;
        let mut protos = Vec::with_capacity(n.min(self.data.len()));
        for _ in 0..n {
            protos.push(self.function()?);
        }

        let n = self.size()?;
        #[allow(clippy::cast_possible_wrap)]
        let line_info = self.take(n)?.iter().map(|b| *b as i8).collect();

        let n = self.size()?;
        let mut abs_line_info = Vec::with_capacity(n.min(self.data.len()));
        for _ in 0..n {
            abs_line_info.push((self.size()?, self.int()?));
        }

        let n = self.size()?;
        for _ in 0..n {
            let _name = self.string()?;
            let _start_pc = self.size()?;
            let _end_pc = self.size()?;
        }

        let n = self.size()?;
        let mut upvalue_names = Vec::with_capacity(n.min(self.data.len()));
        for _ in 0..n {
            upvalue_names.push(
                self.string()?
                    .map(|name| String::from_utf8_lossy(&name).into_owned()),
            );
        }

        Ok(Prototype {
            line_defined,
            code,
            constants,
            upvalue_names,
            protos,
            line_info,
            abs_line_info,
        })
    }

    fn constant(&mut self) -> Result<Constant, BytecodeError> {
        Ok(match self.byte()? {
            TAG_NIL => Constant::Nil,
            TAG_FALSE => Constant::Bool(false),
            TAG_TRUE => Constant::Bool(true),
            TAG_INT => Constant::Integer(i64::from_ne_bytes(self.array()?)),
            TAG_FLOAT => Constant::Float(f64::from_ne_bytes(self.array()?)),
            TAG_SHORT_STR | TAG_LONG_STR => Constant::Str(self.string()?.unwrap_or_default()),
            tag => return Err(BytecodeError::ConstantTag(tag)),
        })
    }
}

/// Opcodes and fields of Lua 5.4 instructions.
pub mod instruction {
    pub const OP_MOVE: u32 = 0;
    pub const OP_LOADK: u32 = 3;
    pub const OP_LOADKX: u32 = 4;
    pub const OP_LOADNIL: u32 = 8;
    pub const OP_GETUPVAL: u32 = 9;
    pub const OP_SETUPVAL: u32 = 10;
    pub const OP_SETTABUP: u32 = 15;
    pub const OP_SETTABLE: u32 = 16;
    pub const OP_SETI: u32 = 17;
    pub const OP_SETFIELD: u32 = 18;
    pub const OP_SELF: u32 = 20;
    pub const OP_MMBIN: u32 = 46;
    pub const OP_MMBINK: u32 = 48;
    pub const OP_CONCAT: u32 = 53;
    pub const OP_CLOSE: u32 = 54;
    pub const OP_GEI: u32 = 65;
    pub const OP_TEST: u32 = 66;
    pub const OP_CALL: u32 = 68;
    pub const OP_TAILCALL: u32 = 69;
    pub const OP_RETURN: u32 = 70;
    pub const OP_RETURN1: u32 = 72;
    pub const OP_FORLOOP: u32 = 73;
    pub const OP_TFORLOOP: u32 = 77;
    pub const OP_SETLIST: u32 = 78;
    pub const OP_VARARG: u32 = 80;
    pub const OP_EXTRAARG: u32 = 82;

    #[must_use]
    pub const fn opcode(i: u32) -> u32 {
        i & 0x7f
    }

    #[must_use]
    pub const fn a(i: u32) -> usize {
        ((i >> 7) & 0xff) as usize
    }

    #[must_use]
    pub const fn b(i: u32) -> usize {
        ((i >> 16) & 0xff) as usize
    }

    #[must_use]
    pub const fn bx(i: u32) -> usize {
        (i >> 15) as usize
    }

    #[must_use]
    pub const fn ax(i: u32) -> usize {
        (i >> 7) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump(source: &str) -> Vec<u8> {
        let lua = mlua::Lua::new();
        lua.load(source)
            .set_name("@test.lua")
            .into_function()
            .expect("compile")
            .dump(false)
    }

    #[test]
    fn reads_nested_prototypes() {
        let proto = parse(&dump(
            "local function a() return function() end end\nlocal function b() end",
        ))
        .expect("parse");
        assert_eq!(proto.protos.len(), 2);
        assert_eq!(proto.protos[0].protos.len(), 1);
        assert_eq!(proto.upvalue_names, vec![Some("_ENV".to_string())]);
    }

    #[test]
    fn resolves_lines_past_absolute_markers() {
        let source = format!("local a = 1\n{}local b = 2", "\n".repeat(300));
        let proto = parse(&dump(&source)).expect("parse");
        let lines: Vec<_> = (0..proto.code.len())
            .filter_map(|pc| proto.line_at(pc))
            .collect();
        assert!(lines.contains(&1));
        assert!(lines.contains(&302));
    }

    #[test]
    fn keeps_string_constants() {
        let proto = parse(&dump("local s = 'hello'")).expect("parse");
        assert!(proto.constants.iter().any(|k| k.as_str() == Some("hello")));
    }

    #[test]
    fn rejects_foreign_data() {
        assert_eq!(
            parse(b"\x1bLuaQ").unwrap_err(),
            BytecodeError::Header("version")
        );
        assert!(matches!(
            parse(b"\x1bLu").unwrap_err(),
            BytecodeError::Truncated(_)
        ));
    }
}

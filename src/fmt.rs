//! Byte buffer and `$`-escape formatter used by both backend emitters.
//!
//! The formatter is keyed on `$` so that generated assembly may freely
//! contain `%` (the LLVM/PTX register prefix). Arguments are a typed
//! list; each escape pops the next argument of the expected flavor.
//!
//! Supported escapes (see the emitters for usage):
//!
//! | escape | argument  | result                                    |
//! |--------|-----------|-------------------------------------------|
//! | `$u`   | u32       | decimal                                   |
//! | `$U`   | u64       | decimal                                   |
//! | `$x`   | u32       | hex                                       |
//! | `$X`   | u64       | hex                                       |
//! | `$s`   | str       | verbatim                                  |
//! | `$t`   | var       | scalar type (`float`, `u32`, ...)         |
//! | `$T`   | var       | vector type (`<8 x float>`)               |
//! | `$h`   | var       | intrinsic type abbreviation (`f32`)       |
//! | `$b`   | var       | same-width integer type                   |
//! | `$B`   | var       | vector of `$b`                            |
//! | `$d`   | var       | double-width integer type                 |
//! | `$D`   | var       | vector of `$d`                            |
//! | `$m`   | var       | scalar type, masks promoted to `i8`       |
//! | `$M`   | var       | vector of `$m`                            |
//! | `$v`   | var       | register name (`%f12`)                    |
//! | `$V`   | var       | type-qualified register (`<8 x float> %f12`) |
//! | `$a`   | var       | scalar alignment                          |
//! | `$A`   | var       | vector alignment                          |
//! | `$o`   | var       | parameter-array offset                    |
//! | `$l`   | var       | literal payload                           |
//! | `$w`   | (none)    | vector width                              |
//! | `$z`   | (none)    | `zeroinitializer`                         |
//! | `$e`   | (none)    | `.experimental` on old LLVM, else empty   |
//! | `$n`   | (none)    | newline                                   |
//! | `${`/`$}` | (none) | literal brace                             |
//!
//! Two grouping constructs exist on the LLVM side: `{a|b}` renders `a`
//! under typed pointers and `b` under opaque pointers (`{i8*}` without a
//! `|` renders `ptr` in opaque mode), and `$<X$>` renders `X` at the top
//! level but `<w x X>` inside a recorded subroutine.

use rustc_hash::FxHashSet;

use crate::kernel::EmitVar;
use crate::state::JitBackend;
use crate::vtype::VarType;

/// Growable text buffer backing code generation.
#[derive(Default)]
pub struct Buffer {
    data: String,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }

    pub fn put(&mut self, s: &str) {
        self.data.push_str(s);
    }

    pub fn putc(&mut self, c: char) {
        self.data.push(c);
    }

    /// Discard everything at and after byte position `len`.
    pub fn rewind_to(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Move the text in `[start..]` so that it begins at byte position
    /// `target` instead, shifting the middle right. Used to patch setup
    /// code (allocas, callable-table loads) into a function prologue
    /// after its body size is known.
    pub fn move_suffix(&mut self, start: usize, target: usize) {
        assert!(target <= start && start <= self.data.len());
        // Both positions are produced by scanning ASCII landmarks, so the
        // rotation below stays on char boundaries.
        let len = self.data.len();
        unsafe {
            self.data.as_mut_vec()[target..].rotate_right(len - start);
        }
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.data)
    }
}

impl std::fmt::Write for Buffer {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.data.push_str(s);
        Ok(())
    }
}

/// One argument of a formatting call.
#[derive(Clone, Copy)]
pub enum FmtArg<'a> {
    U32(u32),
    U64(u64),
    Str(&'a str),
    Var(&'a EmitVar),
}

impl From<u32> for FmtArg<'_> {
    fn from(value: u32) -> Self {
        FmtArg::U32(value)
    }
}

impl From<u64> for FmtArg<'_> {
    fn from(value: u64) -> Self {
        FmtArg::U64(value)
    }
}

impl<'a> From<&'a str> for FmtArg<'a> {
    fn from(value: &'a str) -> Self {
        FmtArg::Str(value)
    }
}

impl<'a> From<&'a EmitVar> for FmtArg<'a> {
    fn from(value: &'a EmitVar) -> Self {
        FmtArg::Var(value)
    }
}

/// Invariant context of one assembly run.
pub struct FmtCtx {
    pub backend: JitBackend,
    /// Vector width of the LLVM backend (lanes per kernel iteration).
    pub width: u32,
    /// Emit `ptr` instead of typed pointers (LLVM >= 15 convention).
    pub opaque_pointers: bool,
    pub llvm_version: u32,
    /// Non-zero while assembling a recorded subroutine body; `$<X$>`
    /// vectorizes and gathers address per-lane.
    pub callable_depth: u32,
}

impl FmtCtx {
    pub fn llvm(width: u32, llvm_version: u32) -> Self {
        Self {
            backend: JitBackend::LlvmSimd,
            width,
            opaque_pointers: llvm_version >= 15,
            llvm_version,
            callable_depth: 0,
        }
    }

    pub fn cuda() -> Self {
        Self {
            backend: JitBackend::Cuda,
            width: 1,
            opaque_pointers: false,
            llvm_version: 0,
            callable_depth: 0,
        }
    }
}

fn scalar_type(ctx: &FmtCtx, v: &EmitVar) -> &'static str {
    match ctx.backend {
        JitBackend::LlvmSimd => v.vtype.llvm(),
        JitBackend::Cuda => v.vtype.ptx(),
    }
}

fn bin_type(ctx: &FmtCtx, v: &EmitVar) -> &'static str {
    match ctx.backend {
        JitBackend::LlvmSimd => v.vtype.llvm_bin(),
        JitBackend::Cuda => v.vtype.ptx_bin(),
    }
}

fn mask_promoted_type(ctx: &FmtCtx, v: &EmitVar) -> &'static str {
    if v.vtype == VarType::Bool {
        "i8"
    } else {
        scalar_type(ctx, v)
    }
}

/// Literal payload in the backend's constant syntax. LLVM spells float
/// constants as hexadecimal doubles regardless of precision; integers are
/// signed decimals of their width. PTX consumes raw bit patterns.
pub fn literal_str(backend: JitBackend, vtype: VarType, bits: u64) -> String {
    match backend {
        JitBackend::Cuda => format!("0x{bits:x}"),
        JitBackend::LlvmSimd => match vtype {
            VarType::Float16 => format!("0xH{bits:04X}"),
            VarType::Float32 => {
                let wide = f32::from_bits(bits as u32) as f64;
                format!("0x{:016X}", wide.to_bits())
            }
            VarType::Float64 => format!("0x{bits:016X}"),
            VarType::Bool => format!("{}", (bits != 0) as u8),
            VarType::Int8 => format!("{}", bits as i8),
            VarType::Int16 => format!("{}", bits as i16),
            VarType::Int32 => format!("{}", bits as i32),
            VarType::Int64 => format!("{}", bits as i64),
            _ => format!("{bits}"),
        },
    }
}

struct ArgCursor<'a, 'b> {
    args: &'b [FmtArg<'a>],
    next: usize,
    template: &'b str,
}

impl<'a, 'b> ArgCursor<'a, 'b> {
    fn pop(&mut self) -> FmtArg<'a> {
        let arg = self.args.get(self.next).copied().unwrap_or_else(|| {
            panic!(
                "fmt(): out of arguments (consumed {}) while formatting \"{}\"!",
                self.next, self.template
            )
        });
        self.next += 1;
        arg
    }

    fn pop_u32(&mut self) -> u32 {
        match self.pop() {
            FmtArg::U32(value) => value,
            _ => panic!("fmt(): expected a u32 argument in \"{}\"!", self.template),
        }
    }

    fn pop_u64(&mut self) -> u64 {
        match self.pop() {
            FmtArg::U64(value) => value,
            FmtArg::U32(value) => value as u64,
            _ => panic!("fmt(): expected a u64 argument in \"{}\"!", self.template),
        }
    }

    fn pop_str(&mut self) -> &'a str {
        match self.pop() {
            FmtArg::Str(value) => value,
            _ => panic!("fmt(): expected a string argument in \"{}\"!", self.template),
        }
    }

    fn pop_var(&mut self) -> &'a EmitVar {
        match self.pop() {
            FmtArg::Var(value) => value,
            _ => panic!("fmt(): expected a variable argument in \"{}\"!", self.template),
        }
    }
}

/// Render `template` into `out`. See the module docs for the escape set.
pub fn format_into(out: &mut Buffer, ctx: &FmtCtx, template: &str, args: &[FmtArg]) {
    let mut cursor = ArgCursor {
        args,
        next: 0,
        template,
    };
    render(out, ctx, template, &mut cursor, true);
    if cursor.next != args.len() {
        panic!(
            "fmt(): {} argument(s) were not consumed by \"{template}\"!",
            args.len() - cursor.next
        );
    }
}

fn render(out: &mut Buffer, ctx: &FmtCtx, template: &str, cursor: &mut ArgCursor, emit: bool) {
    use std::fmt::Write;

    let bytes = template.as_bytes();
    let mut i = 0;
    macro_rules! put {
        ($($fmtargs:tt)*) => {
            if emit {
                let _ = write!(out, $($fmtargs)*);
            }
        };
    }

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '{' && ctx.backend == JitBackend::LlvmSimd {
            let close = template[i + 1..]
                .find('}')
                .map(|p| i + 1 + p)
                .unwrap_or_else(|| panic!("fmt(): unmatched '{{' in \"{template}\"!"));
            let group = &template[i + 1..close];
            match group.find('|') {
                Some(bar) => {
                    let (typed, opaque) = (&group[..bar], &group[bar + 1..]);
                    render(out, ctx, typed, cursor, emit && !ctx.opaque_pointers);
                    render(out, ctx, opaque, cursor, emit && ctx.opaque_pointers);
                }
                None => {
                    if ctx.opaque_pointers {
                        render(out, ctx, group, cursor, false);
                        put!("ptr");
                    } else {
                        render(out, ctx, group, cursor, emit);
                    }
                }
            }
            i = close + 1;
            continue;
        }

        if c != '$' {
            if emit {
                out.putc(c);
            }
            i += 1;
            continue;
        }

        let escape = *bytes
            .get(i + 1)
            .unwrap_or_else(|| panic!("fmt(): dangling '$' in \"{template}\"!"))
            as char;
        i += 2;

        match escape {
            'u' => {
                let value = cursor.pop_u32();
                put!("{value}");
            }
            'U' => {
                let value = cursor.pop_u64();
                put!("{value}");
            }
            'x' => {
                let value = cursor.pop_u32();
                put!("{value:x}");
            }
            'X' => {
                let value = cursor.pop_u64();
                put!("{value:x}");
            }
            's' => {
                let value = cursor.pop_str();
                put!("{value}");
            }
            't' => {
                let v = cursor.pop_var();
                put!("{}", scalar_type(ctx, v));
            }
            'T' => {
                let v = cursor.pop_var();
                put!("<{} x {}>", ctx.width, scalar_type(ctx, v));
            }
            'h' => {
                let v = cursor.pop_var();
                put!("{}", v.vtype.llvm_abbrev());
            }
            'b' => {
                let v = cursor.pop_var();
                put!("{}", bin_type(ctx, v));
            }
            'B' => {
                let v = cursor.pop_var();
                put!("<{} x {}>", ctx.width, bin_type(ctx, v));
            }
            'd' => {
                let v = cursor.pop_var();
                put!("{}", v.vtype.llvm_big());
            }
            'D' => {
                let v = cursor.pop_var();
                put!("<{} x {}>", ctx.width, v.vtype.llvm_big());
            }
            'm' => {
                let v = cursor.pop_var();
                put!("{}", mask_promoted_type(ctx, v));
            }
            'M' => {
                let v = cursor.pop_var();
                put!("<{} x {}>", ctx.width, mask_promoted_type(ctx, v));
            }
            'v' => {
                let v = cursor.pop_var();
                put!("{}{}", v.vtype.prefix(), v.reg);
            }
            'V' => {
                let v = cursor.pop_var();
                put!(
                    "<{} x {}> {}{}",
                    ctx.width,
                    scalar_type(ctx, v),
                    v.vtype.prefix(),
                    v.reg
                );
            }
            'a' => {
                let v = cursor.pop_var();
                put!("{}", v.vtype.size());
            }
            'A' => {
                let v = cursor.pop_var();
                put!("{}", v.vtype.size() * ctx.width as usize);
            }
            'o' => {
                let v = cursor.pop_var();
                put!("{}", v.param_offset);
            }
            'l' => {
                let v = cursor.pop_var();
                put!("{}", literal_str(ctx.backend, v.vtype, v.literal));
            }
            'w' => {
                put!("{}", ctx.width);
            }
            'z' => {
                put!("zeroinitializer");
            }
            'e' => {
                if ctx.llvm_version < 12 {
                    put!(".experimental");
                }
            }
            'n' => {
                put!("\n");
            }
            '{' => {
                put!("{{");
            }
            '}' => {
                put!("}}");
            }
            '<' => {
                if ctx.callable_depth > 0 {
                    put!("<{} x ", ctx.width);
                }
            }
            '>' => {
                if ctx.callable_depth > 0 {
                    put!(">");
                }
            }
            other => panic!("fmt(): unknown escape '${other}' in \"{template}\"!"),
        }
    }
}

/// Code writer shared by the two emitters: the kernel body buffer plus a
/// content-deduplicated globals section for intrinsic declarations and
/// helper functions.
pub struct CodeWriter {
    pub buf: Buffer,
    pub globals: Buffer,
    globals_seen: FxHashSet<u64>,
    pub ctx: FmtCtx,
    scratch: Buffer,
}

impl CodeWriter {
    pub fn new(ctx: FmtCtx) -> Self {
        Self {
            buf: Buffer::new(),
            globals: Buffer::new(),
            globals_seen: FxHashSet::default(),
            ctx,
            scratch: Buffer::new(),
        }
    }

    pub fn put(&mut self, s: &str) {
        self.buf.put(s);
    }

    pub fn fmt(&mut self, template: &str, args: &[FmtArg]) {
        format_into(&mut self.buf, &self.ctx, template, args);
    }

    /// Render a declaration into the globals section unless an identical
    /// one was emitted before.
    pub fn fmt_global(&mut self, template: &str, args: &[FmtArg]) {
        self.scratch.clear();
        format_into(&mut self.scratch, &self.ctx, template, args);
        let hash = crate::kernel::kernel_hash(self.scratch.as_str().as_bytes());
        if self.globals_seen.insert(hash) {
            self.globals.put(self.scratch.as_str());
            self.globals.put("\n");
        }
    }

    /// Append pre-rendered text to the globals section (content-deduped,
    /// no escape processing).
    pub fn put_global_verbatim(&mut self, text: &str) {
        let hash = crate::kernel::kernel_hash(text.as_bytes());
        if self.globals_seen.insert(hash) {
            self.globals.put(text);
            self.globals.put("\n");
        }
    }
}

/// Convenience macro wrapping [`CodeWriter::fmt`].
macro_rules! wfmt {
    ($w:expr, $template:expr) => {
        $w.fmt($template, &[])
    };
    ($w:expr, $template:expr, $($arg:expr),+ $(,)?) => {
        $w.fmt($template, &[$(crate::fmt::FmtArg::from($arg)),+])
    };
}

/// Convenience macro wrapping [`CodeWriter::fmt_global`].
macro_rules! wfmt_g {
    ($w:expr, $template:expr) => {
        $w.fmt_global($template, &[])
    };
    ($w:expr, $template:expr, $($arg:expr),+ $(,)?) => {
        $w.fmt_global($template, &[$(crate::fmt::FmtArg::from($arg)),+])
    };
}

pub(crate) use {wfmt, wfmt_g};

/// Render a legacy numbered statement template (`VarKind::Stmt`).
///
/// The placeholders reference the node and its operands by position:
/// `$r0` is the node's own register, `$r1..$r4` its operands; `$t`/`$b`
/// select scalar/binary types the same way. `$w`, `$z` and `$n` behave as
/// in the main formatter.
pub fn render_stmt(
    out: &mut Buffer,
    ctx: &FmtCtx,
    stmt: &str,
    slots: [Option<&EmitVar>; 5],
) {
    use std::fmt::Write;

    let bytes = stmt.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c != '$' {
            out.putc(c);
            i += 1;
            continue;
        }
        let escape = *bytes
            .get(i + 1)
            .unwrap_or_else(|| panic!("render_stmt(): dangling '$' in \"{stmt}\"!")) as char;
        i += 2;
        match escape {
            'r' | 't' | 'b' => {
                let slot = (*bytes
                    .get(i)
                    .unwrap_or_else(|| panic!("render_stmt(): missing slot digit in \"{stmt}\"!"))
                    - b'0') as usize;
                i += 1;
                let v = slots[slot].unwrap_or_else(|| {
                    panic!("render_stmt(): statement references missing operand {slot}!")
                });
                match escape {
                    'r' => {
                        let _ = write!(out, "{}{}", v.vtype.prefix(), v.reg);
                    }
                    't' => out.put(scalar_type(ctx, v)),
                    _ => out.put(bin_type(ctx, v)),
                }
            }
            'w' => {
                let _ = write!(out, "{}", ctx.width);
            }
            'z' => out.put("zeroinitializer"),
            'n' => out.put("\n    "),
            other => panic!("render_stmt(): unknown escape '${other}' in \"{stmt}\"!"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{ParamKind, NO_REG};

    fn test_var(vtype: VarType, reg: u32) -> EmitVar {
        EmitVar {
            id: reg,
            reg,
            kind: crate::var::VarKind::Add,
            vtype,
            scalar: false,
            param: ParamKind::Register,
            param_offset: 7,
            literal: 0,
            stmt: None,
            dep: [NO_REG; 4],
            ssa_f32_cast: false,
        }
    }

    fn run(ctx: &FmtCtx, template: &str, args: &[FmtArg]) -> String {
        let mut buf = Buffer::new();
        format_into(&mut buf, ctx, template, args);
        buf.as_str().to_string()
    }

    #[test]
    fn numeric_and_string_escapes() {
        let ctx = FmtCtx::llvm(8, 14);
        assert_eq!(
            run(&ctx, "$u $U $x $X $s", &[
                FmtArg::U32(10),
                FmtArg::U64(11),
                FmtArg::U32(255),
                FmtArg::U64(256),
                FmtArg::Str("ok")
            ]),
            "10 11 ff 100 ok"
        );
    }

    #[test]
    fn type_escapes() {
        let ctx = FmtCtx::llvm(8, 14);
        let v = test_var(VarType::Float32, 5);
        assert_eq!(
            run(&ctx, "$t|$T|$h|$b|$B|$v|$V|$a|$A|$o", &[
                FmtArg::Var(&v),
                FmtArg::Var(&v),
                FmtArg::Var(&v),
                FmtArg::Var(&v),
                FmtArg::Var(&v),
                FmtArg::Var(&v),
                FmtArg::Var(&v),
                FmtArg::Var(&v),
                FmtArg::Var(&v),
                FmtArg::Var(&v),
            ]),
            "float|<8 x float>|f32|i32|<8 x i32>|%f5|<8 x float> %f5|4|32|7"
        );
    }

    #[test]
    fn mask_promotion() {
        let ctx = FmtCtx::llvm(16, 14);
        let v = test_var(VarType::Bool, 3);
        assert_eq!(
            run(&ctx, "$t $m $M", &[FmtArg::Var(&v), FmtArg::Var(&v), FmtArg::Var(&v)]),
            "i1 i8 <16 x i8>"
        );
    }

    #[test]
    fn pointer_braces_both_modes() {
        let typed = FmtCtx::llvm(8, 14);
        let opaque = FmtCtx::llvm(8, 16);
        let v = test_var(VarType::Float32, 1);
        assert_eq!(
            run(&typed, "load $M, {$M*} $v_p", &[FmtArg::Var(&v), FmtArg::Var(&v), FmtArg::Var(&v)]),
            "load <8 x float>, <8 x float>* %f1_p"
        );
        assert_eq!(
            run(&opaque, "load $M, {$M*} $v_p", &[FmtArg::Var(&v), FmtArg::Var(&v), FmtArg::Var(&v)]),
            "load <8 x float>, ptr %f1_p"
        );
    }

    #[test]
    fn alternative_braces_consume_args_of_both_sides() {
        let typed = FmtCtx::llvm(8, 14);
        let opaque = FmtCtx::llvm(8, 16);
        assert_eq!(run(&typed, "x{$u|$u}y", &[FmtArg::U32(1), FmtArg::U32(2)]), "x1y");
        assert_eq!(run(&opaque, "x{$u|$u}y", &[FmtArg::U32(1), FmtArg::U32(2)]), "x2y");
    }

    #[test]
    fn subroutine_vectorization() {
        let mut ctx = FmtCtx::llvm(8, 14);
        assert_eq!(run(&ctx, "$<i8*$>", &[]), "i8*");
        ctx.callable_depth = 1;
        assert_eq!(run(&ctx, "$<i8*$>", &[]), "<8 x i8*>");
    }

    #[test]
    fn version_dependent_qualifier() {
        let old = FmtCtx::llvm(8, 11);
        let new = FmtCtx::llvm(8, 14);
        assert_eq!(run(&old, "llvm$e.vector.reduce.or", &[]), "llvm.experimental.vector.reduce.or");
        assert_eq!(run(&new, "llvm$e.vector.reduce.or", &[]), "llvm.vector.reduce.or");
    }

    #[test]
    fn float_literals_use_double_hex() {
        assert_eq!(
            literal_str(JitBackend::LlvmSimd, VarType::Float32, 1.0f32.to_bits() as u64),
            "0x3FF0000000000000"
        );
        assert_eq!(literal_str(JitBackend::LlvmSimd, VarType::Int32, 0xffff_ffff), "-1");
        assert_eq!(literal_str(JitBackend::Cuda, VarType::Float32, 0x3f80_0000), "0x3f800000");
    }

    #[test]
    fn globals_deduplicate() {
        let mut w = CodeWriter::new(FmtCtx::llvm(8, 14));
        wfmt_g!(w, "declare $u", 1u32);
        wfmt_g!(w, "declare $u", 1u32);
        wfmt_g!(w, "declare $u", 2u32);
        assert_eq!(w.globals.as_str(), "declare 1\ndeclare 2\n");
    }

    #[test]
    fn stmt_renderer_numbered_slots() {
        let ctx = FmtCtx::cuda();
        let out_v = test_var(VarType::UInt32, 0);
        let in_v = test_var(VarType::UInt32, 1);
        let mut buf = Buffer::new();
        render_stmt(
            &mut buf,
            &ctx,
            "mov.$t0 $r0, $r1",
            [Some(&out_v), Some(&in_v), None, None, None],
        );
        assert_eq!(buf.as_str(), "mov.u32 %r0, %r1");
    }

    #[test]
    fn move_suffix_inserts_prologue() {
        let mut buf = Buffer::new();
        buf.put("header:\nbody\n");
        let start = buf.len();
        buf.put("setup\n");
        buf.move_suffix(start, "header:\n".len());
        assert_eq!(buf.as_str(), "header:\nsetup\nbody\n");
    }
}

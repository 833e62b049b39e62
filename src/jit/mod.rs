//! Native code generation.
//!
//! A compiled function is lowered at most once, on its first call, to a
//! Cranelift function that runs the simple instructions itself and calls
//! back into [`Interp::step`] for the rest. Functions taking more than
//! [`MAX_FIXED_ARGS`] values, and any function whose lowering fails, stay on
//! the interpreter. Every generated function is recorded in a code-range
//! table so backtraces can name native frames.

#[cfg(feature = "cranelift")]
mod helpers;
#[cfg(feature = "cranelift")]
mod lower;
pub mod passes;
mod ranges;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use ranges::{CodeRange, CodeRanges};

use crate::ir::{FuncId, Function, FunctionSlot};
use crate::runtime::{Core, Unwind};
use crate::value::Value;
use crate::vm::{Frame, Interp};

/// Most argument values a native entry point takes. Methods with more use
/// the variadic convention and are always interpreted.
pub const MAX_FIXED_ARGS: u16 = 6;

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("no native target: {0}")]
    Target(String),
    #[error("code generation failed for {function}: {message}")]
    Codegen { function: String, message: String },
    #[error("{function} takes {real} values; native code takes at most {MAX_FIXED_ARGS}")]
    TooManyArgs { function: String, real: u16 },
}

/// Process-wide JIT state: the code-range table and counters.
#[derive(Debug, Default)]
pub struct JitEngine {
    enabled: bool,
    ranges: CodeRanges,
    compiled: AtomicUsize,
    failed: AtomicUsize,
}

impl JitEngine {
    pub fn new(enabled: bool) -> Self {
        JitEngine { enabled: enabled && cfg!(feature = "cranelift"), ..Self::default() }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Native code for a function, generating it on the first request.
    /// Concurrent first calls wait for one compilation.
    pub fn native(&self, slot: &FunctionSlot, fid: FuncId, core: &Core) -> Option<Arc<NativeCode>> {
        if !self.enabled {
            return None;
        }
        slot.native.get_or_init(|| self.compile(fid, &slot.ir, core)).clone()
    }

    /// Function name and line for an address inside generated code.
    pub fn resolve_address(&self, addr: usize) -> Option<(String, u32)> {
        self.ranges.lookup(addr).map(|r| (r.name, r.line))
    }

    pub fn ranges(&self) -> &CodeRanges {
        &self.ranges
    }

    /// (functions compiled, functions that fell back to the interpreter)
    pub fn stats(&self) -> (usize, usize) {
        (self.compiled.load(Ordering::Relaxed), self.failed.load(Ordering::Relaxed))
    }

    fn compile(&self, fid: FuncId, ir: &Function, core: &Core) -> Option<Arc<NativeCode>> {
        match self.generate(fid, ir, core) {
            Ok(code) => {
                self.compiled.fetch_add(1, Ordering::Relaxed);
                Some(Arc::new(code))
            }
            Err(err @ JitError::TooManyArgs { .. }) => {
                tracing::debug!(function = %ir.name, "{err}");
                None
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(function = %ir.name, error = %err, "native code unavailable, interpreting");
                None
            }
        }
    }

    #[cfg(feature = "cranelift")]
    fn generate(&self, fid: FuncId, ir: &Function, core: &Core) -> Result<NativeCode, JitError> {
        if ir.arity.real > MAX_FIXED_ARGS {
            return Err(JitError::TooManyArgs { function: ir.name.clone(), real: ir.arity.real });
        }
        let opt = passes::optimize(ir);
        tracing::trace!(
            function = %ir.name,
            promoted = opt.residency.promoted(),
            "lowering\n{}",
            opt.func
        );
        let lowered = lower::lower(fid, &opt, &core.caches)?;
        let start = lowered.entry as usize;
        self.ranges.insert(CodeRange {
            start,
            end: start + lowered.size.max(1),
            func: fid,
            name: ir.name.clone(),
            line: ir.line,
        });
        Ok(NativeCode {
            _module: lowered.module,
            entry: lowered.entry,
            ir: Arc::new(opt.func),
        })
    }

    #[cfg(not(feature = "cranelift"))]
    fn generate(&self, _: FuncId, ir: &Function, _: &Core) -> Result<NativeCode, JitError> {
        Err(JitError::Target(format!("{}: built without the cranelift feature", ir.name)))
    }
}

// ── Native code ──────────────────────────────────────────────────────

/// A generated function, callable from any thread.
#[cfg(feature = "cranelift")]
pub struct NativeCode {
    _module: cranelift_jit::JITModule,
    entry: *const u8,
    /// The optimized IR native code runs against; the frame switches to it
    /// so interpreted instructions see the same code.
    ir: Arc<Function>,
}

// SAFETY: the code and the module are immutable once finalized, and every
// activation keeps its state in its own context.
#[cfg(feature = "cranelift")]
unsafe impl Send for NativeCode {}
#[cfg(feature = "cranelift")]
unsafe impl Sync for NativeCode {}

#[cfg(feature = "cranelift")]
impl NativeCode {
    pub fn entry_address(&self) -> usize {
        self.entry as usize
    }

    pub fn ir(&self) -> &Arc<Function> {
        &self.ir
    }

    /// Run an entered frame. `args` are its first `real` registers.
    ///
    /// # Safety
    /// `interp` and `frame` must be live and unaliased for the whole call.
    /// Every access during the activation goes through these pointers, and
    /// helpers reborrow them only for the length of one helper call.
    pub unsafe fn invoke(&self, interp: *mut Interp, frame: *mut Frame, args: &[Value]) -> Result<Value, Unwind> {
        // SAFETY: exclusive per the contract above; this borrow ends before
        // generated code runs.
        let recv = unsafe {
            let frame = &mut *frame;
            frame.func = self.ir.clone();
            frame.self_val.bits()
        };
        let sel = self.ir.selector.map_or(Value::NIL, Value::symbol).bits();
        // SAFETY: as above.
        let mut ctx = unsafe { helpers::ExecCtx::new(interp, frame) };
        let status = self.call(&mut ctx, recv, sel, args);
        ctx.finish(status)
    }

    fn call(&self, ctx: &mut helpers::ExecCtx, recv: u64, sel: u64, args: &[Value]) -> u32 {
        type Ctx = *mut helpers::ExecCtx;
        let ctx: Ctx = ctx;
        let a: Vec<u64> = args.iter().map(|v| v.bits()).collect();
        // SAFETY: the entry was generated with exactly this signature for
        // `args.len()` arguments, which the caller guarantees.
        unsafe {
            match a.len() {
                0 => {
                    let f: extern "C" fn(Ctx, u64, u64) -> u32 = std::mem::transmute(self.entry);
                    f(ctx, recv, sel)
                }
                1 => {
                    let f: extern "C" fn(Ctx, u64, u64, u64) -> u32 = std::mem::transmute(self.entry);
                    f(ctx, recv, sel, a[0])
                }
                2 => {
                    let f: extern "C" fn(Ctx, u64, u64, u64, u64) -> u32 = std::mem::transmute(self.entry);
                    f(ctx, recv, sel, a[0], a[1])
                }
                3 => {
                    let f: extern "C" fn(Ctx, u64, u64, u64, u64, u64) -> u32 = std::mem::transmute(self.entry);
                    f(ctx, recv, sel, a[0], a[1], a[2])
                }
                4 => {
                    let f: extern "C" fn(Ctx, u64, u64, u64, u64, u64, u64) -> u32 = std::mem::transmute(self.entry);
                    f(ctx, recv, sel, a[0], a[1], a[2], a[3])
                }
                5 => {
                    let f: extern "C" fn(Ctx, u64, u64, u64, u64, u64, u64, u64) -> u32 =
                        std::mem::transmute(self.entry);
                    f(ctx, recv, sel, a[0], a[1], a[2], a[3], a[4])
                }
                6 => {
                    let f: extern "C" fn(Ctx, u64, u64, u64, u64, u64, u64, u64, u64) -> u32 =
                        std::mem::transmute(self.entry);
                    f(ctx, recv, sel, a[0], a[1], a[2], a[3], a[4], a[5])
                }
                // Never generated; report it as a failed activation.
                _ => u32::MAX,
            }
        }
    }
}

/// Without a code generator there is never native code.
#[cfg(not(feature = "cranelift"))]
pub enum NativeCode {}

#[cfg(not(feature = "cranelift"))]
impl NativeCode {
    pub fn entry_address(&self) -> usize {
        match *self {}
    }

    pub fn ir(&self) -> &Arc<Function> {
        match *self {}
    }

    /// # Safety
    /// Uninhabited; never called.
    pub unsafe fn invoke(&self, _: *mut Interp, _: *mut Frame, _: &[Value]) -> Result<Value, Unwind> {
        match *self {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Program;
    use crate::ast::build::*;
    use crate::config::Config;
    use crate::runtime::Capture;

    fn run(jit: bool, root: crate::ast::Node) -> (Arc<Core>, String) {
        let out = Capture::new();
        let core = Core::with_output(Config { jit, ..Config::default() }, Box::new(out.clone()));
        core.run(&Program::new("j.rb", root)).unwrap();
        let text = out.contents();
        (core, text)
    }

    fn named(core: &Core, name: &str) -> Option<Arc<FunctionSlot>> {
        (0..core.functions.len() as FuncId).filter_map(|id| core.functions.get(id)).find(|s| s.ir.name == name)
    }

    fn fib() -> crate::ast::Node {
        seq(vec![
            def(
                "fib",
                params().req("n"),
                Some(if_(
                    call(lvar("n"), "<", vec![int(2)]),
                    Some(lvar("n")),
                    Some(call(
                        fcall("fib", vec![call(lvar("n"), "-", vec![int(1)])]),
                        "+",
                        vec![fcall("fib", vec![call(lvar("n"), "-", vec![int(2)])])],
                    )),
                )),
            ),
            fcall("puts", vec![fcall("fib", vec![int(20)])]),
        ])
    }

    #[test]
    fn disabled_engine_never_compiles() {
        let (core, out) = run(false, fib());
        assert_eq!(out, "6765\n");
        assert_eq!(core.jit.stats(), (0, 0));
        assert!(core.jit.ranges().is_empty());
    }

    #[cfg(feature = "cranelift")]
    #[test]
    fn recursion_runs_natively_and_is_recorded() {
        let (core, out) = run(true, fib());
        assert_eq!(out, "6765\n");
        let (compiled, failed) = core.jit.stats();
        assert!(compiled >= 2, "top level and fib compile");
        assert_eq!(failed, 0);
        let entry = named(&core, "fib").and_then(|s| s.native.get().cloned().flatten()).map(|c| c.entry_address());
        let range = entry.and_then(|addr| core.jit.ranges().lookup(addr)).map(|r| r.name);
        assert_eq!(range.as_deref(), Some("fib"));
    }

    #[cfg(feature = "cranelift")]
    #[test]
    fn fixnum_overflow_leaves_the_fast_path() {
        let big = 4_611_686_018_427_387_903_i64; // largest fixnum
        let prog = seq(vec![
            def("grow", params().req("n"), Some(call(lvar("n"), "+", vec![int(1)]))),
            fcall("puts", vec![fcall("grow", vec![int(big)])]),
        ]);
        let (_, out) = run(true, prog);
        assert_eq!(out, "4611686018427387904\n");
    }

    #[cfg(feature = "cranelift")]
    #[test]
    fn raise_unwinds_through_nested_native_frames() {
        // `outer` and `dive` both run natively; `dive` re-enters itself
        // and a helper raises from the innermost activation.
        let dive = def(
            "dive",
            params().req("n"),
            Some(if_(
                call(lvar("n"), "==", vec![int(0)]),
                Some(fcall("raise", vec![str_("bottom")])),
                Some(call(fcall("dive", vec![call(lvar("n"), "-", vec![int(1)])]), "+", vec![int(1)])),
            )),
        );
        let outer = def(
            "outer",
            params(),
            Some(begin(
                Some(fcall("dive", vec![int(5)])),
                vec![rescue(vec![], Some("e"), Some(call(lvar("e"), "message", vec![])))],
                None,
                None,
            )),
        );
        let prog = seq(vec![dive, outer, fcall("puts", vec![fcall("outer", vec![])]), fcall("puts", vec![fcall("outer", vec![])])]);
        let (core, out) = run(true, prog);
        assert_eq!(out, "bottom\nbottom\n");
        let native = |name| named(&core, name).is_some_and(|s| s.native.get().cloned().flatten().is_some());
        assert!(native("dive"));
    }

    #[test]
    fn wide_methods_stay_interpreted() {
        let mut p = params();
        for name in ["a", "b", "c", "d", "e", "f", "g"] {
            p = p.req(name);
        }
        let args = (1..=7).map(int).collect();
        let prog = seq(vec![def("seven", p, Some(lvar("g"))), fcall("puts", vec![fcall("seven", args)])]);
        let (core, out) = run(true, prog);
        assert_eq!(out, "7\n");
        let wide = named(&core, "seven").map(|s| s.native.get().cloned().flatten().is_none());
        assert_eq!(wide, Some(true));
    }
}

//! The runtime core: one shared service holding every piece of process-wide
//! state (symbols, heap, classes, caches, compiled functions, native code).
//!
//! Nothing here is a global. The compiler and each per-thread [`Interp`]
//! receive an `Arc<Core>`; all shared tables are behind `parking_lot` locks
//! or atomics, as documented on each table.

pub mod arity;
pub mod block;
pub mod builtins;
pub mod cache;
pub mod class;
pub mod dispatch;
pub mod heap;
pub mod method;
pub mod symbol;
pub mod thread;

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::ast::Program;
use crate::compiler::{self, CompileError};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ir::{FuncId, FunctionStore};
use crate::jit::JitEngine;
use crate::value::Value;
use crate::vm::Interp;
use arity::Arity;
use cache::{CacheStore, InlineOp};
use class::{ClassId, ClassTable};
use heap::{Data, Heap, Object};
use method::{ForeignFn, MethodBody, MethodEntry, MethodFlags};
use symbol::{Symbol, SymbolTable};

pub type FrameId = u64;

/// Lexical class nesting, innermost first. Always ends with `Object`.
pub type Cref = Arc<Vec<ClassId>>;

/// Non-local control transfer, carried by `Err` through interpreter frames,
/// native helpers and the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Unwind {
    /// A Ruby exception. The object is also on the thread's in-flight stack.
    Raise(Value),
    /// `break` from a block; `tag` is the frame that created the block.
    Break { tag: FrameId, value: Value },
    /// `return` from a block; `tag` is the block's home method frame.
    Return { tag: FrameId, value: Value },
    /// Cooperative thread cancellation. Runs ensure clauses, skips rescue.
    Kill,
}

/// Ids of the classes the runtime itself refers to.
#[derive(Debug, Clone, Copy)]
pub struct ClassIds {
    pub basic_object: ClassId,
    pub object: ClassId,
    pub module: ClassId,
    pub class: ClassId,
    pub kernel: ClassId,
    pub comparable: ClassId,
    pub nil: ClassId,
    pub true_: ClassId,
    pub false_: ClassId,
    pub integer: ClassId,
    pub float: ClassId,
    pub string: ClassId,
    pub symbol: ClassId,
    pub array: ClassId,
    pub proc_: ClassId,
    pub exception: ClassId,
    pub standard_error: ClassId,
    pub runtime_error: ClassId,
    pub argument_error: ClassId,
    pub name_error: ClassId,
    pub no_method_error: ClassId,
    pub local_jump_error: ClassId,
    pub zero_division_error: ClassId,
    pub type_error: ClassId,
    pub index_error: ClassId,
    pub thread_error: ClassId,
    pub stop_iteration: ClassId,
    pub system_stack_error: ClassId,
    pub thread: ClassId,
    pub mutex: ClassId,
}

/// Symbols used by the runtime itself.
#[derive(Debug, Clone, Copy)]
pub struct Syms {
    pub method_missing: Symbol,
    pub initialize: Symbol,
    pub to_s: Symbol,
    pub inspect: Symbol,
    pub call: Symbol,
    pub eq: Symbol,
    pub eqq: Symbol,
    pub message: Symbol,
    pub backtrace: Symbol,
    pub name: Symbol,
    pub each: Symbol,
}

impl ClassIds {
    fn bootstrap(t: &ClassTable) -> Self {
        let basic_object = t.define(Some("BasicObject"), None, false);
        let object = t.define(Some("Object"), Some(basic_object), false);
        let module = t.define(Some("Module"), Some(object), false);
        let class = t.define(Some("Class"), Some(module), false);
        let kernel = t.define(Some("Kernel"), None, true);
        let comparable = t.define(Some("Comparable"), None, true);
        t.include(object, kernel);
        let sub = |name: &str, sup: ClassId| t.define(Some(name), Some(sup), false);
        let exception = sub("Exception", object);
        let standard_error = sub("StandardError", exception);
        let name_error = sub("NameError", standard_error);
        let integer = sub("Integer", object);
        let float = sub("Float", object);
        let string = sub("String", object);
        t.include(integer, comparable);
        t.include(float, comparable);
        t.include(string, comparable);
        let index_error = sub("IndexError", standard_error);
        ClassIds {
            basic_object,
            object,
            module,
            class,
            kernel,
            comparable,
            nil: sub("NilClass", object),
            true_: sub("TrueClass", object),
            false_: sub("FalseClass", object),
            integer,
            float,
            string,
            symbol: sub("Symbol", object),
            array: sub("Array", object),
            proc_: sub("Proc", object),
            exception,
            standard_error,
            runtime_error: sub("RuntimeError", standard_error),
            argument_error: sub("ArgumentError", standard_error),
            name_error,
            no_method_error: sub("NoMethodError", name_error),
            local_jump_error: sub("LocalJumpError", standard_error),
            zero_division_error: sub("ZeroDivisionError", standard_error),
            type_error: sub("TypeError", standard_error),
            index_error,
            thread_error: sub("ThreadError", standard_error),
            stop_iteration: sub("StopIteration", index_error),
            system_stack_error: sub("SystemStackError", exception),
            thread: sub("Thread", object),
            mutex: sub("Mutex", object),
        }
    }
}

/// In-memory sink for program output.
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct Core {
    pub config: Config,
    pub symbols: SymbolTable,
    pub heap: Heap,
    pub classes: ClassTable,
    pub caches: CacheStore,
    pub functions: FunctionStore,
    pub jit: JitEngine,
    pub globals: RwLock<HashMap<Symbol, Value>>,
    pub c: ClassIds,
    pub s: Syms,
    /// The top-level `self`.
    pub main: Value,
    output: Mutex<Box<dyn Write + Send>>,
    booted: AtomicBool,
    next_frame: AtomicU64,
    next_thread: AtomicU64,
    next_program: AtomicU32,
}

impl Core {
    pub fn new(config: Config) -> Arc<Core> {
        Self::with_output(config, Box::new(std::io::stdout()))
    }

    pub fn with_output(config: Config, output: Box<dyn Write + Send>) -> Arc<Core> {
        let symbols = SymbolTable::new();
        let classes = ClassTable::new();
        let c = ClassIds::bootstrap(&classes);
        let s = Syms {
            method_missing: symbols.intern("method_missing"),
            initialize: symbols.intern("initialize"),
            to_s: symbols.intern("to_s"),
            inspect: symbols.intern("inspect"),
            call: symbols.intern("call"),
            eq: symbols.intern("=="),
            eqq: symbols.intern("==="),
            message: symbols.intern("@message"),
            backtrace: symbols.intern("@__backtrace"),
            name: symbols.intern("@name"),
            each: symbols.intern("each"),
        };
        let heap = Heap::new();
        let main = heap.alloc(Object::new(c.object, Data::Plain));
        let jit = JitEngine::new(config.jit);
        let core = Arc::new(Core {
            config,
            symbols,
            heap,
            classes,
            caches: CacheStore::new(),
            functions: FunctionStore::new(),
            jit,
            globals: RwLock::new(HashMap::new()),
            c,
            s,
            main,
            output: Mutex::new(output),
            booted: AtomicBool::new(false),
            next_frame: AtomicU64::new(1),
            next_thread: AtomicU64::new(1),
            next_program: AtomicU32::new(0),
        });
        for id in core.all_builtin_classes() {
            let name = core.classes.name(id);
            let sym = core.symbols.intern(&name);
            core.classes.get(core.c.object).constants.write().insert(sym, Value::class(id));
        }
        builtins::install(&core);
        core.booted.store(true, Ordering::Release);
        core
    }

    fn all_builtin_classes(&self) -> Vec<ClassId> {
        (0..self.classes.len() as u32).map(ClassId).collect()
    }

    // ── compilation and execution ──────────────────────────────────

    pub fn next_program_id(&self) -> u32 {
        self.next_program.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_frame_id(&self) -> FrameId {
        self.next_frame.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_thread_id(&self) -> u64 {
        self.next_thread.fetch_add(1, Ordering::Relaxed)
    }

    /// Compile a program's top level (and every scope nested in it) to IR.
    pub fn load(&self, program: &Program) -> std::result::Result<FuncId, CompileError> {
        compiler::compile_program(self, program)
    }

    /// Compile and run a program on a fresh interpreter thread, which becomes
    /// the main Ruby thread.
    pub fn run(self: &Arc<Self>, program: &Program) -> Result<Value> {
        let top = self.load(program)?;
        let core = self.clone();
        let handle = std::thread::Builder::new()
            .name("garnet-main".into())
            .stack_size(self.config.stack_size)
            .spawn(move || {
                let mut interp = Interp::main(core);
                let result = interp.run_top(top);
                result.map_err(|unwind| interp.uncaught(unwind))
            })
            .map_err(|e| Error::io("<thread>", e))?;
        handle.join().map_err(|_| Error::ThreadPanicked)?
    }

    /// Reverse lookup of a native code address.
    pub fn resolve_address(&self, pc: usize) -> Option<(String, u32)> {
        self.jit.resolve_address(pc)
    }

    // ── output ──────────────────────────────────────────────────────

    pub fn write_output(&self, text: &str) -> std::io::Result<()> {
        let mut out = self.output.lock();
        out.write_all(text.as_bytes())?;
        out.flush()
    }

    pub fn set_output(&self, output: Box<dyn Write + Send>) {
        *self.output.lock() = output;
    }

    // ── classes and methods ────────────────────────────────────────

    pub fn class_of(&self, v: Value) -> ClassId {
        if v.is_fixnum() {
            return self.c.integer;
        }
        match v {
            Value::NIL | Value::UNDEF => return self.c.nil,
            Value::TRUE => return self.c.true_,
            Value::FALSE => return self.c.false_,
            _ => {}
        }
        if v.as_symbol().is_some() {
            return self.c.symbol;
        }
        if let Some(id) = v.as_class() {
            return self.metaclass(id);
        }
        self.heap.get(v).map(|o| o.class).unwrap_or(self.c.object)
    }

    /// The class a user would see: metaclasses resolve to `Class`/`Module`.
    pub fn visible_class(&self, v: Value) -> ClassId {
        if let Some(id) = v.as_class() {
            return if self.classes.get(id).is_module { self.c.module } else { self.c.class };
        }
        self.class_of(v)
    }

    pub fn metaclass(&self, id: ClassId) -> ClassId {
        self.classes.metaclass(id, self.c.class, self.c.module)
    }

    pub fn class_name(&self, id: ClassId) -> String {
        self.classes.name(id)
    }

    pub fn is_a(&self, v: Value, class: ClassId) -> bool {
        self.classes.is_subclass(self.class_of(v), class)
    }

    pub fn lookup_method(&self, class: ClassId, selector: Symbol) -> Option<Arc<MethodEntry>> {
        self.classes.lookup(class, selector)
    }

    /// Install a method, replacing any previous definition in `class`.
    ///
    /// Invalidates every call-site cache (generation bump) and, when the
    /// selector has an inlined fast path that could observe `class`, sets the
    /// redefinition flag so compiled fast paths fall back to dispatch.
    pub fn define_method(
        &self,
        class: ClassId,
        selector: Symbol,
        body: MethodBody,
        arity: Arity,
        flags: MethodFlags,
        cref: Cref,
    ) -> Arc<MethodEntry> {
        let entry = MethodEntry::new(class, selector, arity, body, flags, cref);
        self.classes.get(class).methods.write().insert(selector, entry.clone());
        self.caches.invalidate_methods();
        if self.booted.load(Ordering::Acquire) {
            let name = self.symbols.name(selector);
            if let Some(op) = InlineOp::from_selector(&name)
                && self.fast_path_observes(op, class)
            {
                debug!(target: "garnet::cache", selector = %name, class = %self.class_name(class), "inline fast path disabled");
                self.caches.mark_redefined(op);
            }
            debug!(target: "garnet::runtime", selector = %name, class = %self.class_name(class), kind = ?entry.kind(), "method defined");
        }
        entry
    }

    pub fn define_foreign(&self, class: ClassId, name: &str, min: u16, max: i32, f: ForeignFn) -> Arc<MethodEntry> {
        let selector = self.symbols.intern(name);
        self.define_method(
            class,
            selector,
            MethodBody::Foreign(f),
            Arity::range(min, max),
            MethodFlags { empty_body: false, variadic: true },
            Arc::new(vec![self.c.object]),
        )
    }

    /// Could a fast path for `op` observe a method defined in `class`?
    fn fast_path_observes(&self, op: InlineOp, class: ClassId) -> bool {
        let receivers = match op {
            InlineOp::Send => return true,
            InlineOp::Shl | InlineOp::Aref | InlineOp::Aset => [self.c.array, self.c.array],
            _ => [self.c.integer, self.c.float],
        };
        receivers.iter().any(|&r| self.classes.is_subclass(r, class))
    }

    pub fn include_module(&self, target: ClassId, module: ClassId) {
        if !self.classes.include(target, module) {
            return;
        }
        self.caches.invalidate_methods();
        for op in InlineOp::ALL {
            let selector = self.symbols.intern(op.selector());
            if self.classes.lookup(module, selector).is_some() && self.fast_path_observes(op, target) {
                self.caches.mark_redefined(op);
            }
        }
        debug!(target: "garnet::runtime", module = %self.class_name(module), into = %self.class_name(target), "module included");
    }

    /// Create a class or module named `name` inside `container`.
    pub fn define_class(&self, container: ClassId, name: Symbol, superclass: Option<ClassId>, is_module: bool) -> ClassId {
        let short = self.symbols.name(name);
        let full = if container == self.c.object {
            short.to_string()
        } else {
            format!("{}::{}", self.class_name(container), short)
        };
        let superclass = if is_module { None } else { Some(superclass.unwrap_or(self.c.object)) };
        let id = self.classes.define(Some(&full), superclass, is_module);
        self.set_constant(container, name, Value::class(id));
        id
    }

    // ── constants ───────────────────────────────────────────────────

    pub fn set_constant(&self, owner: ClassId, name: Symbol, value: Value) {
        if let Some(id) = value.as_class() {
            let short = self.symbols.name(name);
            let full = if owner == self.c.object {
                short.to_string()
            } else {
                format!("{}::{}", self.class_name(owner), short)
            };
            self.classes.set_name_if_anonymous(id, full);
        }
        self.classes.get(owner).constants.write().insert(name, value);
        self.caches.invalidate_constants();
    }

    /// Constant in `class` or its ancestors.
    pub fn constant_in(&self, class: ClassId, name: Symbol) -> Option<Value> {
        self.classes.ancestors(class).into_iter().find_map(|c| self.classes.get(c).constant(name))
    }

    /// Lexical scopes first, then the ancestors of the innermost one, then
    /// `Object`.
    pub fn lookup_constant(&self, cref: &[ClassId], name: Symbol) -> Option<Value> {
        for &scope in cref {
            if scope == self.c.object {
                continue;
            }
            if let Some(v) = self.classes.get(scope).constant(name) {
                return Some(v);
            }
        }
        let innermost = cref.first().copied().unwrap_or(self.c.object);
        self.constant_in(innermost, name).or_else(|| self.constant_in(self.c.object, name))
    }

    // ── objects ─────────────────────────────────────────────────────

    pub fn new_object(&self, class: ClassId) -> Value {
        self.heap.alloc(Object::new(class, Data::Plain))
    }

    pub fn new_string(&self, s: impl Into<String>) -> Value {
        self.heap.alloc(Object::new(self.c.string, Data::Str(Mutex::new(s.into()))))
    }

    pub fn new_array(&self, elements: Vec<Value>) -> Value {
        self.heap.alloc(Object::new(self.c.array, Data::Array(Mutex::new(elements))))
    }

    pub fn new_float(&self, f: f64) -> Value {
        self.heap.alloc(Object::new(self.c.float, Data::Float(f)))
    }

    /// Fixnum when it fits, boxed otherwise.
    pub fn int_value(&self, n: i128) -> Value {
        match i64::try_from(n).ok().and_then(Value::fixnum) {
            Some(v) => v,
            None => self.heap.alloc(Object::new(self.c.integer, Data::BigInt(n))),
        }
    }

    pub fn int_of(&self, v: Value) -> Option<i128> {
        v.as_fixnum().map(i128::from).or_else(|| self.heap.bigint(v))
    }

    pub fn symbol_value(&self, name: &str) -> Value {
        Value::symbol(self.symbols.intern(name))
    }

    pub fn ivar_get(&self, obj: Value, name: Symbol) -> Value {
        if let Some(id) = obj.as_class() {
            return self.classes.get(id).ivars.read().get(&name).copied().unwrap_or(Value::NIL);
        }
        self.heap.get(obj).and_then(|o| o.ivar(name)).unwrap_or(Value::NIL)
    }

    /// False for immediates, which cannot hold instance variables.
    pub fn ivar_set(&self, obj: Value, name: Symbol, value: Value) -> bool {
        if let Some(id) = obj.as_class() {
            self.classes.get(id).ivars.write().insert(name, value);
            return true;
        }
        match self.heap.get(obj) {
            Some(o) => {
                o.set_ivar(name, value);
                true
            }
            None => false,
        }
    }

    /// Exception object of `class` with `@message` set.
    pub fn make_exception(&self, class: ClassId, message: &str) -> Value {
        let exc = self.new_object(class);
        let msg = self.new_string(message);
        self.ivar_set(exc, self.s.message, msg);
        exc
    }

    pub fn global(&self, name: Symbol) -> Value {
        self.globals.read().get(&name).copied().unwrap_or(Value::NIL)
    }

    pub fn set_global(&self, name: Symbol, value: Value) {
        self.globals.write().insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> Arc<Core> {
        Core::with_output(Config { jit: false, ..Config::default() }, Box::new(Capture::new()))
    }

    #[test]
    fn immediates_have_builtin_classes() {
        let core = core();
        assert_eq!(core.class_of(Value::int(3)), core.c.integer);
        assert_eq!(core.class_of(Value::NIL), core.c.nil);
        assert_eq!(core.class_of(core.symbol_value("a")), core.c.symbol);
        assert_eq!(core.visible_class(Value::class(core.c.string)), core.c.class);
    }

    #[test]
    fn builtin_classes_are_constants_on_object() {
        let core = core();
        let sym = core.symbols.intern("StandardError");
        assert_eq!(core.lookup_constant(&[core.c.object], sym), Some(Value::class(core.c.standard_error)));
    }

    #[test]
    fn int_value_boxes_outside_fixnum_range() {
        let core = core();
        let big = (Value::FIXNUM_MAX as i128) + 1;
        let v = core.int_value(big);
        assert!(!v.is_fixnum());
        assert_eq!(core.int_of(v), Some(big));
        assert_eq!(core.int_value(5), Value::int(5));
    }

    #[test]
    fn redefining_integer_plus_sets_flag_but_booting_does_not() {
        let core = core();
        assert!(!core.caches.is_redefined(InlineOp::Plus));
        let generation = core.caches.method_generation();
        core.define_foreign(core.c.integer, "+", 1, 1, |_, _, _, _| Ok(Value::int(42)));
        assert!(core.caches.is_redefined(InlineOp::Plus));
        assert!(core.caches.method_generation() > generation);
    }

    #[test]
    fn unrelated_class_leaves_flag_clear() {
        let core = core();
        let sym = core.symbols.intern("Point");
        let point = core.define_class(core.c.object, sym, None, false);
        core.define_foreign(point, "+", 1, 1, |_, _, _, _| Ok(Value::NIL));
        assert!(!core.caches.is_redefined(InlineOp::Plus));
    }

    #[test]
    fn including_module_with_operator_into_array_sets_flag() {
        let core = core();
        let m = core.define_class(core.c.object, core.symbols.intern("M"), None, true);
        core.define_foreign(m, "[]", 1, 1, |_, _, _, _| Ok(Value::NIL));
        assert!(!core.caches.is_redefined(InlineOp::Aref));
        core.include_module(core.c.array, m);
        assert!(core.caches.is_redefined(InlineOp::Aref));
    }

    #[test]
    fn nested_class_names_are_qualified() {
        let core = core();
        let outer = core.define_class(core.c.object, core.symbols.intern("Outer"), None, true);
        let inner = core.define_class(outer, core.symbols.intern("Inner"), None, false);
        assert_eq!(core.class_name(inner), "Outer::Inner");
        let cref = vec![outer, core.c.object];
        assert_eq!(core.lookup_constant(&cref, core.symbols.intern("Inner")), Some(Value::class(inner)));
    }
}

//! garnet: a Ruby method compiler and dispatch core.
//!
//! A program arrives as a serialized AST (the parser lives elsewhere). The
//! compiler lowers every scope to a register IR, the JIT turns hot IR into
//! native code through Cranelift, and the runtime dispatcher resolves, caches
//! and invokes methods at every call site.

pub mod ast;
pub mod compiler;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod ir;
pub mod jit;
pub mod runtime;
pub mod value;
pub mod vm;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::Core;
pub use value::Value;

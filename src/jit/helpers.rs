//! Runtime entry points called from generated code.
//!
//! Generated code and these helpers share one [`ExecCtx`] per activation.
//! Every helper answers with a status word:
//!
//! ```text
//! NEXT    continue with the following instruction
//! PAD     an exception is being handled: jump to handler `ctx.target`
//! RETURN  the activation finished with `ctx.ret`
//! ERROR   the unwind in the context escapes this activation
//! ```

use std::mem::offset_of;
use std::ptr;

use crate::ir::Op;
use crate::runtime::Unwind;
use crate::value::Value;
use crate::vm::{Flow, Frame, Interp, SelfCall, handler_index};

pub const NEXT: u32 = 0;
pub const PAD: u32 = 1;
pub const RETURN: u32 = 2;
pub const ERROR: u32 = 3;

/// State of one native activation. Generated code reads the leading fields
/// by offset.
#[repr(C)]
pub struct ExecCtx {
    pub regs: *mut Value,
    pub interp: *mut Interp,
    pub frame: *mut Frame,
    pub ret: u64,
    pub target: u32,
    pub status: u32,
    error: Option<Unwind>,
}

pub const REGS_OFFSET: i32 = offset_of!(ExecCtx, regs) as i32;
pub const RET_OFFSET: i32 = offset_of!(ExecCtx, ret) as i32;
pub const TARGET_OFFSET: i32 = offset_of!(ExecCtx, target) as i32;
pub const STATUS_OFFSET: i32 = offset_of!(ExecCtx, status) as i32;

impl ExecCtx {
    /// # Safety
    /// Both pointers must be live, and no reference to either may be used
    /// while the context is. The frame must not be resized meanwhile.
    pub unsafe fn new(interp: *mut Interp, frame: *mut Frame) -> Self {
        // SAFETY: per the contract above.
        let regs = unsafe { (*frame).regs.as_mut_ptr() };
        ExecCtx { regs, interp, frame, ret: Value::NIL.bits(), target: 0, status: NEXT, error: None }
    }

    /// # Safety
    /// Only from a helper running on this context's activation. Whoever built
    /// the context holds no reference of its own while generated code runs,
    /// so the returned borrows are the only ones until the helper returns.
    /// They must not outlive that helper call.
    unsafe fn parts<'a>(&self) -> (&'a mut Interp, &'a mut Frame) {
        unsafe { (&mut *self.interp, &mut *self.frame) }
    }

    /// Route an unwind raised at `pc` to a handler of this activation or out
    /// of it.
    fn unwind(&mut self, frame: &mut Frame, pc: u32, unwind: Unwind) -> u32 {
        match handler_index(&frame.func, pc as usize, &unwind) {
            Some(i) => {
                frame.unwinding = Some(unwind);
                self.target = i as u32;
                PAD
            }
            None => {
                self.error = Some(unwind);
                ERROR
            }
        }
    }

    /// Turn the final status of an activation into its result.
    pub fn finish(mut self, status: u32) -> Result<Value, Unwind> {
        match (status, self.error.take()) {
            (RETURN, _) => Ok(Value(self.ret)),
            (ERROR, Some(unwind)) => Err(unwind),
            (status, _) => {
                // SAFETY: the activation has returned; nothing else holds the interpreter.
                let interp = unsafe { &mut *self.interp };
                let class = interp.core.c.runtime_error;
                Err(interp.raise(class, &format!("native code stopped with status {status}")))
            }
        }
    }
}

/// A direct self call in flight: the callee's context and frame.
#[repr(C)]
pub struct NativeActivation {
    ctx: ExecCtx,
    frame: Box<Frame>,
}

fn mark(interp: &mut Interp, pc: u32) {
    if let Some(info) = interp.thread.frames.last_mut() {
        info.pc = pc as usize;
    }
}

/// Run instruction `pc` on the interpreter.
pub extern "C" fn garnet_rt_step(ctx: *mut ExecCtx, pc: u32) -> u32 {
    // SAFETY: generated code passes its own live context.
    let ctx = unsafe { &mut *ctx };
    let (interp, frame) = unsafe { ctx.parts() };
    match interp.step(frame, pc as usize) {
        Ok(Flow::Next | Flow::Jump(_)) => NEXT,
        Ok(Flow::Return(v)) => {
            ctx.ret = v.bits();
            RETURN
        }
        Err(unwind) => ctx.unwind(frame, pc, unwind),
    }
}

/// Kill check on a loop back edge.
pub extern "C" fn garnet_rt_poll(ctx: *mut ExecCtx, pc: u32) -> u32 {
    // SAFETY: as for `garnet_rt_step`.
    let ctx = unsafe { &mut *ctx };
    let (interp, frame) = unsafe { ctx.parts() };
    match interp.check_kill() {
        Ok(()) => NEXT,
        Err(unwind) => ctx.unwind(frame, pc, unwind),
    }
}

/// Slow path of the inlined operator at `pc`; the result goes to `ctx.ret`.
pub extern "C" fn garnet_rt_binop(ctx: *mut ExecCtx, pc: u32, lhs: u64, rhs: u64) -> u32 {
    // SAFETY: as for `garnet_rt_step`.
    let ctx = unsafe { &mut *ctx };
    let (interp, frame) = unsafe { ctx.parts() };
    mark(interp, pc);
    let result = match frame.func.code.get(pc as usize) {
        Some(&Op::Binop { op, site, .. }) => interp.binop(op, Value(lhs), Value(rhs), site),
        _ => Err(interp.raise(interp.core.c.runtime_error, "operator helper called off an operator")),
    };
    match result {
        Ok(v) => {
            ctx.ret = v.bits();
            NEXT
        }
        Err(unwind) => ctx.unwind(frame, pc, unwind),
    }
}

/// Enter the callee of the self call at `pc`. Returns the callee's
/// activation for generated code to run, or null when the call already
/// finished (guard failed, or it raised) with the status in `ctx.status`.
pub extern "C" fn garnet_rt_enter_self(ctx: *mut ExecCtx, pc: u32) -> *mut NativeActivation {
    // SAFETY: as for `garnet_rt_step`.
    let ctx = unsafe { &mut *ctx };
    let (interp, frame) = unsafe { ctx.parts() };
    mark(interp, pc);
    let prepared = match frame.func.code.get(pc as usize) {
        Some(&Op::SelfCall { dst, args, argc, site }) => interp.prepare_self_call(frame, args, argc, site).map(|s| (dst, s)),
        _ => Err(interp.raise(interp.core.c.runtime_error, "self call helper called off a self call")),
    };
    match prepared {
        Ok((_, SelfCall::Direct(mut child))) => {
            child.func = frame.func.clone();
            let caller_entry = interp.thread.frames.iter().rev().nth(1).and_then(|f| f.native_entry);
            if let Some(info) = interp.thread.frames.last_mut() {
                info.native_entry = caller_entry;
            }
            let frame_ptr: *mut Frame = &mut *child;
            // SAFETY: the child is boxed so `frame_ptr` stays put, and it is
            // reached only through the activation until `garnet_rt_leave_self`.
            // The interpreter pointer is the caller's own, not this reborrow.
            let act = Box::new(NativeActivation { ctx: unsafe { ExecCtx::new(ctx.interp, frame_ptr) }, frame: child });
            ctx.status = NEXT;
            Box::into_raw(act)
        }
        Ok((dst, SelfCall::Done(v))) => {
            frame.set(dst, v);
            ctx.status = NEXT;
            ptr::null_mut()
        }
        Err(unwind) => {
            ctx.status = ctx.unwind(frame, pc, unwind);
            ptr::null_mut()
        }
    }
}

/// Leave a callee entered by [`garnet_rt_enter_self`] that finished with
/// `status`, storing its result.
pub extern "C" fn garnet_rt_leave_self(ctx: *mut ExecCtx, pc: u32, act: *mut NativeActivation, status: u32) -> u32 {
    // SAFETY: `act` came from `garnet_rt_enter_self` and is released once.
    let act = unsafe { Box::from_raw(act) };
    let NativeActivation { ctx: callee, frame: child } = *act;
    let result = callee.finish(status);
    // SAFETY: as for `garnet_rt_step`.
    let ctx = unsafe { &mut *ctx };
    let (interp, frame) = unsafe { ctx.parts() };
    match (interp.leave_frame(*child, result), frame.func.code.get(pc as usize)) {
        (Ok(v), Some(&Op::SelfCall { dst, .. })) => {
            frame.set(dst, v);
            NEXT
        }
        (Ok(_), _) => NEXT,
        (Err(unwind), _) => ctx.unwind(frame, pc, unwind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_fields_sit_where_generated_code_reads_them() {
        let word = std::mem::size_of::<usize>() as i32;
        assert_eq!(REGS_OFFSET, 0);
        assert_eq!(RET_OFFSET, 3 * word);
        assert_eq!(TARGET_OFFSET, 3 * word + 8);
        assert_eq!(STATUS_OFFSET, TARGET_OFFSET + 4);
        assert_eq!(offset_of!(NativeActivation, ctx), 0);
    }
}

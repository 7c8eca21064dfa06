// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Trap and exception plumbing.
//!
//! Every entry into compiled code pushes a frame onto a per-thread stack of
//! [`CallThreadState`]s, saving a register context to resume from. Traps
//! reach the nearest frame one of two ways: hardware faults land in the
//! process-wide signal handler, which classifies the fault (memory
//! reservation hit, stack exhaustion, or a recorded trap site) and restores
//! the saved context; runtime builtins raise typed exceptions directly with
//! [`raise_trap`]. Either way the entry returns the boxed [`Exception`] and
//! Rust code above it propagates with plain `Result`s - there is never an
//! unwind through compiled frames.

use core::cell::{Cell, UnsafeCell};
use core::ffi::c_void;
use core::mem::MaybeUninit;
use core::ptr;
use std::sync::Once;

use cfg_if::cfg_if;

use crate::compartment::{Compartment, Object};
use crate::exception::{CallStack, Exception, ExceptionKind};
use crate::trap::TrapKind;
use crate::values::UntaggedValue;
use crate::vm::code;
use crate::vm::memory::{lookup_reservation, ReservationHit};
use crate::arch;

const MAX_BACKTRACE_FRAMES: usize = 32;

/// Data recorded at the instant of a trap, written either by the signal
/// handler (no allocation) or by a raising builtin.
enum UnwindReason {
    Trap {
        kind: TrapKind,
        memory_hit: Option<ReservationHit>,
        frames: [usize; MAX_BACKTRACE_FRAMES],
        num_frames: usize,
    },
    Exception(Box<Exception>),
}

/// One active entry into compiled code on this thread.
pub(crate) struct CallThreadState {
    jmp_buf: UnsafeCell<arch::JmpBuf>,
    unwind: UnsafeCell<Option<UnwindReason>>,
    prev: *const CallThreadState,
    /// Host stack pointer at entry; the upper bound for frame-pointer
    /// walks.
    entry_sp: usize,
}

thread_local! {
    static TLS_TOP: Cell<*const CallThreadState> = const { Cell::new(ptr::null()) };
}

struct Payload<'a, F> {
    f: Option<F>,
    hit_error: &'a mut bool,
}

unsafe extern "C" fn invoke_closure<F: FnOnce()>(payload: *mut u8) {
    // Safety: payload is the Payload the caller passed to
    // save_context_and_call on this stack.
    let payload = unsafe { &mut *(payload as *mut Payload<'_, F>) };
    (payload.f.take().unwrap())();
    *payload.hit_error = false;
}

/// Runs `f` with a trap frame installed, converting any trap raised while
/// it runs (from this or deeper frames) into an [`Exception`].
pub(crate) fn catch_traps_raw<F: FnOnce()>(f: F) -> Result<(), Box<Exception>> {
    lazy_per_thread_init();

    let state = CallThreadState {
        jmp_buf: UnsafeCell::new(arch::JmpBuf::new()),
        unwind: UnsafeCell::new(None),
        prev: TLS_TOP.with(|tls| tls.get()),
        entry_sp: arch::stack_pointer(),
    };
    TLS_TOP.with(|tls| tls.set(&state));

    let mut hit_error = true;
    let mut payload = Payload {
        f: Some(f),
        hit_error: &mut hit_error,
    };

    // Safety: the jmp_buf lives on this stack frame and is only restored
    // while this frame is active (the TLS pop below happens on both paths).
    let rc = unsafe {
        arch::save_context_and_call(
            state.jmp_buf.get(),
            invoke_closure::<F>,
            &mut payload as *mut Payload<'_, F> as *mut u8,
        )
    };

    TLS_TOP.with(|tls| tls.set(state.prev));

    if rc == 0 {
        debug_assert!(!hit_error);
        Ok(())
    } else {
        // Safety: the raising side stored the reason before restoring.
        let reason = unsafe { (*state.unwind.get()).take() }.expect("trap without a cause");
        Err(exception_from_unwind(reason))
    }
}

/// Like [`catch_traps_raw`], for an invocation in `compartment`.
pub(crate) fn catch_traps<F: FnOnce()>(
    _compartment: &Compartment,
    _function: Object,
    f: F,
) -> Result<(), Box<Exception>> {
    catch_traps_raw(f)
}

fn exception_from_unwind(reason: UnwindReason) -> Box<Exception> {
    match reason {
        UnwindReason::Exception(exception) => exception,
        UnwindReason::Trap {
            kind,
            memory_hit,
            frames,
            num_frames,
        } => {
            let call_stack = CallStack::from_frames(&frames[..num_frames]);
            let (kind, arguments): (ExceptionKind, Vec<UntaggedValue>) = match kind {
                TrapKind::MemoryOutOfBounds => match memory_hit {
                    Some(hit) => (
                        ExceptionKind::OutOfBoundsMemoryAccess,
                        vec![
                            UntaggedValue::from_object(hit.memory),
                            UntaggedValue::from_i64(hit.offset as i64),
                        ],
                    ),
                    None => (
                        ExceptionKind::OutOfBoundsMemoryAccess,
                        vec![UntaggedValue::ZERO, UntaggedValue::ZERO],
                    ),
                },
                TrapKind::StackOverflow => (ExceptionKind::StackOverflow, vec![]),
                TrapKind::IntegerOverflow | TrapKind::IntegerDivisionByZero => {
                    (ExceptionKind::IntegerDivideByZeroOrOverflow, vec![])
                }
                TrapKind::BadConversionToInteger => {
                    (ExceptionKind::InvalidFloatOperation, vec![])
                }
                TrapKind::UnreachableCodeReached => (ExceptionKind::ReachedUnreachable, vec![]),
            };
            Box::new(Exception::intrinsic(kind, &arguments).with_call_stack(call_stack))
        }
    }
}

/// Raises `exception` out of the current invocation.
///
/// Must only be called on a thread that is inside [`catch_traps`]; builtins
/// satisfy this by construction. Captures the call stack at the raise
/// point.
pub(crate) fn raise_trap(exception: Exception) -> ! {
    let state = TLS_TOP.with(|tls| tls.get());
    assert!(
        !state.is_null(),
        "attempted to raise a runtime exception with no invocation in progress"
    );

    // Safety: non-null means the frame is live on this thread's stack.
    let state = unsafe { &*state };

    let mut frames = [0usize; MAX_BACKTRACE_FRAMES];
    let num_frames = capture_backtrace(
        arch::frame_pointer(),
        0,
        arch::stack_pointer(),
        state.entry_sp,
        &mut frames,
    );
    let exception =
        exception.with_call_stack(CallStack::from_frames(&frames[..num_frames]));

    // Safety: writing the reason then restoring the saved context; the
    // catch side takes the reason before anything else runs.
    unsafe {
        *state.unwind.get() = Some(UnwindReason::Exception(Box::new(exception)));
        arch::restore_context(state.jmp_buf.get(), 1)
    }
}

/// Throws a runtime exception from host code running under an invocation
/// (e.g. host glue invoked by a builtin).
///
/// # Panics
///
/// Panics if no invocation is in progress on this thread; throwing outside
/// compiled code is a caller contract violation.
pub fn throw_exception(exception: Box<Exception>) -> ! {
    raise_trap(*exception)
}

/// Runs `thunk`; if it completes, passes its value through, and if it
/// raises a runtime exception, hands the exception (and its ownership) to
/// `catch_thunk`.
pub fn catch_runtime_exceptions<T>(
    thunk: impl FnOnce() -> Result<T, Box<Exception>>,
    catch_thunk: impl FnOnce(Box<Exception>),
) -> Option<T> {
    match thunk() {
        Ok(value) => Some(value),
        Err(exception) => {
            catch_thunk(exception);
            None
        }
    }
}

/// Runs `thunk` converting any signal raised inside it into an exception,
/// without interpreting other failures: the caller's `catch` layer (or the
/// `?` operator) sees the result.
pub fn unwind_signals_as_exceptions<T>(thunk: impl FnOnce() -> T) -> Result<T, Box<Exception>> {
    let mut result: MaybeUninit<T> = MaybeUninit::uninit();
    let slot = &mut result;
    catch_traps_raw(move || {
        slot.write(thunk());
    })?;
    // Safety: catch_traps_raw returned Ok, so the closure completed and
    // wrote the value.
    Ok(unsafe { result.assume_init() })
}

/// Walks a frame-pointer chain, validating every step; stops at the entry
/// stack pointer or on anything implausible.
fn capture_backtrace(
    mut fp: usize,
    first_pc: usize,
    stack_lower_bound: usize,
    entry_sp: usize,
    frames: &mut [usize; MAX_BACKTRACE_FRAMES],
) -> usize {
    let mut count = 0;

    if first_pc != 0 {
        frames[count] = first_pc;
        count += 1;
    }

    let mut lower = stack_lower_bound;
    while count < MAX_BACKTRACE_FRAMES {
        if fp == 0 || fp <= lower || fp >= entry_sp || fp % core::mem::size_of::<usize>() != 0 {
            break;
        }
        // Safety: bounds-checked against the current stack extent above.
        let (next_fp, pc) = unsafe { arch::next_older_frame(fp) };
        if pc == 0 {
            break;
        }
        frames[count] = pc;
        count += 1;
        lower = fp;
        fp = next_fp;
    }

    count
}

// ===== signal handling =====

static INSTALL_HANDLERS: Once = Once::new();

const TRAP_SIGNALS: &[i32] = &[
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGTRAP,
];

struct PrevHandlers(UnsafeCell<[MaybeUninit<libc::sigaction>; 5]>);

// Safety: written once under INSTALL_HANDLERS before any handler can run,
// read-only afterwards.
unsafe impl Sync for PrevHandlers {}

static PREV_HANDLERS: PrevHandlers =
    PrevHandlers(UnsafeCell::new([MaybeUninit::uninit(); 5]));

/// Installs the process-wide trap handlers. Idempotent; called on engine
/// creation.
pub(crate) fn ensure_signal_handlers() {
    INSTALL_HANDLERS.call_once(|| {
        for (i, signal) in TRAP_SIGNALS.iter().enumerate() {
            // Safety: standard sigaction installation at process setup; the
            // previous-handler table is only written here, once.
            unsafe {
                let mut action: libc::sigaction = core::mem::zeroed();
                action.sa_sigaction = trap_handler as usize;
                action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
                libc::sigemptyset(&mut action.sa_mask);
                let previous = (*PREV_HANDLERS.0.get())[i].as_mut_ptr();
                let rc = libc::sigaction(*signal, &action, previous);
                assert_eq!(rc, 0, "failed to install trap handler");
            }
        }
    });
}

thread_local! {
    static ALT_STACK_INSTALLED: Cell<bool> = const { Cell::new(false) };
}

/// Gives this thread an alternate signal stack so stack-exhaustion faults
/// can still run the handler.
fn lazy_per_thread_init() {
    ALT_STACK_INSTALLED.with(|installed| {
        if installed.get() {
            return;
        }
        installed.set(true);

        let size = 64 * 1024;
        let stack = Box::leak(vec![0u8; size].into_boxed_slice());
        // Safety: the stack allocation is leaked, so it outlives the
        // thread.
        unsafe {
            let alt = libc::stack_t {
                ss_sp: stack.as_mut_ptr().cast(),
                ss_flags: 0,
                ss_size: size,
            };
            let rc = libc::sigaltstack(&alt, ptr::null_mut());
            debug_assert_eq!(rc, 0);
        }
    });
}

/// How far below the faulting stack pointer a fault address may be to still
/// count as stack exhaustion.
const STACK_GUARD_SLOP: usize = 1024 * 1024;

unsafe extern "C" fn trap_handler(
    signum: i32,
    siginfo: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    let state = TLS_TOP.with(|tls| tls.get());
    if state.is_null() {
        // Safety: fault did not originate under an invocation; hand it to
        // whoever was installed before us.
        unsafe { delegate_to_previous(signum, siginfo, context) };
        return;
    }

    // Safety: the kernel passed a valid ucontext for this platform.
    let (pc, fp, sp) = unsafe { registers_from_ucontext(context) };

    let is_memory_fault = signum == libc::SIGSEGV || signum == libc::SIGBUS;
    let fault_addr = if is_memory_fault {
        // Safety: si_addr is valid for SIGSEGV/SIGBUS.
        unsafe { fault_address(siginfo) }
    } else {
        0
    };

    let memory_hit = if is_memory_fault {
        lookup_reservation(fault_addr)
    } else {
        None
    };

    let code_hit = code::lookup_code(pc);

    let kind = if memory_hit.is_some() {
        Some(TrapKind::MemoryOutOfBounds)
    } else if is_memory_fault
        && code_hit.is_some()
        && fault_addr != 0
        && fault_addr.abs_diff(sp) < STACK_GUARD_SLOP
    {
        Some(TrapKind::StackOverflow)
    } else if let Some((info, offset)) = &code_hit {
        info.lookup_trap_code(*offset)
    } else {
        None
    };

    let Some(kind) = kind else {
        // A fault in compiled code without a recorded trap site (or a host
        // fault) is not ours to handle.
        // Safety: see above.
        unsafe { delegate_to_previous(signum, siginfo, context) };
        return;
    };

    // Safety: non-null means the frame is live on this thread's stack.
    let state = unsafe { &*state };

    let mut frames = [0usize; MAX_BACKTRACE_FRAMES];
    let num_frames = capture_backtrace(fp, pc, sp, state.entry_sp, &mut frames);

    // Safety: single writer (this thread); the catch side reads only after
    // the restore below.
    unsafe {
        *state.unwind.get() = Some(UnwindReason::Trap {
            kind,
            memory_hit,
            frames,
            num_frames,
        });
        arch::restore_context(state.jmp_buf.get(), 1)
    }
}

unsafe fn delegate_to_previous(signum: i32, siginfo: *mut libc::siginfo_t, context: *mut c_void) {
    let index = TRAP_SIGNALS
        .iter()
        .position(|s| *s == signum)
        .expect("handler installed for unexpected signal");

    // Safety: PREV_HANDLERS was written by ensure_signal_handlers before
    // this handler could run.
    let previous = unsafe { (*PREV_HANDLERS.0.get())[index].assume_init() };

    let handler = previous.sa_sigaction;
    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        // Reinstate the default action and return; the faulting
        // instruction re-executes and the default disposition applies.
        // Safety: restoring a previously valid disposition.
        unsafe {
            libc::sigaction(signum, &previous, ptr::null_mut());
        }
    } else if previous.sa_flags & libc::SA_SIGINFO != 0 {
        // Safety: chaining to the previously installed SA_SIGINFO handler.
        unsafe {
            let previous_handler: unsafe extern "C" fn(i32, *mut libc::siginfo_t, *mut c_void) =
                core::mem::transmute(handler);
            previous_handler(signum, siginfo, context);
        }
    } else {
        // Safety: chaining to the previously installed plain handler.
        unsafe {
            let previous_handler: unsafe extern "C" fn(i32) = core::mem::transmute(handler);
            previous_handler(signum);
        }
    }
}

unsafe fn fault_address(siginfo: *mut libc::siginfo_t) -> usize {
    cfg_if! {
        if #[cfg(target_os = "linux")] {
            // Safety: caller ensured this is a memory fault siginfo.
            unsafe { (*siginfo).si_addr() as usize }
        } else {
            // Safety: see above.
            unsafe { (*siginfo).si_addr as usize }
        }
    }
}

/// Extracts (pc, fp, sp) from a signal ucontext.
unsafe fn registers_from_ucontext(context: *mut c_void) -> (usize, usize, usize) {
    cfg_if! {
        if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
            // Safety: the kernel passed a valid ucontext.
            unsafe {
                let context = &*(context as *const libc::ucontext_t);
                let gregs = &context.uc_mcontext.gregs;
                (
                    gregs[libc::REG_RIP as usize] as usize,
                    gregs[libc::REG_RBP as usize] as usize,
                    gregs[libc::REG_RSP as usize] as usize,
                )
            }
        } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
            // Safety: the kernel passed a valid ucontext.
            unsafe {
                let context = &*(context as *const libc::ucontext_t);
                let mcontext = &context.uc_mcontext;
                (
                    mcontext.pc as usize,
                    mcontext.regs[29] as usize,
                    mcontext.sp as usize,
                )
            }
        } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
            // Safety: the kernel passed a valid ucontext.
            unsafe {
                let context = &*(context as *const libc::ucontext_t);
                let ss = &(*context.uc_mcontext).__ss;
                (ss.__rip as usize, ss.__rbp as usize, ss.__rsp as usize)
            }
        } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
            // Safety: the kernel passed a valid ucontext.
            unsafe {
                let context = &*(context as *const libc::ucontext_t);
                let ss = &(*context.uc_mcontext).__ss;
                (ss.__pc as usize, ss.__fp as usize, ss.__sp as usize)
            }
        } else {
            compile_error!("unsupported platform for signal-based trap handling");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_without_trap_passes_value_through() {
        let value = unwind_signals_as_exceptions(|| 41 + 1).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn catch_runtime_exceptions_routes_errors() {
        let mut caught = None;
        let result: Option<()> = catch_runtime_exceptions(
            || {
                Err(Exception::boxed_intrinsic(
                    ExceptionKind::CalledAbort,
                    &[],
                ))
            },
            |exception| caught = Some(exception),
        );
        assert!(result.is_none());
        assert!(matches!(
            caught.unwrap().kind(),
            ExceptionKind::CalledAbort
        ));
    }
}

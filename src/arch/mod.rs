// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Host-architecture helpers: register-context save/restore for the trap
//! plumbing, frame-pointer chain walking, and instruction-cache maintenance
//! for freshly published code.
//!
//! The save/restore pair is a setjmp/longjmp equivalent with the classic
//! footgun removed: [`save_context_and_call`] saves the caller's context and
//! then runs the callback *inside* the assembly frame, so a later
//! [`restore_context`] resumes at a single well-defined return point instead
//! of re-entering the middle of a Rust function.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else {
        compile_error!("unsupported host architecture");
    }
}

/// Reads the saved return address and frame pointer of the next older frame.
///
/// Both supported ABIs lay frame records out the same way: the previous
/// frame pointer at `[fp]` and the return address at `[fp + 8]`.
///
/// # Safety
///
/// `fp` must point to a valid frame record.
pub unsafe fn next_older_frame(fp: usize) -> (usize, usize) {
    // Safety: caller has to ensure fp is valid
    unsafe {
        let next_fp = *(fp as *const usize);
        let pc = *((fp + 8) as *const usize);
        (next_fp, pc)
    }
}

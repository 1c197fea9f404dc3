//! Architecture-specific context switch.
//!
//! A fiber's saved context is nothing but its stack pointer: the switch
//! routine pushes the callee-saved register set onto the outgoing stack,
//! swaps stack pointers through two raw slots and pops the incoming set.
//! From the caller's perspective the switch is an ordinary function call,
//! so the compiler has already spilled everything caller-saved around it;
//! recording the callee-saved set is sufficient for all caller-local state
//! to be bit-identical after switching out and back.
//!
//! [`bootstrap`] writes the initial frame of a new fiber so that the first
//! switch into it pops dummy callee-save values and returns into the entry
//! trampoline with correct ABI stack alignment.

use core::arch::global_asm;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("the fiber context switch is only implemented for x86_64 and aarch64");

// System V AMD64: callee-saved are rbp, rbx, r12-r15.
#[cfg(target_arch = "x86_64")]
global_asm!(
    r#"
    .text
    .globl strand_fiber_switch
strand_fiber_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, [rsi]
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret
"#
);

// AAPCS64: callee-saved are x19-x28, the frame pointer x29, the link
// register x30 and the low halves d8-d15 of v8-v15.
#[cfg(target_arch = "aarch64")]
global_asm!(
    r#"
    .text
    .globl strand_fiber_switch
strand_fiber_switch:
    sub sp, sp, #160
    stp x19, x20, [sp, #0]
    stp x21, x22, [sp, #16]
    stp x23, x24, [sp, #32]
    stp x25, x26, [sp, #48]
    stp x27, x28, [sp, #64]
    stp x29, x30, [sp, #80]
    stp d8, d9, [sp, #96]
    stp d10, d11, [sp, #112]
    stp d12, d13, [sp, #128]
    stp d14, d15, [sp, #144]
    mov x9, sp
    str x9, [x0]
    ldr x9, [x1]
    mov sp, x9
    ldp x19, x20, [sp, #0]
    ldp x21, x22, [sp, #16]
    ldp x23, x24, [sp, #32]
    ldp x25, x26, [sp, #48]
    ldp x27, x28, [sp, #64]
    ldp x29, x30, [sp, #80]
    ldp d8, d9, [sp, #96]
    ldp d10, d11, [sp, #112]
    ldp d12, d13, [sp, #128]
    ldp d14, d15, [sp, #144]
    add sp, sp, #160
    ret
"#
);

extern "C" {
    fn strand_fiber_switch(save: *mut *mut u8, load: *const *mut u8);
}

/// Machine words the switch routine pops before returning.
#[cfg(target_arch = "x86_64")]
const SAVED_WORDS: usize = 6;
#[cfg(target_arch = "aarch64")]
const SAVED_WORDS: usize = 20;

/// Entry trampoline signature: no arguments, never returns. The trampoline
/// is expected to fetch whatever it needs from the scheduler.
pub(crate) type Entry = extern "C" fn() -> !;

/// Saves the current context through `save`, loads the one behind `load`
/// and resumes it.
///
/// # Safety
///
/// `save` must point at a writable slot that stays valid until this fiber
/// is resumed; `load` must hold a stack pointer produced by a previous
/// switch or by [`bootstrap`]. Must only be called on the thread owning
/// both contexts.
#[inline(always)]
pub(crate) unsafe fn switch(save: *mut *mut u8, load: *const *mut u8) {
    strand_fiber_switch(save, load)
}

/// Backstop return address installed above the entry trampoline. The
/// trampoline's type forbids returning; reaching this means the fiber
/// stack was corrupted.
extern "C" fn entry_returned() -> ! {
    std::process::abort()
}

/// Prepares a fresh stack so that the first [`switch`] into it begins
/// executing `entry` on that stack. Returns the stack pointer to store as
/// the fiber's saved context.
///
/// # Safety
///
/// `stack_top` must be the 16-aligned upper end of a writable region large
/// enough for the initial frame, exclusively owned by the new fiber.
pub(crate) unsafe fn bootstrap(stack_top: *mut u8, entry: Entry) -> *mut u8 {
    debug_assert_eq!(stack_top as usize % 16, 0);
    let top = stack_top.cast::<usize>();

    #[cfg(target_arch = "x86_64")]
    {
        // Frame, low to high: six dummy callee-save slots, the entry
        // address the final `ret` pops, the backstop. Entry then sees
        // rsp % 16 == 8, as after a call.
        top.sub(1).write(entry_returned as usize);
        top.sub(2).write(entry as usize);
        for slot in 3..=2 + SAVED_WORDS {
            top.sub(slot).write(0);
        }
        return top.sub(2 + SAVED_WORDS).cast::<u8>();
    }

    #[cfg(target_arch = "aarch64")]
    {
        // One 160-byte store frame; the x30 slot (word 11) makes the final
        // `ret` branch into the entry. sp lands back on stack_top,
        // 16-aligned as AAPCS64 requires.
        let base = top.sub(SAVED_WORDS);
        for slot in 0..SAVED_WORDS {
            base.add(slot).write(0);
        }
        base.add(11).write(entry as usize);
        let _ = entry_returned; // no return slot exists on this arch
        return base.cast::<u8>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::stack::Stack;
    use std::ptr::{self, addr_of_mut};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);
    static mut MAIN_SP: *mut u8 = ptr::null_mut();
    static mut FIBER_SP: *mut u8 = ptr::null_mut();

    extern "C" fn visit_and_switch_back() -> ! {
        HITS.fetch_add(1, Ordering::SeqCst);
        unsafe { switch(addr_of_mut!(FIBER_SP), addr_of_mut!(MAIN_SP)) };
        unreachable!()
    }

    #[test]
    fn switch_out_and_back_preserves_locals() {
        let stack = Stack::new(64 * 1024).unwrap();
        let sentinel = 0xDEAD_BEEF_u32;
        unsafe {
            FIBER_SP = bootstrap(stack.top(), visit_and_switch_back);
            switch(addr_of_mut!(MAIN_SP), addr_of_mut!(FIBER_SP));
        }
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        assert_eq!(sentinel, 0xDEAD_BEEF);
    }
}

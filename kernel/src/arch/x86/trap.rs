//! Trap entry and the cross-ring boundary
//!
//! The stubs below funnel every vector into one frame layout and one Rust
//! dispatcher. Entering an action goes the other way: a crafted `iretd`
//! frame drops the CPU onto the automaton's fixed stack at its ring.
//!
//! There is no return path through the kernel stack: an action ends in the
//! finish trap, after which the next entry is dispatched from the top of
//! the same fixed kernel stack.

use core::arch::{asm, global_asm};

use super::{gdt, idt, pic};

/// Register state captured by the trap stubs, in push order.
#[repr(C)]
pub struct TrapFrame {
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    // Present only when the trap crossed from ring 3.
    pub user_esp: u32,
    pub ss: u32,
}

global_asm!(
    r#"
.macro TRAP_NOERR vec
.global trap_stub_\vec
trap_stub_\vec:
    push 0
    push \vec
    jmp trap_common
.endm

.macro TRAP_ERR vec
.global trap_stub_\vec
trap_stub_\vec:
    push \vec
    jmp trap_common
.endm

TRAP_NOERR 0
TRAP_NOERR 1
TRAP_NOERR 2
TRAP_NOERR 3
TRAP_NOERR 4
TRAP_NOERR 5
TRAP_NOERR 6
TRAP_NOERR 7
TRAP_ERR   8
TRAP_NOERR 9
TRAP_ERR   10
TRAP_ERR   11
TRAP_ERR   12
TRAP_ERR   13
TRAP_ERR   14
TRAP_NOERR 15
TRAP_NOERR 16
TRAP_ERR   17
TRAP_NOERR 18
TRAP_NOERR 19
TRAP_NOERR 32
TRAP_NOERR 33
TRAP_NOERR 34
TRAP_NOERR 35
TRAP_NOERR 36
TRAP_NOERR 37
TRAP_NOERR 38
TRAP_NOERR 39
TRAP_NOERR 40
TRAP_NOERR 41
TRAP_NOERR 42
TRAP_NOERR 43
TRAP_NOERR 44
TRAP_NOERR 45
TRAP_NOERR 46
TRAP_NOERR 47
TRAP_NOERR 128

trap_common:
    pusha
    mov eax, ds
    push eax
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    cld
    push esp
    call trap_dispatch
    add esp, 4
    pop eax
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    popa
    add esp, 8
    iretd
"#
);

macro_rules! stub_addr {
    ($name:ident) => {{
        extern "C" {
            fn $name();
        }
        $name as usize
    }};
}

/// Exception vectors 0..=19 with their stub addresses.
pub fn exception_stubs() -> [(usize, usize); 20] {
    [
        (0, stub_addr!(trap_stub_0)),
        (1, stub_addr!(trap_stub_1)),
        (2, stub_addr!(trap_stub_2)),
        (3, stub_addr!(trap_stub_3)),
        (4, stub_addr!(trap_stub_4)),
        (5, stub_addr!(trap_stub_5)),
        (6, stub_addr!(trap_stub_6)),
        (7, stub_addr!(trap_stub_7)),
        (8, stub_addr!(trap_stub_8)),
        (9, stub_addr!(trap_stub_9)),
        (10, stub_addr!(trap_stub_10)),
        (11, stub_addr!(trap_stub_11)),
        (12, stub_addr!(trap_stub_12)),
        (13, stub_addr!(trap_stub_13)),
        (14, stub_addr!(trap_stub_14)),
        (15, stub_addr!(trap_stub_15)),
        (16, stub_addr!(trap_stub_16)),
        (17, stub_addr!(trap_stub_17)),
        (18, stub_addr!(trap_stub_18)),
        (19, stub_addr!(trap_stub_19)),
    ]
}

/// Remapped PIC vectors 32..=47.
pub fn irq_stubs() -> [(usize, usize); 16] {
    [
        (32, stub_addr!(trap_stub_32)),
        (33, stub_addr!(trap_stub_33)),
        (34, stub_addr!(trap_stub_34)),
        (35, stub_addr!(trap_stub_35)),
        (36, stub_addr!(trap_stub_36)),
        (37, stub_addr!(trap_stub_37)),
        (38, stub_addr!(trap_stub_38)),
        (39, stub_addr!(trap_stub_39)),
        (40, stub_addr!(trap_stub_40)),
        (41, stub_addr!(trap_stub_41)),
        (42, stub_addr!(trap_stub_42)),
        (43, stub_addr!(trap_stub_43)),
        (44, stub_addr!(trap_stub_44)),
        (45, stub_addr!(trap_stub_45)),
        (46, stub_addr!(trap_stub_46)),
        (47, stub_addr!(trap_stub_47)),
    ]
}

/// The `int 0x80` gate.
pub fn syscall_stub() -> usize {
    stub_addr!(trap_stub_128)
}

#[no_mangle]
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    match frame.vector {
        v if v == idt::VECTOR_PAGE_FAULT => page_fault(frame),
        v if v == idt::VECTOR_SYSCALL => syscall(frame),
        v if v == idt::VECTOR_TIMER => {
            pic::eoi(0);
            crate::sched::dispatch::timer_tick();
        }
        v if (idt::VECTOR_IRQ_BASE..idt::VECTOR_IRQ_BASE + 16).contains(&v) => {
            // Lines other than the timer are masked; if one fires anyway
            // (spurious), acknowledge and drop it.
            pic::eoi((v - idt::VECTOR_IRQ_BASE) as u8);
        }
        v => exception(v, frame),
    }
}

fn page_fault(frame: &mut TrapFrame) {
    let addr = super::read_cr2() as usize;
    let from_user = frame.cs & 3 == 3;
    match crate::mm::page_fault::handle(crate::kernel(), addr, frame.error, from_user) {
        crate::mm::page_fault::FaultOutcome::Resumed => {}
        crate::mm::page_fault::FaultOutcome::AutomatonDestroyed => {
            // The faulting action is gone; pick up the next entry.
            crate::sched::dispatch::run()
        }
        crate::mm::page_fault::FaultOutcome::Fatal => {
            panic!(
                "unrecoverable page fault at {:#x} (error {:#x}, eip {:#x})",
                addr, frame.error, frame.eip
            );
        }
    }
}

fn syscall(frame: &mut TrapFrame) {
    let args = crate::syscall::SyscallArgs {
        number: frame.eax as usize,
        arg1: frame.ebx as usize,
        arg2: frame.ecx as usize,
        arg3: frame.edx as usize,
        arg4: frame.esi as usize,
        arg5: frame.edi as usize,
    };
    match crate::syscall::handle(crate::kernel(), args) {
        crate::syscall::SyscallOutcome::Return(value) => frame.eax = value as u32,
        crate::syscall::SyscallOutcome::Finished => crate::sched::dispatch::run(),
    }
}

fn exception(vector: u32, frame: &mut TrapFrame) {
    if frame.cs & 3 == 3 {
        // A user action misbehaved; the fault is fatal to the automaton,
        // not to the system.
        log::error!(
            "exception {} in user action at eip {:#x}; destroying automaton",
            vector,
            frame.eip
        );
        crate::sched::dispatch::destroy_current();
        crate::sched::dispatch::run()
    }
    panic!("kernel exception {} at eip {:#x} (error {:#x})", vector, frame.eip, frame.error);
}

/// Drop to ring 3 at `entry` with the given stack. The argument frame has
/// already been written to the stack by the dispatcher.
///
/// # Safety
///
/// `entry` and `user_esp` must be valid in the active address space, and
/// the TSS must already point at the fixed kernel stack.
pub unsafe fn enter_ring3(entry: u32, user_esp: u32) -> ! {
    // SAFETY: the iretd frame matches the layout the CPU expects for an
    // inter-privilege return; segment selectors come from the live GDT.
    unsafe {
        asm!(
            "mov ax, {udata}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "push {udata}",
            "push {esp_}",
            "push {eflags}",
            "push {ucode}",
            "push {entry}",
            "iretd",
            udata = const gdt::USER_DATA as u32,
            ucode = const gdt::USER_CODE as u32,
            eflags = const 0x202u32, // IF set on return
            esp_ = in(reg) user_esp,
            entry = in(reg) entry,
            options(noreturn),
        )
    }
}

/// Enter a ring-0 action image at `entry` on its fixed stack. Used for
/// automata created with retained privilege; the system automaton's own
/// actions are direct calls and never come through here.
///
/// # Safety
///
/// `entry` and `esp` must be valid supervisor addresses in the active
/// address space.
pub unsafe fn enter_ring0(entry: u32, esp: u32) -> ! {
    // SAFETY: same-privilege iretd pops eip/cs/eflags only; esp is set
    // beforehand, which is exactly the fresh-stack contract.
    unsafe {
        asm!(
            "mov esp, {esp_}",
            "push {eflags}",
            "push {kcode}",
            "push {entry}",
            "iretd",
            kcode = const gdt::KERNEL_CODE as u32,
            eflags = const 0x202u32,
            esp_ = in(reg) esp,
            entry = in(reg) entry,
            options(noreturn),
        )
    }
}

//! Global descriptor table and task-state segment
//!
//! Flat 4 GiB segments for rings 0 and 3, plus one TSS supplying the
//! kernel stack for ring transitions. Selector values are part of the
//! trap-layer ABI.

use core::arch::asm;

use spin::Mutex;

pub const KERNEL_CODE: u16 = 0x08;
pub const KERNEL_DATA: u16 = 0x10;
pub const USER_CODE: u16 = 0x18 | 3;
pub const USER_DATA: u16 = 0x20 | 3;
const TSS_SELECTOR: u16 = 0x28;

#[repr(C)]
struct TaskStateSegment {
    link: u16,
    _r0: u16,
    esp0: u32,
    ss0: u16,
    _r1: u16,
    esp1: u32,
    ss1: u16,
    _r2: u16,
    esp2: u32,
    ss2: u16,
    _r3: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u16,
    _r4: u16,
    cs: u16,
    _r5: u16,
    ss: u16,
    _r6: u16,
    ds: u16,
    _r7: u16,
    fs: u16,
    _r8: u16,
    gs: u16,
    _r9: u16,
    ldt: u16,
    _r10: u16,
    trap: u16,
    iomap_base: u16,
}

impl TaskStateSegment {
    const fn new() -> Self {
        // SAFETY comment not needed: plain zeroed construction.
        Self {
            link: 0,
            _r0: 0,
            esp0: 0,
            ss0: KERNEL_DATA,
            _r1: 0,
            esp1: 0,
            ss1: 0,
            _r2: 0,
            esp2: 0,
            ss2: 0,
            _r3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            _r4: 0,
            cs: 0,
            _r5: 0,
            ss: 0,
            _r6: 0,
            ds: 0,
            _r7: 0,
            fs: 0,
            _r8: 0,
            gs: 0,
            _r9: 0,
            ldt: 0,
            _r10: 0,
            trap: 0,
            iomap_base: core::mem::size_of::<TaskStateSegment>() as u16,
        }
    }
}

static TSS: Mutex<TaskStateSegment> = Mutex::new(TaskStateSegment::new());
static GDT: Mutex<[u64; 6]> = Mutex::new([0; 6]);

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

/// Build a flat segment descriptor.
const fn descriptor(access: u8) -> u64 {
    // base 0, limit 0xFFFFF, 4 KiB granularity, 32-bit
    let limit_low = 0xFFFFu64;
    let limit_high = 0xFu64;
    let flags = 0xCu64; // G | D
    limit_low | (access as u64) << 40 | limit_high << 48 | flags << 52
}

fn tss_descriptor(base: u32, limit: u32) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xFFFF)
        | (base & 0xFF_FFFF) << 16
        | 0x89u64 << 40 // present, 32-bit available TSS
        | (limit >> 16 & 0xF) << 48
        | (base >> 24) << 56
}

/// Install the GDT, reload the segment registers and load the TSS.
pub fn init(kernel_stack_top: u32) {
    let tss_base = {
        let mut tss = TSS.lock();
        tss.esp0 = kernel_stack_top;
        core::ptr::from_ref::<TaskStateSegment>(&*tss) as u32
    };

    let pointer = {
        let mut gdt = GDT.lock();
        gdt[0] = 0;
        gdt[1] = descriptor(0x9A); // ring 0 code
        gdt[2] = descriptor(0x92); // ring 0 data
        gdt[3] = descriptor(0xFA); // ring 3 code
        gdt[4] = descriptor(0xF2); // ring 3 data
        gdt[5] = tss_descriptor(tss_base, core::mem::size_of::<TaskStateSegment>() as u32 - 1);
        GdtPointer {
            limit: core::mem::size_of::<[u64; 6]>() as u16 - 1,
            base: gdt.as_ptr() as u32,
        }
    };

    // SAFETY: the pointer references the static GDT, which is never moved
    // or freed; the selector constants match the table built above.
    unsafe {
        asm!(
            "lgdt [{ptr}]",
            "mov ax, {kdata}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            "push {kcode}",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            "mov ax, {tss}",
            "ltr ax",
            ptr = in(reg) &pointer,
            kdata = const KERNEL_DATA as u32,
            kcode = const KERNEL_CODE as u32,
            tss = const TSS_SELECTOR as u32,
            out("eax") _,
        );
    }
}

/// Point the TSS at the fixed kernel stack before entering a user action;
/// the next trap starts there.
pub fn set_kernel_stack(esp0: u32) {
    TSS.lock().esp0 = esp0;
}

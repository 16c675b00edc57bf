//! Multiboot entry stub
//!
//! The loader drops us at `_start` in the identity-mapped low megabytes
//! with paging off. The stub builds a throwaway page directory with two
//! 4 MiB mappings (identity and the kernel window), turns paging on and
//! jumps into the higher half, where `boot_main` takes over with the real
//! memory manager.

use core::arch::global_asm;

global_asm!(
    r#"
.section .multiboot, "a"
.align 4
    .long 0x1BADB002            # magic
    .long 0x00000003            # page-align modules, want memory map
    .long -(0x1BADB002 + 0x00000003)

.section .bss
.align 16
.global boot_stack_bottom
.global boot_stack_top
boot_stack_bottom:
    .skip 16384
boot_stack_top:

.section .data
.align 4096
boot_page_directory:
    # [0, 16M) identity-mapped with 4 MiB pages; the DMA zone must be
    # reachable before the real kernel directory exists.
    .long 0x00000083
    .long 0x00400083
    .long 0x00800083
    .long 0x00C00083
    .fill 764, 4, 0
    # The same 16 MiB at the kernel window base.
    .long 0x00000083
    .long 0x00400083
    .long 0x00800083
    .long 0x00C00083
    .fill 252, 4, 0

.section .boot, "ax"
.global _start
_start:
    # eax = multiboot magic, ebx = physical address of the info record.
    mov ecx, offset boot_page_directory
    sub ecx, 0xC0000000
    mov cr3, ecx

    mov ecx, cr4
    or ecx, 0x10                # PSE for the 4 MiB boot mappings
    mov cr4, ecx

    mov ecx, cr0
    or ecx, 0x80000000          # PG
    mov cr0, ecx

    mov ecx, offset 2f
    jmp ecx

.section .text
2:
    mov esp, offset boot_stack_top
    xor ebp, ebp
    push ebx
    push eax
    call boot_main

    # boot_main never returns; spin if it somehow does.
3:  cli
    hlt
    jmp 3b
"#
);

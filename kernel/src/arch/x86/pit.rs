//! 8253 programmable interval timer
//!
//! Programs the tick rate and nothing more. The kernel keeps no
//! timeouts of its own; each tick is recorded by the scheduler's timer
//! entry and surfaced to automata through the system automaton's timer
//! output.

use super::port::outb;

const CHANNEL0: u16 = 0x40;
const COMMAND: u16 = 0x43;
const INPUT_HZ: u32 = 1_193_182;

/// Default tick rate.
pub const DEFAULT_HZ: u32 = 100;

/// Program channel 0 as a rate generator at `hz`.
pub fn init(hz: u32) {
    let divisor = (INPUT_HZ / hz).clamp(1, 65535) as u16;
    // SAFETY: channel 0 mode/divisor programming; the kernel owns the PIT.
    unsafe {
        outb(COMMAND, 0x36); // channel 0, lobyte/hibyte, mode 3
        outb(CHANNEL0, (divisor & 0xFF) as u8);
        outb(CHANNEL0, (divisor >> 8) as u8);
    }
}

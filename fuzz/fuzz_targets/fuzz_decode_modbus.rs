#![no_main]
use libfuzzer_sys::fuzz_target;
use wallbox_sync::catalog::{PlanLimits, RegisterCatalog};
use wallbox_sync::modbus::{decode_block, decode_string, decode_u32};

fuzz_target!(|data: &[u8]| {
    // Interpret the input as u16 register stream in big-endian pairs
    let regs: Vec<u16> = data
        .chunks_exact(2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect();

    let _ = decode_u32(&regs);
    let _ = decode_string(&regs, Some(32));

    // Short or garbled block reads must leave keys absent, never panic
    let catalog = RegisterCatalog::webasto_next();
    let limits = PlanLimits {
        max_registers: 110,
        max_gap: 4,
    };
    for block in catalog.read_plan(limits).unwrap_or_default() {
        let _ = decode_block(&block, &regs);
    }
});

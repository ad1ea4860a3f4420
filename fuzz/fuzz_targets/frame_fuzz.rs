//! Frame fuzz target: arbitrary CAN ids and payloads through decode, reassembly and parsing.
//! Malformed frames must surface as UavcanError, never as a panic.
//! Build with: cargo fuzz run frame_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    use std::sync::OnceLock;
    use uavcan_dsdl::{DsdlParser, MemoryFiles, SerializationRules, UavcanReceiver};

    static RECEIVER: OnceLock<Option<UavcanReceiver>> = OnceLock::new();
    let receiver = RECEIVER.get_or_init(|| {
        let mut files = MemoryFiles::new();
        files.insert("fuzz/ns/413.Pitot.uavcan", "float32 pressure_delta\nuint8 error_bf");
        files.insert("fuzz/ns/100.Dyn.uavcan", "int3 a\nvoid5\nuint8[<=12] bytes\nfloat16 h");
        files.insert("fuzz/ns/35.Srv.uavcan", "bool enable\n---\nuint8 state");
        let mut parser = DsdlParser::with_provider("fuzz", files);
        let table = parser.parse_all_directories().ok()?;
        SerializationRules::generate(table).ok().map(UavcanReceiver::new)
    });
    let Some(receiver) = receiver else { return };
    if data.len() < 4 {
        return;
    }
    let can_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) & 0x1fff_ffff;
    for chunk in data[4..].chunks(9) {
        let _ = receiver.on_frame_received(can_id, chunk, 0);
    }
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run frame_fuzz");
}

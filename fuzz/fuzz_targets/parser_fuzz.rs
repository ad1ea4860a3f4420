//! Parser fuzz target: feed arbitrary text to the DSDL line parser as one definition file.
//! The parser must not panic; it should return Ok(TypeId) or Err(DsdlError).
//! Build with: cargo fuzz run parser_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let s = match std::str::from_utf8(data) {
        Ok(x) => x,
        Err(_) => return,
    };
    let mut parser = uavcan_dsdl::DsdlParser::with_provider("fuzz", uavcan_dsdl::MemoryFiles::new());
    let _ = parser.parse_source("fuzz/ns/1.Fuzz.1.0.uavcan", s);
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run parser_fuzz");
}

#![no_main]
use kvbus::offset::Offset;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Binary decode must round-trip whatever it accepts.
    if let Ok(offset) = Offset::decode(data) {
        assert_eq!(offset.encode().as_slice(), data);
    }

    // String parse must never panic, and accepted inputs must re-parse.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(offset) = s.parse::<Offset>() {
            assert_eq!(offset.to_string().parse::<Offset>().unwrap(), offset);
        }
    }
});

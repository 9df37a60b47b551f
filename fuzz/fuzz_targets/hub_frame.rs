//! Fuzz target for hub frame decoding.
//!
//! Every line the hub sends goes through `HubFrame::decode`; it must
//! reject garbage without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use lunabridge::bus::wire::HubFrame;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        if let Ok(frame) = HubFrame::decode(line) {
            // Anything we accept must survive a round trip.
            let json = serde_json::to_string(&frame).unwrap();
            assert_eq!(HubFrame::decode(&json).unwrap(), frame);
        }
    }
});

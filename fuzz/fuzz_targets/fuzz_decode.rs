//! Fuzz target for the wire decoder.
//!
//! Any line must decode to a message, a salvaged malformed envelope, or an
//! error, never a panic. Decoded messages must survive re-encoding.

#![no_main]

use gossip_replica::protocol::{decode, encode, Inbound};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|line: &str| {
    if let Ok(Inbound::Message(message)) = decode(line) {
        let encoded = encode(&message).expect("decoded message must encode");
        match decode(&encoded) {
            Ok(Inbound::Message(again)) => assert_eq!(again, message),
            other => panic!("re-encoded message did not decode: {:?}", other),
        }
    }
});

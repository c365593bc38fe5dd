//! Fuzz target for pkt-line decoding.
//!
//! Feeds arbitrary bytes to the decoder in two pieces and drains it.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let split = data.first().map_or(0, |b| *b as usize % (data.len() + 1));
    let mut decoder = gitwire_protocol::PktLineDecoder::new();

    for piece in [&data[..split], &data[split..]] {
        decoder.feed(piece);
        // Every packet consumes at least the 4-byte header, so this ends.
        while let Ok(Some(_)) = decoder.next_packet() {}
    }
});

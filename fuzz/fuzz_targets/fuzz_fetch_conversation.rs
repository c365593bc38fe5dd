//! Fuzz target for the fetch conversation.
//!
//! Plays an arbitrary server: the advertisement and the pack phase are
//! both attacker controlled, delivered in arbitrary chunk sizes.

#![no_main]

use arbitrary::Arbitrary;
use gitwire_protocol::{ConversationConfig, FetchConversation, FetchState};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    advertisement: Vec<u8>,
    response: Vec<u8>,
    chunk: u8,
    depth: Option<u8>,
}

fuzz_target!(|input: Input| {
    let mut config = ConversationConfig::default();
    config.depth = input.depth.map(u32::from);
    let (mut fetch, _events) = FetchConversation::new(Vec::new(), config);
    let chunk = usize::from(input.chunk.max(1));

    for piece in input.advertisement.chunks(chunk) {
        if fetch.receive(piece).is_err() {
            return;
        }
    }
    if fetch.state() != FetchState::Discovered {
        let _ = fetch.close();
        return;
    }

    let names: Vec<String> = fetch.refs().keys().cloned().collect();
    for name in &names {
        let _ = fetch.want(name);
    }
    if fetch.flush().is_err() {
        return;
    }

    for piece in input.response.chunks(chunk) {
        if fetch.receive(piece).is_err() {
            return;
        }
    }
    let _ = fetch.close();
});

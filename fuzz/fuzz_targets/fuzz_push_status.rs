//! Fuzz target for push status report parsing.

#![no_main]

use gitwire_protocol::{
    ConversationConfig, GitObject, History, PendingCommit, PktLine, PushConversation,
};
use libfuzzer_sys::fuzz_target;

const TIP: &str = "1111111111111111111111111111111111111111";

fuzz_target!(|data: &[u8]| {
    let (mut push, _events) = PushConversation::new(Vec::new(), ConversationConfig::default());

    let mut advertisement =
        PktLine::from_string(&format!("{} refs/heads/main\0report-status\n", TIP)).encode();
    advertisement.extend(PktLine::Flush.encode());
    if push.receive(&advertisement).is_err() {
        return;
    }

    let blob = GitObject::blob(b"fuzz".to_vec());
    let tree = GitObject::tree([("100644", "f", blob.id)]);
    let history = History::new().commit(
        PendingCommit::new(tree.id, "F <f@f> 0 +0000", "fuzz\n")
            .with_object(blob)
            .with_object(tree),
    );
    if push.update("main", &history).is_err() || push.flush().is_err() {
        return;
    }

    if push.receive(data).is_ok() {
        let _ = push.close();
    }
});

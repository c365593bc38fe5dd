//! End-to-end push conversations against scripted server bytes.

use gitwire_protocol::{
    ConversationConfig, GitError, GitObject, History, ObjectId, ObjectType, PackParser,
    PendingCommit, PktLine, PktLineDecoder, PushConversation, PushEvent, PushState, RefStatus,
    UnpackStatus,
};

const SIG: &str = "Dave <dave@example.com> 1700000000 +0000";

fn id(byte: u8) -> ObjectId {
    ObjectId::from_bytes([byte; 20])
}

fn config() -> ConversationConfig {
    let mut config = ConversationConfig::default();
    config.capabilities.agent = None;
    config
}

fn advertisement(caps: &str, refs: &[(ObjectId, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, (object_id, name)) in refs.iter().enumerate() {
        let line = if i == 0 {
            format!("{} {}\0{}\n", object_id, name, caps)
        } else {
            format!("{} {}\n", object_id, name)
        };
        out.extend(PktLine::from_string(&line).encode());
    }
    out.extend(PktLine::Flush.encode());
    out
}

fn file_commit(path: &str, content: &str, message: &str) -> PendingCommit {
    let blob = GitObject::blob(content.as_bytes().to_vec());
    let tree = GitObject::tree([("100644", path, blob.id)]);
    PendingCommit::new(tree.id, SIG, message)
        .with_object(blob)
        .with_object(tree)
}

/// Splits the client's output into command lines and the trailing pack.
fn split_request(request: &[u8]) -> (Vec<String>, Vec<u8>) {
    let mut decoder = PktLineDecoder::new();
    decoder.feed(request);
    let mut commands = Vec::new();
    loop {
        match decoder.next_packet().unwrap().unwrap() {
            PktLine::Flush => break,
            PktLine::Data(data) => commands.push(String::from_utf8(data.to_vec()).unwrap()),
        }
    }
    (commands, decoder.take_remaining().to_vec())
}

#[test]
fn test_update_splices_history_onto_old_tip() {
    let main = id(0xaa);
    let (mut push, mut events) = PushConversation::new(Vec::new(), config());
    push.receive(&advertisement(
        "report-status delete-refs side-band-64k ofs-delta agent=git/2.43.0",
        &[(main, "refs/heads/main"), (id(0xbb), "refs/heads/old")],
    ))
    .unwrap();
    assert_eq!(push.selected_capabilities(), "report-status delete-refs ofs-delta");

    let history = History::new()
        .commit(file_commit("a.txt", "one", "first\n"))
        .commit(file_commit("a.txt", "two", "second\n"));
    push.update("main", &history).unwrap();
    push.del("old").unwrap();
    push.flush().unwrap();
    assert_eq!(push.state(), PushState::Pushing);

    let (commands, pack) = split_request(push.writer());
    let tip = history.splice_onto(Some(main)).unwrap().tip;
    assert_eq!(
        commands,
        vec![
            format!(
                "{} {} refs/heads/main\0report-status delete-refs ofs-delta\n",
                main, tip
            ),
            format!("{} {} refs/heads/old\n", id(0xbb), ObjectId::zero()),
        ]
    );

    let objects = PackParser::new(&pack).parse().unwrap();
    assert_eq!(objects.len(), 6);
    let commits: Vec<&GitObject> = objects
        .iter()
        .filter(|o| o.object_type == ObjectType::Commit)
        .collect();
    assert_eq!(commits[0].parents(), vec![main]);
    assert_eq!(commits[1].id, tip);

    let mut report = PktLine::from_string("unpack ok\n").encode();
    report.extend(PktLine::from_string("ok refs/heads/main\n").encode());
    report.extend(PktLine::from_string("ok refs/heads/old\n").encode());
    report.extend(PktLine::Flush.encode());
    for byte in &report {
        push.receive(std::slice::from_ref(byte)).unwrap();
    }

    assert_eq!(push.state(), PushState::Pushed);
    let report = push.take_report().unwrap();
    assert!(report.is_success());
    assert_eq!(report.commands.len(), 2);

    assert!(matches!(events.try_recv().unwrap(), PushEvent::Discover(_)));
    assert!(matches!(events.try_recv().unwrap(), PushEvent::Pushed(_)));
    assert!(matches!(events.try_recv().unwrap(), PushEvent::End));
}

#[test]
fn test_rejected_update_is_data() {
    let main = id(0x11);
    let (mut push, _events) = PushConversation::new(Vec::new(), config());
    push.receive(&advertisement("report-status", &[(main, "refs/heads/main")]))
        .unwrap();
    push.update("main", &History::new().commit(file_commit("f", "x", "m\n")))
        .unwrap();
    push.flush().unwrap();

    let mut report = PktLine::from_string("unpack ok\n").encode();
    report.extend(PktLine::from_string("ng refs/heads/main non-fast-forward\n").encode());
    report.extend(PktLine::Flush.encode());
    push.receive(&report).unwrap();

    let report = push.report().unwrap();
    assert!(!report.is_success());
    assert_eq!(
        report.commands[0].status,
        RefStatus::Rejected("non-fast-forward".to_string())
    );
}

#[test]
fn test_unpack_failure() {
    let main = id(0x11);
    let (mut push, _events) = PushConversation::new(Vec::new(), config());
    push.receive(&advertisement("report-status", &[(main, "refs/heads/main")]))
        .unwrap();
    push.update("main", &History::new().commit(file_commit("f", "x", "m\n")))
        .unwrap();
    push.flush().unwrap();

    let mut report = PktLine::from_string("unpack index-pack abnormal exit\n").encode();
    report.extend(PktLine::from_string("ng refs/heads/main unpacker error\n").encode());
    report.extend(PktLine::Flush.encode());
    push.receive(&report).unwrap();

    let report = push.take_report().unwrap();
    assert_eq!(
        report.unpack,
        UnpackStatus::Failed("index-pack abnormal exit".to_string())
    );
    assert!(!report.is_success());
}

#[test]
fn test_create_in_empty_repository() {
    let (mut push, _events) = PushConversation::new(Vec::new(), config());
    push.receive(&advertisement(
        "report-status delete-refs ofs-delta",
        &[(ObjectId::zero(), "capabilities^{}")],
    ))
    .unwrap();
    assert_eq!(push.state(), PushState::Discovered);
    assert!(push.refs().is_empty());

    let history = History::new().commit(file_commit("README", "hi", "root\n"));
    push.create("main", &history).unwrap();
    push.flush().unwrap();

    let (commands, pack) = split_request(push.writer());
    let tip = history.splice_onto(None).unwrap().tip;
    assert_eq!(
        commands[0],
        format!(
            "{} {} refs/heads/main\0report-status delete-refs ofs-delta\n",
            ObjectId::zero(),
            tip
        )
    );
    let objects = PackParser::new(&pack).parse().unwrap();
    let root = objects.iter().find(|o| o.id == tip).unwrap();
    assert!(root.parents().is_empty());

    let mut report = PktLine::from_string("unpack ok\n").encode();
    report.extend(PktLine::from_string("ok refs/heads/main\n").encode());
    report.extend(PktLine::Flush.encode());
    push.receive(&report).unwrap();
    assert!(push.report().unwrap().is_success());
}

#[test]
fn test_create_conflict_keeps_conversation_usable() {
    let main = id(0x42);
    let (mut push, _events) = PushConversation::new(Vec::new(), config());
    push.receive(&advertisement("report-status", &[(main, "refs/heads/main")]))
        .unwrap();

    let history = History::new().commit(file_commit("f", "x", "m\n"));
    assert!(matches!(
        push.create("main", &history),
        Err(GitError::RefConflict(_))
    ));
    assert!(push.writer().is_empty());
    assert_eq!(push.refs()["main"].object_id, main);

    push.create("topic", &history).unwrap();
    assert_eq!(push.commands().len(), 1);
    assert_eq!(push.commands()[0].ref_name, "refs/heads/topic");
}

#[test]
fn test_without_report_status() {
    let main = id(0x42);
    let (mut push, mut events) = PushConversation::new(Vec::new(), config());
    push.receive(&advertisement("ofs-delta", &[(main, "refs/heads/main")]))
        .unwrap();
    push.update("main", &History::new().commit(file_commit("f", "x", "m\n")))
        .unwrap();
    push.flush().unwrap();

    assert_eq!(push.state(), PushState::Pushed);
    let report = push.take_report().unwrap();
    assert_eq!(report.unpack, UnpackStatus::Unreported);
    assert!(report
        .commands
        .iter()
        .all(|c| c.status == RefStatus::Unreported));

    // Trailing server bytes are ignored once pushed.
    push.receive(b"0000").unwrap();
    let kinds: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|event| match event {
            PushEvent::Discover(_) => "discover",
            PushEvent::Pushed(_) => "pushed",
            PushEvent::End => "end",
        })
        .collect();
    assert_eq!(kinds, vec!["discover", "pushed", "end"]);
}

#[test]
fn test_handles_drive_updates() {
    let main = id(0x42);
    let (mut push, _events) = PushConversation::new(Vec::new(), config());
    push.receive(&advertisement(
        "report-status delete-refs",
        &[(main, "refs/heads/main"), (id(0x43), "refs/tags/v1")],
    ))
    .unwrap();

    let handles = push.handles();
    let tag = handles.iter().find(|h| h.name == "v1").unwrap();
    assert_eq!(tag.full_name(), "refs/tags/v1");
    push.delete_ref(tag).unwrap();
    assert_eq!(push.commands()[0].ref_name, "refs/tags/v1");
    assert!(matches!(push.del("v1"), Err(GitError::RefConflict(_))));
}

#[test]
fn test_garbage_status_fails() {
    let main = id(0x11);
    let (mut push, _events) = PushConversation::new(Vec::new(), config());
    push.receive(&advertisement("report-status", &[(main, "refs/heads/main")]))
        .unwrap();
    push.update("main", &History::new().commit(file_commit("f", "x", "m\n")))
        .unwrap();
    push.flush().unwrap();

    let result = push.receive(&PktLine::from_string("what\n").encode());
    assert!(matches!(result, Err(GitError::Protocol(_))));
    assert_eq!(push.state(), PushState::Failed);
    assert!(push.take_report().is_none());
}

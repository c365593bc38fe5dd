//! Async sessions over in-memory duplex streams.

use gitwire_protocol::{
    Channel, ConversationConfig, FetchEvent, FetchSession, GitError, GitObject, History,
    PackBuilder, PackParser, PendingCommit, PktLine, PktLineDecoder, PushSession, SideBandFrame,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const SIG: &str = "Erin <erin@example.com> 1700000000 +0000";

fn config(read_chunk_size: usize) -> ConversationConfig {
    let mut config = ConversationConfig::default();
    config.capabilities.agent = None;
    config.capabilities.ofs_delta = true;
    config.read_chunk_size = read_chunk_size;
    config
}

fn commit() -> Vec<GitObject> {
    let blob = GitObject::blob(b"async\n".to_vec());
    let tree = GitObject::tree([("100644", "file", blob.id)]);
    let commit = GitObject::commit(&tree.id, &[], SIG, SIG, "async\n");
    vec![blob, tree, commit]
}

fn pkt_lines(lines: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in lines {
        out.extend(PktLine::from_string(line).encode());
    }
    out.extend(PktLine::Flush.encode());
    out
}

/// Plays upload-pack: advertises, waits for `done`, replies.
async fn upload_pack(mut stream: DuplexStream, advertisement: Vec<u8>, response: Vec<u8>) -> Vec<u8> {
    stream.write_all(&advertisement).await.unwrap();
    let mut request = Vec::new();
    let mut buf = [0u8; 256];
    while request != b"0000" && !request.ends_with(b"0009done\n") {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
    }
    if request.ends_with(b"0009done\n") {
        stream.write_all(&response).await.unwrap();
    }
    request
}

/// Plays receive-pack: advertises, reads commands and pack, replies.
async fn receive_pack(mut stream: DuplexStream, advertisement: Vec<u8>, report: Vec<u8>) -> usize {
    stream.write_all(&advertisement).await.unwrap();

    let mut decoder = PktLineDecoder::new();
    let mut buf = [0u8; 256];
    let mut commands = 0;
    loop {
        match decoder.next_packet().unwrap() {
            Some(PktLine::Flush) => break,
            Some(PktLine::Data(_)) => commands += 1,
            None => {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before the command list ended");
                decoder.feed(&buf[..n]);
            }
        }
    }

    let mut pack = decoder.take_remaining().to_vec();
    let objects = loop {
        if let Ok(objects) = PackParser::new(&pack).parse() {
            break objects;
        }
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed before the pack ended");
        pack.extend_from_slice(&buf[..n]);
    };
    assert!(commands > 0);

    stream.write_all(&report).await.unwrap();
    objects.len()
}

#[tokio::test]
async fn test_fetch_session() {
    let objects = commit();
    let tip = objects[2].id;
    let advertisement = pkt_lines(&[
        format!("{} HEAD\0side-band-64k ofs-delta symref=HEAD:refs/heads/main\n", tip),
        format!("{} refs/heads/main\n", tip),
    ]);

    let mut builder = PackBuilder::new();
    for object in &objects {
        builder.add(object.clone());
    }
    let pack = builder.build().unwrap();
    let mut response = PktLine::from_string("NAK\n").encode();
    response.extend(SideBandFrame::new(Channel::Pack, pack).to_pkt_line().encode());
    response.extend(PktLine::Flush.encode());

    let (client, server) = tokio::io::duplex(1024);
    let server = tokio::spawn(upload_pack(server, advertisement, response));
    let (reader, writer) = tokio::io::split(client);

    let (mut session, mut events) = FetchSession::connect(reader, writer, config(5))
        .await
        .unwrap();
    assert_eq!(session.conversation().head(), Some("main"));
    session.conversation_mut().want("main").unwrap();
    let result = session.finish().await.unwrap().unwrap();

    assert_eq!(result.refs["main"].id, tip);
    assert_eq!(result.objects.len(), 3);

    let request = server.await.unwrap();
    let request = String::from_utf8_lossy(&request);
    assert!(request.starts_with(&format!("004awant {} side-band-64k ofs-delta\n", tip)));

    let mut kinds = Vec::new();
    while let Some(event) = events.recv().await {
        kinds.push(match event {
            FetchEvent::Discover(_) => "discover",
            FetchEvent::Progress(_) | FetchEvent::Error(_) => "text",
            FetchEvent::Fetched(_) => "fetched",
            FetchEvent::End => "end",
        });
    }
    assert_eq!(kinds, vec!["discover", "fetched", "end"]);
}

#[tokio::test]
async fn test_fetch_session_nothing_wanted() {
    let tip = commit()[2].id;
    let advertisement = pkt_lines(&[format!("{} refs/heads/main\0side-band-64k\n", tip)]);

    let (client, server) = tokio::io::duplex(1024);
    let server = tokio::spawn(upload_pack(server, advertisement, Vec::new()));
    let (reader, writer) = tokio::io::split(client);

    let (session, _events) = FetchSession::connect(reader, writer, config(64))
        .await
        .unwrap();
    assert!(session.finish().await.unwrap().is_none());
    assert_eq!(server.await.unwrap(), b"0000");
}

#[tokio::test]
async fn test_connect_fails_on_truncated_advertisement() {
    let (client, mut server) = tokio::io::duplex(1024);
    tokio::spawn(async move {
        server.write_all(b"003f0123").await.unwrap();
    });
    let (reader, writer) = tokio::io::split(client);

    let result = FetchSession::connect(reader, writer, config(64)).await;
    assert!(matches!(result, Err(GitError::UnexpectedEof(_))));
}

#[tokio::test]
async fn test_push_session() {
    let main = commit()[2].id;
    let advertisement = pkt_lines(&[format!(
        "{} refs/heads/main\0report-status delete-refs ofs-delta\n",
        main
    )]);
    let mut report = PktLine::from_string("unpack ok\n").encode();
    report.extend(PktLine::from_string("ok refs/heads/main\n").encode());
    report.extend(PktLine::Flush.encode());

    let (client, server) = tokio::io::duplex(1024);
    let server = tokio::spawn(receive_pack(server, advertisement, report));
    let (reader, writer) = tokio::io::split(client);

    let (mut session, _events) = PushSession::connect(reader, writer, config(7))
        .await
        .unwrap();

    let blob = GitObject::blob(b"second\n".to_vec());
    let tree = GitObject::tree([("100644", "file", blob.id)]);
    let history = History::new().commit(
        PendingCommit::new(tree.id, SIG, "second\n")
            .with_object(blob)
            .with_object(tree),
    );
    session.conversation_mut().update("main", &history).unwrap();

    let report = session.finish().await.unwrap().unwrap();
    assert!(report.is_success());
    assert_eq!(report.commands[0].ref_name, "refs/heads/main");
    assert_eq!(server.await.unwrap(), 3);
}

//! CLI command implementations.

use crate::transport::{self, Remote};
use gitwire_protocol::{
    ConversationConfig, FetchEvent, FetchSession, GitError, GitObject, History, PendingCommit,
    PushReport, PushSession, RefStatus, Service, UnpackStatus,
};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// CLI errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("push rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, CliError>;

/// List the refs a repository advertises.
pub async fn ls_remote(remote: &Remote, config: ConversationConfig) -> Result<()> {
    let connection = transport::connect(remote, Service::UploadPack).await?;
    let (session, _events) =
        FetchSession::connect(connection.reader, connection.writer, config).await?;

    let discovery = session.conversation().discovery().clone();
    session.finish().await?;
    transport::wait(connection.child).await?;

    for (name, advertised) in &discovery.refs {
        let full_name = advertised.kind.full_name(name);
        println!("{}\t{}", advertised.object_id, full_name);
        if let Some(peeled) = advertised.peeled {
            println!("{}\t{}^{{}}", peeled, full_name);
        }
    }
    if let Some(head) = &discovery.head {
        tracing::info!(head = %head, "HEAD resolves to branch");
    }
    Ok(())
}

/// Fetch refs and report what arrived. Without names, fetches HEAD's branch.
pub async fn fetch(remote: &Remote, refs: &[String], config: ConversationConfig) -> Result<()> {
    let connection = transport::connect(remote, Service::UploadPack).await?;
    let (mut session, mut events) =
        FetchSession::connect(connection.reader, connection.writer, config).await?;

    let progress = tokio::spawn(async move {
        let mut progress = RemoteLines::new("remote: ");
        let mut errors = RemoteLines::new("remote error: ");
        while let Some(event) = events.recv().await {
            let (lines, text) = match event {
                FetchEvent::Progress(text) => (&mut progress, text),
                FetchEvent::Error(text) => (&mut errors, text),
                _ => continue,
            };
            for line in lines.push(&text) {
                eprint!("{}", line);
            }
        }
        for line in [progress.finish(), errors.finish()].into_iter().flatten() {
            eprintln!("{}", line);
        }
    });

    let conversation = session.conversation_mut();
    if refs.is_empty() {
        let head = conversation
            .head()
            .map(str::to_string)
            .ok_or_else(|| GitError::UnknownRef("HEAD".to_string()))?;
        conversation.want(&head)?;
    } else {
        for name in refs {
            conversation.want(name)?;
        }
    }

    let result = session.finish().await?;
    transport::wait(connection.child).await?;
    if let Err(e) = progress.await {
        tracing::warn!(error = %e, "progress task failed");
    }

    let Some(result) = result else {
        println!("Nothing to fetch");
        return Ok(());
    };
    for (name, object) in &result.refs {
        println!("{} {} {}", object.id, object.object_type.as_str(), name);
    }
    for shallow in &result.shallow {
        println!("shallow {}", shallow);
    }
    println!("Received {} objects", result.objects.len());
    Ok(())
}

/// Commit a single file as the whole tree of `branch`, creating the branch
/// if it does not exist yet.
pub async fn commit_file(
    remote: &Remote,
    branch: &str,
    file: &Path,
    message: &str,
    author: &str,
    config: ConversationConfig,
) -> Result<()> {
    let content = tokio::fs::read(file).await?;
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string();
    let history = single_file_history(&name, content, message, &signature(author, now()));

    let connection = transport::connect(remote, Service::ReceivePack).await?;
    let (mut session, _events) =
        PushSession::connect(connection.reader, connection.writer, config).await?;

    let conversation = session.conversation_mut();
    if conversation.refs().contains_key(branch) {
        conversation.update(branch, &history)?;
    } else {
        conversation.create(branch, &history)?;
    }

    let report = session.finish().await?;
    transport::wait(connection.child).await?;
    print_report(report)
}

/// Delete a branch or tag.
pub async fn delete(remote: &Remote, name: &str, config: ConversationConfig) -> Result<()> {
    let connection = transport::connect(remote, Service::ReceivePack).await?;
    let (mut session, _events) =
        PushSession::connect(connection.reader, connection.writer, config).await?;

    session.conversation_mut().del(name)?;

    let report = session.finish().await?;
    transport::wait(connection.child).await?;
    print_report(report)
}

/// Reassembles side-band text into prefixed lines. Chunks may split a line
/// anywhere; `\r` ends a line so progress counters redraw in place.
struct RemoteLines {
    prefix: &'static str,
    pending: String,
}

impl RemoteLines {
    fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            pending: String::new(),
        }
    }

    fn push(&mut self, text: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for c in text.chars() {
            self.pending.push(c);
            if c == '\n' || c == '\r' {
                lines.push(format!("{}{}", self.prefix, self.pending));
                self.pending.clear();
            }
        }
        lines
    }

    /// Returns any unterminated trailing text.
    fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then(|| format!("{}{}", self.prefix, self.pending))
    }
}

fn print_report(report: Option<PushReport>) -> Result<()> {
    let Some(report) = report else {
        println!("Everything up-to-date");
        return Ok(());
    };

    if let UnpackStatus::Failed(reason) = &report.unpack {
        return Err(CliError::Rejected(format!("unpack failed: {}", reason)));
    }
    for command in &report.commands {
        match &command.status {
            RefStatus::Ok => println!("ok {}", command.ref_name),
            RefStatus::Unreported => println!("sent {}", command.ref_name),
            RefStatus::Rejected(reason) => println!("! {} ({})", command.ref_name, reason),
        }
    }

    let rejected: Vec<&str> = report.rejected().map(|(name, _)| name).collect();
    if rejected.is_empty() {
        Ok(())
    } else {
        Err(CliError::Rejected(rejected.join(", ")))
    }
}

fn single_file_history(name: &str, content: Vec<u8>, message: &str, signature: &str) -> History {
    let blob = GitObject::blob(content);
    let tree = GitObject::tree([("100644", name, blob.id)]);
    let mut message = message.to_string();
    if !message.ends_with('\n') {
        message.push('\n');
    }
    History::new().commit(
        PendingCommit::new(tree.id, signature, message)
            .with_object(blob)
            .with_object(tree),
    )
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Formats an author line: `Name <email> <seconds> +0000`.
fn signature(author: &str, timestamp: u64) -> String {
    format!("{} {} +0000", author, timestamp)
}

use anyhow::Context;
use campus_chat_engine::{
    init_tracing, AppConfig, Backends, ChatSession, ChatView, ConversationResolver, LocalBackend,
    SendError, SendRequest, SyncConfig,
};
use campus_chat_messaging::{Message, MessageId};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    let backend = Arc::new(LocalBackend::open(&config.data_dir)?);
    backend.faults().set_latency(config.simulated_latency);
    let backends = Backends::from_local(backend.clone());

    let resolver = ConversationResolver::new(backends.clone(), config.user.clone());
    let conversation_id = resolver
        .resolve(&config.target)
        .await
        .with_context(|| format!("failed to resolve {:?}", config.target))?;
    info!(%conversation_id, user_id = %config.user.id, "starting campus chat");

    let session = ChatSession::open(
        conversation_id,
        config.user.clone(),
        backends,
        SyncConfig::default(),
    )
    .await;

    let mut view = session.view();
    let printer = tokio::spawn(async move {
        while view.changed().await.is_ok() {
            let snapshot = view.borrow_and_update().clone();
            render(&snapshot);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse(line) {
            Input::Quit => break,
            Input::Typing => session.notify_typing().await?,
            Input::Text(text) => submit(&session, SendRequest::text(text)).await,
            Input::Image { path, caption } => {
                submit(&session, SendRequest::image(path, caption)).await
            }
            Input::Like(n) => match nth_message(&session, n) {
                Some(id) => {
                    session.press(&id).await?;
                    session.press(&id).await?;
                }
                None => warn!(n, "no such message"),
            },
            Input::Unsend(n) => match nth_message(&session, n) {
                Some(id) => {
                    if let Err(err) = session.unsend(&id).await {
                        warn!(%err, "unsend failed");
                    }
                }
                None => warn!(n, "no such message"),
            },
            Input::Retry(n) => match nth_message(&session, n) {
                Some(id) => match session.retry(&id).await {
                    Ok(pending) => watch_outcome(pending),
                    Err(err) => warn!(%err, "retry rejected"),
                },
                None => warn!(n, "no such message"),
            },
            Input::Older => {
                let added = session.load_older().await?;
                info!(added, "older messages loaded");
            }
            Input::Unknown(command) => warn!(command, "unknown command"),
        }
    }

    session.close().await;
    printer.abort();
    backend.flush().await?;
    Ok(())
}

enum Input<'a> {
    Text(&'a str),
    Image { path: &'a str, caption: &'a str },
    Typing,
    Like(usize),
    Unsend(usize),
    Retry(usize),
    Older,
    Quit,
    Unknown(&'a str),
}

fn parse(line: &str) -> Input<'_> {
    let Some(command) = line.strip_prefix('/') else {
        return Input::Text(line);
    };
    let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
    match (name, arg.trim().parse::<usize>().ok()) {
        ("quit", _) => Input::Quit,
        ("older", _) => Input::Older,
        ("typing", _) => Input::Typing,
        ("img", _) if !arg.trim().is_empty() => {
            let (path, caption) = arg.trim().split_once(' ').unwrap_or((arg.trim(), ""));
            Input::Image {
                path,
                caption: caption.trim(),
            }
        }
        ("like", Some(n)) => Input::Like(n),
        ("unsend", Some(n)) => Input::Unsend(n),
        ("retry", Some(n)) => Input::Retry(n),
        _ => Input::Unknown(line),
    }
}

async fn submit(session: &ChatSession, request: SendRequest) {
    match session.send(request).await {
        Ok(pending) => watch_outcome(pending),
        Err(err) => warn!(%err, "message not sent"),
    }
}

fn watch_outcome(pending: campus_chat_engine::PendingSend) {
    tokio::spawn(async move {
        let temp_id = pending.temp_id().clone();
        match pending.outcome().await {
            Ok(_) => {}
            Err(SendError::Upload { reason, restored }) => {
                warn!(%temp_id, %reason, "attachment upload failed");
                let path = restored
                    .attachment
                    .map(|attachment| attachment.local_uri)
                    .unwrap_or_default();
                println!("    upload failed, your input was: /img {path} {}", restored.text);
            }
            Err(err) => warn!(%temp_id, %err, "send failed"),
        }
    });
}

fn nth_message(session: &ChatSession, n: usize) -> Option<MessageId> {
    let view = session.snapshot();
    n.checked_sub(1)
        .and_then(|index| view.messages.get(index))
        .map(|message| message.id.clone())
}

fn render(view: &ChatView) {
    println!("--- {} ---", view.conversation_id);
    for (index, message) in view.messages.iter().enumerate() {
        println!("{:>3} {}", index + 1, line_for(view, message));
    }
    if let Some(label) = view.typing_label() {
        println!("    {label}");
    }
}

fn line_for(view: &ChatView, message: &Message) -> String {
    let content = if message.is_unsent() {
        "(message unsent)".to_owned()
    } else {
        message.content.clone()
    };
    let mut line = format!("[{}] {}", message.sender_id, content);
    let hearts = view.reaction_count(&message.id);
    if hearts > 0 {
        line.push_str(&format!("  ♥ {hearts}"));
    }
    if let Some(advisory) = message.advisory() {
        line.push_str(&format!("  ! {advisory}"));
    } else if message.is_optimistic() {
        line.push_str("  …");
    }
    line
}

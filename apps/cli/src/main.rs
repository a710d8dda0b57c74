use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    load_settings, message_status, sender_directory, ChatClient, ClientEvent, KindFilter,
    MessageRecord, RosterFilter, Session,
};
use shared::domain::{ConversationId, MessageId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides server_url from chat.toml / CHAT_SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let client = ChatClient::start(
        settings,
        Session {
            user_id: UserId(args.user_id),
            display_name: args.display_name,
            token: args.token,
        },
    )?;

    if let Err(err) = client.refresh_roster().await {
        warn!("initial roster load failed: {err}");
    }

    spawn_event_printer(&client);
    print_help();

    let mut filter = RosterFilter::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = dispatch(&client, &mut filter, line).await {
            println!("error: {err}");
        }
    }

    client.shutdown();
    Ok(())
}

fn spawn_event_printer(client: &Arc<ChatClient>) {
    let client = Arc::clone(client);
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&client, event).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("dropped {skipped} UI notifications");
                }
                Err(_) => break,
            }
        }
    });
}

async fn print_event(client: &ChatClient, event: ClientEvent) {
    match event {
        ClientEvent::ScrollToBottom { .. } => {
            if let Some(view) = client.conversation_view().await {
                let directory = sender_directory(&view.messages);
                if let Some(record) = view.messages.last() {
                    println!(
                        "{}",
                        format_message(client, record, &view.participants, &directory)
                    );
                }
            }
        }
        ClientEvent::UnseenChanged {
            conversation_id,
            unseen,
            total_unread,
        } => {
            if unseen > 0 {
                println!(
                    "[{}] {unseen} new message(s), {total_unread} unread in total",
                    conversation_id.0
                );
            }
        }
        ClientEvent::SendFailed { reason, .. } => println!("send failed: {reason}"),
        ClientEvent::Notice(notice) => println!("notice: {notice}"),
        ClientEvent::ConversationOpened { conversation_id } => {
            println!("opened conversation {}", conversation_id.0);
        }
        ClientEvent::RosterChanged | ClientEvent::MessagesChanged { .. } => {}
    }
}

fn print_help() {
    println!("commands:");
    println!("  /chats [query]      list conversations (current filter)");
    println!("  /filter all|direct|group [archived]");
    println!("  /open <id>          open a conversation");
    println!("  /messages           render the open conversation");
    println!("  /close              close the chat surface");
    println!("  /edit <msg> <text>  edit one of your messages");
    println!("  /delete <msg>       delete for everyone");
    println!("  /hide <msg>         hide for me only");
    println!("  /top | /bottom      move the viewport");
    println!("  /dm <user>          open a direct conversation");
    println!("  /group <name> <user,user,...>");
    println!("  /invite <id> <user,user,...>");
    println!("  /leave <id> | /delgroup <id> | /rm <id>");
    println!("  /pin <id> | /unpin <id> | /archive <id> | /unarchive <id>");
    println!("  /quit");
    println!("anything not starting with '/' is sent as a message");
}

async fn dispatch(client: &Arc<ChatClient>, filter: &mut RosterFilter, line: &str) -> Result<()> {
    if !line.starts_with('/') {
        client.send_text(line).await?;
        return Ok(());
    }

    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "/chats" => {
            filter.query = rest.to_string();
            render_roster(client, filter).await;
        }
        "/filter" => {
            let mut parts = rest.split_whitespace();
            filter.kind = match parts.next() {
                Some("direct") => KindFilter::Direct,
                Some("group") => KindFilter::Group,
                _ => KindFilter::All,
            };
            filter.archived = parts.next() == Some("archived");
            render_roster(client, filter).await;
        }
        "/open" => {
            client
                .open_conversation(ConversationId(rest.parse()?))
                .await?;
            render_conversation(client).await;
        }
        "/messages" => render_conversation(client).await,
        "/close" => client.close_conversation().await,
        "/edit" => {
            let (id, text) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow::anyhow!("usage: /edit <msg> <text>"))?;
            client
                .edit_message(MessageId(id.trim().parse()?), text)
                .await?;
        }
        "/delete" => client.delete_for_all(MessageId(rest.parse()?)).await?,
        "/hide" => client.hide_for_me(MessageId(rest.parse()?)).await?,
        "/top" => client.set_viewport_at_bottom(false).await,
        "/bottom" => client.set_viewport_at_bottom(true).await,
        "/dm" => {
            client.create_direct(UserId(rest.parse()?)).await?;
        }
        "/group" => {
            let (name, members) = rest
                .rsplit_once(' ')
                .ok_or_else(|| anyhow::anyhow!("usage: /group <name> <user,user,...>"))?;
            client.create_group(name, parse_users(members)?).await?;
        }
        "/invite" => {
            let (id, members) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow::anyhow!("usage: /invite <id> <user,user,...>"))?;
            client
                .add_members(ConversationId(id.trim().parse()?), parse_users(members)?)
                .await?;
        }
        "/leave" => client.leave_group(ConversationId(rest.parse()?)).await?,
        "/delgroup" => client.delete_group(ConversationId(rest.parse()?)).await?,
        "/rm" => client.remove_local(ConversationId(rest.parse()?)).await,
        "/pin" => client.set_pinned(ConversationId(rest.parse()?), true).await?,
        "/unpin" => client.set_pinned(ConversationId(rest.parse()?), false).await?,
        "/archive" => {
            client
                .set_archived(ConversationId(rest.parse()?), true)
                .await?
        }
        "/unarchive" => {
            client
                .set_archived(ConversationId(rest.parse()?), false)
                .await?
        }
        other => println!("unknown command {other}; /quit to exit"),
    }
    Ok(())
}

fn parse_users(raw: &str) -> Result<Vec<UserId>> {
    raw.split(',')
        .map(|part| Ok(UserId(part.trim().parse()?)))
        .collect()
}

async fn render_roster(client: &ChatClient, filter: &RosterFilter) {
    let entries = client.roster_snapshot(filter).await;
    if entries.is_empty() {
        println!("(no conversations)");
        return;
    }
    for entry in entries {
        let pin = if entry.pinned { "*" } else { " " };
        let unseen = if entry.unseen > 0 {
            format!(" ({} new)", entry.unseen)
        } else {
            String::new()
        };
        let preview = match &entry.last_message {
            Some(preview) if preview.deleted => "message deleted".to_string(),
            Some(preview) if preview.content.is_empty() && preview.has_voice_note => {
                "voice note".to_string()
            }
            Some(preview) => preview.content.clone(),
            None => "no messages yet".to_string(),
        };
        println!(
            "{pin}[{}] {}{} - {}",
            entry.conversation_id.0,
            entry.title(client.session().user_id),
            unseen,
            preview
        );
    }
}

async fn render_conversation(client: &ChatClient) {
    let Some(view) = client.conversation_view().await else {
        println!("(no open conversation)");
        return;
    };
    println!("== {} ==", view.title);
    let directory = sender_directory(&view.messages);
    for record in &view.messages {
        println!(
            "{}",
            format_message(client, record, &view.participants, &directory)
        );
    }
    if view.unseen > 0 {
        println!("-- {} new message(s) below --", view.unseen);
    }
}

fn format_message(
    client: &ChatClient,
    record: &MessageRecord,
    participants: &[shared::domain::ParticipantSummary],
    directory: &std::collections::HashMap<UserId, String>,
) -> String {
    let me = client.session().user_id;
    let who = if record.sender_id == me {
        "me".to_string()
    } else {
        directory
            .get(&record.sender_id)
            .cloned()
            .or_else(|| {
                participants
                    .iter()
                    .find(|p| p.user_id == record.sender_id)
                    .map(|p| p.display_name.clone())
            })
            .unwrap_or_else(|| format!("user {}", record.sender_id.0))
    };

    let id = match record.server_id() {
        Some(id) => format!("#{}", id.0),
        None => "(pending)".to_string(),
    };

    if record.deleted {
        return format!("{id} {who}: [message deleted]");
    }

    let mut line = format!("{id} {who}: {}", record.content);
    if let Some(url) = &record.voice_note_url {
        line.push_str(&format!(" [voice note {url}]"));
    }
    if record.edited() {
        line.push_str(" (edited)");
    }
    if record.sender_id == me {
        line.push_str(&format!(" [{}]", message_status(record, participants)));
    }
    line
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocketUpgrade},
        Path, State,
    },
    routing::{get, post},
    Json, Router,
};
use tokio::{net::TcpListener, time::timeout};

use super::*;

fn session() -> Session {
    Session {
        user_id: UserId(1),
        display_name: "Ana Ruiz".into(),
        token: "test-token".into(),
    }
}

fn test_client_with_server(server_url: &str, socket: SocketHandle) -> Arc<ChatClient> {
    let settings = ClientSettings {
        server_url: server_url.into(),
        ..ClientSettings::default()
    };
    let api = ChatApi::new(&settings, "test-token").expect("api");
    ChatClient::assemble(api, session(), socket)
}

fn test_client() -> Arc<ChatClient> {
    // Port 9 is discard; nothing in these tests should reach the network.
    test_client_with_server("http://127.0.0.1:9", SocketHandle::detached())
}

fn direct_summary(id: i64) -> ConversationSummary {
    ConversationSummary {
        conversation_id: ConversationId(id),
        kind: shared::domain::ConversationKind::Direct,
        name: None,
        participants: vec![
            ParticipantSummary {
                user_id: UserId(1),
                display_name: "Ana Ruiz".into(),
            },
            ParticipantSummary {
                user_id: UserId(2),
                display_name: "Bram Okafor".into(),
            },
        ],
        admin_id: None,
        pinned: false,
        archived: false,
        last_message: None,
        created_at: Utc::now(),
    }
}

fn group_summary(id: i64, admin: i64) -> ConversationSummary {
    ConversationSummary {
        conversation_id: ConversationId(id),
        kind: shared::domain::ConversationKind::Group,
        name: Some("deal room".into()),
        participants: vec![
            ParticipantSummary {
                user_id: UserId(1),
                display_name: "Ana Ruiz".into(),
            },
            ParticipantSummary {
                user_id: UserId(2),
                display_name: "Bram Okafor".into(),
            },
            ParticipantSummary {
                user_id: UserId(3),
                display_name: "Chiara Neri".into(),
            },
        ],
        admin_id: Some(UserId(admin)),
        pinned: false,
        archived: false,
        last_message: None,
        created_at: Utc::now(),
    }
}

fn payload(conversation: i64, message_id: i64, sender: i64, content: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(message_id),
        conversation_id: ConversationId(conversation),
        sender_id: UserId(sender),
        sender_name: None,
        content: content.into(),
        voice_note_url: None,
        is_deleted: false,
        created_at: Utc::now(),
        edited_at: None,
        delivered_to: Vec::new(),
        read_by: Vec::new(),
    }
}

async fn seed_open(client: &Arc<ChatClient>, summary: &ConversationSummary) {
    let mut state = client.inner.lock().await;
    state.roster.upsert(summary);
    state.active = Some(ActiveConversation::new(summary.conversation_id));
}

fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn optimistic_send_appends_a_pending_record() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;

    let temp_id = client.send_text("  hello there  ").await.expect("send");

    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.messages.len(), 1);
    let record = &view.messages[0];
    assert_eq!(record.identity, MessageIdentity::Pending(temp_id));
    assert_eq!(record.content, "hello there");
    assert_eq!(record.sender_id, UserId(1));
    assert!(record.delivered_to.is_empty() && record.read_by.is_empty());
    assert_eq!(
        message_status(record, &view.participants),
        DeliveryStatus::Sending
    );
}

#[tokio::test]
async fn empty_send_is_rejected_without_touching_state() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;

    assert!(client.send_text("   ").await.is_err());
    let view = client.conversation_view().await.expect("view");
    assert!(view.messages.is_empty());
}

#[tokio::test]
async fn success_ack_swaps_the_pending_record_in_place() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;

    let temp_id = client.send_text("hello").await.expect("send");
    client.send_text("second").await.expect("send");

    let mut confirmed = payload(7, 42, 1, "hello");
    confirmed.sender_name = Some("Ana Ruiz".into());
    client
        .apply_server_event(ServerEvent::SendAck {
            ok: true,
            temp_id: temp_id.clone(),
            message: Some(confirmed),
            error: None,
        })
        .await;

    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.messages.len(), 2);
    // Position preserved: the acknowledged message stays first.
    assert_eq!(view.messages[0].server_id(), Some(MessageId(42)));
    assert_eq!(view.messages[0].content, "hello");
    assert_eq!(
        message_status(&view.messages[0], &view.participants),
        DeliveryStatus::Sent
    );
    assert!(view.messages[1].is_pending());

    // A duplicate ack finds no matching temp id and is a no-op.
    client
        .apply_server_event(ServerEvent::SendAck {
            ok: true,
            temp_id,
            message: Some(payload(7, 42, 1, "hello")),
            error: None,
        })
        .await;
    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.messages.len(), 2);
}

#[tokio::test]
async fn failure_ack_removes_the_pending_record() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;
    let mut events = client.subscribe_events();

    let temp_id = client.send_text("doomed").await.expect("send");
    drain(&mut events);

    client
        .apply_server_event(ServerEvent::SendAck {
            ok: false,
            temp_id: temp_id.clone(),
            message: None,
            error: Some("quota exceeded".into()),
        })
        .await;

    let view = client.conversation_view().await.expect("view");
    assert!(view.messages.is_empty());
    let emitted = drain(&mut events);
    assert!(emitted.iter().any(|event| matches!(
        event,
        ClientEvent::SendFailed { temp_id: t, reason } if *t == temp_id && reason == "quota exceeded"
    )));
}

#[tokio::test]
async fn new_message_events_are_idempotent() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;

    let message = payload(7, 5, 2, "ping");
    client
        .apply_server_event(ServerEvent::MessageNew {
            message: message.clone(),
        })
        .await;
    client
        .apply_server_event(ServerEvent::MessageNew { message })
        .await;

    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].server_id(), Some(MessageId(5)));
    assert_eq!(view.messages[0].content, "ping");
}

#[tokio::test]
async fn own_echo_before_ack_still_leaves_one_record() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;

    let temp_id = client.send_text("hello").await.expect("send");
    // The broadcast echo of our own message wins the race against the ack.
    client
        .apply_server_event(ServerEvent::MessageNew {
            message: payload(7, 42, 1, "hello"),
        })
        .await;
    client
        .apply_server_event(ServerEvent::SendAck {
            ok: true,
            temp_id,
            message: Some(payload(7, 42, 1, "hello")),
            error: None,
        })
        .await;

    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].server_id(), Some(MessageId(42)));
}

#[tokio::test]
async fn read_watermark_is_inclusive_and_stops_at_the_mark() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;

    for (id, content) in [(1, "a"), (2, "b"), (3, "c")] {
        client
            .apply_server_event(ServerEvent::MessageNew {
                message: payload(7, id, 1, content),
            })
            .await;
    }

    client
        .apply_server_event(ServerEvent::MessageRead {
            conversation_id: ConversationId(7),
            reader_id: UserId(2),
            up_to_message_id: MessageId(2),
        })
        .await;

    let view = client.conversation_view().await.expect("view");
    assert!(view.messages[0].read_by.contains(&UserId(2)));
    assert!(view.messages[1].read_by.contains(&UserId(2)));
    assert!(!view.messages[2].read_by.contains(&UserId(2)));
    assert_eq!(
        message_status(&view.messages[0], &view.participants),
        DeliveryStatus::Read
    );
    assert_eq!(
        message_status(&view.messages[2], &view.participants),
        DeliveryStatus::Sent
    );
}

#[tokio::test]
async fn delivery_receipts_support_both_shapes() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;
    client
        .apply_server_event(ServerEvent::MessageNew {
            message: payload(7, 1, 1, "a"),
        })
        .await;
    client
        .apply_server_event(ServerEvent::MessageNew {
            message: payload(7, 2, 1, "b"),
        })
        .await;

    client
        .apply_server_event(ServerEvent::MessageDelivered {
            conversation_id: ConversationId(7),
            message_id: MessageId(1),
            recipient_id: UserId(2),
        })
        .await;
    let view = client.conversation_view().await.expect("view");
    assert_eq!(
        message_status(&view.messages[0], &view.participants),
        DeliveryStatus::Delivered
    );
    assert_eq!(
        message_status(&view.messages[1], &view.participants),
        DeliveryStatus::Sent
    );

    client
        .apply_server_event(ServerEvent::MessageDeliveredBulk {
            conversation_id: ConversationId(7),
            recipient_id: UserId(2),
        })
        .await;
    let view = client.conversation_view().await.expect("view");
    assert_eq!(
        message_status(&view.messages[1], &view.participants),
        DeliveryStatus::Delivered
    );
}

#[tokio::test]
async fn hide_for_me_never_touches_another_clients_copy() {
    let alice = test_client();
    let bob = test_client_with_server("http://127.0.0.1:9", SocketHandle::detached());
    seed_open(&alice, &direct_summary(7)).await;
    seed_open(&bob, &direct_summary(7)).await;

    for client in [&alice, &bob] {
        client
            .apply_server_event(ServerEvent::MessageNew {
                message: payload(7, 1, 2, "keep"),
            })
            .await;
        client
            .apply_server_event(ServerEvent::MessageNew {
                message: payload(7, 2, 2, "hide me"),
            })
            .await;
    }

    alice.hide_for_me(MessageId(2)).await.expect("hide");

    let alice_view = alice.conversation_view().await.expect("view");
    assert_eq!(alice_view.messages.len(), 1);
    assert_eq!(alice_view.messages[0].server_id(), Some(MessageId(1)));

    // No broadcast exists for hides, so the other client's copy is intact.
    let bob_view = bob.conversation_view().await.expect("view");
    assert_eq!(bob_view.messages.len(), 2);
}

#[tokio::test]
async fn delete_for_everyone_keeps_the_record_as_a_placeholder() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;
    let mut message = payload(7, 4, 2, "offensive");
    message.voice_note_url = Some("https://files.example.com/v/4.ogg".into());
    let sent_at = message.created_at;
    client
        .apply_server_event(ServerEvent::MessageNew { message })
        .await;

    client
        .apply_server_event(ServerEvent::MessageDeleted {
            conversation_id: ConversationId(7),
            message_id: MessageId(4),
            last_message: None,
        })
        .await;

    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.messages.len(), 1);
    let record = &view.messages[0];
    assert!(record.deleted);
    assert!(record.content.is_empty());
    assert!(record.voice_note_url.is_none());
    assert_eq!(record.created_at, sent_at);
}

#[tokio::test]
async fn edit_event_merges_content_and_marks_edited() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;
    client
        .apply_server_event(ServerEvent::MessageNew {
            message: payload(7, 4, 2, "teh fix"),
        })
        .await;

    let mut edited = payload(7, 4, 2, "the fix");
    edited.edited_at = Some(Utc::now());
    client
        .apply_server_event(ServerEvent::MessageEdited {
            conversation_id: ConversationId(7),
            message: edited,
        })
        .await;

    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.messages[0].content, "the fix");
    assert!(view.messages[0].edited());
}

#[tokio::test]
async fn message_at_bottom_scrolls_and_keeps_unseen_at_zero() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;
    let mut events = client.subscribe_events();

    client
        .apply_server_event(ServerEvent::MessageNew {
            message: payload(7, 9, 2, "fresh"),
        })
        .await;

    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.unseen, 0);
    let emitted = drain(&mut events);
    assert!(emitted
        .iter()
        .any(|event| matches!(event, ClientEvent::ScrollToBottom { .. })));
}

#[tokio::test]
async fn message_while_scrolled_up_bumps_unseen_without_scrolling() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;
    client.set_viewport_at_bottom(false).await;
    let mut events = client.subscribe_events();

    client
        .apply_server_event(ServerEvent::MessageNew {
            message: payload(7, 9, 2, "fresh"),
        })
        .await;

    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.unseen, 1);
    let emitted = drain(&mut events);
    assert!(!emitted
        .iter()
        .any(|event| matches!(event, ClientEvent::ScrollToBottom { .. })));
    assert!(emitted.iter().any(|event| matches!(
        event,
        ClientEvent::UnseenChanged { unseen: 1, .. }
    )));
}

#[tokio::test]
async fn returning_to_the_bottom_clears_unseen_and_advances_the_watermark() {
    let (socket, mut commands) = SocketHandle::capture();
    let client = test_client_with_server("http://127.0.0.1:9", socket);
    seed_open(&client, &direct_summary(7)).await;
    client.set_viewport_at_bottom(false).await;
    client
        .apply_server_event(ServerEvent::MessageNew {
            message: payload(7, 9, 2, "fresh"),
        })
        .await;

    client.set_viewport_at_bottom(true).await;

    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.unseen, 0);
    let mut sent = Vec::new();
    while let Ok(command) = commands.try_recv() {
        sent.push(command);
    }
    assert!(sent.contains(&ClientCommand::ReadMessages {
        conversation_id: ConversationId(7),
        up_to_message_id: MessageId(9),
    }));
}

#[tokio::test]
async fn background_message_updates_preview_and_unseen_only() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;
    {
        let mut state = client.inner.lock().await;
        state.roster.upsert(&direct_summary(8));
    }

    client
        .apply_server_event(ServerEvent::MessageNew {
            message: payload(8, 50, 2, "psst"),
        })
        .await;

    // The open conversation's list is untouched; the other entry gains a
    // preview and an unseen tick. The body is not retained anywhere.
    let view = client.conversation_view().await.expect("view");
    assert!(view.messages.is_empty());
    let state = client.inner.lock().await;
    let entry = state.roster.get(ConversationId(8)).expect("entry");
    assert_eq!(entry.unseen, 1);
    assert_eq!(
        entry.last_message.as_ref().map(|p| p.content.as_str()),
        Some("psst")
    );
    assert_eq!(state.roster.total_unread(), 1);
}

#[tokio::test]
async fn own_background_echo_does_not_count_as_unread() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;
    {
        let mut state = client.inner.lock().await;
        state.roster.upsert(&direct_summary(8));
    }

    client
        .apply_server_event(ServerEvent::MessageNew {
            message: payload(8, 50, 1, "sent from my phone"),
        })
        .await;

    let state = client.inner.lock().await;
    assert_eq!(state.roster.get(ConversationId(8)).map(|e| e.unseen), Some(0));
}

#[tokio::test]
async fn conversation_deleted_event_closes_and_forgets() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;

    client
        .apply_server_event(ServerEvent::ConversationDeleted {
            conversation_id: ConversationId(7),
        })
        .await;

    assert!(client.conversation_view().await.is_none());
    let state = client.inner.lock().await;
    assert!(!state.roster.contains(ConversationId(7)));
}

#[tokio::test]
async fn membership_update_changes_receipt_expectations() {
    let client = test_client();
    seed_open(&client, &group_summary(7, 1)).await;
    client
        .apply_server_event(ServerEvent::MessageNew {
            message: payload(7, 1, 1, "hi all"),
        })
        .await;
    client
        .apply_server_event(ServerEvent::MessageRead {
            conversation_id: ConversationId(7),
            reader_id: UserId(2),
            up_to_message_id: MessageId(1),
        })
        .await;

    let view = client.conversation_view().await.expect("view");
    assert_eq!(
        message_status(&view.messages[0], &view.participants),
        DeliveryStatus::Sent
    );

    // Member 3 leaves; everyone remaining has read the message.
    let mut shrunk = group_summary(7, 1);
    shrunk.participants.retain(|p| p.user_id != UserId(3));
    client
        .apply_server_event(ServerEvent::ConversationUpdated {
            conversation: shrunk,
        })
        .await;

    let view = client.conversation_view().await.expect("view");
    assert_eq!(
        message_status(&view.messages[0], &view.participants),
        DeliveryStatus::Read
    );
}

#[tokio::test]
async fn admin_guard_rejects_member_add_before_any_request() {
    let client = test_client();
    seed_open(&client, &group_summary(7, 2)).await;

    let err = client
        .add_members(ConversationId(7), vec![UserId(9)])
        .await
        .expect_err("must be rejected");
    match err.downcast_ref::<ChatError>() {
        Some(ChatError::AdminRequired(_)) => {}
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn opening_switches_subscriptions_and_replays_on_reconnect() {
    let server_url = spawn_history_server(None).await;
    let (socket, mut commands) = SocketHandle::capture();
    let client = test_client_with_server(&server_url, socket);
    {
        let mut state = client.inner.lock().await;
        state.roster.upsert(&direct_summary(1));
        state.roster.upsert(&direct_summary(2));
    }

    client
        .open_conversation(ConversationId(1))
        .await
        .expect("open 1");
    client
        .open_conversation(ConversationId(2))
        .await
        .expect("open 2");
    client
        .handle_socket_event(SocketEvent::Connected)
        .await;

    let mut sent = Vec::new();
    while let Ok(command) = commands.try_recv() {
        sent.push(command);
    }
    assert!(sent.contains(&ClientCommand::Subscribe {
        conversation_id: ConversationId(1),
    }));
    assert!(sent.contains(&ClientCommand::Unsubscribe {
        conversation_id: ConversationId(1),
    }));
    assert!(sent.contains(&ClientCommand::Subscribe {
        conversation_id: ConversationId(2),
    }));
    // Re-subscription replay after the reconnect targets the open thread.
    assert_eq!(
        sent.last(),
        Some(&ClientCommand::Subscribe {
            conversation_id: ConversationId(2),
        })
    );
}

#[tokio::test]
async fn stale_history_fetch_never_overwrites_the_newer_conversation() {
    let server_url = spawn_history_server(Some(1)).await;
    let client = test_client_with_server(&server_url, SocketHandle::detached());
    {
        let mut state = client.inner.lock().await;
        state.roster.upsert(&direct_summary(1));
        state.roster.upsert(&direct_summary(2));
    }

    let slow = Arc::clone(&client);
    let slow_open = tokio::spawn(async move { slow.open_conversation(ConversationId(1)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    client
        .open_conversation(ConversationId(2))
        .await
        .expect("open 2");
    slow_open.await.expect("join").expect("open 1");

    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.conversation_id, ConversationId(2));
    assert!(view
        .messages
        .iter()
        .all(|record| record.content != "stale history"));
}

#[tokio::test]
async fn open_conversation_loads_history_and_marks_it_read() {
    let server_url = spawn_history_server(None).await;
    let (socket, mut commands) = SocketHandle::capture();
    let client = test_client_with_server(&server_url, socket);
    {
        let mut state = client.inner.lock().await;
        state.roster.upsert(&direct_summary(2));
        state.roster.bump_unseen(ConversationId(2));
    }

    client
        .open_conversation(ConversationId(2))
        .await
        .expect("open");

    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.messages.len(), 2);
    assert_eq!(view.unseen, 0);
    let mut sent = Vec::new();
    while let Ok(command) = commands.try_recv() {
        sent.push(command);
    }
    assert!(sent.contains(&ClientCommand::ReadMessages {
        conversation_id: ConversationId(2),
        up_to_message_id: MessageId(2),
    }));
}

#[tokio::test]
async fn roster_refresh_keeps_unseen_and_honors_local_removal() {
    let server_url = spawn_roster_server().await;
    let client = test_client_with_server(&server_url, SocketHandle::detached());
    {
        let mut state = client.inner.lock().await;
        state.roster.upsert(&direct_summary(1));
        state.roster.bump_unseen(ConversationId(1));
    }
    client.remove_local(ConversationId(2)).await;

    client.refresh_roster().await.expect("refresh");

    let state = client.inner.lock().await;
    assert_eq!(state.roster.get(ConversationId(1)).map(|e| e.unseen), Some(1));
    // Conversation 2 is still listed by the server but stays hidden here.
    assert!(!state.roster.contains(ConversationId(2)));
}

#[tokio::test]
async fn voice_note_upload_produces_an_optimistic_voice_send() {
    let server_url = spawn_voice_server().await;
    let (socket, mut commands) = SocketHandle::capture();
    let client = test_client_with_server(&server_url, socket);
    seed_open(&client, &direct_summary(7)).await;

    client
        .send_voice_note(vec![1, 2, 3], "audio/ogg")
        .await
        .expect("voice send");

    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.messages.len(), 1);
    let record = &view.messages[0];
    assert!(record.is_pending());
    assert!(record.content.is_empty());
    assert_eq!(
        record.voice_note_url.as_deref(),
        Some("https://files.example.com/v/99.ogg")
    );
    let mut saw_voice_command = false;
    while let Ok(command) = commands.try_recv() {
        if let ClientCommand::SendMessage { voice_note_url, .. } = command {
            saw_voice_command = voice_note_url.is_some();
        }
    }
    assert!(saw_voice_command);
}

#[tokio::test]
async fn socket_send_is_best_effort_when_disconnected() {
    let client = test_client();
    seed_open(&client, &direct_summary(7)).await;

    // The detached socket drops the command, but the optimistic record still
    // lands; the ack (which will never come) is the only confirmation path.
    let temp_id = client.send_text("into the void").await.expect("send");
    let view = client.conversation_view().await.expect("view");
    assert_eq!(view.messages[0].identity, MessageIdentity::Pending(temp_id));
}

#[tokio::test]
async fn live_channel_orders_frames_skips_garbage_and_reconnects() {
    let (server_url, mut inbound) = spawn_ws_server().await;
    let settings = ClientSettings {
        server_url: "http://irrelevant.invalid".into(),
        socket_url: Some(server_url),
        reconnect_base_ms: 10,
        reconnect_cap_ms: 100,
        ..ClientSettings::default()
    };
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = transport::spawn(&settings, "test-token", events_tx).expect("spawn");

    assert!(matches!(
        next_socket_event(&mut events_rx).await,
        SocketEvent::Connected
    ));
    assert!(matches!(
        next_socket_event(&mut events_rx).await,
        SocketEvent::Event(ServerEvent::MessageDeliveredBulk { .. })
    ));
    // The malformed frame in between was logged and dropped.
    assert!(matches!(
        next_socket_event(&mut events_rx).await,
        SocketEvent::Event(ServerEvent::ConversationDeleted { .. })
    ));
    assert!(matches!(
        next_socket_event(&mut events_rx).await,
        SocketEvent::Closed
    ));
    // Backoff elapses and the loop reconnects on its own.
    assert!(matches!(
        next_socket_event(&mut events_rx).await,
        SocketEvent::Connected
    ));

    handle.send(ClientCommand::Subscribe {
        conversation_id: ConversationId(3),
    });
    let frame = timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("t")
        .expect("frame");
    assert!(frame.contains("\"subscribe\""));

    handle.shutdown();
}

async fn next_socket_event(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<SocketEvent>,
) -> SocketEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a socket event")
        .expect("socket event stream ended")
}

async fn spawn_history_server(slow_conversation: Option<i64>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route(
        "/chat/conversations/:id/messages",
        get(move |Path(id): Path<i64>| async move {
            if Some(id) == slow_conversation {
                tokio::time::sleep(Duration::from_millis(250)).await;
                return Json(vec![payload(id, 900, 2, "stale history")]);
            }
            Json(vec![payload(id, 1, 2, "first"), payload(id, 2, 2, "second")])
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn spawn_roster_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route(
        "/chat/conversations",
        get(|| async { Json(vec![direct_summary(1), direct_summary(2)]) }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn spawn_voice_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route(
        "/chat/voice/upload",
        post(|| async {
            Json(serde_json::json!({ "url": "https://files.example.com/v/99.ogg" }))
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn spawn_ws_server() -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let app = Router::new()
        .route(
            "/chat",
            get(
                move |ws: WebSocketUpgrade, State((connections, inbound)): State<WsState>| async move {
                    ws.on_upgrade(move |mut socket| async move {
                        let n = connections.fetch_add(1, Ordering::SeqCst);
                        if n == 0 {
                            let first = ServerEvent::MessageDeliveredBulk {
                                conversation_id: ConversationId(7),
                                recipient_id: UserId(2),
                            };
                            let second = ServerEvent::ConversationDeleted {
                                conversation_id: ConversationId(9),
                            };
                            let _ = socket
                                .send(WsMessage::Text(
                                    serde_json::to_string(&first).expect("encode"),
                                ))
                                .await;
                            let _ = socket.send(WsMessage::Text("{not json".into())).await;
                            let _ = socket
                                .send(WsMessage::Text(
                                    serde_json::to_string(&second).expect("encode"),
                                ))
                                .await;
                            // Dropping the socket closes the first connection.
                        } else {
                            while let Some(Ok(frame)) = socket.recv().await {
                                if let WsMessage::Text(text) = frame {
                                    let _ = inbound.send(text);
                                }
                            }
                        }
                    })
                },
            ),
        )
        .with_state((connections, inbound_tx));

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("ws://{addr}"), inbound_rx)
}

type WsState = (Arc<AtomicUsize>, tokio::sync::mpsc::UnboundedSender<String>);

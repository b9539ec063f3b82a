use super::*;
use crate::connection::{Outbound, CLOSE_NORMAL};
use crate::envelope::MessageType;
use serde_json::json;
use tokio::sync::mpsc;

fn setup() -> Dispatcher {
    Dispatcher::new(
        Arc::new(ConnectionRegistry::new()),
        Arc::new(AgentStore::new()),
        16,
    )
}

fn connect(dispatcher: &Dispatcher) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(32);
    (dispatcher.registry().register(tx), rx)
}

/// Drain every queued text frame as parsed envelopes.
fn received(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Outbound::Text(text) = frame {
            out.push(serde_json::from_str(&text).unwrap());
        }
    }
    out
}

fn frame(value: serde_json::Value) -> String {
    value.to_string()
}

#[test]
fn test_broadcast_reaches_everyone_but_excluded() {
    let dispatcher = setup();
    let (c1, mut rx1) = connect(&dispatcher);
    let (_c2, mut rx2) = connect(&dispatcher);
    let (_c3, mut rx3) = connect(&dispatcher);

    let envelope = Envelope::error("", "hello");
    let delivered = dispatcher.broadcast(&envelope, Some(c1.id));

    assert_eq!(delivered, 2);
    assert!(received(&mut rx1).is_empty());
    assert_eq!(received(&mut rx2), vec![envelope.clone()]);
    assert_eq!(received(&mut rx3), vec![envelope]);
}

#[test]
fn test_broadcast_survives_broken_connection() {
    let dispatcher = setup();
    let (_dead, dead_rx) = connect(&dispatcher);
    let (_full, _full_rx) = {
        let (tx, rx) = mpsc::channel(1);
        let conn = dispatcher.registry().register(tx);
        assert!(conn.send(Arc::from("filler")));
        (conn, rx)
    };
    let (_ok, mut ok_rx) = connect(&dispatcher);
    drop(dead_rx);

    let delivered = dispatcher.broadcast(&Envelope::error("", "x"), None);

    assert_eq!(delivered, 1);
    assert_eq!(received(&mut ok_rx).len(), 1);
}

#[test]
fn test_broadcast_skips_closing_connections() {
    let dispatcher = setup();
    let (closing, _rx1) = connect(&dispatcher);
    let (_open, mut rx2) = connect(&dispatcher);
    closing.close(CLOSE_NORMAL, "bye");

    assert_eq!(dispatcher.broadcast(&Envelope::error("", "x"), None), 1);
    assert_eq!(received(&mut rx2).len(), 1);
}

#[test]
fn test_send_to_nonexistent_agent_returns_false() {
    let dispatcher = setup();
    let (_conn, _rx) = connect(&dispatcher);
    assert!(!dispatcher.send_to_agent("nonexistent", &Envelope::error("", "x")));
}

#[test]
fn test_send_to_agent_with_closed_socket_returns_false() {
    let dispatcher = setup();
    let (conn, rx) = connect(&dispatcher);
    dispatcher.registry().bind_agent(&conn.id, "a1");
    drop(rx);

    assert!(!dispatcher.send_to_agent("a1", &Envelope::error("a1", "x")));
}

#[test]
fn test_update_agent_state_broadcasts_and_unicasts() {
    let dispatcher = setup();
    let (owner, mut owner_rx) = connect(&dispatcher);
    let (_observer, mut observer_rx) = connect(&dispatcher);
    dispatcher.registry().bind_agent(&owner.id, "a1");

    let patch = StatePatch {
        reward: Some(2.0),
        ..StatePatch::default()
    };
    let state = dispatcher.update_agent_state("a1", &patch);

    let expected = Envelope::state("a1", &state);
    // Owner gets the broadcast copy plus the direct echo
    assert_eq!(received(&mut owner_rx), vec![expected.clone(), expected.clone()]);
    assert_eq!(received(&mut observer_rx), vec![expected]);
    assert_eq!(dispatcher.store().get("a1").unwrap().reward, 2.0);
}

#[test]
fn test_update_for_unbound_agent_still_broadcasts() {
    let dispatcher = setup();
    let (_observer, mut rx) = connect(&dispatcher);

    dispatcher.update_agent_state("driver-only", &StatePatch::default());

    let frames = received(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].agent_id, "driver-only");
}

#[test]
fn test_disconnect_cascades_once() {
    let dispatcher = setup();
    let (gone, _gone_rx) = connect(&dispatcher);
    let (_observer, mut rx) = connect(&dispatcher);
    dispatcher.registry().bind_agent(&gone.id, "a1");
    dispatcher.update_agent_state("a1", &StatePatch::default());
    received(&mut rx);

    assert_eq!(dispatcher.disconnect(&gone.id), Some("a1".to_string()));
    assert_eq!(dispatcher.disconnect(&gone.id), None);

    assert!(dispatcher.store().get("a1").is_none());
    let frames = received(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].disconnected_agent(), Some("a1"));
}

#[test]
fn test_disconnect_unbound_connection_is_silent() {
    let dispatcher = setup();
    let (conn, _rx) = connect(&dispatcher);
    let (_observer, mut rx) = connect(&dispatcher);

    assert_eq!(dispatcher.disconnect(&conn.id), None);
    assert!(received(&mut rx).is_empty());
    assert_eq!(dispatcher.registry().len(), 1);
}

#[test]
fn test_handle_state_merges_across_frames() {
    let dispatcher = setup();
    let (conn, _rx) = connect(&dispatcher);

    handle_text(
        &dispatcher,
        &conn,
        &frame(json!({"type": "state", "agentId": "a1", "data": {"position": [1, 0, 0]}})),
    );
    let outcome = handle_text(
        &dispatcher,
        &conn,
        &frame(json!({"type": "state", "agentId": "a1", "data": {"reward": 5}})),
    );

    let HandleOutcome::StateApplied(state) = outcome else {
        panic!("expected state to be applied, got {:?}", outcome);
    };
    assert_eq!(state.position, [1.0, 0.0, 0.0]);
    assert_eq!(state.rotation, [0.0, 0.0, 0.0]);
    assert_eq!(state.reward, 5.0);
    assert_eq!(dispatcher.store().get("a1").unwrap(), state);
    assert_eq!(dispatcher.registry().find_by_agent("a1"), Some(conn.id));
}

#[test]
fn test_handle_invalid_envelope_replies_with_error() {
    let dispatcher = setup();
    let (conn, mut rx) = connect(&dispatcher);

    let outcome = handle_text(
        &dispatcher,
        &conn,
        &frame(json!({"type": "state", "agentId": "a1", "data": {"position": [1, 2]}})),
    );

    assert_eq!(outcome, HandleOutcome::Rejected);
    assert!(dispatcher.store().is_empty());
    // Invalid frames do not bind
    assert!(dispatcher.registry().find_by_agent("a1").is_none());

    let replies = received(&mut rx);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].msg_type, MessageType::Error);
    assert_eq!(replies[0].agent_id, "a1");
    assert!(replies[0].data["error"].as_str().unwrap().contains("position"));
}

#[test]
fn test_handle_missing_fields_does_not_mutate_store() {
    let dispatcher = setup();
    let (conn, mut rx) = connect(&dispatcher);

    for bad in [
        json!({"agentId": "a1", "data": {}}),
        json!({"type": "state", "data": {}}),
        json!({"type": "state", "agentId": "a1"}),
        json!({"type": "teleport", "agentId": "a1", "data": {}}),
    ] {
        assert_eq!(handle_text(&dispatcher, &conn, &frame(bad)), HandleOutcome::Rejected);
    }

    assert!(dispatcher.store().is_empty());
    assert_eq!(received(&mut rx).len(), 4);
}

#[test]
fn test_handle_non_json_frame() {
    let dispatcher = setup();
    let (conn, mut rx) = connect(&dispatcher);

    assert_eq!(handle_text(&dispatcher, &conn, "not json"), HandleOutcome::Rejected);

    let replies = received(&mut rx);
    assert_eq!(replies.len(), 1);
    assert!(replies[0].data["error"]
        .as_str()
        .unwrap()
        .starts_with("invalid JSON"));
}

#[test]
fn test_handle_mistyped_field_rejected_without_mutation() {
    let dispatcher = setup();
    let (conn, mut rx) = connect(&dispatcher);

    let outcome = handle_text(
        &dispatcher,
        &conn,
        &frame(json!({"type": "state", "agentId": "a1", "data": {"reward": "lots"}})),
    );

    assert_eq!(outcome, HandleOutcome::Rejected);
    assert!(dispatcher.store().get("a1").is_none());
    assert!(conn.agent_id().is_none());
    assert_eq!(received(&mut rx)[0].msg_type, MessageType::Error);
}

#[test]
fn test_handle_state_without_agent_id_rejected() {
    let dispatcher = setup();
    let (conn, _rx) = connect(&dispatcher);

    let outcome = handle_text(
        &dispatcher,
        &conn,
        &frame(json!({"type": "state", "agentId": "", "data": {"reward": 1}})),
    );

    assert_eq!(outcome, HandleOutcome::Rejected);
    assert!(dispatcher.store().is_empty());
    assert!(conn.agent_id().is_none());
}

#[test]
fn test_handle_reset_replaces_state() {
    let dispatcher = setup();
    let (conn, _rx) = connect(&dispatcher);

    handle_text(
        &dispatcher,
        &conn,
        &frame(json!({"type": "state", "agentId": "a1", "data": {"reward": 9, "color": "red"}})),
    );
    let outcome = handle_text(
        &dispatcher,
        &conn,
        &frame(json!({"type": "reset", "agentId": "a1", "data": {"position": [1, 1, 1]}})),
    );

    let HandleOutcome::StateApplied(state) = outcome else {
        panic!("expected reset to apply");
    };
    assert_eq!(state.position, [1.0, 1.0, 1.0]);
    assert_eq!(state.reward, 0.0);
    assert!(state.extra.is_empty());
}

#[test]
fn test_handle_action_relays_and_publishes() {
    let dispatcher = setup();
    let mut actions = dispatcher.subscribe_actions();
    let (sender, mut sender_rx) = connect(&dispatcher);
    let (_peer, mut peer_rx) = connect(&dispatcher);

    let outcome = handle_text(
        &dispatcher,
        &sender,
        &frame(json!({"type": "action", "agentId": "a1", "data": {"move": "left"}})),
    );

    assert_eq!(outcome, HandleOutcome::Relayed(1));
    assert!(received(&mut sender_rx).is_empty());
    let relayed = received(&mut peer_rx);
    assert_eq!(relayed[0].msg_type, MessageType::Action);
    assert_eq!(relayed[0].data["move"], json!("left"));

    let action = actions.try_recv().unwrap();
    assert_eq!(action.agent_id, "a1");
    assert_eq!(action.connection_id, sender.id);
    // Actions never touch stored state
    assert!(dispatcher.store().is_empty());
}

#[test]
fn test_unbound_connection_still_receives_broadcasts() {
    let dispatcher = setup();
    let (producer, _rx) = connect(&dispatcher);
    let (watcher, mut watcher_rx) = connect(&dispatcher);

    handle_text(
        &dispatcher,
        &producer,
        &frame(json!({"type": "state", "agentId": "a1", "data": {"done": true}})),
    );

    assert!(watcher.agent_id().is_none());
    let frames = received(&mut watcher_rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data["done"], json!(true));
}

#[test]
fn test_concurrent_updates_publish_in_commit_order() {
    const WRITERS: u64 = 4;
    const UPDATES: u64 = 50;

    for _ in 0..50 {
        let dispatcher = setup();
        let (tx, mut rx) = mpsc::channel((WRITERS * UPDATES) as usize + 8);
        let _observer = dispatcher.registry().register(tx);

        std::thread::scope(|scope| {
            for writer in 0..WRITERS {
                let dispatcher = &dispatcher;
                scope.spawn(move || {
                    for i in 0..UPDATES {
                        let patch = StatePatch {
                            reward: Some((writer * 1000 + i) as f64),
                            ..StatePatch::default()
                        };
                        dispatcher.update_agent_state("a1", &patch);
                    }
                });
            }
        });

        let frames = received(&mut rx);
        assert_eq!(frames.len(), (WRITERS * UPDATES) as usize);
        let last = frames.last().unwrap();
        let stored = dispatcher.store().get("a1").unwrap();
        assert_eq!(last.data["reward"], json!(stored.reward));
    }
}

#[test]
fn test_frame_after_eviction_is_dropped() {
    let dispatcher = setup();
    let (conn, _rx) = connect(&dispatcher);
    let (_observer, mut observer_rx) = connect(&dispatcher);

    handle_text(
        &dispatcher,
        &conn,
        &frame(json!({"type": "state", "agentId": "a1", "data": {"reward": 1}})),
    );
    conn.close(1001, "heartbeat timeout");
    dispatcher.disconnect(&conn.id);
    received(&mut observer_rx);

    let outcome = handle_text(
        &dispatcher,
        &conn,
        &frame(json!({"type": "state", "agentId": "a1", "data": {"reward": 2}})),
    );

    assert_eq!(outcome, HandleOutcome::Ignored);
    assert!(dispatcher.store().get("a1").is_none());
    assert!(dispatcher.registry().find_by_agent("a1").is_none());
    assert!(received(&mut observer_rx).is_empty());
}

#[test]
fn test_frame_from_unregistered_connection_is_dropped() {
    let dispatcher = setup();
    let (conn, _rx) = connect(&dispatcher);
    dispatcher.registry().unregister(&conn.id);

    let outcome = handle_text(
        &dispatcher,
        &conn,
        &frame(json!({"type": "reset", "agentId": "a1", "data": {}})),
    );

    assert_eq!(outcome, HandleOutcome::Ignored);
    assert!(dispatcher.store().is_empty());
}

#[test]
fn test_client_disconnect_notice_is_not_relayed() {
    let dispatcher = setup();
    let (owner, _owner_rx) = connect(&dispatcher);
    let (spoofer, mut spoofer_rx) = connect(&dispatcher);
    let (_peer, mut peer_rx) = connect(&dispatcher);
    handle_text(
        &dispatcher,
        &owner,
        &frame(json!({"type": "state", "agentId": "a1", "data": {}})),
    );
    received(&mut peer_rx);

    let outcome = handle_text(
        &dispatcher,
        &spoofer,
        &Envelope::agent_disconnected("a1").to_json().unwrap(),
    );

    assert_eq!(outcome, HandleOutcome::Rejected);
    assert!(received(&mut peer_rx).is_empty());
    let replies = received(&mut spoofer_rx);
    assert!(replies.iter().any(|e| e.msg_type == MessageType::Error));
    assert!(dispatcher.store().get("a1").is_some());
    assert!(spoofer.agent_id().is_none());
}

#[test]
fn test_plain_info_is_still_relayed() {
    let dispatcher = setup();
    let (sender, _rx) = connect(&dispatcher);
    let (_peer, mut peer_rx) = connect(&dispatcher);

    let outcome = handle_text(
        &dispatcher,
        &sender,
        &frame(json!({"type": "info", "agentId": "a1", "data": {"note": "episode 3"}})),
    );

    assert_eq!(outcome, HandleOutcome::Relayed(1));
    assert_eq!(received(&mut peer_rx)[0].data["note"], json!("episode 3"));
}

mod common;

use std::time::Duration;

use common::{Bridge, DEVICE, OTHER};
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};
use tylohelo_bridge::{
    protocol::{
        Inbound, IntegerValue, IntegerValueType, Outbound, StateUpdate, UserMessage,
        ANSWER_PENDING, CONNECT_STATUS_SUCCESS, MESSAGE_TYPE_ERROR, MESSAGE_TYPE_NONE,
    },
    CalendarEntry, ConnectionStatus, GatewayError, TimerKind,
};

fn connectivity(messages: &[tylohelo_bridge::BusMessage], value: &str) -> usize {
    messages
        .iter()
        .filter(|m| m.topic.ends_with("/connected") && m.payload == value)
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_after_silent_timeout() {
    let mut bridge = Bridge::connected(DEVICE).await;
    bridge.receive(Inbound::KeepAliveAck { sequence: 1 }).await;
    let acked_at = Instant::now();

    let mut published = Vec::new();
    while bridge.session.device(DEVICE).unwrap().is_connected() {
        let event = bridge.timers.recv().await.unwrap();
        bridge.session.on_timer(event).await.unwrap();
        published.extend(bridge.published());
    }
    assert_eq!(acked_at.elapsed(), Duration::from_secs(30));
    assert_eq!(connectivity(&published, "false"), 1);

    let sent = bridge.sent().await;
    assert_eq!(sent.last(), Some(&Outbound::DisconnectRequest));
    assert_eq!(bridge.session.bound_device(51112), None);

    // Nothing fires for a closed session
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(60), bridge.timers.recv()).await
    {
        bridge.session.on_timer(event).await.unwrap();
    }
    assert_eq!(connectivity(&bridge.published(), "false"), 0);
    assert!(bridge.transport.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_acks_keep_the_session_alive() {
    let mut bridge = Bridge::connected(DEVICE).await;
    let start = Instant::now();

    while start.elapsed() < Duration::from_secs(120) {
        let event = bridge.timers.recv().await.unwrap();
        let is_keepalive = event.kind == TimerKind::KeepAlive;
        bridge.session.on_timer(event).await.unwrap();
        if is_keepalive {
            for message in bridge.sent().await {
                if let Outbound::KeepAlive { sequence } = message {
                    bridge.receive(Inbound::KeepAliveAck { sequence }).await;
                }
            }
        }
    }
    assert!(bridge.session.device(DEVICE).unwrap().is_connected());
    assert_eq!(connectivity(&bridge.published(), "false"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_no_connection_closes_without_request() {
    let mut bridge = Bridge::connected(DEVICE).await;
    bridge.receive(Inbound::NoConnection).await;

    assert_eq!(
        bridge.session.device(DEVICE).unwrap().status,
        ConnectionStatus::Disconnected
    );
    assert!(bridge.transport.is_empty().await);
    assert_eq!(connectivity(&bridge.published(), "false"), 1);
    assert_eq!(bridge.session.bound_device(51112), None);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_sequence_survives_reconnect() {
    let mut bridge = Bridge::connected(DEVICE).await;
    let mut sequences = Vec::new();
    while sequences.len() < 2 {
        let event = bridge.timers.recv().await.unwrap();
        bridge.session.on_timer(event).await.unwrap();
        for message in bridge.sent().await {
            if let Outbound::KeepAlive { sequence } = message {
                sequences.push(sequence);
            }
        }
    }

    bridge.session.disconnect(DEVICE).await.unwrap();
    bridge.session.connect(DEVICE).await.unwrap();
    bridge
        .receive(Inbound::ConnectReply(tylohelo_bridge::protocol::ConnectReply {
            status: tylohelo_bridge::protocol::CONNECT_STATUS_SUCCESS,
            system_id: DEVICE.0,
            keepalive_interval: 10,
            lost_connection_timeout: 30,
            system_type: 20,
            application_description: "Pure".to_string(),
            application_version: "3.0".to_string(),
        }))
        .await;
    bridge.transport.take().await;

    while sequences.len() < 3 {
        let event = bridge.timers.recv().await.unwrap();
        bridge.session.on_timer(event).await.unwrap();
        for message in bridge.sent().await {
            if let Outbound::KeepAlive { sequence } = message {
                sequences.push(sequence);
            }
        }
    }
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_identical_updates_change_once() {
    let mut bridge = Bridge::connected(DEVICE).await;
    let update = || StateUpdate {
        integer_values: vec![IntegerValue::new(IntegerValueType::TargetHumidity, 45)],
        ..StateUpdate::default()
    };

    bridge.update(update()).await;
    let first = bridge.published();
    assert_eq!(first.len(), 1);
    assert!(first[0].topic.ends_with("/target-humidity"));
    assert_eq!(first[0].payload, "45");

    bridge.update(update()).await;
    assert!(bridge.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_device_cannot_take_the_port() {
    let mut bridge = Bridge::connected(DEVICE).await;
    bridge.announce(OTHER).await;
    bridge.published();

    let err = assert_err!(bridge.session.connect(OTHER).await);
    assert!(err.is_policy_violation());
    assert!(matches!(
        err,
        GatewayError::PortInUse {
            bound: DEVICE,
            requested: OTHER,
            ..
        }
    ));
    assert!(bridge.transport.is_empty().await);
    assert!(bridge.published().is_empty());
    assert!(bridge.session.device(DEVICE).unwrap().is_connected());
    assert_eq!(
        bridge.session.device(OTHER).unwrap().status,
        ConnectionStatus::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn test_port_is_free_after_disconnect() {
    let mut bridge = Bridge::connected(DEVICE).await;
    bridge.announce(OTHER).await;
    bridge.session.disconnect(DEVICE).await.unwrap();
    bridge.transport.take().await;

    bridge.session.connect(OTHER).await.unwrap();
    assert_eq!(bridge.session.bound_device(51112), Some(OTHER));
    assert!(matches!(
        bridge.sent().await.as_slice(),
        [Outbound::ConnectRequest { .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_calendar_index_outside_date_programs_is_rejected() {
    let mut bridge = Bridge::connected(DEVICE).await;
    let mut entry = manual_entry();
    for index in [0, 22] {
        entry.index = index;
        let err = assert_err!(bridge.session.save_calendar_entry(DEVICE, &entry).await);
        assert!(matches!(err, GatewayError::InvalidCalendarIndex(i) if i == index));
        let err = assert_err!(bridge.session.delete_calendar_entry(DEVICE, &entry).await);
        assert!(matches!(err, GatewayError::InvalidCalendarIndex(_)));
    }
    assert!(bridge.transport.is_empty().await);

    entry.index = 21;
    assert_ok!(bridge.session.save_calendar_entry(DEVICE, &entry).await);
    assert_ok!(bridge.session.delete_calendar_entry(DEVICE, &entry).await);
    let sent = bridge.sent().await;
    let [Outbound::CalendarPosts(saved), Outbound::CalendarPosts(deleted)] = sent.as_slice() else {
        panic!("expected two calendar posts, got {sent:?}");
    };
    assert!(saved[0].valid);
    assert_eq!(saved[0].index, 21);
    assert!(!deleted[0].valid);
    assert_eq!(deleted[0].index, 21);
}

fn manual_entry() -> CalendarEntry {
    let start = tylohelo_bridge::protocol::from_device_millis(0).unwrap();
    CalendarEntry {
        index: 1,
        valid: true,
        activation_time: start,
        end_time: start + chrono::Duration::minutes(60),
        bath_time: 60,
        temperature_set_point: 80,
        humidity_set_point: 0,
        weekday: false,
        start_mode: 2,
        standby: false,
        favorite: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_commands_are_dropped_without_session() {
    let mut bridge = Bridge::new();
    bridge.announce(DEVICE).await;
    bridge.published();

    bridge.session.set_target_temperature(DEVICE, 90).await;
    bridge.session.set_lighting(DEVICE, false).await;
    bridge.session.acknowledge_error(DEVICE).await;
    bridge.session.save_calendar_entry(DEVICE, &manual_entry()).await.unwrap();
    assert!(bridge.transport.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_error_message_publications() {
    let mut bridge = Bridge::connected(DEVICE).await;
    let door = UserMessage {
        message_type: MESSAGE_TYPE_ERROR,
        identity: 19,
        answer: ANSWER_PENDING,
        text: "Door open".to_string(),
    };
    bridge
        .update(StateUpdate {
            user_message: Some(door.clone()),
            ..StateUpdate::default()
        })
        .await;
    let raised = bridge.published();
    assert_eq!(raised.len(), 2);
    assert!(raised[0].topic.ends_with("/error"));
    let payload: serde_json::Value = serde_json::from_str(&raised[0].payload).unwrap();
    assert_eq!(payload["state"], "ON");
    assert_eq!(payload["message"]["text"], "Door open");
    assert!(raised[1].topic.ends_with("/door"));
    assert_eq!(raised[1].payload, "ON");

    // Same message again
    bridge
        .update(StateUpdate {
            user_message: Some(door),
            ..StateUpdate::default()
        })
        .await;
    assert!(bridge.published().is_empty());

    let clear = || StateUpdate {
        user_message: Some(UserMessage {
            message_type: MESSAGE_TYPE_NONE,
            identity: 0,
            answer: 0,
            text: String::new(),
        }),
        ..StateUpdate::default()
    };
    bridge.update(clear()).await;
    let cleared = bridge.published();
    assert_eq!(cleared.len(), 2);
    assert_eq!(cleared[1].payload, "OFF");

    // Repeated clears keep the bus consistent
    bridge.update(clear()).await;
    let again = bridge.published();
    assert_eq!(again.len(), 2);
    assert_eq!(again[1].payload, "OFF");
}

#[tokio::test(start_paused = true)]
async fn test_error_cleared_after_reconnect() {
    let mut bridge = Bridge::connected(DEVICE).await;
    bridge
        .update(StateUpdate {
            user_message: Some(UserMessage {
                message_type: MESSAGE_TYPE_ERROR,
                identity: 19,
                answer: ANSWER_PENDING,
                text: "Door open".to_string(),
            }),
            ..StateUpdate::default()
        })
        .await;
    assert_eq!(bridge.published().len(), 2);

    assert_ok!(bridge.session.disconnect(DEVICE).await);
    assert_ok!(bridge.session.connect(DEVICE).await);
    bridge.reply(DEVICE, CONNECT_STATUS_SUCCESS).await;
    bridge.published();

    bridge
        .update(StateUpdate {
            user_message: Some(UserMessage {
                message_type: MESSAGE_TYPE_NONE,
                identity: 0,
                answer: 0,
                text: String::new(),
            }),
            ..StateUpdate::default()
        })
        .await;
    let cleared = bridge.published();
    assert_eq!(cleared.len(), 2);
    assert!(cleared[0].topic.ends_with("/error"));
    let payload: serde_json::Value = serde_json::from_str(&cleared[0].payload).unwrap();
    assert_eq!(payload["state"], "OFF");
    assert!(cleared[1].topic.ends_with("/door"));
    assert_eq!(cleared[1].payload, "OFF");
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_becomes_unavailable() {
    let mut bridge = Bridge::new();
    bridge.announce(DEVICE).await;
    assert_eq!(bridge.published()[0].payload, "true");

    tokio::time::sleep(Duration::from_secs(15)).await;
    bridge.session.sweep(Instant::now()).await;
    assert!(bridge.published().is_empty());

    tokio::time::sleep(Duration::from_secs(6)).await;
    bridge.session.sweep(Instant::now()).await;
    let published = bridge.published();
    assert_eq!(published.len(), 1);
    assert!(published[0].topic.ends_with("/available"));
    assert_eq!(published[0].payload, "false");

    bridge.session.sweep(Instant::now()).await;
    assert!(bridge.published().is_empty());

    bridge.announce(DEVICE).await;
    assert_eq!(bridge.published()[0].payload, "true");
}

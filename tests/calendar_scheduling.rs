mod common;

use chrono::{DateTime, Duration, Utc};
use common::{Bridge, DEVICE};
use tokio_test::assert_ok;
use tylohelo_bridge::protocol::{
    to_device_millis, CalendarProgram, Favorite, Outbound, RunStateReport, StateUpdate,
    FAVORITE_NONE, START_MODE_READY_AT,
};

fn at(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn clock(now: DateTime<Utc>) -> StateUpdate {
    StateUpdate {
        run_state: Some(RunStateReport {
            state: None,
            device_time: Some(to_device_millis(now)),
        }),
        ..StateUpdate::default()
    }
}

fn program(index: u8, valid: bool, start: DateTime<Utc>, minutes: u16) -> CalendarProgram {
    CalendarProgram {
        index,
        valid,
        activation_time: Some(to_device_millis(start)),
        bath_time: minutes,
        temperature_set_point: 75,
        humidity_set_point: 0,
        weekday: false,
        start_mode: START_MODE_READY_AT,
        standby: false,
        favorite: FAVORITE_NONE,
    }
}

/// Every slot reported, all empty
fn empty_calendar(now: DateTime<Utc>) -> Vec<CalendarProgram> {
    (0..22).map(|index| program(index, false, now, 0)).collect()
}

#[tokio::test(start_paused = true)]
async fn test_empty_window_schedules_at_noon() {
    let mut bridge = Bridge::connected(DEVICE).await;
    bridge.update(clock(at("2024-06-01T09:15:00Z"))).await;

    let gap = bridge.session.preferred_gap(DEVICE).unwrap();
    assert_eq!(gap.start, at("2024-06-01T12:00:00Z"));
    assert_eq!(gap.minutes, 180);
    assert_eq!(gap.end - gap.start, Duration::minutes(180));
}

#[tokio::test(start_paused = true)]
async fn test_trailing_slot_is_used_for_new_entry() {
    let now = at("2024-06-01T09:15:00Z");
    let mut bridge = Bridge::connected(DEVICE).await;
    bridge.update(clock(now)).await;

    let mut calendar = empty_calendar(now);
    calendar[1] = program(1, true, now, 1440 - 90);
    bridge
        .update(StateUpdate {
            calendar_programs: calendar,
            ..StateUpdate::default()
        })
        .await;

    let window = bridge.session.calendar_window(DEVICE);
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].entry.index, 1);

    let gaps = bridge.session.free_gaps(DEVICE);
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].start, now + Duration::minutes(1350));

    let entry = bridge.session.synthesize_calendar_entry(DEVICE).unwrap();
    assert_eq!(entry.index, 2);
    assert_eq!(entry.bath_time, 90);
    assert_eq!(entry.activation_time, now + Duration::minutes(1350));
    assert_eq!(entry.end_time, now + Duration::minutes(1440));

    assert_ok!(bridge.session.save_calendar_entry(DEVICE, &entry).await);
    let sent = bridge.sent().await;
    let [Outbound::CalendarPosts(posts)] = sent.as_slice() else {
        panic!("expected one calendar post, got {sent:?}");
    };
    assert_eq!(posts[0].index, 2);
    assert_eq!(posts[0].activation_time, Some(to_device_millis(entry.activation_time)));
    assert_eq!(posts[0].favorite, FAVORITE_NONE);
}

#[tokio::test(start_paused = true)]
async fn test_favorite_bath_time_extends_entry() {
    let now = at("2024-06-01T09:15:00Z");
    let mut bridge = Bridge::connected(DEVICE).await;
    bridge.update(clock(now)).await;

    let mut calendar = empty_calendar(now);
    let mut linked = program(1, true, now + Duration::hours(1), 30);
    linked.favorite = 3;
    calendar[1] = linked;
    bridge
        .update(StateUpdate {
            calendar_programs: calendar,
            favorites: vec![Favorite {
                index: 3,
                name: "Evening".to_string(),
                bath_time: 120,
                temperature_set_point: 80,
                humidity_set_point: 0,
            }],
            ..StateUpdate::default()
        })
        .await;

    let window = bridge.session.calendar_window(DEVICE);
    assert_eq!(window[0].effective_end, now + Duration::hours(3));
    let gaps = bridge.session.free_gaps(DEVICE);
    assert_eq!(gaps[0].end, now + Duration::hours(1));
    assert_eq!(gaps[1].start, now + Duration::hours(3));
}

#[tokio::test(start_paused = true)]
async fn test_working_entry_is_cached_until_cleared() {
    let now = at("2024-06-01T09:15:00Z");
    let mut bridge = Bridge::connected(DEVICE).await;
    bridge.update(clock(now)).await;
    let mut calendar = empty_calendar(now);
    calendar[4] = program(4, true, now + Duration::hours(2), 60);
    bridge
        .update(StateUpdate {
            calendar_programs: calendar,
            ..StateUpdate::default()
        })
        .await;

    let stored = bridge
        .session
        .working_calendar_entry(DEVICE, Some(4))
        .unwrap()
        .clone();
    assert!(!stored.freshly_created);
    assert_eq!(stored.entry.index, 4);

    // Cached, the index is not consulted again
    let cached = bridge.session.working_calendar_entry(DEVICE, None).unwrap();
    assert_eq!(cached, &stored);

    bridge.session.clear_working_calendar_entry(DEVICE);
    let fresh = bridge.session.working_calendar_entry(DEVICE, None).unwrap();
    assert!(fresh.freshly_created);
    assert_eq!(fresh.entry.index, 1);
}

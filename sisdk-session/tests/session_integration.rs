// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! End-to-end session tests over the in-process bus

use crossbeam::channel::{unbounded, Receiver};
use sisdk_bus::{Frame, FrameReceiver, MemoryBus, MessageBus};
use sisdk_core::payload::{CLOCK_TAG, PROGRESS_TAG};
use sisdk_core::wire::{ClockMode, ClockValue, PlaybackStatus, WallClockValue};
use sisdk_core::{
    BusBackend, ChannelId, ClientRequest, Codec, Fragment, MessageKind, Payload, SisdkConfig,
    StorageConfig, CLIENT_CONNECTED,
};
use sisdk_session::{ReplayStatus, RequestForwarder, Session, SessionRegistry};
use sisdk_storage::{EventLog, SequenceSelector, StateStore};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

fn config(dir: &TempDir) -> SisdkConfig {
    let mut config = SisdkConfig {
        storage: StorageConfig {
            log_dir: dir.path().to_path_buf(),
        },
        ..SisdkConfig::default()
    };
    config.bus.backend = BusBackend::Memory;
    config.session.origin_server = "test".to_string();
    config
}

fn registry(dir: &TempDir) -> (MemoryBus, SessionRegistry) {
    let bus = MemoryBus::new();
    let registry = SessionRegistry::new(Arc::new(bus.clone()), config(dir));
    (bus, registry)
}

/// Attach to `topic` and swallow the `Subscribed` acknowledgement
fn listen(bus: &MemoryBus, topic: &str) -> FrameReceiver {
    let receiver = bus.attach(topic);
    assert!(matches!(
        receiver.recv_timeout(WAIT).unwrap(),
        Frame::Subscribed { .. }
    ));
    receiver
}

fn next_message(receiver: &FrameReceiver, timeout: Duration) -> Option<Vec<u8>> {
    match receiver.recv_timeout(timeout).ok()? {
        Frame::Message { data, .. } => Some(data),
        other => panic!("unexpected frame {:?}", other),
    }
}

fn is_progress(bytes: &[u8]) -> bool {
    Codec::decode(bytes)
        .map(|m| m.atoms.iter().any(|a| a.type_tag == PROGRESS_TAG))
        .unwrap_or(false)
}

/// Next message that is not a progress report
fn next_data(receiver: &FrameReceiver, timeout: Duration) -> Option<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        let bytes = next_message(receiver, remaining)?;
        if !is_progress(&bytes) {
            return Some(bytes);
        }
    }
}

fn single_payload(bytes: &[u8]) -> Payload {
    let mut fragments = Codec::decode_fragments(bytes).unwrap();
    assert_eq!(fragments.len(), 1);
    fragments.remove(0).payload
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn forwarder() -> (RequestForwarder, Receiver<(ChannelId, String, String)>) {
    let (tx, rx) = unbounded();
    let forward: RequestForwarder = Arc::new(move |channel, client_id, raw| {
        let _ = tx.send((channel.clone(), client_id.to_string(), raw.to_string()));
    });
    (forward, rx)
}

/// Write a recording straight into the live log of `CR_<instance>`
///
/// Each item is `(timestamp_us, text, state)`; a state item also records a
/// snapshot holding every state written so far.
fn record(
    dir: &TempDir,
    instance: &str,
    items: &[(i64, &str, Option<&str>)],
) -> Vec<Vec<u8>> {
    let live = ChannelId::live("CR", instance).unwrap();
    let log = EventLog::open_for(&config(dir).storage, &live).unwrap();
    let codec = Codec::new("recorder", &live);
    let store = StateStore::new(&live);

    let mut messages = Vec::new();
    for (ts, text, state) in items {
        let bytes = codec.encode_payload(Payload::text(*text), MessageKind::Behavior);
        log.try_save_message_at(&bytes, *ts).unwrap();
        if let Some(key) = state {
            store.set_at(key, text, bytes.clone(), *ts);
            log.try_save_state_snapshot_at(&store.entries(), *ts).unwrap();
        }
        messages.push(bytes);
    }
    messages
}

/// Test that a reconnecting client receives every stored state, and only those
#[test]
fn test_client_connect_restores_state() {
    let dir = TempDir::new().unwrap();
    let (bus, registry) = registry(&dir);
    let channel = ChannelId::live("CR", "42").unwrap();
    let session = registry.open(&channel, None).unwrap();

    session.publish_state("TITLE", "Final round", Payload::text("Final round"));
    thread::sleep(Duration::from_millis(2));
    session.publish_state("LOGO", "logo.png", Payload::image("logo.png"));
    session.publish(Payload::text("not a state"));

    let receiver = listen(&bus, &channel.topic());
    bus.send_command(&channel.control_topic(), "client-1", CLIENT_CONNECTED)
        .unwrap();

    let first = next_message(&receiver, WAIT).unwrap();
    let second = next_message(&receiver, WAIT).unwrap();
    assert_eq!(single_payload(&first), Payload::text("Final round"));
    assert_eq!(single_payload(&second), Payload::image("logo.png"));
    assert!(next_message(&receiver, Duration::from_millis(200)).is_none());

    let header = Codec::decode(&first).unwrap().header.unwrap();
    assert_eq!(header.channel, "CR_42_LIVE");
    assert_eq!(header.origin_server, "test");
}

/// Test that restoring a running clock accounts for the time since it was set
#[test]
fn test_clock_restore_is_recomputed() {
    let dir = TempDir::new().unwrap();
    let (bus, registry) = registry(&dir);
    let channel = ChannelId::live("CR", "7").unwrap();
    let session = registry.open(&channel, None).unwrap();

    session.publish_state(
        "CLOCK",
        "05:00",
        Payload::Clock(ClockValue {
            mode: ClockMode::Countdown as i32,
            seconds: 300.0,
            running: true,
        }),
    );
    session.publish_state("TIME", "now", Payload::WallClock(WallClockValue { unix_ms: 1 }));

    let set_at = session.store().get("CLOCK").unwrap().updated_at_us;
    let now_us = set_at + 60_000_000;

    let receiver = listen(&bus, &channel.topic());
    assert_eq!(session.restore_states_at(now_us), 2);

    let mut clock = None;
    let mut wall = None;
    for _ in 0..2 {
        let bytes = next_message(&receiver, WAIT).unwrap();
        match single_payload(&bytes) {
            Payload::Clock(value) => clock = Some(value),
            Payload::WallClock(value) => wall = Some(value),
            other => panic!("unexpected payload {:?}", other),
        }
    }
    let clock = clock.unwrap();
    assert!((clock.seconds - 240.0).abs() < 1e-6);
    assert!(clock.running);
    assert_eq!(wall.unwrap().unix_ms, now_us / 1_000);

    // the store itself keeps what was published
    let stored = single_payload(&session.store().get("CLOCK").unwrap().encoded_message);
    assert!(matches!(stored, Payload::Clock(ClockValue { seconds, .. }) if seconds == 300.0));
}

/// Test that the in-memory state and the last logged snapshot agree
#[test]
fn test_store_converges_with_log() {
    let dir = TempDir::new().unwrap();
    let (_bus, registry) = registry(&dir);
    let channel = ChannelId::live("CR", "9").unwrap();
    let session = registry.open(&channel, None).unwrap();

    session.publish_state("TITLE", "one", Payload::text("one"));
    session.publish_state("SCORE", "3", Payload::text("3"));
    session.publish_state("TITLE", "two", Payload::text("two"));

    let log = session.event_log().unwrap();
    let open = log.open_sequence().unwrap().unwrap();
    let snapshot = log
        .get_state_sequence(&SequenceSelector::Id(open.seq_id))
        .unwrap()
        .unwrap();

    let mut logged = snapshot.entries();
    logged.sort_by(|a, b| a.key.cmp(&b.key));
    let mut live = session.store().entries();
    live.sort_by(|a, b| a.key.cmp(&b.key));
    assert_eq!(logged, live);
    assert_eq!(session.store().human_value_or("TITLE", ""), "two");
    assert_eq!(log.message_count().unwrap(), 3);
}

/// Test that concurrent publishers leave the log in timestamp order
#[test]
fn test_concurrent_publishers_keep_log_ordered() {
    let dir = TempDir::new().unwrap();
    let (_bus, registry) = registry(&dir);
    let channel = ChannelId::live("CR", "99").unwrap();
    let session = registry.open(&channel, None).unwrap();

    let publishers: Vec<_> = (0..4)
        .map(|worker| {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                for i in 0..150 {
                    let value = format!("{}-{}", worker, i);
                    session.publish_state(&format!("KEY{}", worker), &value, Payload::text(&value));
                    if i % 10 == 0 {
                        session.publish(Payload::text("tick"));
                    }
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.join().unwrap();
    }

    let log = session.event_log().unwrap();
    let (cursor, total) = log.iter_messages(0).unwrap();
    assert_eq!(total, 4 * 150 + 4 * 15);
    let timestamps: Vec<i64> = cursor.map(|r| r.unwrap().timestamp_us).collect();
    assert_eq!(timestamps.len(), total);
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));

    let sequences = log.sequences().unwrap();
    assert_eq!(sequences.len(), 4 * 150);
    assert!(sequences.windows(2).all(|w| w[0].start_us <= w[1].start_us));
    assert!(sequences
        .iter()
        .all(|s| s.end_us.map_or(true, |end| end >= s.start_us)));
    assert_eq!(sequences.iter().filter(|s| s.is_open()).count(), 1);

    let open = log.open_sequence().unwrap().unwrap();
    let snapshot = log
        .get_state_sequence(&SequenceSelector::At(open.start_us))
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.sequence.seq_id, open.seq_id);
    assert_eq!(snapshot.records.len(), 4);
}

/// Test that a seek while playing replaces the running loop
#[test]
fn test_seek_while_playing() {
    let dir = TempDir::new().unwrap();
    let texts: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    let items: Vec<(i64, &str, Option<&str>)> = texts
        .iter()
        .enumerate()
        .map(|(i, text)| (i as i64 * 200_000, text.as_str(), None))
        .collect();
    record(&dir, "12", &items);

    let (bus, registry) = registry(&dir);
    let channel = ChannelId::replay("CR", "12").unwrap();
    let session = registry.open(&channel, None).unwrap();
    let replay = session.replay().unwrap();
    let receiver = listen(&bus, &channel.topic());

    let text_of = |bytes: Vec<u8>| match single_payload(&bytes) {
        Payload::Text(value) => value.text,
        other => panic!("unexpected payload {:?}", other),
    };

    replay.start().unwrap();
    let mut seen = vec![
        text_of(next_data(&receiver, WAIT).unwrap()),
        text_of(next_data(&receiver, WAIT).unwrap()),
    ];
    assert_eq!(seen, vec!["0", "1"]);

    // index floor(0.8 * 10) = 8
    replay.seek(0.8).unwrap();
    assert_eq!(replay.status(), ReplayStatus::Playing);

    assert!(wait_until(|| replay.status() == ReplayStatus::Paused));
    while let Some(bytes) = next_data(&receiver, Duration::from_millis(300)) {
        seen.push(text_of(bytes));
    }

    let resumed_at = seen.iter().position(|t| t == "8").unwrap();
    let (before, after) = seen.split_at(resumed_at);
    assert_eq!(after, ["8", "9"]);
    // the old loop may have got one more record out before it was cancelled
    assert!(before.len() <= 3);
    for (i, text) in before.iter().enumerate() {
        assert_eq!(text, &i.to_string());
    }
    assert_eq!(replay.position(), (10, 10));
}

/// Test that a speed change applies from the next computed delay
#[test]
fn test_speed_change_during_playback() {
    let dir = TempDir::new().unwrap();
    record(
        &dir,
        "13",
        &[
            (0, "a", None),
            (300_000, "b", None),
            (600_000, "c", None),
            (900_000, "d", None),
        ],
    );

    let (bus, registry) = registry(&dir);
    let channel = ChannelId::replay("CR", "13").unwrap();
    let session = registry.open(&channel, None).unwrap();
    let replay = session.replay().unwrap();
    let receiver = listen(&bus, &channel.topic());

    replay.start().unwrap();
    assert_eq!(single_payload(&next_data(&receiver, WAIT).unwrap()), Payload::text("a"));

    // the delay before "b" is already running at 1x
    replay.pause();
    replay.set_speed(4.0);
    replay.resume().unwrap();

    let mut arrivals = Vec::new();
    for expected in ["b", "c", "d"] {
        let bytes = next_data(&receiver, WAIT).unwrap();
        arrivals.push(Instant::now());
        assert_eq!(single_payload(&bytes), Payload::text(expected));
    }

    // 300ms recorded gaps at 4x
    for pair in arrivals.windows(2) {
        let gap = pair[1].duration_since(pair[0]).as_millis();
        assert!((65..=200).contains(&gap), "gap {}ms, expected about 75ms", gap);
    }
    assert_eq!(replay.speed(), 4.0);
}

/// Test that replay reproduces the recorded gaps scaled by speed
#[test]
fn test_replay_timing_follows_speed() {
    let dir = TempDir::new().unwrap();
    let timestamps = [0_i64, 100_000, 200_000, 500_000, 900_000];
    let items: Vec<(i64, &str, Option<&str>)> = timestamps
        .iter()
        .zip(["a", "b", "c", "d", "e"])
        .map(|(ts, text)| (*ts, text, None))
        .collect();
    let recorded = record(&dir, "5", &items);

    let (bus, registry) = registry(&dir);
    let channel = ChannelId::replay("CR", "5").unwrap();
    let session = registry.open(&channel, None).unwrap();
    let replay = session.replay().unwrap();
    replay.set_speed(2.0);

    let receiver = listen(&bus, &channel.topic());
    replay.start().unwrap();

    let mut arrivals = Vec::new();
    for original in &recorded {
        let bytes = next_data(&receiver, WAIT).unwrap();
        arrivals.push(Instant::now());

        let message = Codec::decode(&bytes).unwrap();
        assert_eq!(message.header.unwrap().channel, "CR_5_REPLAY");
        assert_eq!(message.atoms, Codec::decode(original).unwrap().atoms);
    }

    let expected_ms = [50_i64, 50, 150, 200];
    for (pair, expected) in arrivals.windows(2).zip(expected_ms) {
        let gap = pair[1].duration_since(pair[0]).as_millis() as i64;
        assert!(
            gap >= expected - 10 && gap <= expected + 100,
            "gap {}ms, expected about {}ms",
            gap,
            expected
        );
    }

    assert!(wait_until(|| replay.status() == ReplayStatus::Paused));
    assert_eq!(replay.position(), (5, 5));
}

/// Test that the end-of-log progress report says paused at 100%
#[test]
fn test_replay_reports_completion() {
    let dir = TempDir::new().unwrap();
    record(&dir, "6", &[(0, "only", None)]);

    let (bus, registry) = registry(&dir);
    let channel = ChannelId::replay("CR", "6").unwrap();
    let session = registry.open(&channel, None).unwrap();
    let receiver = listen(&bus, &channel.topic());
    session.replay().unwrap().start().unwrap();

    let mut last_progress = None;
    while let Some(bytes) = next_message(&receiver, Duration::from_millis(500)) {
        if let Payload::Progress(progress) = single_payload(&bytes) {
            let kind = Codec::decode(&bytes).unwrap().header.unwrap().kind();
            assert_eq!(kind, MessageKind::Command);
            last_progress = Some(progress);
        }
    }
    let progress = last_progress.unwrap();
    assert_eq!(progress.fraction, 1.0);
    assert_eq!(progress.status(), PlaybackStatus::Paused);
}

/// Test that a seek loads the snapshot active at the target record
#[test]
fn test_seek_restores_snapshot() {
    let dir = TempDir::new().unwrap();
    let second = 1_000_000;
    record(
        &dir,
        "8",
        &[
            (0, "intro", Some("TITLE")),
            (10 * second, "plain", None),
            (20 * second, "round 2", Some("TITLE")),
            (30 * second, "blue", Some("TEAM")),
        ],
    );

    let (bus, registry) = registry(&dir);
    let channel = ChannelId::replay("CR", "8").unwrap();
    let session = registry.open(&channel, None).unwrap();
    let replay = session.replay().unwrap();

    replay.start().unwrap();
    assert_eq!(session.store().human_value_or("TITLE", ""), "intro");
    replay.pause();

    let receiver = listen(&bus, &channel.topic());
    // index floor(0.5 * 4) = 2, recorded at 20s
    replay.seek(0.5).unwrap();
    assert_eq!(replay.status(), ReplayStatus::Paused);
    assert_eq!(replay.position(), (2, 4));

    let live_log = EventLog::open(dir.path().join("CR_8_LIVE.db")).unwrap();
    let expected = live_log
        .get_state_sequence(&SequenceSelector::At(20 * second))
        .unwrap()
        .unwrap()
        .entries();
    let restored = session.store().entries();
    assert_eq!(restored.len(), expected.len());
    for (got, want) in restored.iter().zip(&expected) {
        assert_eq!(got.key, want.key);
        assert_eq!(got.human_value, want.human_value);
        assert_eq!(got.updated_at_us, want.updated_at_us);
    }
    assert!(session.store().get("TEAM").is_none());

    // the restored state is republished under the replay channel
    let bytes = next_data(&receiver, WAIT).unwrap();
    assert_eq!(single_payload(&bytes), Payload::text("round 2"));
    assert_eq!(Codec::decode(&bytes).unwrap().header.unwrap().channel, "CR_8_REPLAY");

    replay.stop();
}

/// Test that pause and play arrive as client commands on the control topic
#[test]
fn test_playback_commands_from_client() {
    let dir = TempDir::new().unwrap();
    record(&dir, "3", &[(0, "first", None), (30_000_000, "second", None)]);

    let (bus, registry) = registry(&dir);
    let channel = ChannelId::replay("CR", "3").unwrap();
    let session = registry.open(&channel, None).unwrap();
    let replay = session.replay().unwrap();
    let control = channel.control_topic();

    bus.send_command(&control, "client-1", &ClientRequest::Play.to_command())
        .unwrap();
    assert!(wait_until(|| replay.status() == ReplayStatus::Playing));

    bus.send_command(&control, "client-1", &ClientRequest::Pause.to_command())
        .unwrap();
    assert!(wait_until(|| replay.status() == ReplayStatus::Paused));

    let speed = ClientRequest::Speed { multiplier: 4.0 };
    bus.send_command(&control, "client-1", &speed.to_command())
        .unwrap();
    assert!(wait_until(|| replay.speed() == 4.0));

    bus.send_command(&control, "client-1", &ClientRequest::Play.to_command())
        .unwrap();
    assert!(wait_until(|| replay.status() == ReplayStatus::Playing));

    registry.close(&channel);
    assert_eq!(replay.status(), ReplayStatus::Stopped);
}

/// Test that domain requests reach the forwarder and playback requests on a
/// live channel do not
#[test]
fn test_request_forwarding() {
    let dir = TempDir::new().unwrap();
    let (bus, registry) = registry(&dir);
    let channel = ChannelId::live("CR", "11").unwrap();
    let (forward, forwarded) = forwarder();
    let session = registry.open(&channel, Some(forward)).unwrap();
    assert!(session.replay().is_none());

    let click = ClientRequest::Domain {
        type_tag: "sisdk.Click".to_string(),
        body: vec![1, 2, 3],
    }
    .to_command();
    bus.send_command(&channel.control_topic(), "client-9", &click)
        .unwrap();

    let (got_channel, client_id, raw) = forwarded.recv_timeout(WAIT).unwrap();
    assert_eq!(got_channel, channel);
    assert_eq!(client_id, "client-9");
    assert_eq!(raw, click);

    bus.send_command(&channel.control_topic(), "client-9", "not base64 !")
        .unwrap();
    assert_eq!(forwarded.recv_timeout(WAIT).unwrap().2, "not base64 !");

    bus.send_command(
        &channel.control_topic(),
        "client-9",
        &ClientRequest::Pause.to_command(),
    )
    .unwrap();
    assert!(forwarded.recv_timeout(Duration::from_millis(300)).is_err());
}

/// Test create-or-get and close on the registry
#[test]
fn test_registry_lifecycle() {
    let dir = TempDir::new().unwrap();
    let (bus, registry) = registry(&dir);
    let live = ChannelId::live("CR", "1").unwrap();
    let replay = ChannelId::replay("CR", "1").unwrap();

    let first = registry.open(&live, None).unwrap();
    let again = registry.open(&live, None).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    registry.open(&replay, None).unwrap();

    assert_eq!(registry.channels(), vec![live.clone(), replay.clone()]);
    assert_eq!(bus.subscriber_count(&live.control_topic()), 1);

    assert!(registry.close(&live));
    assert!(!registry.close(&live));
    assert!(registry.get(&live).is_none());
    // closed receivers are pruned on the next publish
    assert!(wait_until(|| {
        bus.publish(&live.control_topic(), b"");
        bus.subscriber_count(&live.control_topic()) == 0
    }));

    registry.close_all();
    assert!(registry.channels().is_empty());
}

/// Test that a live session records fragment sequences it publishes
#[test]
fn test_live_session_records_sequences() {
    let dir = TempDir::new().unwrap();
    let (bus, registry) = registry(&dir);
    let channel = ChannelId::live("CR", "2").unwrap();
    let session = registry.open(&channel, None).unwrap();
    let receiver = listen(&bus, &channel.topic());

    session.publish_sequence(&[
        Fragment::new(Payload::text("attack")),
        Fragment::after(
            500,
            Payload::Clock(ClockValue {
                mode: ClockMode::Elapsed as i32,
                seconds: 1.0,
                running: false,
            }),
        ),
    ]);

    let bytes = next_message(&receiver, WAIT).unwrap();
    let message = Codec::decode(&bytes).unwrap();
    assert_eq!(message.atoms.len(), 2);
    assert_eq!(message.atoms[1].type_tag, CLOCK_TAG);
    assert_eq!(message.atoms[1].wait_ms, 500);

    let log = session.event_log().unwrap();
    assert_eq!(log.message_at(0).unwrap().unwrap().message, bytes);
    assert!(session.store().is_empty());
}

/// Test that a registry built from configuration validates it first
#[test]
fn test_registry_from_config() {
    let dir = TempDir::new().unwrap();
    let mut bad = config(&dir);
    bad.session.wall_clock_key = bad.session.clock_key.clone();
    assert!(SessionRegistry::from_config(bad).is_err());

    let registry = SessionRegistry::from_config(config(&dir)).unwrap();
    let channel = ChannelId::live("CR", "4").unwrap();
    let session: Arc<Session> = registry.open(&channel, None).unwrap();
    assert_eq!(session.channel(), &channel);
    assert!(dir.path().join("CR_4_LIVE.db").exists());
}

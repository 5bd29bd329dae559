//! Cross-cutting invariants: monotonic stream-id cutoffs, window
//! accounting, dependency-tree integrity under PRIORITY storms, resource
//! caps, and server push bookkeeping.

use bytes::Bytes;
use manifold::frame::{FrameType, PriorityData};
use manifold::{Config, Event};

mod helpers;
use helpers::peer::{goaway, TestPeer};

#[test]
fn pull_max_open_is_monotonic() {
    let mut peer = TestPeer::handshake(Config::default());
    let mut last = 0;
    for sid in [1u32, 5, 9] {
        peer.send_get(sid, "/");
        let observed = peer.conn.debug_state().pull_max_open;
        assert!(observed >= last, "cutoff moved backwards");
        last = observed;
    }
    assert_eq!(last, 9);

    // PRIORITY references and resets never move it either.
    peer.send_priority(15, 0, 16, false);
    peer.send_rst_stream(9, manifold::ErrorCode::Cancel);
    assert_eq!(peer.conn.debug_state().pull_max_open, 9);
}

#[test]
fn headers_below_cutoff_open_no_stream() {
    let mut peer = TestPeer::handshake(Config::default());
    peer.send_get(5, "/");
    assert_eq!(peer.events(), vec![Event::Request(5)]);

    // Stream 3 is "closed" by definition: its id sits below the cutoff.
    peer.send_get(3, "/stale");
    let frames = peer.flush();
    assert!(goaway(&frames).is_some());
    assert!(peer.conn.request(3).is_none());
}

#[test]
fn connection_receive_window_is_replenished_at_half_mark() {
    let mut peer = TestPeer::handshake(Config::default());
    peer.send_post(1, "/bulk", &[]);

    let full = peer.conn.debug_state().input_window;
    let chunk = vec![0x61u8; 16_000];
    let mut sent: i64 = 0;
    let mut saw_replenish = false;
    while sent <= full / 2 + 32_000 {
        peer.send_data(1, &chunk, false);
        sent += chunk.len() as i64;
        let frames = peer.flush();
        if frames
            .iter()
            .any(|f| f.is(FrameType::WindowUpdate) && f.header.stream_id == 0)
        {
            saw_replenish = true;
            break;
        }
    }
    assert!(saw_replenish, "no connection WINDOW_UPDATE issued");
    // The replenishment restores the full window.
    assert_eq!(peer.conn.debug_state().input_window, full);
}

#[test]
fn dependency_tree_parents_stay_valid() {
    let mut peer = TestPeer::handshake(Config::default());

    // A Chromium-style exclusive chain plus assorted reprioritizations.
    peer.send_get(1, "/a");
    peer.send_headers_with_priority(
        3,
        &[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "example.com"),
            (":path", "/b"),
        ],
        true,
        PriorityData {
            exclusive: true,
            dependency: 1,
            weight: 200,
        },
    );
    peer.send_priority(5, 3, 100, true);
    peer.send_priority(5, 0, 50, false);
    peer.send_priority(3, 5, 20, false);
    assert!(!peer.conn.is_closed());

    let debug = peer.conn.debug_state();
    let live: Vec<u32> = debug.streams.iter().map(|s| s.id).collect();
    for stream in &debug.streams {
        assert!(
            stream.parent == 0
                || live.contains(&stream.parent)
                || debug.recently_closed.contains(&stream.parent),
            "stream {} has dangling parent {}",
            stream.id,
            stream.parent
        );
    }
}

#[test]
fn priority_only_streams_are_capped() {
    let config = Config {
        max_streams_for_priority: 2,
        ..Config::default()
    };
    let mut peer = TestPeer::handshake(config);
    peer.send_priority(101, 0, 16, false);
    peer.send_priority(103, 0, 16, false);
    assert!(!peer.conn.is_closed());

    peer.send_priority(105, 0, 16, false);
    let frames = peer.flush();
    assert_eq!(
        goaway(&frames).unwrap().error_code,
        manifold::ErrorCode::EnhanceYourCalm
    );
}

#[test]
fn priority_opened_stream_is_promoted_by_headers() {
    let mut peer = TestPeer::handshake(Config::default());
    peer.send_priority(5, 0, 42, false);
    assert!(peer.events().is_empty());
    // PRIORITY alone does not advance the cutoff.
    assert_eq!(peer.conn.debug_state().pull_max_open, 0);

    peer.send_get(5, "/now-real");
    assert_eq!(peer.events(), vec![Event::Request(5)]);
    assert_eq!(peer.conn.debug_state().pull_max_open, 5);
    let (_, weight) = peer.conn.actual_priority(5).unwrap();
    assert_eq!(weight, 42);
}

#[test]
fn closed_priority_ring_evicts_fifo() {
    let mut peer = TestPeer::handshake(Config::default());
    // Open and immediately finish more streams than the ring holds.
    for i in 0..12u32 {
        let sid = 2 * i + 1;
        peer.send_get(sid, "/");
        peer.events();
        peer.conn.send_response(sid, 204, &[], true).unwrap();
        peer.flush();
    }
    let debug = peer.conn.debug_state();
    assert_eq!(debug.recently_closed.len(), 10);
    // The two oldest ids were evicted.
    assert!(!debug.recently_closed.contains(&1));
    assert!(!debug.recently_closed.contains(&3));
    assert!(debug.recently_closed.contains(&23));
}

#[test]
fn teardown_leaves_no_live_state() {
    let mut peer = TestPeer::handshake(Config::default());
    peer.send_get(1, "/");
    peer.send_post(3, "/upload", &[]);
    peer.send_data(3, b"partial", false);
    peer.events();

    // A protocol violation tears everything down.
    peer.send_window_update(0, 0);
    peer.flush();
    assert!(peer.conn.is_closed());
    let debug = peer.conn.debug_state();
    assert!(debug.streams.is_empty());

    // The dispatched request surfaces as a reset; the half-received upload
    // was never dispatched and simply vanishes.
    let events = peer.events();
    assert!(events.contains(&Event::Reset(1)));
    assert!(!events.contains(&Event::Reset(3)));
}

#[test]
fn settings_window_delta_applies_to_streams_only() {
    let mut peer = TestPeer::handshake(Config::default());
    peer.send_get(1, "/");
    peer.events();

    let before = peer.conn.debug_state();
    let stream_before = before.streams[0].send_window;
    let conn_before = before.output_window;

    peer.send_settings(vec![(0x4, 65_535 + 1_000)]);
    let after = peer.conn.debug_state();
    assert_eq!(after.streams[0].send_window, stream_before + 1_000);
    assert_eq!(after.output_window, conn_before);
}

#[test]
fn push_promise_is_emitted_once_per_path() {
    let mut peer = TestPeer::handshake(Config::default());
    peer.send_get(1, "/index.html");
    assert_eq!(peer.events(), vec![Event::Request(1)]);

    peer.conn.push_path(1, "/style.css", false);
    peer.conn.push_path(1, "/style.css", false);

    let events = peer.events();
    assert_eq!(events, vec![Event::Request(2)]);

    let frames = peer.flush();
    let promises: Vec<_> = frames
        .iter()
        .filter(|f| f.is(FrameType::PushPromise))
        .collect();
    assert_eq!(promises.len(), 1);
    assert_eq!(promises[0].header.stream_id, 1);
    // Promised stream id leads the payload.
    let promised = u32::from_be_bytes(promises[0].payload[..4].try_into().unwrap());
    assert_eq!(promised, 2);

    // The pushed response flows like any other.
    peer.conn.send_response(2, 200, &[], false).unwrap();
    peer.conn
        .send_body(2, Bytes::from_static(b"body{}"), true)
        .unwrap();
    peer.conn.send_response(1, 200, &[], true).unwrap();
    peer.flush();
    assert!(peer.conn.request(2).is_none());
}

#[test]
fn push_is_disabled_by_peer_settings() {
    let mut peer = TestPeer::new(Config::default());
    peer.send_preface();
    peer.send_settings(vec![(0x2, 0)]); // ENABLE_PUSH = 0
    peer.flush();

    peer.send_get(1, "/index.html");
    peer.events();
    peer.conn.push_path(1, "/style.css", false);
    assert!(peer.events().is_empty());
    let frames = peer.flush();
    assert!(!frames.iter().any(|f| f.is(FrameType::PushPromise)));
}

#[test]
fn critical_push_keeps_its_weight_against_priority_frames() {
    let mut peer = TestPeer::handshake(Config::default());
    peer.send_get(1, "/index.html");
    peer.events();
    peer.conn.push_path(1, "/critical.js", true);
    assert_eq!(peer.events(), vec![Event::Request(2)]);

    let (parent, weight) = peer.conn.actual_priority(2).unwrap();
    assert_eq!(parent, 0, "critical pushes hang off the root");
    assert_eq!(weight, 257);

    // The client cannot demote it.
    peer.send_priority(2, 1, 8, false);
    let (_, weight) = peer.conn.actual_priority(2).unwrap();
    assert_eq!(weight, 257);
}

#[test]
fn weighted_siblings_share_bandwidth_proportionally() {
    let mut peer = TestPeer::handshake(Config::default());
    peer.send_headers_with_priority(
        1,
        &[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "example.com"),
            (":path", "/heavy"),
        ],
        true,
        PriorityData {
            exclusive: false,
            dependency: 0,
            weight: 192,
        },
    );
    peer.send_headers_with_priority(
        3,
        &[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "example.com"),
            (":path", "/light"),
        ],
        true,
        PriorityData {
            exclusive: false,
            dependency: 0,
            weight: 64,
        },
    );
    peer.events();

    let body = vec![0x62u8; 100_000];
    for sid in [1u32, 3] {
        peer.conn.send_response(sid, 200, &[], false).unwrap();
        peer.conn
            .send_body(sid, Bytes::from(body.clone()), true)
            .unwrap();
    }

    // Egress is bounded by the connection send window; the weighted
    // traversal hands what fits to the heavier stream first.
    let frames = peer.flush();
    let heavy: usize = frames
        .iter()
        .filter(|f| f.is(FrameType::Data) && f.header.stream_id == 1)
        .map(|f| f.payload.len())
        .sum();
    let light: usize = frames
        .iter()
        .filter(|f| f.is(FrameType::Data) && f.header.stream_id == 3)
        .map(|f| f.payload.len())
        .sum();
    assert!(heavy > light * 2, "heavy={heavy} light={light}");
}

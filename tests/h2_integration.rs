//! HTTP/2 connection integration tests.
//!
//! These tests drive `milli_h2` through its public API only: streams are
//! created through the connection or through inbound frame events, data is
//! queued as flow-controlled units, and output is read back from a
//! `FrameQueue`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use bytes::Bytes;
use milli_h2::h2::{
    DataFrame, FrameQueue, H2Frame, HeadersFrame, OutboundFrame, StreamState, Streamable,
    WeightedFairQueueDistributor, WritabilityListener,
};
use milli_h2::{ConnectionConfig, Error, H2Connection, H2Error, Role, Side, StreamId};

// ---------------------------------------------------------------------------
// Test infrastructure
// ---------------------------------------------------------------------------

fn client() -> H2Connection {
    H2Connection::new(Role::Client, ConnectionConfig::default()).unwrap()
}

fn server() -> H2Connection {
    H2Connection::new(Role::Server, ConnectionConfig::default()).unwrap()
}

/// A queue that never fills up, so only windows limit writes.
fn roomy_queue() -> FrameQueue {
    FrameQueue::with_high_water_mark(1 << 30)
}

fn data(stream_id: StreamId, len: usize, end_stream: bool) -> Box<DataFrame> {
    Box::new(DataFrame::new(stream_id, Bytes::from(vec![0xab; len]), end_stream))
}

/// Drain the queue and sum DATA bytes per stream.
fn drain_data(out: &mut FrameQueue) -> BTreeMap<StreamId, usize> {
    let mut written = BTreeMap::new();
    while let Some(frame) = out.poll_frame() {
        if let OutboundFrame::Data {
            stream_id, data, ..
        } = frame
        {
            *written.entry(stream_id).or_default() += data.len();
        }
    }
    written
}

/// Fake per-stream send queues for driving the distributor directly.
#[derive(Default)]
struct FakeStreams {
    state: BTreeMap<StreamId, (usize, i32)>,
    written: BTreeMap<StreamId, usize>,
}

impl FakeStreams {
    fn set(&mut self, wfq: &mut WeightedFairQueueDistributor, id: StreamId, pending: usize, window: i32) {
        self.state.insert(id, (pending, window));
        wfq.update_streamable_bytes(&self.snapshot(id));
    }

    fn snapshot(&self, id: StreamId) -> Streamable {
        let (pending, window) = self.state[&id];
        Streamable {
            stream_id: id,
            pending_bytes: pending,
            has_frame: pending > 0,
            window,
        }
    }

    fn write(&mut self, id: StreamId, n: usize) -> Result<Streamable, Error> {
        let (pending, window) = self.state.get_mut(&id).unwrap();
        assert!(*window >= 0, "writer invoked for stream {id} with negative window");
        *pending -= n;
        *window -= n as i32;
        *self.written.entry(id).or_default() += n;
        Ok(self.snapshot(id))
    }

    fn total(&self) -> usize {
        self.written.values().sum()
    }
}

fn distributor(ids: &[StreamId]) -> WeightedFairQueueDistributor {
    let mut wfq = WeightedFairQueueDistributor::new(5, 1024);
    for &id in ids {
        wfq.on_stream_added(id, false);
        wfq.on_stream_active(id);
    }
    wfq
}

// ---------------------------------------------------------------------------
// Stream registry
// ---------------------------------------------------------------------------

#[test]
fn allocated_ids_have_endpoint_parity_and_increase() {
    let mut conn = client();
    let mut last = 0;
    for _ in 0..5 {
        let id = conn.local_mut().increment_and_get_next_stream_id().unwrap();
        conn.create_stream(Side::Local, id, false).unwrap();
        assert_eq!(id % 2, 1);
        assert!(id > last);
        last = id;
    }
    assert_eq!(conn.local().last_stream_created(), last);

    let mut conn = server();
    let a = conn.local_mut().increment_and_get_next_stream_id().unwrap();
    conn.create_stream(Side::Local, a, false).unwrap();
    let b = conn.local_mut().increment_and_get_next_stream_id().unwrap();
    assert_eq!((a % 2, b % 2), (0, 0));
    assert!(b > a);
}

#[test]
fn out_of_order_and_wrong_parity_ids_are_connection_errors() {
    let mut conn = server();
    conn.create_stream(Side::Remote, 5, false).unwrap();

    let lower = conn.create_stream(Side::Remote, 3, false).unwrap_err();
    assert!(lower.is_connection_error());
    assert_eq!(lower.code(), H2Error::ProtocolError);

    let parity = conn.create_stream(Side::Remote, 8, false).unwrap_err();
    assert!(parity.is_connection_error());
}

#[test]
fn exceeding_active_limit_refuses_only_the_new_stream() {
    let mut conn = server();
    conn.remote_mut().set_max_active_streams(1);
    conn.create_stream(Side::Remote, 1, false).unwrap();
    let err = conn.create_stream(Side::Remote, 3, false).unwrap_err();
    assert!(err.is_stream_error());
    assert_eq!(err.code(), H2Error::RefusedStream);
    assert_eq!(conn.num_active_streams(), 1);
}

#[test]
fn create_then_close_restores_active_count() {
    let mut conn = server();
    conn.create_stream(Side::Remote, 1, false).unwrap();
    let before = conn.num_active_streams();

    conn.create_stream(Side::Remote, 5, false).unwrap();
    assert_eq!(conn.num_active_streams(), before + 1);
    conn.close_stream(5).unwrap();

    assert!(conn.stream(5).is_none());
    assert_eq!(conn.num_active_streams(), before);
}

#[test]
fn visitor_closing_another_stream_completes_traversal() {
    let mut conn = server();
    for id in [1, 3, 5, 7] {
        conn.create_stream(Side::Remote, id, false).unwrap();
    }

    let mut first = Vec::new();
    conn.for_each_active_stream(|c, id| {
        first.push(id);
        if id == 3 {
            c.close_stream(1)?;
        }
        Ok(true)
    })
    .unwrap();
    assert_eq!(first, [1, 3, 5, 7]);

    let mut second = Vec::new();
    conn.for_each_active_stream(|_, id| {
        second.push(id);
        Ok(true)
    })
    .unwrap();
    assert_eq!(second, [3, 5, 7]);
    assert!(conn.stream(1).is_none());
}

#[test]
fn go_away_sent_must_not_decrease() {
    let mut conn = server();
    for id in [1, 3, 5, 7] {
        conn.create_stream(Side::Remote, id, false).unwrap();
    }

    assert!(conn.go_away_sent(5, H2Error::NoError, b"").unwrap());
    assert!(conn.is_go_away_sent());
    assert!(conn.stream(7).is_none());
    assert!(conn.stream(5).is_some());

    // Same id again is a no-op.
    assert!(!conn.go_away_sent(5, H2Error::NoError, b"").unwrap());
    assert!(conn.stream(5).is_some());

    let err = conn.go_away_sent(3, H2Error::NoError, b"").unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(err.code(), H2Error::ProtocolError);
}

#[test]
fn streams_above_go_away_are_refused() {
    let mut conn = server();
    conn.create_stream(Side::Remote, 1, false).unwrap();
    conn.go_away_sent(1, H2Error::NoError, b"").unwrap();
    let err = conn.on_frame(H2Frame::Headers {
        stream_id: 3,
        end_stream: false,
        priority: None,
    });
    let err = err.unwrap_err();
    assert!(err.is_stream_error());
    assert_eq!(err.code(), H2Error::RefusedStream);
}

#[test]
fn close_completes_when_last_stream_is_removed() {
    let mut conn = client();
    conn.create_stream(Side::Local, 1, false).unwrap();
    conn.create_stream(Side::Local, 3, true).unwrap();
    conn.close();
    assert!(conn.is_closing());
    assert!(conn.is_close_complete());
    assert!(conn.stream(1).is_none());
    assert!(conn.stream(0).is_some());
}

// ---------------------------------------------------------------------------
// Flow control
// ---------------------------------------------------------------------------

#[test]
fn window_tracks_increments_minus_written() {
    let mut conn = client();
    let mut out = roomy_queue();
    conn.create_stream(Side::Local, 1, false).unwrap();
    conn.increment_window_size(0, 1_000_000).unwrap();

    let initial = conn.initial_window_size();
    let mut increments = 0i64;
    let mut written = 0i64;

    conn.add_flow_controlled(1, data(1, 100_000, false)).unwrap();
    conn.write_pending_bytes(&mut out).unwrap();
    written += drain_data(&mut out).values().sum::<usize>() as i64;
    assert_eq!(i64::from(conn.window_size(1).unwrap()), i64::from(initial) + increments - written);
    assert_eq!(conn.window_size(1), Some(0));

    for delta in [10_000, 250, 40_000] {
        conn.increment_window_size(1, delta).unwrap();
        increments += i64::from(delta);
        conn.write_pending_bytes(&mut out).unwrap();
        written += drain_data(&mut out).values().sum::<usize>() as i64;
        assert_eq!(
            i64::from(conn.window_size(1).unwrap()),
            i64::from(initial) + increments - written
        );
    }
    assert_eq!(written, 100_000);
    assert!(!conn.has_flow_controlled(1));
}

#[test]
fn stream_window_overflow_is_stream_error() {
    let mut conn = client();
    conn.create_stream(Side::Local, 1, false).unwrap();
    let err = conn.increment_window_size(1, i32::MAX).unwrap_err();
    assert!(err.is_stream_error());
    assert_eq!(err.code(), H2Error::FlowControlError);
    assert_eq!(conn.window_size(1), Some(65_535));
}

#[test]
fn initial_window_change_rebases_streams() {
    let mut conn = client();
    let mut out = roomy_queue();
    conn.create_stream(Side::Local, 1, false).unwrap();
    conn.create_stream(Side::Local, 3, false).unwrap();

    conn.add_flow_controlled(1, data(1, 40_000, false)).unwrap();
    conn.write_pending_bytes(&mut out).unwrap();
    assert_eq!(conn.window_size(1), Some(65_535 - 40_000));

    conn.set_initial_window_size(10_000).unwrap();
    assert_eq!(conn.window_size(1), Some(10_000 - 40_000));
    assert_eq!(conn.window_size(3), Some(10_000));

    // A negative window blocks the stream entirely.
    drain_data(&mut out);
    conn.add_flow_controlled(1, data(1, 10, false)).unwrap();
    conn.add_flow_controlled(3, data(3, 10, false)).unwrap();
    conn.write_pending_bytes(&mut out).unwrap();
    let written = drain_data(&mut out);
    assert_eq!(written.get(&1), None);
    assert_eq!(written.get(&3), Some(&10));

    assert!(conn.set_initial_window_size(-1).is_err());
}

#[test]
fn rejected_initial_window_change_leaves_every_window_alone() {
    let mut conn = client();
    for id in [1, 3, 5] {
        conn.create_stream(Side::Local, id, false).unwrap();
    }
    conn.increment_window_size(5, i32::MAX - 65_535).unwrap();

    let err = conn.set_initial_window_size(65_635).unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(err.code(), H2Error::FlowControlError);
    assert_eq!(conn.initial_window_size(), 65_535);
    assert_eq!(conn.window_size(1), Some(65_535));
    assert_eq!(conn.window_size(3), Some(65_535));
    assert_eq!(conn.window_size(5), Some(i32::MAX));
}

#[test]
fn connection_window_bounds_total_output() {
    let mut conn = client();
    let mut out = roomy_queue();
    for id in [1, 3, 5] {
        conn.create_stream(Side::Local, id, false).unwrap();
        conn.add_flow_controlled(id, data(id, 50_000, false)).unwrap();
    }
    conn.write_pending_bytes(&mut out).unwrap();
    let total: usize = drain_data(&mut out).values().sum();
    assert_eq!(total, 65_535);
    assert_eq!(conn.connection_window_size(), 0);
    assert!(!conn.is_writable(0));
}

#[test]
fn trailers_follow_data_in_order() {
    let mut conn = client();
    let mut out = roomy_queue();
    conn.create_stream(Side::Local, 1, false).unwrap();
    conn.add_flow_controlled(1, data(1, 10, false)).unwrap();
    conn.add_flow_controlled(1, data(1, 20, false)).unwrap();
    let trailers = vec![(Bytes::from_static(b"grpc-status"), Bytes::from_static(b"0"))];
    conn.add_flow_controlled(1, Box::new(HeadersFrame::new(1, trailers, true)))
        .unwrap();
    conn.write_pending_bytes(&mut out).unwrap();

    match out.poll_frame() {
        Some(OutboundFrame::Data {
            stream_id: 1,
            data,
            end_stream: false,
            ..
        }) => assert_eq!(data.len(), 30),
        other => panic!("expected merged DATA, got {other:?}"),
    }
    assert!(matches!(
        out.poll_frame(),
        Some(OutboundFrame::Headers {
            stream_id: 1,
            end_stream: true,
            ..
        })
    ));
    assert!(out.is_empty());
}

#[test]
fn closing_stream_fails_each_queued_unit_once() {
    let failures = Rc::new(RefCell::new(Vec::new()));
    let mut conn = client();
    conn.create_stream(Side::Local, 1, false).unwrap();
    conn.set_initial_window_size(0).unwrap();

    for len in [10, 20, 30] {
        let failures = failures.clone();
        let unit = DataFrame::new(1, Bytes::from(vec![0; len]), false).on_complete(move |r| {
            failures.borrow_mut().push(r.map_err(Error::code));
        });
        conn.add_flow_controlled(1, Box::new(unit)).unwrap();
    }
    let trailer_failures = failures.clone();
    let trailers = HeadersFrame::new(1, Vec::new(), true).on_complete(move |r| {
        trailer_failures.borrow_mut().push(r.map_err(Error::code));
    });
    conn.add_flow_controlled(1, Box::new(trailers)).unwrap();

    conn.close_stream(1).unwrap();
    assert_eq!(*failures.borrow(), vec![Err(H2Error::StreamClosed); 4]);
    assert_eq!(conn.flow_controller().total_pending_bytes(), 0);
}

#[test]
fn queueing_on_missing_stream_fails_the_unit() {
    let failed = Rc::new(RefCell::new(false));
    let mut conn = client();
    let flag = failed.clone();
    let unit = DataFrame::new(9, Bytes::from_static(b"x"), true).on_complete(move |r| {
        *flag.borrow_mut() = r.is_err();
    });
    assert_eq!(conn.add_flow_controlled(9, Box::new(unit)), Err(Error::StreamNotFound(9)));
    assert!(*failed.borrow());
}

struct Edges(Rc<RefCell<Vec<(StreamId, bool)>>>);

impl WritabilityListener for Edges {
    fn writability_changed(&mut self, stream_id: StreamId, writable: bool) {
        self.0.borrow_mut().push((stream_id, writable));
    }
}

#[test]
fn writability_listener_sees_only_edges() {
    let edges = Rc::new(RefCell::new(Vec::new()));
    let mut conn = client();
    let mut out = roomy_queue();
    conn.set_writability_listener(Some(Box::new(Edges(edges.clone()))));

    conn.create_stream(Side::Local, 1, false).unwrap();
    assert!(conn.is_writable(1));
    conn.add_flow_controlled(1, data(1, 70_000, false)).unwrap();
    assert!(!conn.is_writable(1));
    conn.write_pending_bytes(&mut out).unwrap();
    assert_eq!(conn.window_size(1), Some(0));

    conn.increment_window_size(0, 100_000).unwrap();
    conn.increment_window_size(1, 100_000).unwrap();
    assert!(conn.is_writable(1));

    assert_eq!(*edges.borrow(), [(1, true), (1, false), (1, true)]);
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[test]
fn repeated_dependency_update_is_idempotent() {
    let mut conn = server();
    for id in [1, 3, 5] {
        conn.create_stream(Side::Remote, id, false).unwrap();
    }
    conn.update_dependency_tree(5, 3, 42, false).unwrap();
    let children_3 = conn.priority().children_of(3);
    let children_0 = conn.priority().children_of(0);

    conn.update_dependency_tree(5, 3, 42, false).unwrap();
    assert_eq!(conn.priority().children_of(3), children_3);
    assert_eq!(conn.priority().children_of(0), children_0);
    assert_eq!(conn.priority().weight_of(5), Some(42));
}

#[test]
fn exclusive_dependency_adopts_siblings() {
    let mut conn = server();
    for id in [1, 3, 5, 7] {
        conn.create_stream(Side::Remote, id, false).unwrap();
    }
    conn.update_dependency_tree(3, 1, 16, false).unwrap();
    conn.update_dependency_tree(5, 1, 16, false).unwrap();
    let prior = conn.priority().children_of(1);

    conn.update_dependency_tree(7, 1, 16, true).unwrap();
    assert_eq!(conn.priority().children_of(1), [7]);
    assert_eq!(conn.priority().children_of(7), prior);
}

#[test]
fn distribute_never_exceeds_budget_or_touches_negative_windows() {
    let mut wfq = distributor(&[1, 3, 5, 7]);
    let mut streams = FakeStreams::default();
    streams.set(&mut wfq, 1, 10_000, 8_000);
    streams.set(&mut wfq, 3, 10_000, -1);
    streams.set(&mut wfq, 5, 3_000, 65_535);
    streams.set(&mut wfq, 7, 10_000, 65_535);
    wfq.update_dependency_tree(7, 5, 100, false).unwrap();

    for budget in [0, 1, 500, 4_000, 9_999] {
        let before = streams.total();
        wfq.distribute(budget, &mut |id: StreamId, n: usize| streams.write(id, n))
            .unwrap();
        assert!(streams.total() - before <= budget);
    }
    assert_eq!(streams.written.get(&3), None);
}

#[test]
fn weights_one_and_three_split_one_to_three() {
    let mut wfq = distributor(&[1, 3]);
    wfq.update_dependency_tree(1, 0, 1, false).unwrap();
    wfq.update_dependency_tree(3, 0, 3, false).unwrap();
    let mut streams = FakeStreams::default();
    streams.set(&mut wfq, 1, usize::MAX / 4, i32::MAX);
    streams.set(&mut wfq, 3, usize::MAX / 4, i32::MAX);

    let mut total = 0;
    for _ in 0..20 {
        wfq.distribute(4000, &mut |id: StreamId, n: usize| streams.write(id, n))
            .unwrap();
        total += 4000;
    }
    let light = streams.written[&1];
    let heavy = streams.written[&3];
    assert_eq!(light + heavy, total);
    assert!(light.abs_diff(total / 4) <= wfq.allocation_quantum());
    assert!(heavy.abs_diff(total * 3 / 4) <= wfq.allocation_quantum());
}

#[test]
fn priority_survives_stream_close_within_retention() {
    let mut conn = server();
    conn.create_stream(Side::Remote, 1, false).unwrap();
    conn.create_stream(Side::Remote, 3, false).unwrap();
    conn.update_dependency_tree(3, 1, 77, false).unwrap();
    conn.close_stream(1).unwrap();

    assert!(conn.stream(1).is_none());
    assert!(conn.priority().contains(1));
    assert_eq!(conn.priority().parent_of(3), Some(1));
    assert_eq!(conn.stream(3).map(|s| s.state()), Some(StreamState::Open));
}

//! Integration tests for the per-node server.
//!
//! Each test hands the server one end of a loopback TCP pair and plays the
//! client by writing raw request frames on the other end.

mod common;

use std::time::{Duration, Instant};

use common::*;
use request_queue::{QueueError, RequestFailure, RequestQueueServer};

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

/// Retransmitted numbers in a single burst run once but are each acknowledged.
#[tokio::test]
async fn repeated_numbers_in_one_burst_are_performed_once() {
    let (server, handler) = new_server(1);
    let mut conn = connect_raw(&server).await;

    send_frames(
        &mut conn,
        &[(0, OK, 0), (0, OK, 0), (1, OK, 1), (1, OK, 1), (2, OK, 2)],
    )
    .await;
    for _ in 0..5 {
        assert_eq!(read_response(&mut conn).await, Ok(()));
    }

    assert_eq!(handler.performed(), vec![0, 1, 2]);
    assert_eq!(server.last_performed(), Some(2));
}

/// A client that reconnects and resends gets nothing performed twice.
#[tokio::test]
async fn dedup_state_survives_reconnection() {
    let (server, handler) = new_server(1);

    let mut first = connect_raw(&server).await;
    send_frames(&mut first, &[(0, OK, 0), (1, OK, 1), (2, OK, 2)]).await;
    for _ in 0..3 {
        assert_eq!(read_response(&mut first).await, Ok(()));
    }
    server.disconnect();
    assert_closed(&mut first).await;

    let mut second = connect_raw(&server).await;
    send_frames(&mut second, &[(1, OK, 1), (2, OK, 2), (3, OK, 3), (4, OK, 4)]).await;
    for _ in 0..4 {
        assert_eq!(read_response(&mut second).await, Ok(()));
    }

    assert_eq!(handler.performed(), vec![0, 1, 2, 3, 4]);
}

/// Numbering carries on from 32767 to 0, and the old 32767 is then a duplicate.
#[tokio::test]
async fn numbers_continue_across_the_wrap() {
    let (server, handler) = new_server(1);
    let mut conn = connect_raw(&server).await;

    // Walk the server up to the top of the number space in legal steps.
    let mut frames = Vec::new();
    let mut number: u16 = 0;
    while number < 32_767 {
        frames.push((number, OK, 0));
        number = (number + 9_000).min(32_767);
    }
    frames.push((32_767, OK, 0));
    frames.push((0, OK, 1));
    frames.push((32_767, OK, 2)); // duplicate of an older request

    send_frames(&mut conn, &frames).await;
    for _ in 0..frames.len() {
        assert_eq!(read_response(&mut conn).await, Ok(()));
    }

    assert_eq!(server.last_performed(), Some(0));
    assert_eq!(handler.performed().last(), Some(&1));
    assert!(!handler.performed().contains(&2));
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// After a failure, later requests get the same failure back and are not run.
#[tokio::test]
async fn failure_is_echoed_without_performing_later_requests() {
    let (server, handler) = new_server(1);
    let mut conn = connect_raw(&server).await;

    send_frames(&mut conn, &[(0, FAIL, 10), (1, OK, 11)]).await;

    let expected = RequestFailure::new(FAILURE_KIND, "refused 10");
    assert_eq!(read_response(&mut conn).await, Err(expected.clone()));
    assert_eq!(read_response(&mut conn).await, Err(expected.clone()));

    assert_eq!(handler.performed(), vec![10]);
    assert_eq!(server.last_performed(), None);
    assert_eq!(server.failure(), Some(expected));
}

/// The failure is still answered on a fresh connection.
#[tokio::test]
async fn failure_outlives_the_connection() {
    let (server, handler) = new_server(1);

    let mut first = connect_raw(&server).await;
    send_frames(&mut first, &[(0, FAIL, 10)]).await;
    assert!(read_response(&mut first).await.is_err());

    let mut second = connect_raw(&server).await;
    send_frames(&mut second, &[(0, OK, 10), (1, OK, 11)]).await;
    assert!(read_response(&mut second).await.is_err());
    assert!(read_response(&mut second).await.is_err());

    assert_eq!(handler.performed(), vec![10]);
}

/// Clearing the failure lets the next request run.
#[tokio::test]
async fn reset_failure_resumes_execution() {
    let (server, handler) = new_server(1);
    let mut conn = connect_raw(&server).await;

    send_frames(&mut conn, &[(0, FAIL, 10)]).await;
    assert!(read_response(&mut conn).await.is_err());

    server.reset_failure();
    assert_eq!(server.failure(), None);

    send_frames(&mut conn, &[(0, OK, 20)]).await;
    assert_eq!(read_response(&mut conn).await, Ok(()));
    assert_eq!(handler.performed(), vec![10, 20]);
    assert_eq!(server.last_performed(), Some(0));
}

/// State can be read and reset while a slow handler is still running.
#[tokio::test]
async fn accessors_do_not_wait_for_a_running_handler() {
    let (server, handler) = new_server(1);
    let mut conn = connect_raw(&server).await;

    send_frames(&mut conn, &[(0, OK, 0), (1, SLOW, 1)]).await;
    assert_eq!(read_response(&mut conn).await, Ok(()));
    tokio::time::timeout(PATIENCE, async {
        while !handler.performed().contains(&1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("slow request never started");

    let started = Instant::now();
    assert_eq!(server.last_performed(), Some(0));
    assert_eq!(server.failure(), None);
    server.reset_failure();
    let waited = started.elapsed();
    assert!(waited < SLOW_FOR / 2, "accessors waited {waited:?}");

    assert_eq!(read_response(&mut conn).await, Ok(()));
    assert_eq!(server.last_performed(), Some(1));
    assert_eq!(handler.performed(), vec![0, 1]);
}

/// A handler panic is answered as a failure of kind `panic`.
#[tokio::test]
async fn panicking_handler_becomes_a_failure() {
    let (server, handler) = new_server(1);
    let mut conn = connect_raw(&server).await;

    send_frames(&mut conn, &[(0, PANIC, 7), (1, OK, 8)]).await;

    let first = read_response(&mut conn).await.unwrap_err();
    assert_eq!(first.kind, request_queue::request::PANIC_KIND);
    assert!(first.message.contains("exploded on 7"), "{}", first.message);
    assert_eq!(read_response(&mut conn).await, Err(first));
    assert_eq!(handler.performed(), vec![7]);
}

// ---------------------------------------------------------------------------
// Protocol violations
// ---------------------------------------------------------------------------

/// A number that cannot be ordered drops the connection without a reply.
#[tokio::test]
async fn ambiguous_number_closes_connection_without_response() {
    let (server, handler) = new_server(1);
    let mut conn = connect_raw(&server).await;

    send_frames(&mut conn, &[(0, OK, 0)]).await;
    assert_eq!(read_response(&mut conn).await, Ok(()));

    send_frames(&mut conn, &[(20_000, OK, 1)]).await;
    let next = tokio::time::timeout(PATIENCE, request_queue::wire::read_bool(&mut conn))
        .await
        .expect("server neither answered nor closed");
    assert!(next.is_err(), "expected end of stream, got {next:?}");

    assert_eq!(handler.performed(), vec![0]);
    assert_eq!(server.last_performed(), Some(0));
    assert_eq!(server.failure(), None);
}

/// A payload the handler cannot read drops only that connection.
#[tokio::test]
async fn unreadable_request_closes_connection() {
    let (server, handler) = new_server(1);
    let mut conn = connect_raw(&server).await;

    // Request number followed by an action the handler does not know.
    use tokio::io::AsyncWriteExt;
    conn.write_all(&[0, 0, 0xee]).await.unwrap();
    assert_closed(&mut conn).await;

    assert!(handler.performed().is_empty());
    assert_eq!(server.last_performed(), None);
    assert_eq!(server.failure(), None);

    // The server itself is still usable.
    let mut again = connect_raw(&server).await;
    send_frames(&mut again, &[(0, OK, 1)]).await;
    assert_eq!(read_response(&mut again).await, Ok(()));
}

// ---------------------------------------------------------------------------
// Connection management
// ---------------------------------------------------------------------------

/// Handing over a second connection closes the first.
#[tokio::test]
async fn new_connection_replaces_old_one() {
    let (server, _handler) = new_server(1);

    let mut first = connect_raw(&server).await;
    let mut second = connect_raw(&server).await;
    assert_closed(&mut first).await;

    send_frames(&mut second, &[(0, OK, 0)]).await;
    assert_eq!(read_response(&mut second).await, Ok(()));
    assert!(server.is_connected());
}

/// `disconnect` can be called any number of times, connected or not.
#[tokio::test]
async fn disconnect_is_idempotent() {
    let (server, _handler) = new_server(1);
    server.disconnect();
    server.disconnect();

    let mut conn = connect_raw(&server).await;
    server.disconnect();
    server.disconnect();
    assert_closed(&mut conn).await;
    assert!(!server.is_connected());
}

/// Node ids must not be negative.
#[tokio::test]
async fn negative_node_id_rejected() {
    let result = RequestQueueServer::new(-1, TestHandler::default());
    assert!(matches!(result, Err(QueueError::InvalidArgument(_))));
}

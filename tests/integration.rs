//! End-to-end scenarios exercising sessions, drivers, facades and the
//! expirator family together.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use framelink::config::SessionConfig;
use framelink::expirator::{Expirator, LockFreeExpirator, TimingWheelExpirator};
use framelink::peer::{ClientList, PeerClient, PeerServer};
use framelink::protocol::{CommandId, CommandStatus, FrameHeader, Request, StreamRequest};
use framelink::session::{Session, SessionState};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

/// Opt-in log capture: `RUST_LOG=framelink=debug cargo test -- --nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn echo_peer_server() -> PeerServer {
    let server = PeerServer::builder()
        .with_system_id("echo")
        .with_request_handler(|_, _, _| {})
        .with_response_handler(|_, _, _| {})
        .with_timeout_handler(|_, _, _| {})
        .bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    server
}

/// Scenario: echo. The server answers `stream_req{"hello"}` with
/// `stream_resp{"echo:hello"}`; the client's response handler observes it
/// and the outstanding-request table drains.
#[tokio::test]
async fn test_echo_round_trip() {
    init_tracing();

    // Requests surface through a channel and are answered from the test
    // body, the way a real handler task would.
    let (req_tx, mut req_rx) = tokio::sync::mpsc::unbounded_channel::<(String, u32, String)>();
    let echo_server = Arc::new(
        PeerServer::builder()
            .with_system_id("echo")
            .with_request_handler(move |peer, seq, body| {
                let _ = req_tx.send((peer.to_string(), seq, body));
            })
            .with_response_handler(|_, _, _| {})
            .with_timeout_handler(|_, _, _| {})
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let responder = echo_server.clone();

    let (resp_tx, resp_rx) = mpsc::channel::<(u32, String)>();
    let (bound_tx, mut bound_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let client = PeerClient::builder()
        .with_address(echo_server.local_addr())
        .with_client_id("c1")
        .with_request_timeout(Duration::from_secs(5))
        .with_request_handler(|_, _, _| {})
        .with_response_handler(move |_, seq, body| {
            let _ = resp_tx.send((seq, body));
        })
        .with_timeout_handler(|_, _, _| panic!("echo must not time out"))
        .with_bound_handler(move |server_id| {
            let _ = bound_tx.send(server_id.to_string());
        })
        .build()
        .unwrap();
    client.start();

    let server_id = tokio::time::timeout(Duration::from_secs(5), bound_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server_id, "echo");

    let sequence = client.send_request("hello").unwrap();
    assert_eq!(client.outstanding_requests(), 1);

    let (peer, seq, body) = tokio::time::timeout(Duration::from_secs(5), req_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(peer, "c1");
    assert_eq!(seq, sequence);
    assert_eq!(body, "hello");
    responder
        .send_response(&format!("echo:{body}"), seq, &peer)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let (resp_seq, resp_body) = resp_rx.try_recv().unwrap();
    assert_eq!(resp_seq, sequence);
    assert_eq!(resp_body, "echo:hello");
    assert_eq!(client.outstanding_requests(), 0);
}

/// Scenario: request timeout. The server never replies; the timeout
/// handler observes the stored request and no response handler fires.
#[tokio::test]
async fn test_request_timeout_surfaces_original_body() {
    let server = echo_peer_server().await;

    let (timeout_tx, timeout_rx) = mpsc::channel::<(u32, String)>();
    let (bound_tx, mut bound_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let response_calls = Arc::new(AtomicUsize::new(0));
    let response_calls_probe = response_calls.clone();

    let client = PeerClient::builder()
        .with_address(server.local_addr())
        .with_client_id("c1")
        .with_request_timeout(Duration::from_millis(100))
        .with_request_handler(|_, _, _| {})
        .with_response_handler(move |_, _, _| {
            response_calls_probe.fetch_add(1, Ordering::SeqCst);
        })
        .with_timeout_handler(move |_, seq, body| {
            let _ = timeout_tx.send((seq, body));
        })
        .with_bound_handler(move |_| {
            let _ = bound_tx.send(());
        })
        .build()
        .unwrap();
    client.start();

    tokio::time::timeout(Duration::from_secs(5), bound_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let sequence = client.send_request("X").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let fired = loop {
        if let Ok(fired) = timeout_rx.try_recv() {
            break fired;
        }
        assert!(Instant::now() < deadline, "timeout handler never fired");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert_eq!(fired, (sequence, "X".to_string()));
    assert_eq!(client.outstanding_requests(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(response_calls.load(Ordering::SeqCst), 0);
}

/// Scenario: unbind race. Both peers unbind simultaneously; each answers
/// the other's `unbind_req` and both close cleanly with no error cause.
#[tokio::test]
async fn test_unbind_race_closes_both_cleanly() {
    init_tracing();

    let (left_stream, right_stream) = duplex(64 * 1024);

    let (left_tx, left_rx) = mpsc::channel();
    let left = Session::builder()
        .with_close_handler(move |reason| {
            let _ = left_tx.send(reason);
        })
        .build(left_stream)
        .unwrap();

    let (right_tx, right_rx) = mpsc::channel();
    let right = Session::builder()
        .with_close_handler(move |reason| {
            let _ = right_tx.send(reason);
        })
        .build(right_stream)
        .unwrap();

    left.start();
    right.start();

    left.unbind();
    right.unbind();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(left_rx.try_recv().unwrap(), None);
    assert!(left_rx.try_recv().is_err(), "close handler fired twice");
    assert_eq!(right_rx.try_recv().unwrap(), None);
    assert!(right_rx.try_recv().is_err(), "close handler fired twice");

    assert_eq!(left.state(), SessionState::Closed);
    assert_eq!(right.state(), SessionState::Closed);
}

/// Scenario: backpressure. Flooding past the high watermark pauses
/// receive; draining below the low watermark resumes it and fires
/// `send_buf_available` exactly once.
#[tokio::test]
async fn test_backpressure_pause_and_single_resume_notification() {
    // Pipe smaller than one frame so the very first write stalls and the
    // pending buffer accumulates past the high watermark.
    let (local, mut peer) = duplex(512);

    let config = SessionConfig {
        send_buf_capacity: 64 * 1024,
        send_buf_threshold: 8 * 1024,
        backpressure_low_watermark: 2 * 1024,
        backpressure_high_watermark: 8 * 1024,
        ..Default::default()
    };

    let available_calls = Arc::new(AtomicUsize::new(0));
    let available_probe = available_calls.clone();
    let (req_tx, req_rx) = mpsc::channel();

    let session = Session::builder()
        .with_config(config)
        .with_request_handler(move |request, _| {
            let _ = req_tx.send(request);
        })
        .with_send_buf_available_handler(move || {
            available_probe.fetch_add(1, Ordering::SeqCst);
        })
        .build(local)
        .unwrap();
    session.start();

    // Flood with 1 KiB requests while the peer holds its reads.
    let kilo = "k".repeat(1024);
    for _ in 0..20 {
        session
            .send_request(Request::Stream(StreamRequest {
                message_body: kilo.clone(),
            }))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // An inbound request sits unread while receive is paused.
    let mut frame = Vec::new();
    framelink::protocol::append_frame(
        &mut frame,
        CommandId::StreamReq,
        CommandStatus::Ok,
        900,
        |out| {
            out.extend_from_slice(b"while-paused");
            Ok(())
        },
    )
    .unwrap();
    peer.write_all(&frame).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(req_rx.try_recv().is_err(), "receive was not paused");
    assert_eq!(available_calls.load(Ordering::SeqCst), 0);

    // Drain everything the session wrote; the pending buffer empties and
    // receive resumes.
    let reader = tokio::spawn(async move {
        let mut sink = vec![0u8; 16 * 1024];
        let mut total = 0usize;
        loop {
            match tokio::time::timeout(Duration::from_millis(500), peer.read(&mut sink)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => total += n,
                Ok(Err(_)) => break,
            }
        }
        (peer, total)
    });
    let (_peer, drained) = reader.await.unwrap();
    assert!(drained >= 20 * 1024);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(available_calls.load(Ordering::SeqCst), 1);
    assert!(req_rx.try_recv().is_ok(), "receive did not resume");
}

/// Scenario: lock-free stress. Four producer threads insert 10 000
/// entries; a random quarter is cancelled. Every entry either fires or
/// was removed, never both.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lockfree_stress_accounting() {
    use rand::seq::SliceRandom;

    const TOTAL: u64 = 10_000;
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = TOTAL / PRODUCERS;

    let fired = Arc::new(Mutex::new(HashSet::new()));
    let fired_sink = fired.clone();

    let expirator: Arc<LockFreeExpirator<u64, u64>> =
        Arc::new(LockFreeExpirator::with_shards(16, move |key, _value| {
            fired_sink.lock().unwrap().insert(key);
        }));

    let mut joins = Vec::new();
    for producer in 0..PRODUCERS {
        let expirator = expirator.clone();
        joins.push(std::thread::spawn(move || {
            let mut rng = rand::thread_rng();
            let mut keys: Vec<u64> =
                (producer * PER_PRODUCER..(producer + 1) * PER_PRODUCER).collect();

            for &key in &keys {
                let ttl = Duration::from_millis(100 + key % 150);
                assert!(expirator.add(key, ttl, key), "ring rejected add");
            }

            // Cancel a random quarter.
            keys.shuffle(&mut rng);
            let removed: Vec<u64> = keys[..(PER_PRODUCER as usize / 4)].to_vec();
            for key in &removed {
                assert!(expirator.remove(key), "ring rejected remove");
            }
            removed
        }));
    }

    let mut removed = HashSet::new();
    for join in joins {
        removed.extend(join.join().unwrap());
    }
    assert_eq!(removed.len() as u64, TOTAL / 4);

    // Wait for every surviving entry to pass its deadline.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let residual = expirator.len() as u64;
    let fired = fired.lock().unwrap();

    assert_eq!(fired.len() as u64 + removed.len() as u64 + residual, TOTAL);
    assert!(
        fired.is_disjoint(&removed),
        "an entry both fired and was removed"
    );
    assert_eq!(residual, 0, "entries left after their deadline");
}

/// Scenario: wheel cascade. An entry beyond the first wheel's horizon
/// relocates inward as wheels wrap and still fires on schedule.
#[tokio::test]
async fn test_wheel_cascade_fires_on_schedule() {
    let (tx, rx) = mpsc::channel();
    let expirator: TimingWheelExpirator<u32, &str> =
        TimingWheelExpirator::new(move |key, _value| {
            let _ = tx.send((key, Instant::now()));
        });

    let started = Instant::now();
    expirator.add(1, Duration::from_millis(260), "cascaded");

    tokio::time::sleep(Duration::from_millis(600)).await;
    let (key, fired_at) = rx.try_recv().expect("entry never fired");
    assert_eq!(key, 1);

    let elapsed = fired_at.duration_since(started);
    assert!(
        elapsed >= Duration::from_millis(255),
        "fired early at {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(500),
        "fired late at {elapsed:?}"
    );
    assert!(expirator.is_empty());
}

/// Round-robin and broadcast across a client list bound to two servers.
#[tokio::test]
async fn test_client_list_round_robin_and_broadcast() {
    let server_a = PeerServer::builder()
        .with_system_id("srv-a")
        .with_request_handler(|_, _, _| {})
        .with_response_handler(|_, _, _| {})
        .with_timeout_handler(|_, _, _| {})
        .bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let server_b = PeerServer::builder()
        .with_system_id("srv-b")
        .with_request_handler(|_, _, _| {})
        .with_response_handler(|_, _, _| {})
        .with_timeout_handler(|_, _, _| {})
        .bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let (bound_tx, mut bound_rx) = tokio::sync::mpsc::unbounded_channel();
    let list = ClientList::builder()
        .with_addresses([server_a.local_addr(), server_b.local_addr()])
        .with_client_id("lister")
        .with_request_timeout(Duration::from_secs(5))
        .with_request_handler(|_, _, _| {})
        .with_response_handler(|_, _, _| {})
        .with_timeout_handler(|_, _, _| {})
        .with_session_event_handler(move |id, event| {
            let _ = bound_tx.send((id.to_string(), event));
        })
        .build()
        .unwrap();
    list.start();

    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(5), bound_rx.recv())
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(list.binded_count(), 2);
    assert_eq!(list.total_count(), 2);
    assert_eq!(list.binded_ids(), vec!["srv-a".to_string(), "srv-b".to_string()]);

    let (_, first) = list.send_request_round_robin("one").unwrap();
    let (_, second) = list.send_request_round_robin("two").unwrap();
    assert_ne!(first, second);

    let sent = list.broadcast("fan-out");
    assert_eq!(sent.len(), 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server_a.client_ids(), vec!["lister".to_string()]);
    assert_eq!(server_b.client_ids(), vec!["lister".to_string()]);
}

/// A frame one byte past `max_command_length` kills the connection while
/// an exactly-max frame passes (driven over a real socket pair).
#[tokio::test]
async fn test_frame_ceiling_over_tcp() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = SessionConfig {
        max_command_length: 64,
        ..Default::default()
    };

    let (close_tx, close_rx) = mpsc::channel();
    let accept_config = config.clone();
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let session = Session::builder()
            .with_config(accept_config)
            .with_close_handler(move |reason| {
                let _ = close_tx.send(reason);
            })
            .build(stream)
            .unwrap();
        session.start();
        session
    });

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    let _session = accept.await.unwrap();

    // At the limit: accepted.
    let header = FrameHeader::new(64, CommandId::StreamReq, CommandStatus::Ok, 1);
    client.write_all(&header.encode()).await.unwrap();
    client.write_all(&vec![b'x'; 54]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(close_rx.try_recv().is_err());

    // One past the limit: fatal.
    let header = FrameHeader::new(65, CommandId::StreamReq, CommandStatus::Ok, 2);
    client.write_all(&header.encode()).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let reason = loop {
        if let Ok(reason) = close_rx.try_recv() {
            break reason;
        }
        assert!(Instant::now() < deadline, "session never closed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(reason.unwrap().contains("65"));
}

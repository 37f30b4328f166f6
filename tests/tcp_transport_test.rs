//! Integration tests for direct TCP links
//!
//! Covers raw framing between two transports and a full two-peer session
//! driven over TCP with candidates supplied by hand.

use std::time::Duration;

use meshplay::network::{
    event_channel, ConnectionHandle, IceConfig, TransportEvent, TransportEventReceiver,
    TransportState,
};
use meshplay::protocol::{PeerId, Vec3};
use meshplay::{Session, SessionConfig, SessionDriver, SessionEvent, TcpTransport, Transport};
use tokio::time::timeout;
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(5);

async fn next_open(events: &mut TransportEventReceiver) -> (ConnectionHandle, PeerId) {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("Timed out waiting for link")
            .expect("Event channel closed");
        if let TransportEvent::StateChanged {
            handle,
            peer,
            state: TransportState::Open,
        } = event
        {
            return (handle, peer);
        }
    }
}

async fn next_message(events: &mut TransportEventReceiver) -> (PeerId, Vec<u8>) {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("Timed out waiting for message")
            .expect("Event channel closed");
        if let TransportEvent::Message { peer, bytes, .. } = event {
            return (peer, bytes);
        }
    }
}

/// Test: Frames flow both ways over one link
/// Given two bound transports
/// When one dials the other and both send
/// Then each side receives the other's frame tagged with the sender's id
#[tokio::test]
async fn test_frames_exchanged_over_link() {
    let (a_tx, mut a_rx) = event_channel();
    let (b_tx, mut b_rx) = event_channel();
    let mut a = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), PeerId::new("a"), a_tx)
        .await
        .expect("Failed to bind a");
    let mut b = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), PeerId::new("b"), b_tx)
        .await
        .expect("Failed to bind b");

    let ice = IceConfig::default().with_candidates(vec![b.local_addr()]);
    let dialed = a.open(&PeerId::new("b"), &ice).expect("Failed to dial");

    let (a_handle, a_peer) = next_open(&mut a_rx).await;
    let (b_handle, b_peer) = next_open(&mut b_rx).await;
    assert_eq!(a_handle, dialed);
    assert_eq!(a_peer, PeerId::new("b"));
    assert_eq!(b_peer, PeerId::new("a"));

    assert_ok!(a.send(a_handle, b"ping".to_vec()));
    let (from, bytes) = next_message(&mut b_rx).await;
    assert_eq!(from, PeerId::new("a"));
    assert_eq!(bytes, b"ping");

    assert_ok!(b.send(b_handle, b"pong".to_vec()));
    let (from, bytes) = next_message(&mut a_rx).await;
    assert_eq!(from, PeerId::new("b"));
    assert_eq!(bytes, b"pong");
}

/// Test: Closing one end is reported on the other
#[tokio::test]
async fn test_close_reported_to_remote() {
    let (a_tx, mut a_rx) = event_channel();
    let (b_tx, mut b_rx) = event_channel();
    let mut a = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), PeerId::new("a"), a_tx)
        .await
        .expect("Failed to bind a");
    let b = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), PeerId::new("b"), b_tx)
        .await
        .expect("Failed to bind b");

    let ice = IceConfig::default().with_candidates(vec![b.local_addr()]);
    a.open(&PeerId::new("b"), &ice).expect("Failed to dial");
    let (a_handle, _) = next_open(&mut a_rx).await;
    next_open(&mut b_rx).await;

    a.close(a_handle);

    let closed = timeout(WAIT, async {
        loop {
            match b_rx.recv().await {
                Some(TransportEvent::StateChanged { state, peer, .. }) if state.is_terminal() => {
                    return peer;
                }
                Some(_) => continue,
                None => panic!("Event channel closed"),
            }
        }
    })
    .await
    .expect("Close was not reported");
    assert_eq!(closed, PeerId::new("a"));
}

/// Test: Dialing an address with nothing listening fails
#[tokio::test]
async fn test_unreachable_candidate_fails() {
    let unused = std::net::TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind probe")
        .local_addr()
        .expect("Failed to read probe address");

    let (tx, mut rx) = event_channel();
    let mut a = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), PeerId::new("a"), tx)
        .await
        .expect("Failed to bind a");

    let ice = IceConfig::default().with_candidates(vec![unused]);
    let handle = a.open(&PeerId::new("ghost"), &ice).expect("Open should start");

    let failed = timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(TransportEvent::StateChanged { handle: h, state, .. }) if state.is_terminal() => {
                    return (h, state);
                }
                Some(_) => continue,
                None => panic!("Event channel closed"),
            }
        }
    })
    .await
    .expect("Failure was not reported");
    assert_eq!(failed, (handle, TransportState::Failed));
}

/// Test: Two sessions join and sync over TCP
/// Given a host and a joiner on separate transports
/// When the joiner asks for candidates and receives the host's address
/// Then it joins and both sides see the other's player state
#[tokio::test]
async fn test_session_joins_over_tcp() {
    let host_id = PeerId::new("host");
    let guest_id = PeerId::new("guest");

    let (host_tx, host_rx) = event_channel();
    let host_transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), host_id.clone(), host_tx)
        .await
        .expect("Failed to bind host");
    let host_addr = host_transport.local_addr();
    let host_session = Session::new(SessionConfig::default(), host_id.clone(), Box::new(host_transport));
    let (host, mut host_events, host_task) = SessionDriver::spawn(host_session, host_rx);

    let (guest_tx, guest_rx) = event_channel();
    let guest_transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), guest_id.clone(), guest_tx)
        .await
        .expect("Failed to bind guest");
    let guest_session = Session::new(SessionConfig::default(), guest_id.clone(), Box::new(guest_transport));
    let (guest, mut guest_events, guest_task) = SessionDriver::spawn(guest_session, guest_rx);

    assert_ok!(host.create().await);
    assert_ok!(host.update_local(|state| state.position = Vec3::new(3.0, 0.0, 0.0)));
    assert_ok!(guest.join(host_id.clone()).await);

    let joined = timeout(WAIT, async {
        while let Some(event) = guest_events.recv().await {
            match event {
                SessionEvent::CandidatesNeeded { peer } => {
                    assert_eq!(peer, host_id);
                    guest
                        .add_candidates(peer, vec![host_addr])
                        .expect("Guest task stopped");
                }
                SessionEvent::Joined { host_id, .. } => return host_id,
                SessionEvent::JoinFailed { error } => panic!("Join failed: {}", error),
                _ => {}
            }
        }
        panic!("Guest event channel closed");
    })
    .await
    .expect("Guest never joined");
    assert_eq!(joined, host_id);

    let admitted = timeout(WAIT, async {
        while let Some(event) = host_events.recv().await {
            if let SessionEvent::PeerJoined { peer } = event {
                return peer;
            }
        }
        panic!("Host event channel closed");
    })
    .await
    .expect("Host never admitted the guest");
    assert_eq!(admitted, guest_id);

    let seen = timeout(WAIT, async {
        loop {
            let snapshot = guest.snapshot().await.expect("Guest task stopped");
            if let Some(state) = snapshot.remote.get(&host_id) {
                if state.position.x > 0.0 {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("Host state never reached the guest");
    assert_eq!(seen.info.peer_count, 2);
    assert_eq!(seen.info.host_id, Some(host_id.clone()));

    host.shutdown();
    guest.shutdown();
    let _ = host_task.await;
    let _ = guest_task.await;
}

//! Reactor tests
//!
//! Passes driven over memory transports and over real loopback sockets.

mod common;

use common::*;
use rustsvcs_core::partyline::BANNER;
use rustsvcs_core::{ConnectionRole, Event, MemoryTransport, Reactor};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

fn fast_config() -> rustsvcs_core::Config {
    let mut config = config();
    config.timeouts.tick_ms = 10;
    config
}

/// Run passes until `done` holds, yielding so spawned peers can progress
async fn turn_until<F: Fn(&Reactor) -> bool>(reactor: &mut Reactor, done: F) {
    for _ in 0..500 {
        if done(reactor) {
            return;
        }
        reactor.turn().await;
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Test a pass reads, dispatches and flushes over a memory transport
#[tokio::test]
async fn test_turn_links_over_memory_transport() {
    let mut reactor = Reactor::new(session_with(fast_config()));
    let t = MemoryTransport::new("hub");
    reactor
        .session_mut()
        .attach(ConnectionRole::Uplink, Box::new(t.clone()));

    t.feed_line("PASS linkpass TS 6 :1HB");
    t.feed_line("CAPAB :QS EX IE KLN UNKLN ENCAP TB EUID");
    t.feed_line("SERVER hub.example.net 1 :Test hub");
    turn_until(&mut reactor, |r| r.session().is_linked()).await;

    let lines = t.take_lines();
    assert!(lines.iter().any(|l| l.starts_with(":0SV UID ChanServ ")));
    assert_eq!(lines.last().unwrap(), "PING :services.example.org");
}

/// Test a connection that dies during a pass is released on the next one
#[tokio::test]
async fn test_teardown_is_deferred_to_next_pass() {
    let mut session = session_with(fast_config());
    let events = record_events(&mut session);
    let (id, t) = link(&mut session);
    let mut reactor = Reactor::new(session);

    t.feed_line("ERROR :Closing Link: maintenance");
    turn_until(&mut reactor, |r| r.session().connection(id).is_some_and(|c| c.is_dead())).await;
    assert!(!events.lock().iter().any(|e| matches!(e, Event::LinkLost { .. })));

    reactor.turn().await;
    assert!(reactor.session().connection(id).is_none());
    assert!(events.lock().iter().any(|e| matches!(e, Event::LinkLost { .. })));
    assert!(reactor.session().reconnect_at().is_some());
}

/// Test shutdown closes every connection
#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let mut session = session_with(fast_config());
    let (_, _uplink) = link(&mut session);
    let (_, _peer) = logged_in_peer(&mut session, "peer");
    session.request_shutdown();

    let mut reactor = Reactor::new(session);
    reactor.run().await.unwrap();
    assert_eq!(reactor.session().connection_count(), 0);
}

/// Test the uplink handshake and burst over a real socket
#[tokio::test]
async fn test_uplink_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let hub = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut received = Vec::new();

        while let Some(line) = lines.next_line().await.unwrap() {
            let svinfo = line.starts_with("SVINFO");
            received.push(line);
            if svinfo {
                break;
            }
        }

        write
            .write_all(
                b"PASS linkpass TS 6 :1HB\r\n\
                  CAPAB :QS EX IE KLN UNKLN ENCAP TB EUID\r\n\
                  SERVER hub.example.net 1 :Test hub\r\n\
                  SVINFO 6 6 0 :1700000000\r\n",
            )
            .await
            .unwrap();

        while let Some(line) = lines.next_line().await.unwrap() {
            let end = line.starts_with("PING ");
            received.push(line);
            if end {
                break;
            }
        }

        write
            .write_all(b":1HB PONG hub.example.net :services.example.org\r\n")
            .await
            .unwrap();
        received
    });

    let mut config = fast_config();
    config.uplink.port = port;
    let mut session = session_with(config);
    let events = record_events(&mut session);
    let id = session.connect_uplink();
    let mut reactor = Reactor::new(session);

    turn_until(&mut reactor, |r| {
        r.session().connection(id).is_some_and(|c| c.flags.end_of_burst)
    })
    .await;

    let received = hub.await.unwrap();
    assert_eq!(received[0], "PASS linkpass TS 6 :0SV");
    assert_eq!(received[2], "SERVER services.example.org 1 :IRC Services");
    assert!(received.iter().any(|l| l.starts_with(":0SV UID ChanServ ")));
    assert_eq!(received.last().unwrap(), "PING :services.example.org");

    assert_eq!(reactor.session().uplink_server(), Some("1HB"));
    let finished = events
        .lock()
        .iter()
        .filter(|e| matches!(e, Event::BurstFinished { .. }))
        .count();
    assert_eq!(finished, 1);
}

/// Test a refused connect marks the uplink dead and schedules a reconnect
#[tokio::test]
async fn test_refused_uplink_connect() {
    // Grab a free port, then close it
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut config = fast_config();
    config.uplink.port = port;
    let mut session = session_with(config);
    let id = session.connect_uplink();
    let mut reactor = Reactor::new(session);

    turn_until(&mut reactor, |r| r.session().connection(id).is_none()).await;
    assert!(reactor.session().uplink().is_none());
    assert!(reactor.session().reconnect_at().is_some());
}

/// Test an inbound party-line connection gets the banner and can log in
#[tokio::test]
async fn test_partyline_listener() {
    let mut session = session_with(fast_config());
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (id, addr) = session.open_dcc_listener(bind).await.unwrap();
    let mut reactor = Reactor::new(session);

    let peer = tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let banner = lines.next_line().await.unwrap().unwrap();
        write
            .write_all(format!(".login admin {}\r\n", ADMIN_PASSWORD).as_bytes())
            .await
            .unwrap();
        let reply = lines.next_line().await.unwrap().unwrap();
        (banner, reply)
    });

    turn_until(&mut reactor, |_| peer.is_finished()).await;
    let (banner, reply) = peer.await.unwrap();

    assert_eq!(banner, format!("*** {}", BANNER));
    assert_eq!(reply, "*** Logged in as admin");

    let conn = reactor.session().connection(id).unwrap();
    assert_eq!(conn.role, ConnectionRole::DccIn);
    assert_eq!(conn.identity().unwrap().name, "admin");
}

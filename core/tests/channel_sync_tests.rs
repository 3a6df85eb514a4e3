//! Channel synchronisation tests
//!
//! TS conflict resolution for JOIN and SJOIN, membership teardown, topics
//! and mode bursts, all driven through the uplink.

mod common;

use common::*;
use rustsvcs_core::{Event, MemoryTransport, Session};

const ALICE: &str = "1HBAAAAAA";
const BOB: &str = "1HBAAAAAB";

/// Linked session with alice and bob on the hub
fn with_users() -> (Session, MemoryTransport) {
    let (mut session, _, t) = linked();
    introduce(&mut session, &t, ALICE, "alice", "i");
    introduce(&mut session, &t, BOB, "bob", "i");
    t.take_written();
    (session, t)
}

fn feed(session: &mut Session, t: &MemoryTransport, lines: &[&str]) {
    for line in lines {
        t.feed_line(line);
    }
    pump(session, t);
}

/// Test JOIN creates a channel and the last PART tears it down
#[test]
fn test_join_creates_and_part_destroys() {
    let (mut session, t) = with_users();
    let events = record_events(&mut session);

    feed(&mut session, &t, &[":1HBAAAAAA JOIN 1000 #test +nt"]);
    let chan = session.channels().get("#TEST").unwrap();
    assert_eq!(chan.ts, 1000);
    assert!(chan.modes.has('n') && chan.modes.has('t'));
    assert!(chan.members.contains_key(ALICE));
    assert!(session.network().user(ALICE).unwrap().channels.contains("#test"));

    feed(&mut session, &t, &[":1HBAAAAAB JOIN 1000 #test +", ":1HBAAAAAA PART #test :bye"]);
    assert_eq!(session.channels().get("#test").unwrap().members.len(), 1);

    feed(&mut session, &t, &[":1HBAAAAAB PART #test"]);
    assert!(!session.channels().contains("#test"));
    assert!(session.network().user(BOB).unwrap().channels.is_empty());

    let recorded = events.lock().clone();
    assert_eq!(
        recorded,
        vec![
            Event::ChannelCreated { channel: "#test".to_string() },
            Event::ChannelDestroyed { channel: "#test".to_string() },
        ]
    );
}

/// Test a lower incoming TS replaces modes and strips local privileges
#[test]
fn test_lower_ts_wins() {
    let (mut session, t) = with_users();

    feed(
        &mut session,
        &t,
        &[
            ":1HB SJOIN 1000 #test +ntl 10 :@1HBAAAAAA",
            ":1HB BMASK 1000 #test b :*!*@bad.example",
            ":1HB SJOIN 500 #test +m :@1HBAAAAAB",
        ],
    );

    let chan = session.channels().get("#test").unwrap();
    assert_eq!(chan.ts, 500);
    assert!(chan.modes.has('m'));
    assert!(!chan.modes.has('n'));
    assert_eq!(chan.modes.limit, None);
    assert!(chan.bans.is_empty());
    assert!(!chan.members[ALICE].opped);
    assert!(chan.members[BOB].opped);
}

/// Test a higher incoming TS keeps local state and downgrades newcomers
#[test]
fn test_higher_ts_loses() {
    let (mut session, t) = with_users();

    feed(
        &mut session,
        &t,
        &[":1HB SJOIN 1000 #test +nt :@1HBAAAAAA", ":1HB SJOIN 2000 #test +s :@+1HBAAAAAB"],
    );

    let chan = session.channels().get("#test").unwrap();
    assert_eq!(chan.ts, 1000);
    assert!(!chan.modes.has('s'));
    assert!(chan.members[ALICE].opped);

    let bob = chan.members[BOB];
    assert!(!bob.opped);
    assert!(!bob.voiced);
    assert!(bob.deopped);
}

/// Test equal timestamps merge modes additively
#[test]
fn test_equal_ts_merges() {
    let (mut session, t) = with_users();

    feed(
        &mut session,
        &t,
        &[
            ":1HB SJOIN 1000 #test +ntkl alpha 10 :@1HBAAAAAA",
            ":1HB SJOIN 1000 #test +skl beta 20 :+1HBAAAAAB",
        ],
    );

    let chan = session.channels().get("#test").unwrap();
    assert_eq!(chan.ts, 1000);
    assert!(chan.modes.has('n') && chan.modes.has('t') && chan.modes.has('s'));
    assert_eq!(chan.modes.limit, Some(20));
    assert_eq!(chan.modes.key.as_deref(), Some("beta"));
    assert!(chan.members[ALICE].opped);
    assert!(chan.members[BOB].voiced);
}

/// Test a zero TS on either side merges and leaves the channel at zero
#[test]
fn test_zero_ts_merges_as_equal() {
    let (mut session, t) = with_users();

    feed(
        &mut session,
        &t,
        &[":1HB SJOIN 1000 #test +n :@1HBAAAAAA", ":1HB SJOIN 0 #test +s :@1HBAAAAAB"],
    );

    let chan = session.channels().get("#test").unwrap();
    assert_eq!(chan.ts, 0);
    assert!(chan.modes.has('n') && chan.modes.has('s'));
    assert!(chan.members[ALICE].opped);
    assert!(chan.members[BOB].opped);
}

/// Test the merged state does not depend on arrival order
#[test]
fn test_merge_is_order_independent() {
    let first = ":1HB SJOIN 900 #test +m :@1HBAAAAAA";
    let second = ":1HB SJOIN 1000 #test +ntk key :@1HBAAAAAB";

    let (mut a, ta) = with_users();
    feed(&mut a, &ta, &[first, second]);
    let (mut b, tb) = with_users();
    feed(&mut b, &tb, &[second, first]);

    let (ca, cb) = (a.channels().get("#test").unwrap(), b.channels().get("#test").unwrap());
    assert_eq!(ca.ts, 900);
    assert_eq!(ca.ts, cb.ts);
    assert_eq!(ca.modes, cb.modes);
    assert_eq!(ca.members[ALICE].opped, cb.members[ALICE].opped);
    assert_eq!(ca.members[BOB].opped, cb.members[BOB].opped);
}

/// Test an SJOIN naming only unknown users leaves no channel behind
#[test]
fn test_sjoin_with_unknown_members_leaves_nothing() {
    let (mut session, t) = with_users();
    let events = record_events(&mut session);

    feed(&mut session, &t, &[":1HB SJOIN 1000 #ghost +nt :@1HBZZZZZZ"]);

    assert!(!session.channels().contains("#ghost"));
    assert_eq!(
        events.lock().clone(),
        vec![
            Event::ChannelCreated { channel: "#ghost".to_string() },
            Event::ChannelDestroyed { channel: "#ghost".to_string() },
        ]
    );
}

/// Test services rejoin with ops when their channel loses a TS merge
#[test]
fn test_services_rejoin_after_losing_ts() {
    let (mut session, t) = with_users();
    let uid = session.network().find_service("ChanServ").unwrap().uid.clone();

    feed(&mut session, &t, &[":1HB SJOIN 1000 #services +nt :@1HBAAAAAA"]);

    assert_eq!(t.take_lines(), vec![format!(":0SV SJOIN 1000 #services + :@{}", uid)]);
    let chan = session.channels().get("#services").unwrap();
    assert_eq!(chan.ts, 1000);
    assert!(chan.services.contains(&uid));
    assert!(chan.members[ALICE].opped);
}

/// Test kicking a service puts it straight back
#[test]
fn test_kicked_service_rejoins() {
    let (mut session, t) = with_users();
    let uid = session.network().find_service("ChanServ").unwrap().uid.clone();
    let ts = session.channels().get("#services").unwrap().ts;

    feed(&mut session, &t, &[":1HBAAAAAA KICK #services ChanServ :out"]);

    assert_eq!(t.take_lines(), vec![format!(":0SV SJOIN {} #services + :@{}", ts, uid)]);
    assert!(session.channels().get("#services").unwrap().services.contains(&uid));
}

/// Test KICK removes a user and tears down an emptied channel
#[test]
fn test_kick_removes_member() {
    let (mut session, t) = with_users();

    feed(
        &mut session,
        &t,
        &[":1HB SJOIN 1000 #test + :@1HBAAAAAA 1HBAAAAAB", ":1HBAAAAAA KICK #test bob :bye"],
    );
    let chan = session.channels().get("#test").unwrap();
    assert!(!chan.members.contains_key(BOB));
    assert!(session.network().user(BOB).unwrap().channels.is_empty());

    feed(&mut session, &t, &[":1HB KICK #test 1HBAAAAAA :gone"]);
    assert!(!session.channels().contains("#test"));
}

/// Test JOIN 0 and QUIT leave every channel
#[test]
fn test_join_zero_and_quit_leave_everything() {
    let (mut session, t) = with_users();

    feed(
        &mut session,
        &t,
        &[
            ":1HBAAAAAA JOIN 1000 #one +",
            ":1HBAAAAAA JOIN 1000 #two +",
            ":1HBAAAAAB JOIN 1000 #two +",
            ":1HBAAAAAB JOIN 1000 #three +",
            ":1HBAAAAAA JOIN 0",
        ],
    );
    assert!(!session.channels().contains("#one"));
    assert!(session.network().user(ALICE).unwrap().channels.is_empty());
    assert_eq!(session.channels().get("#two").unwrap().members.len(), 1);

    feed(&mut session, &t, &[":1HBAAAAAB QUIT :leaving"]);
    assert!(!session.channels().contains("#two"));
    assert!(!session.channels().contains("#three"));
}

/// Test TOPIC records the user's mask and a fresh timestamp
#[test]
fn test_topic_from_user() {
    let (mut session, t) = with_users();
    let events = record_events(&mut session);

    feed(&mut session, &t, &[":1HBAAAAAA JOIN 1000 #test +", ":1HBAAAAAA TOPIC #test :hello world"]);

    let chan = session.channels().get("#test").unwrap();
    assert_eq!(chan.topic, "hello world");
    assert_eq!(chan.topic_setter, "alice!alice@host.example");
    assert!(chan.topic_ts >= session.now_ts() - 5);
    assert!(events.lock().contains(&Event::TopicChanged {
        channel: "#test".to_string(),
        setter: "alice!alice@host.example".to_string(),
        topic: "hello world".to_string(),
    }));

    feed(&mut session, &t, &[":1HB TOPIC #test :from the hub"]);
    let chan = session.channels().get("#test").unwrap();
    assert_eq!(chan.topic, "from the hub");
    assert_eq!(chan.topic_setter, "hub.example.net");
}

/// Test a topic burst is accepted unless the local topic is older
#[test]
fn test_topic_burst_ordering() {
    let (mut session, t) = with_users();
    feed(&mut session, &t, &[":1HBAAAAAA JOIN 1000 #test +"]);

    // No topic yet: any burst is taken
    feed(&mut session, &t, &[":1HB TB #test 900 carol!c@h :first"]);
    let chan = session.channels().get("#test").unwrap();
    assert_eq!(chan.topic, "first");
    assert_eq!(chan.topic_setter, "carol!c@h");
    let stamped = chan.topic_ts;

    // A burst from after our topic was set loses
    let later = stamped + 1000;
    feed(&mut session, &t, &[&format!(":1HB TB #test {} dave!d@h :second", later)]);
    assert_eq!(session.channels().get("#test").unwrap().topic, "first");

    // One from before it wins, and the setter defaults to the source
    feed(&mut session, &t, &[":1HB TB #test 800 :third"]);
    let chan = session.channels().get("#test").unwrap();
    assert_eq!(chan.topic, "third");
    assert_eq!(chan.topic_setter, "hub.example.net");
}

/// Test TMODE and BMASK respect the channel TS
#[test]
fn test_tmode_and_bmask() {
    let (mut session, t) = with_users();
    feed(
        &mut session,
        &t,
        &[
            ":1HB SJOIN 1000 #test +n :@1HBAAAAAA 1HBAAAAAB",
            ":1HBAAAAAA TMODE 1000 #test +tv-o bob alice",
            ":1HB BMASK 1000 #test b :*!*@one.example *!*@two.example",
            ":1HB BMASK 1000 #test e :*!*@friend.example",
        ],
    );

    let chan = session.channels().get("#test").unwrap();
    assert!(chan.modes.has('t'));
    assert!(chan.members[BOB].voiced);
    assert!(!chan.members[ALICE].opped);
    assert_eq!(chan.bans, vec!["*!*@one.example", "*!*@two.example"]);
    assert_eq!(chan.excepts, vec!["*!*@friend.example"]);

    // Newer timestamps are ignored
    feed(
        &mut session,
        &t,
        &[
            ":1HBAAAAAA TMODE 2000 #test +s",
            ":1HB BMASK 2000 #test b :*!*@three.example",
        ],
    );
    let chan = session.channels().get("#test").unwrap();
    assert!(!chan.modes.has('s'));
    assert_eq!(chan.bans.len(), 2);
}

/// Test malformed channel commands are dropped without side effects
#[test]
fn test_malformed_commands_are_ignored() {
    let (mut session, t) = with_users();
    let before = session.channels().len();

    feed(
        &mut session,
        &t,
        &[
            ":1HB SJOIN notats #test + :@1HBAAAAAA",
            ":1HB SJOIN 1000 badname + :@1HBAAAAAA",
            ":1HB SJOIN 1000 #test +o :@1HBAAAAAA",
            ":1HB JOIN 1000 #test +",
            ":1HBAAAAAA TOPIC #nowhere :x",
            ":1HB TMODE 1000 #test +x",
        ],
    );

    assert_eq!(session.channels().len(), before);
    assert!(session.is_linked());
}

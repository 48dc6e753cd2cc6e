mod common;

use ledgerdb::{
    Error, EventStore, GlobalPosition, PersistentSubscriptions, StreamId, SubscriptionQuery,
};

#[test]
fn subscription_sees_only_its_streams() {
    let (_dir, db) = common::open_temp_db("subscription.db");
    let session = db.session().unwrap();
    let store = EventStore::new();
    let subs = PersistentSubscriptions::new(store.clone());

    subs.create(&session, "s-only", &SubscriptionQuery::for_streams(["S"]))
        .unwrap();

    let s_events = store
        .append(&session, &StreamId::new("S"), &common::events("E", 2))
        .unwrap();
    store
        .append(&session, &StreamId::new("T"), &common::events("E", 1))
        .unwrap();

    session.begin().unwrap();
    let page = subs.read(&session, "s-only").unwrap();
    assert_eq!(page.events, s_events);
    assert_eq!(page.start_position, GlobalPosition::START);
    assert_eq!(page.end_position, s_events[1].position);
    subs.ack(&session, &page).unwrap();
    session.commit().unwrap();

    let next = subs.read(&session, "s-only").unwrap();
    assert!(next.is_empty());
    assert_eq!(next.start_position, s_events[1].position);
    assert_eq!(next.end_position, next.start_position);
}

#[test]
fn unacknowledged_page_is_read_again() {
    let (_dir, db) = common::open_temp_db("redelivery.db");
    let session = db.session().unwrap();
    let store = EventStore::new();
    let subs = PersistentSubscriptions::new(store.clone());

    subs.create(&session, "audit", &SubscriptionQuery::all()).unwrap();
    store
        .append(&session, &StreamId::new("a"), &common::events("E", 3))
        .unwrap();

    let first = subs.read(&session, "audit").unwrap();
    let again = subs.read(&session, "audit").unwrap();
    assert_eq!(first.events, again.events);

    // Rolling back the ack leaves the cursor where it was.
    session.begin().unwrap();
    subs.ack(&session, &first).unwrap();
    session.rollback().unwrap();
    assert_eq!(
        subs.cursor(&session, "audit").unwrap().position,
        GlobalPosition::START
    );
}

#[test]
fn cursor_never_moves_backwards() {
    let (_dir, db) = common::open_temp_db("forward.db");
    let session = db.session().unwrap();
    let store = EventStore::new();
    let subs = PersistentSubscriptions::new(store.clone());

    subs.create(&session, "paged", &SubscriptionQuery::all().with_limit(2))
        .unwrap();
    store
        .append(&session, &StreamId::new("a"), &common::events("E", 4))
        .unwrap();

    let first = subs.read(&session, "paged").unwrap();
    assert!(first.is_full());
    subs.ack(&session, &first).unwrap();
    let second = subs.read(&session, "paged").unwrap();
    subs.ack(&session, &second).unwrap();

    subs.ack(&session, &first).unwrap();
    assert_eq!(
        subs.cursor(&session, "paged").unwrap().position,
        second.end_position
    );
}

#[test]
fn cursor_starts_after_query_from() {
    let (_dir, db) = common::open_temp_db("from.db");
    let session = db.session().unwrap();
    let store = EventStore::new();
    let subs = PersistentSubscriptions::new(store.clone());

    let written = store
        .append(&session, &StreamId::new("a"), &common::events("E", 3))
        .unwrap();
    subs.create(
        &session,
        "late",
        &SubscriptionQuery::all().with_from(written[0].position),
    )
    .unwrap();

    let page = subs.read(&session, "late").unwrap();
    assert_eq!(page.events, written[1..].to_vec());
}

#[test]
fn missing_subscriptions_are_reported() {
    let (_dir, db) = common::open_temp_db("missing.db");
    let session = db.session().unwrap();
    let subs = PersistentSubscriptions::default();

    assert!(matches!(
        subs.read(&session, "ghost").unwrap_err(),
        Error::SubscriptionNotFound(_)
    ));

    subs.create(&session, "short-lived", &SubscriptionQuery::all())
        .unwrap();
    let page = subs.read(&session, "short-lived").unwrap();
    assert!(subs.delete(&session, "short-lived").unwrap());
    assert!(!subs.delete(&session, "short-lived").unwrap());

    assert!(matches!(
        subs.ack(&session, &page).unwrap_err(),
        Error::SubscriptionNotFound(_)
    ));
    assert!(matches!(
        subs.create(&session, "dup", &SubscriptionQuery::all())
            .and_then(|_| subs.create(&session, "dup", &SubscriptionQuery::all())),
        Err(Error::Sqlite(_))
    ));
}

/// Readers of one named subscription serialize on its cursor row: a second
/// reader waits for the first transaction and then starts after its ack.
#[test]
fn second_reader_waits_for_first_ack() {
    let (_dir, db) = common::open_temp_db("cursor-lock.db");
    let session = db.session().unwrap();
    let store = EventStore::new();
    let subs = PersistentSubscriptions::new(store.clone());

    subs.create(&session, "shared", &SubscriptionQuery::all()).unwrap();
    store
        .append(&session, &StreamId::new("a"), &common::events("E", 3))
        .unwrap();

    session.begin().unwrap();
    let first = subs.read(&session, "shared").unwrap();
    assert_eq!(first.len(), 3);

    let second = std::thread::spawn({
        let db = db.clone();
        let subs = subs.clone();
        move || {
            let other = db.session().unwrap();
            subs.read(&other, "shared").unwrap()
        }
    });

    std::thread::sleep(std::time::Duration::from_millis(100));
    subs.ack(&session, &first).unwrap();
    session.commit().unwrap();

    let second = second.join().unwrap();
    assert!(second.is_empty());
    assert_eq!(second.start_position, first.end_position);
}

/// Competing consumers that read and ack in one transaction never see the
/// same event twice, and together see every event.
#[test]
fn competing_consumers_split_the_log() {
    let (_dir, db) = common::open_temp_db("consumers.db");
    let session = db.session().unwrap();
    let store = EventStore::new();
    let subs = PersistentSubscriptions::new(store.clone());

    subs.create(&session, "work", &SubscriptionQuery::all().with_limit(3))
        .unwrap();
    let written = store
        .append(&session, &StreamId::new("jobs"), &common::events("Job", 40))
        .unwrap();

    let mut seen: Vec<GlobalPosition> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                let subs = subs.clone();
                scope.spawn(move || {
                    let session = db.session().unwrap();
                    let mut mine = Vec::new();
                    loop {
                        let page = session
                            .transaction(|s| {
                                let page = subs.read(s, "work")?;
                                subs.ack(s, &page)?;
                                Ok(page)
                            })
                            .unwrap();
                        if page.is_empty() {
                            return mine;
                        }
                        mine.extend(page.events.iter().map(|e| e.position));
                    }
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    seen.sort();
    let expected: Vec<GlobalPosition> = written.iter().map(|e| e.position).collect();
    assert_eq!(seen, expected);
}

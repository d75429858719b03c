use std::hint::black_box;
use std::time::Duration;

use collab_presence::color::{color_for, palette_index};
use collab_presence::conflict::EditConflictDetector;
use collab_presence::cursor::Debouncer;
use collab_presence::identity::{SessionId, UserId, UserProfile};
use collab_presence::presence::{Author, PresenceStore};
use collab_presence::protocol::{Envelope, Frame, PresenceEvent, ResumeTicket};
use collab_presence::room::{EntityKind, RoomId, RoomRegistry};
use criterion::{criterion_group, criterion_main, Criterion};
use tokio::time::Instant;

fn deliver_cursor() -> Frame {
    let room = RoomId::for_entity(EntityKind::Document, 42);
    Frame::Deliver {
        envelope: Envelope::new(
            room,
            SessionId::new(),
            UserId::new("alice"),
            PresenceEvent::CursorMove { x: 120.0, y: 80.0 },
        ),
    }
}

fn bench_frame_encode(c: &mut Criterion) {
    let frame = deliver_cursor();
    c.bench_function("frame_encode_cursor", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = deliver_cursor().encode().unwrap();
    c.bench_function("frame_decode_cursor", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_hello_encode(c: &mut Criterion) {
    let frame = Frame::Hello {
        user: UserProfile::new("alice", "Alice").with_avatar("https://cdn.example/alice.png"),
        resume: Some(ResumeTicket::issue(SessionId::new())),
    };
    c.bench_function("frame_encode_hello", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_color_assignment(c: &mut Criterion) {
    let ids: Vec<String> = (0..64).map(|i| format!("user-{i:04}")).collect();
    c.bench_function("palette_index_64_users", |b| {
        b.iter(|| {
            for id in &ids {
                black_box(palette_index(black_box(id)));
            }
        })
    });
    c.bench_function("color_for", |b| b.iter(|| black_box(color_for(black_box("alice")))));
}

fn populated_store(room: &RoomId, sessions: usize, now: Instant) -> (PresenceStore, Vec<Author>) {
    let mut store = PresenceStore::new();
    let authors: Vec<Author> = (0..sessions)
        .map(|i| Author::new(SessionId::new(), UserId::new(format!("user-{}", i % 10))))
        .collect();
    for (i, author) in authors.iter().enumerate() {
        store.announce(room, author, &format!("User {i}"), None, now);
        store.set_editing(room, author, i % 7 == 0, now);
    }
    (store, authors)
}

fn bench_presence_upsert(c: &mut Criterion) {
    let room = RoomId::for_entity(EntityKind::Document, 1);
    let now = Instant::now();
    let (mut store, authors) = populated_store(&room, 50, now);

    c.bench_function("presence_upsert_cursor_50_sessions", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let author = &authors[i % authors.len()];
            store.upsert_cursor(&room, author, i as f32, 10.0, now);
            i += 1;
        })
    });
}

fn bench_presence_snapshot(c: &mut Criterion) {
    let room = RoomId::for_entity(EntityKind::Document, 1);
    let (store, _) = populated_store(&room, 50, Instant::now());

    c.bench_function("presence_snapshot_50_sessions", |b| {
        b.iter(|| black_box(store.snapshot(black_box(&room))))
    });
}

fn bench_conflict_detect(c: &mut Criterion) {
    let room = RoomId::for_entity(EntityKind::Requirement, 9);
    let (store, _) = populated_store(&room, 50, Instant::now());
    let detector = EditConflictDetector::new(room, SessionId::new(), UserId::new("me"));

    c.bench_function("conflict_detect_50_sessions", |b| {
        b.iter(|| black_box(detector.detect(black_box(&store))))
    });
}

fn bench_debouncer_burst(c: &mut Criterion) {
    let start = Instant::now();
    c.bench_function("debounce_burst_100_moves", |b| {
        b.iter(|| {
            let mut debouncer = Debouncer::new(Duration::from_millis(50));
            for i in 0..100u64 {
                debouncer.schedule(i, start + Duration::from_millis(i * 5));
            }
            black_box(debouncer.take_due(start + Duration::from_secs(1)))
        })
    });
}

fn bench_registry_join_release(c: &mut Criterion) {
    let rooms: Vec<RoomId> = (0..16)
        .map(|i| RoomId::for_entity(EntityKind::Prototype, i))
        .collect();
    let session = SessionId::new();

    c.bench_function("registry_join_release_16_rooms", |b| {
        let mut registry = RoomRegistry::new();
        b.iter(|| {
            let subscriptions: Vec<_> = rooms.iter().map(|r| registry.join(r, session)).collect();
            for subscription in subscriptions {
                black_box(registry.release(subscription));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_hello_encode,
    bench_color_assignment,
    bench_presence_upsert,
    bench_presence_snapshot,
    bench_conflict_detect,
    bench_debouncer_burst,
    bench_registry_join_release,
);
criterion_main!(benches);

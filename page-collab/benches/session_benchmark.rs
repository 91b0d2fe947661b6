use criterion::{black_box, criterion_group, criterion_main, Criterion};
use page_collab::presence::{AwarenessMessage, PresenceAttributes, PresenceTable};
use page_collab::state::{ConnectionStateMachine, ConnectionStatus};
use page_collab::sync::{RestSnapshot, SyncCoordinator};
use page_collab::transport::{TransportEvent, TransportSession};
use page_collab::{ReplicaHandle, SyncMessage};
use std::time::Duration;
use uuid::Uuid;

fn bench_frame_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let update = vec![0u8; 64]; // Typical small update

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(peer), black_box("doc"), black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_demux(c: &mut Criterion) {
    let transport = TransportSession::new("doc", Uuid::new_v4());
    let binary = SyncMessage::update(Uuid::new_v4(), "doc", vec![0u8; 64])
        .encode()
        .unwrap();
    let control = r#"{"type":"error","code":"access_denied","message":"no"}"#.to_string();

    c.bench_function("demux_binary_64B", |b| {
        b.iter(|| black_box(transport.demux(TransportEvent::Binary(binary.clone()))))
    });
    c.bench_function("demux_control_json", |b| {
        b.iter(|| black_box(transport.demux(TransportEvent::Text(control.clone()))))
    });
}

fn bench_reconcile(c: &mut Criterion) {
    let content = "lorem ipsum dolor sit amet ".repeat(400); // ~10KB page

    c.bench_function("reconcile_seed_10KB", |b| {
        b.iter(|| {
            let replica = ReplicaHandle::new();
            let mut sync =
                SyncCoordinator::new(Some(RestSnapshot::new(content.clone())), Duration::from_secs(5));
            black_box(sync.on_first_sync(&replica));
        })
    });
}

fn bench_replica_apply(c: &mut Criterion) {
    let source = ReplicaHandle::new();
    for i in 0..1000 {
        source.insert(source.len(), &format!("line {i}\n")).unwrap();
    }
    let state = source.encode_state();

    c.bench_function("replica_apply_1k_inserts", |b| {
        b.iter(|| {
            let replica = ReplicaHandle::new();
            replica.apply_remote(black_box(&state)).unwrap();
            black_box(replica.len());
        })
    });
}

fn bench_presence_churn(c: &mut Criterion) {
    let table = PresenceTable::new(Uuid::new_v4());
    let peers: Vec<Uuid> = (0..50).map(|_| Uuid::new_v4()).collect();

    c.bench_function("presence_50_announce_leave", |b| {
        b.iter(|| {
            for &peer_id in &peers {
                table.apply(&AwarenessMessage::Announce {
                    peer_id,
                    attributes: PresenceAttributes::for_peer(peer_id, "Peer"),
                });
            }
            for &peer_id in &peers {
                table.apply(&AwarenessMessage::Leave { peer_id });
            }
        })
    });
}

fn bench_state_machine(c: &mut Criterion) {
    c.bench_function("state_machine_reconnect_cycle", |b| {
        b.iter(|| {
            let mut machine = ConnectionStateMachine::new("doc", 3);
            machine.on_connected();
            machine.on_synced();
            for _ in 0..10 {
                machine.on_closed(Some(1006));
                machine.on_retry();
                machine.on_connected();
            }
            black_box(machine.status() == ConnectionStatus::Connected);
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_demux,
    bench_reconcile,
    bench_replica_apply,
    bench_presence_churn,
    bench_state_machine,
);
criterion_main!(benches);

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shmlink::{
    BackingType, ChannelConfig, ChannelRole, FramingMode, NullDoorbell, RegionConfig, RingChannel,
    SharedRegion,
};
use std::sync::Arc;

fn region(size: usize) -> Arc<SharedRegion> {
    Arc::new(
        SharedRegion::new(RegionConfig {
            name: "bench".to_string(),
            size,
            #[cfg(target_os = "linux")]
            backing_type: BackingType::MemFd,
            #[cfg(not(target_os = "linux"))]
            backing_type: BackingType::FileBacked,
            ..Default::default()
        })
        .unwrap(),
    )
}

fn packet_config(slot_count: u32, slot_size: u32) -> ChannelConfig {
    ChannelConfig {
        base_offset: 0,
        slot_count,
        data_size: slot_count * slot_size,
        alignment: 64,
        mtu: slot_size,
        packets_per_slot: 1,
        data_bit: 0,
        release_bit: 1,
    }
}

fn ring_pair(config: &ChannelConfig, mode: FramingMode) -> (RingChannel, RingChannel) {
    let region = region(1024 * 1024);
    let bell = Arc::new(NullDoorbell);
    let producer = RingChannel::new(
        region.clone(),
        config,
        mode,
        ChannelRole::Producer,
        bell.clone(),
    )
    .unwrap();
    let consumer =
        RingChannel::new(region, config, mode, ChannelRole::Consumer, bell).unwrap();
    producer.init_descriptor();
    producer.arm_writes();
    (producer, consumer)
}

fn benchmark_packet_fill_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("RingChannel_Packet");

    for slot_count in [4u32, 16, 64].iter() {
        group.throughput(Throughput::Elements(*slot_count as u64));
        group.bench_with_input(
            BenchmarkId::new("fill_drain_512B", slot_count),
            slot_count,
            |b, &slot_count| {
                let config = packet_config(slot_count, 512);
                let (producer, consumer) = ring_pair(&config, FramingMode::Packet);
                let payload = [0xabu8; 512];

                b.iter(|| {
                    for _ in 0..slot_count {
                        let mut slot = producer.acquire_write_slot().unwrap();
                        slot.write_payload(&payload).unwrap();
                        slot.commit(512).unwrap();
                    }
                    for _ in 0..slot_count {
                        consumer.peek_read_slot().unwrap().unwrap().release().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

fn benchmark_payload_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("RingChannel_PayloadSize");

    for size in [64u32, 512, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64 * 16));
        group.bench_with_input(BenchmarkId::new("packet", size), size, |b, &size| {
            let config = packet_config(16, size);
            let (producer, consumer) = ring_pair(&config, FramingMode::Packet);
            let payload = vec![0x5au8; size as usize];

            b.iter(|| {
                for _ in 0..16 {
                    let mut slot = producer.acquire_write_slot().unwrap();
                    slot.write_payload(&payload).unwrap();
                    slot.commit(size).unwrap();
                }
                for _ in 0..16 {
                    consumer.peek_read_slot().unwrap().unwrap().release().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn benchmark_stream_bytes(c: &mut Criterion) {
    let mut group = c.benchmark_group("RingChannel_Stream");
    let config = ChannelConfig {
        base_offset: 0,
        slot_count: 1,
        data_size: 64 * 1024,
        alignment: 64,
        mtu: 4096,
        packets_per_slot: 1,
        data_bit: 0,
        release_bit: 1,
    };

    group.throughput(Throughput::Bytes(8 * 4096));
    group.bench_function("write_read_4KiB_chunks", |b| {
        let (producer, consumer) = ring_pair(&config, FramingMode::Stream);
        let payload = [0x77u8; 4096];

        b.iter(|| {
            for _ in 0..8 {
                let mut slot = producer.acquire_write_slot().unwrap();
                slot.write_payload(&payload).unwrap();
                slot.commit(4096).unwrap();
            }
            let mut drained = 0usize;
            while drained < 8 * 4096 {
                let slot = consumer.peek_read_slot().unwrap().unwrap();
                drained += slot.len() as usize;
                slot.release().unwrap();
            }
        });
    });

    group.finish();
}

fn benchmark_interleaved(c: &mut Criterion) {
    let mut group = c.benchmark_group("RingChannel_Interleaved");
    let config = packet_config(8, 512);

    // Producer and consumer advance in lockstep, the steady-state shape of
    // a live link
    group.bench_function("lockstep_512B", |b| {
        let (producer, consumer) = ring_pair(&config, FramingMode::Packet);
        let payload = [0x11u8; 512];

        b.iter(|| {
            for _ in 0..1000 {
                let mut slot = producer.acquire_write_slot().unwrap();
                slot.write_payload(&payload).unwrap();
                slot.commit(512).unwrap();
                consumer.peek_read_slot().unwrap().unwrap().release().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_packet_fill_drain,
    benchmark_payload_sizes,
    benchmark_stream_bytes,
    benchmark_interleaved
);
criterion_main!(benches);

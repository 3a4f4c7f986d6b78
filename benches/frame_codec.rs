use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use dubflow::protocol::{Compression, Flags, Frame, FrameBuffer, MessageType};
use std::hint::black_box;

/// One chunk of 16 kHz mono 16-bit audio, as the recognizer streams it.
const CHUNK_BYTES: usize = 3200;

fn audio_frame(len: usize, compression: Compression) -> Frame {
    let payload: Vec<u8> = (0..len).map(|i| ((i * 31) % 256) as u8).collect();
    Frame::new(MessageType::AudioOnlyRequest, Flags::POSITIVE_SEQUENCE, payload)
        .with_sequence(7)
        .with_compression(compression)
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for len in [0, CHUNK_BYTES, 64 * 1024] {
        group.throughput(Throughput::Bytes(len as u64));
        for (name, compression) in [("raw", Compression::None), ("gzip", Compression::Gzip)] {
            let frame = audio_frame(len, compression);
            group.bench_with_input(BenchmarkId::new(name, len), &frame, |b, frame| {
                b.iter(|| black_box(frame.encode().unwrap()));
            });
        }
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for len in [CHUNK_BYTES, 64 * 1024] {
        group.throughput(Throughput::Bytes(len as u64));
        for (name, compression) in [("raw", Compression::None), ("gzip", Compression::Gzip)] {
            let bytes = audio_frame(len, compression).encode().unwrap();
            group.bench_with_input(BenchmarkId::new(name, len), &bytes, |b, bytes| {
                b.iter(|| black_box(Frame::from_bytes(bytes).unwrap()));
            });
        }
    }
    group.finish();
}

/// A second of audio arriving in small, frame-misaligned reads.
fn bench_reassembly(c: &mut Criterion) {
    let mut stream = Vec::new();
    for _ in 0..10 {
        stream.extend(audio_frame(CHUNK_BYTES, Compression::None).encode().unwrap());
    }

    let mut group = c.benchmark_group("reassembly");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    for read_size in [512, 4096] {
        group.bench_with_input(
            BenchmarkId::from_parameter(read_size),
            &read_size,
            |b, &read_size| {
                b.iter(|| {
                    let mut buffer = FrameBuffer::new();
                    let mut frames = 0;
                    for piece in stream.chunks(read_size) {
                        buffer.push(piece);
                        while let Some(frame) = buffer.next_frame().unwrap() {
                            black_box(&frame);
                            frames += 1;
                        }
                    }
                    assert_eq!(frames, 10);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_reassembly);
criterion_main!(benches);

//! Performance benchmarks for the hot paths of a tick
//!
//! Bounds are loose enough for unoptimized builds; the printed timings are
//! the interesting part.

use server::{Accumulator, Dispatcher, Group, Input, Recipient, Session};
use shared::{decode_frame, encode_frame, Frame, FrameFormat, FrameReader, Payload, MAX_PAYLOAD_SIZE};
use std::sync::Arc;
use std::time::Instant;

fn report(name: &str, iterations: usize, duration: std::time::Duration) {
    println!(
        "{}: {} iterations in {:?} ({:.2} ns/iter)",
        name,
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );
}

/// Benchmarks staging and draining inputs through the accumulator
#[test]
fn benchmark_accumulator_add_consume() {
    let (session, _rx) = Session::new(1, None, 8);
    let accumulator = Accumulator::new();

    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        accumulator.add(Input::new(Arc::clone(&session), Frame::new(vec![i as u8; 16])));
        if i % 1_000 == 999 {
            assert_eq!(accumulator.consume().len(), 1_000);
        }
    }

    let duration = start.elapsed();
    report("Accumulator add/consume", iterations, duration);

    assert!(accumulator.is_empty());
    assert!(duration.as_millis() < 2_000);
}

/// Benchmarks frame encoding and decoding in both formats
#[test]
fn benchmark_frame_codec() {
    let payload = vec![42u8; 128];
    let iterations = 100_000;

    for format in [FrameFormat::Plain, FrameFormat::Timestamped] {
        let mut buf = Vec::with_capacity(256);
        let start = Instant::now();

        for _ in 0..iterations {
            buf.clear();
            encode_frame(format, &payload, &mut buf).unwrap();
            let (frame, used) = decode_frame(&buf, format, MAX_PAYLOAD_SIZE).unwrap();
            assert_eq!(used, buf.len());
            assert_eq!(frame.payload.len(), payload.len());
        }

        let duration = start.elapsed();
        report(&format!("Frame codec ({:?})", format), iterations, duration);
        assert!(duration.as_millis() < 2_000);
    }
}

/// Benchmarks the streaming reader over a buffer of back-to-back frames
#[test]
fn benchmark_stream_reader() {
    let frames = 10_000;
    let mut wire = Vec::new();
    for i in 0..frames {
        encode_frame(FrameFormat::Plain, format!("frame {}", i).as_bytes(), &mut wire).unwrap();
    }

    let start = Instant::now();
    let read = tokio_test::block_on(async {
        let mut reader = FrameReader::new(wire.as_slice(), FrameFormat::Plain, MAX_PAYLOAD_SIZE);
        let mut read = 0;
        while reader.read_frame().await.is_ok() {
            read += 1;
        }
        read
    });

    let duration = start.elapsed();
    report("Stream reader", frames, duration);

    assert_eq!(read, frames);
    assert!(duration.as_millis() < 2_000);
}

/// Benchmarks coalescing many payloads into one batch per recipient
#[test]
fn benchmark_dispatcher_flush() {
    let members = Arc::new(Group::new("all"));
    let mut receivers = Vec::new();
    for id in 1..=100 {
        let (session, rx) = Session::new(id, None, 64);
        members.add(session);
        receivers.push(rx);
    }
    let mut dispatcher = Dispatcher::new(Arc::clone(&members));
    let payload = Payload::from(&b"state"[..]);

    let ticks = 50;
    let start = Instant::now();

    for _ in 0..ticks {
        for session in members.sessions() {
            dispatcher.enqueue(Recipient::Session(session), vec![payload.clone(); 10]);
        }
        dispatcher.enqueue(Recipient::All, vec![payload.clone(); 10]);
        let stats = dispatcher.flush();
        // One direct batch and one broadcast batch per session
        assert_eq!(stats.recipients, 101);
        assert_eq!(stats.delivered, 200);

        for rx in receivers.iter_mut() {
            assert_eq!(rx.try_recv().unwrap().len(), 10);
            assert_eq!(rx.try_recv().unwrap().len(), 10);
        }
    }

    let duration = start.elapsed();
    report("Dispatcher flush (100 sessions)", ticks, duration);
    assert!(duration.as_millis() < 2_000);
}

/// Benchmarks broadcasting batches to a group
#[test]
fn benchmark_group_broadcast() {
    let group = Group::new("room");
    let mut receivers = Vec::new();
    for id in 1..=50 {
        let (session, rx) = Session::new(id, None, 1_024);
        group.add(session);
        receivers.push(rx);
    }
    let batch: server::Batch = vec![Payload::from("hello"); 4].into();

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        assert_eq!(group.ship(Arc::clone(&batch)), 50);
    }

    let duration = start.elapsed();
    report("Group broadcast (50 sessions)", iterations, duration);

    for rx in receivers.iter_mut() {
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, iterations);
    }
    assert!(duration.as_millis() < 2_000);
}

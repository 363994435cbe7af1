use coalesce_bench::{FlushPolicy, MessageGenerator, Scheduler, TransportPipeline, STOP_SENTINEL};
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

const SCHEDULERS: [Scheduler; 3] = [
    Scheduler::Synchronous,
    Scheduler::Threaded,
    Scheduler::Cooperative,
];

fn policies() -> [FlushPolicy; 2] {
    [
        FlushPolicy::Immediate,
        FlushPolicy::Coalescing {
            window: Duration::from_micros(100),
        },
    ]
}

/// Run one pipeline over a real loopback connection and return what the
/// peer read, together with the bytes the pipeline says it produced.
fn deliver(pipeline: &TransportPipeline, count: usize, nodelay: bool) -> (Vec<u8>, Vec<u8>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        received
    });

    let client = TcpStream::connect(address).unwrap();
    client.set_nodelay(nodelay).unwrap();
    client.set_nonblocking(true).unwrap();

    let mut generator = MessageGenerator::new(7, b'\n').with_max_size(300);
    let output = pipeline.run(&mut generator, count, client).unwrap();
    assert_eq!(output.produced.len(), count);

    let expected: Vec<u8> = output.produced.iter().flat_map(|p| p.data.clone()).collect();
    (server.join().unwrap(), expected)
}

/// Every scheduler/policy combination delivers every message, in order, with
/// nothing lost or duplicated, followed by exactly one stop sentinel.
#[test]
fn every_pipeline_delivers_in_order_over_tcp() {
    for scheduler in SCHEDULERS {
        for policy in policies() {
            let pipeline = TransportPipeline::new(scheduler, policy).with_queue_capacity(4);
            let (received, expected) = deliver(&pipeline, 2_000, true);

            let (payload, tail) = received.split_at(received.len() - STOP_SENTINEL.len());
            assert_eq!(tail, STOP_SENTINEL, "{} / {}", scheduler, policy);
            assert_eq!(payload.len(), expected.len(), "{} / {}", scheduler, policy);
            assert!(payload == expected.as_slice(), "{} / {}: payload differs", scheduler, policy);
        }
    }
}

/// With Nagle enabled the byte stream is unchanged; only timing differs.
#[test]
fn nagle_does_not_change_the_byte_stream() {
    let pipeline = TransportPipeline::new(Scheduler::Threaded, FlushPolicy::Immediate);
    let (received, expected) = deliver(&pipeline, 500, false);
    assert!(received.starts_with(&expected));
    assert!(received.ends_with(STOP_SENTINEL));
    assert_eq!(received.len(), expected.len() + STOP_SENTINEL.len());
}

/// Coalescing never needs more writes than immediate flushing for the same
/// sequence.
#[test]
fn coalescing_uses_no_more_writes_than_immediate() {
    let run = |policy| {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut sink = Vec::new();
            stream.read_to_end(&mut sink).unwrap();
        });
        let client = TcpStream::connect(address).unwrap();
        client.set_nonblocking(true).unwrap();
        let mut generator = MessageGenerator::new(3, b'\n');
        let output = TransportPipeline::new(Scheduler::Synchronous, policy)
            .run(&mut generator, 1_000, client)
            .unwrap();
        server.join().unwrap();
        output.writes
    };

    let immediate = run(FlushPolicy::Immediate);
    let coalesced = run(FlushPolicy::Coalescing {
        window: Duration::from_millis(1),
    });
    assert_eq!(immediate, 1_000);
    assert!(coalesced <= immediate);
}

use coalesce_bench::receiver::{read_event, ReceiverEvent};
use coalesce_bench::STOP_SENTINEL;
use os_pipe::pipe;
use std::io::Write;
use std::net::TcpStream;
use std::process::{Command, Stdio};

/// Drive the receiver binary by hand: ready frame, one run, clean exit.
///
/// The child's stdout is connected to an OS pipe exactly as the benchmark
/// runner does it, so this exercises the real frame channel end to end.
#[test]
fn receiver_reports_ready_chunks_and_end_of_stream() {
    let (mut reader, writer) = pipe().expect("create pipe");

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_coalesce-bench"));
    cmd.stdin(Stdio::null())
        .stdout(writer)
        .stderr(Stdio::null())
        .args([
            "--internal-run-as-receiver",
            "--host",
            "127.0.0.1",
            "--port",
            "0",
            "--idle-timeout",
            "200ms",
        ]);
    let mut child = cmd.spawn().expect("spawn receiver");
    drop(cmd);

    let address = match read_event(&mut reader).expect("read ready frame") {
        Some(ReceiverEvent::Ready { address }) => address,
        other => panic!("expected Ready, got {:?}", other),
    };

    let mut client = TcpStream::connect(&address).expect("connect to receiver");
    client.write_all(b"aaaa\naa\n").unwrap();
    client.write_all(STOP_SENTINEL).unwrap();

    let mut payload = Vec::new();
    loop {
        match read_event(&mut reader).expect("read frame") {
            Some(ReceiverEvent::Chunk(chunk)) => {
                assert!(chunk.timestamp_ns > 0);
                payload.extend(chunk.data);
            }
            Some(ReceiverEvent::EndOfStream) => break,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(payload, b"aaaa\naa\n");

    // Closing the connection ends the receiver; the channel then hits EOF.
    drop(client);
    assert!(read_event(&mut reader).expect("read eof").is_none());
    let status = child.wait().expect("reap receiver");
    assert!(status.success());
}

/// A port that is already taken is reported as `Failed` and a non-zero exit.
#[test]
fn receiver_reports_bind_failure() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let (mut reader, writer) = pipe().expect("create pipe");

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_coalesce-bench"));
    cmd.stdin(Stdio::null())
        .stdout(writer)
        .stderr(Stdio::null())
        .args(["--internal-run-as-receiver", "--port", &port.to_string()]);
    let mut child = cmd.spawn().expect("spawn receiver");
    drop(cmd);

    match read_event(&mut reader).expect("read frame") {
        Some(ReceiverEvent::Failed { reason }) => assert!(reason.contains("bind")),
        other => panic!("expected Failed, got {:?}", other),
    }
    assert!(!child.wait().expect("reap receiver").success());
}

//! Process-level behaviour of the server binary.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::process::{Command, Stdio};
use std::time::Duration;

#[test]
fn invalid_payload_aborts_without_echo() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_echo-call-server"))
        .args(["127.0.0.1:0", "--log-level", "info"])
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn server");

    let mut stderr = BufReader::new(child.stderr.take().expect("stderr"));
    let mut log = String::new();
    let addr = loop {
        let mut line = String::new();
        if stderr.read_line(&mut line).expect("read log") == 0 {
            panic!("server exited before binding:\n{log}");
        }
        log.push_str(&line);
        if line.contains("Creating server") {
            let addr = line
                .split_whitespace()
                .find_map(|field| field.strip_prefix("addr="))
                .expect("addr field");
            break addr.to_string();
        }
    };

    let mut stream = TcpStream::connect(&addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    // Byte 0 of a call must be 0x00.
    stream.write_all(b"1\r\n\x05").expect("send frame");

    let mut echoed = Vec::new();
    let _ = stream.read_to_end(&mut echoed);
    assert!(echoed.is_empty(), "echoed {echoed:?}");

    let status = child.wait().expect("wait for server");
    assert!(!status.success());
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // SIGABRT
        assert_eq!(status.signal(), Some(6), "status {status:?}");
    }

    stderr.read_to_string(&mut log).expect("read log");
    assert!(log.contains("invalid payload"), "log:\n{log}");
}

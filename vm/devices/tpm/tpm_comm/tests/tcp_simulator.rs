// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end tests against an in-process simulator listening on loopback.

use std::io::Read;
use std::io::Write;
use std::net::TcpListener;
use std::net::TcpStream;
use std::num::NonZeroU32;
use std::thread::JoinHandle;
use tpm_comm::BackendKind;
use tpm_comm::Error;
use tpm_comm::OpenError;
use tpm_comm::TpmCommConfig;
use tpm_comm::simulator::ConnectError;
use tpm_comm::simulator::SimulatorConfig;
use tpm_comm::simulator::SubmitError;

const TIMEOUT: NonZeroU32 = NonZeroU32::new(10).unwrap();

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::new("tpm_comm=trace"))
        .try_init();
}

/// What the simulator saw over the life of one connection.
#[derive(Debug, Default)]
struct Transcript {
    signals: Vec<u32>,
    commands: Vec<Vec<u8>>,
    session_ended: bool,
}

/// Speaks just enough of the simulator protocol to serve one client. Each
/// command is answered with its bytes reversed.
struct FakeSimulator {
    command_port: u16,
    platform_port: u16,
    thread: JoinHandle<Transcript>,
}

impl FakeSimulator {
    fn spawn() -> Self {
        let command = TcpListener::bind("127.0.0.1:0").unwrap();
        let platform = TcpListener::bind("127.0.0.1:0").unwrap();
        let command_port = command.local_addr().unwrap().port();
        let platform_port = platform.local_addr().unwrap().port();
        let thread = std::thread::spawn(move || serve(command, platform));
        Self {
            command_port,
            platform_port,
            thread,
        }
    }

    fn config(&self) -> TpmCommConfig {
        TpmCommConfig::Emulator(SimulatorConfig {
            host: "127.0.0.1".into(),
            command_port: self.command_port,
            platform_port: Some(self.platform_port),
            timeout: TIMEOUT,
        })
    }

    fn join(self) -> Transcript {
        self.thread.join().unwrap()
    }
}

fn read_u32(stream: &mut TcpStream) -> Option<u32> {
    let mut word = [0; 4];
    stream.read_exact(&mut word).ok()?;
    Some(u32::from_be_bytes(word))
}

fn serve(command: TcpListener, platform: TcpListener) -> Transcript {
    let mut transcript = Transcript::default();

    let (mut conn, _) = command.accept().unwrap();
    assert_eq!(read_u32(&mut conn), Some(15));
    let version = read_u32(&mut conn).unwrap();
    let mut reply = Vec::new();
    reply.extend_from_slice(&version.to_be_bytes());
    reply.extend_from_slice(&0x2au32.to_be_bytes());
    reply.extend_from_slice(&0u32.to_be_bytes());
    conn.write_all(&reply).unwrap();

    let (mut power, _) = platform.accept().unwrap();
    while let Some(signal) = read_u32(&mut power) {
        transcript.signals.push(signal);
        power.write_all(&0u32.to_be_bytes()).unwrap();
    }

    while let Some(opcode) = read_u32(&mut conn) {
        match opcode {
            8 => {
                let mut locality = [0; 1];
                conn.read_exact(&mut locality).unwrap();
                assert_eq!(locality, [0]);
                let len = read_u32(&mut conn).unwrap() as usize;
                let mut body = vec![0; len];
                conn.read_exact(&mut body).unwrap();

                let mut reply = Vec::new();
                reply.extend_from_slice(&(len as u32).to_be_bytes());
                reply.extend(body.iter().rev());
                reply.extend_from_slice(&0u32.to_be_bytes());
                conn.write_all(&reply).unwrap();
                transcript.commands.push(body);
            }
            20 => {
                transcript.session_ended = true;
                break;
            }
            other => panic!("unexpected opcode {other}"),
        }
    }
    transcript
}

#[test]
fn submits_commands_to_a_simulator() {
    init_tracing();
    let sim = FakeSimulator::spawn();

    let mut tpm = tpm_comm::open(&sim.config()).unwrap();
    assert_eq!(tpm.kind(), BackendKind::Emulator);

    let mut response = [0; 64];
    let len = tpm.submit_command(&[1, 2, 3], &mut response).unwrap();
    assert_eq!(&response[..len], [3, 2, 1]);

    let len = tpm.submit_command(&[9; 10], &mut response).unwrap();
    assert_eq!(&response[..len], [9; 10]);

    drop(tpm);
    let transcript = sim.join();
    assert_eq!(transcript.signals, [1, 11]);
    assert_eq!(transcript.commands, [vec![1, 2, 3], vec![9; 10]]);
    assert!(transcript.session_ended);
}

#[test]
fn large_responses_span_many_reads() {
    init_tracing();
    let sim = FakeSimulator::spawn();
    let mut tpm = tpm_comm::open(&sim.config()).unwrap();

    let command: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
    let mut response = vec![0; command.len()];
    let len = tpm.submit_command(&command, &mut response).unwrap();
    assert_eq!(len, command.len());
    assert!(response.iter().eq(command.iter().rev()));

    drop(tpm);
    assert!(sim.join().session_ended);
}

#[test]
fn failed_submit_still_ends_session() {
    init_tracing();
    let sim = FakeSimulator::spawn();
    let mut tpm = tpm_comm::open(&sim.config()).unwrap();

    // The simulator answers with as many bytes as it was sent.
    let err = tpm.submit_command(&[7; 32], &mut [0; 16]).unwrap_err();
    assert!(matches!(
        err,
        Error::Simulator(SubmitError::ResponseTooLarge {
            len: 32,
            capacity: 16
        })
    ));

    drop(tpm);
    let transcript = sim.join();
    assert_eq!(transcript.commands, [vec![7; 32]]);
    assert!(transcript.session_ended);
}

#[test]
fn refused_connection_is_reported() {
    init_tracing();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = TpmCommConfig::Emulator(SimulatorConfig {
        host: "127.0.0.1".into(),
        command_port: port,
        platform_port: Some(port),
        timeout: TIMEOUT,
    });

    let err = tpm_comm::open(&config).err().unwrap();
    assert!(matches!(
        err,
        OpenError::Simulator(ConnectError::Connect(_))
    ));
}

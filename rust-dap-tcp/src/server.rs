// Copyright 2021-2024 Kenta Ida
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use rust_dap::{BitBangIo, CmsisDap};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

use crate::error::{Error, FramingError};
use crate::packet::{PacketHeader, PacketType, HEADER_SIZE, MAX_FRAME};

pub const DEFAULT_PORT: u16 = 4441;

/// How long a response may wait for room in the send buffer.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

const KEEPALIVE_IDLE: Duration = Duration::from_secs(1);
#[cfg(any(target_os = "linux", target_os = "android"))]
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
#[cfg(any(target_os = "linux", target_os = "android"))]
const KEEPALIVE_RETRIES: u32 = 5;

struct Client {
    stream: TcpStream,
    peer: SocketAddr,
}

enum Pump {
    /// Number of requests answered. The session stays open.
    Open(usize),
    /// The peer closed the connection.
    Closed(usize),
}

/// Serves one CMSIS-DAP processor to a single TCP client at a time.
pub struct DapServer<'a, Io> {
    listener: TcpListener,
    client: Option<Client>,
    dap: CmsisDap<'a, Io>,
    request: [u8; MAX_FRAME],
    response: [u8; MAX_FRAME],
}

impl<'a, Io: BitBangIo> DapServer<'a, Io> {
    /// Opens the non-blocking listener.
    pub fn bind(addr: SocketAddr, dap: CmsisDap<'a, Io>) -> Result<Self, Error> {
        let listener = listen(addr).map_err(Error::Listener)?;
        info!(
            "listening on {}",
            listener.local_addr().map_err(Error::Listener)?
        );
        Ok(Self {
            listener,
            client: None,
            dap,
            request: [0; MAX_FRAME],
            response: [0; MAX_FRAME],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.client.as_ref().map(|client| client.peer)
    }

    pub fn dap(&self) -> &CmsisDap<'a, Io> {
        &self.dap
    }

    pub fn dap_mut(&mut self) -> &mut CmsisDap<'a, Io> {
        &mut self.dap
    }

    /// Runs one pump iteration: admits or rejects pending connections,
    /// then answers every complete request frame already received.
    ///
    /// Returns the number of requests answered; 0 means idle. A session
    /// error closes the session before it is returned.
    pub fn process(&mut self) -> Result<usize, Error> {
        self.accept()?;

        let result = match self.client.as_ref() {
            Some(client) => pump(
                &client.stream,
                &mut self.dap,
                &mut self.request,
                &mut self.response,
            ),
            None => return Ok(0),
        };
        match result {
            Ok(Pump::Open(handled)) => Ok(handled),
            Ok(Pump::Closed(handled)) => {
                self.close("closed by peer");
                Ok(handled)
            }
            Err(err) => {
                warn!("session error: {}", err);
                self.close("session error");
                Err(err)
            }
        }
    }

    fn accept(&mut self) -> Result<(), Error> {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::Interrupted
                            | ErrorKind::ConnectionAborted
                            | ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(err) => return Err(Error::Listener(err)),
            };
            if self.client.is_some() {
                info!("rejecting {}: a session is already active", peer);
                continue;
            }
            if let Err(err) = configure_stream(&stream) {
                warn!("dropping {}: {}", peer, err);
                continue;
            }
            info!("client {} connected", peer);
            self.client = Some(Client { stream, peer });
        }
    }

    fn close(&mut self, reason: &str) {
        if let Some(client) = self.client.take() {
            info!("client {} disconnected: {}", client.peer, reason);
        }
    }
}

fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let keepalive = keepalive
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_RETRIES);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Non-blocking peek. `None` when nothing is queued yet.
fn peek(stream: &TcpStream, buffer: &mut [u8]) -> io::Result<Option<usize>> {
    loop {
        match stream.peek(buffer) {
            Ok(length) => return Ok(Some(length)),
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Writes a whole frame, giving up when the peer has not made room for it
/// within [`RESPONSE_TIMEOUT`].
fn write_frame(mut stream: &TcpStream, frame: &[u8]) -> io::Result<()> {
    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    let mut written = 0;
    while written < frame.len() {
        match stream.write(&frame[written..]) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(length) => written += length,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        ErrorKind::TimedOut,
                        "peer stopped reading responses",
                    ));
                }
                std::thread::yield_now()
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Answers complete frames until less than one frame is queued.
fn pump<Io: BitBangIo>(
    mut stream: &TcpStream,
    dap: &mut CmsisDap<'_, Io>,
    request: &mut [u8; MAX_FRAME],
    response: &mut [u8; MAX_FRAME],
) -> Result<Pump, Error> {
    let mut handled = 0;
    loop {
        let mut header = [0u8; HEADER_SIZE];
        let available = match peek(stream, &mut header)? {
            Some(0) => return Ok(Pump::Closed(handled)),
            Some(available) => available,
            None => return Ok(Pump::Open(handled)),
        };
        if available < HEADER_SIZE {
            return Ok(Pump::Open(handled));
        }

        let header = PacketHeader::parse(&header)?;
        if header.packet_type != PacketType::Request {
            return Err(FramingError::UnexpectedPacketType(header.packet_type.into()).into());
        }
        let frame_size = header.frame_size();
        match peek(stream, &mut request[..frame_size])? {
            Some(available) if available >= frame_size => {}
            _ => return Ok(Pump::Open(handled)),
        }
        stream.read_exact(&mut request[..frame_size])?;

        let payload = &request[HEADER_SIZE..frame_size];
        let produced = if payload.is_empty() {
            0
        } else {
            let result = dap.process_command(payload, &mut response[HEADER_SIZE..])?;
            let consumed = (result >> 16) as usize;
            if consumed < payload.len() {
                debug!("ignoring {} bytes after the command", payload.len() - consumed);
            }
            (result & 0xffff) as usize
        };

        response[..HEADER_SIZE].copy_from_slice(&PacketHeader::response(produced)?.to_bytes());
        write_frame(stream, &response[..HEADER_SIZE + produced])?;
        trace!("request {} bytes, response {} bytes", payload.len(), produced);
        handled += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::{encode_frame, DAP_SIGNATURE};
    use rust_dap::sim::{SimTarget, SIM_DPIDR};
    use rust_dap::{ClockTiming, ProbeInfo};
    use std::net::Ipv4Addr;
    use std::thread;

    fn server() -> DapServer<'static, SimTarget> {
        let dap = CmsisDap::new(SimTarget::swd(), ProbeInfo::default(), ClockTiming::default());
        DapServer::bind((Ipv4Addr::LOCALHOST, 0).into(), dap).unwrap()
    }

    fn connect(server: &mut DapServer<SimTarget>) -> TcpStream {
        let client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for _ in 0..1000 {
            server.process().unwrap();
            if server.peer_addr() == Some(client.local_addr().unwrap()) {
                return client;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("connection was not accepted");
    }

    /// Calls `process` until `count` requests were answered.
    fn pump_requests(server: &mut DapServer<SimTarget>, count: usize) {
        let mut handled = 0;
        for _ in 0..1000 {
            handled += server.process().unwrap();
            if handled >= count {
                assert_eq!(handled, count);
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("only {} of {} requests answered", handled, count);
    }

    fn read_response(client: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; HEADER_SIZE];
        client.read_exact(&mut header).unwrap();
        let header = PacketHeader::parse(&header).unwrap();
        assert_eq!(header.packet_type, PacketType::Response);
        let mut payload = vec![0u8; header.length as usize];
        client.read_exact(&mut payload).unwrap();
        payload
    }

    fn exchange(server: &mut DapServer<SimTarget>, client: &mut TcpStream, request: &[u8]) -> Vec<u8> {
        client
            .write_all(&encode_frame(PacketType::Request, request).unwrap())
            .unwrap();
        pump_requests(server, 1);
        read_response(client)
    }

    /// The server must have closed the connection, gracefully or not.
    fn assert_closed(client: &mut TcpStream) {
        let mut byte = [0u8; 1];
        match client.read(&mut byte) {
            Ok(0) => {}
            Err(err) if err.kind() == ErrorKind::ConnectionReset => {}
            other => panic!("connection still open: {:?}", other),
        }
    }

    /// Runs `process` until it fails, which it must do within a few tries.
    fn expect_session_error(server: &mut DapServer<SimTarget>) -> Error {
        for _ in 0..1000 {
            match server.process() {
                Ok(_) => thread::sleep(Duration::from_millis(1)),
                Err(err) => return err,
            }
        }
        panic!("no session error");
    }

    #[test]
    fn info_and_transfer_over_tcp() {
        let mut server = server();
        let mut client = connect(&mut server);

        assert_eq!(exchange(&mut server, &mut client, &[0x00, 0x01]), b"\x00\x08OpenOCD\x00");
        assert_eq!(exchange(&mut server, &mut client, &[0x02, 0x01]), [0x02, 0x01]);
        assert_eq!(
            exchange(&mut server, &mut client, &[0x11, 0x40, 0x42, 0x0f, 0x00]),
            [0x11, 0x00]
        );
        let mut expected = vec![0x05, 0x01, 0x01];
        expected.extend_from_slice(&SIM_DPIDR.to_le_bytes());
        assert_eq!(exchange(&mut server, &mut client, &[0x05, 0x00, 0x01, 0x02]), expected);
    }

    #[test]
    fn response_header_on_the_wire() {
        let mut server = server();
        let mut client = connect(&mut server);
        client
            .write_all(&encode_frame(PacketType::Request, &[0x00, 0x01]).unwrap())
            .unwrap();
        pump_requests(&mut server, 1);
        let mut frame = [0u8; 18];
        client.read_exact(&mut frame).unwrap();
        assert_eq!(&frame[..8], [0x44, 0x41, 0x50, 0x00, 0x0a, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn empty_payload_gets_empty_response() {
        let mut server = server();
        let mut client = connect(&mut server);
        assert!(exchange(&mut server, &mut client, &[]).is_empty());
    }

    #[test]
    fn partial_frames_wait_for_the_rest() {
        let mut server = server();
        let mut client = connect(&mut server);
        let frame = encode_frame(PacketType::Request, &[0x00, 0x01]).unwrap();

        client.write_all(&frame[..5]).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(server.process().unwrap(), 0);
        client.write_all(&frame[5..9]).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(server.process().unwrap(), 0);
        client.write_all(&frame[9..]).unwrap();
        pump_requests(&mut server, 1);
        assert_eq!(read_response(&mut client), b"\x00\x08OpenOCD\x00");
    }

    #[test]
    fn back_to_back_frames_answered_in_order() {
        let mut server = server();
        let mut client = connect(&mut server);
        let mut frames = encode_frame(PacketType::Request, &[0x02, 0x01]).unwrap();
        frames.extend_from_slice(&encode_frame(PacketType::Request, &[0x42]).unwrap());
        frames.extend_from_slice(&encode_frame(PacketType::Request, &[0x03]).unwrap());
        client.write_all(&frames).unwrap();
        pump_requests(&mut server, 3);
        assert_eq!(read_response(&mut client), [0x02, 0x01]);
        assert_eq!(read_response(&mut client), [0xff]);
        assert_eq!(read_response(&mut client), [0x03, 0x00]);
    }

    #[test]
    fn bad_signature_closes_session() {
        let mut server = server();
        let mut client = connect(&mut server);
        let mut frame = encode_frame(PacketType::Request, &[0x00, 0x01]).unwrap();
        frame[0] = b'X';
        client.write_all(&frame).unwrap();

        let err = expect_session_error(&mut server);
        let signature = DAP_SIGNATURE & !0xff | b'X' as u32;
        assert!(matches!(err, Error::Framing(FramingError::BadSignature(s)) if s == signature));
        assert!(!err.is_fatal());
        assert_eq!(server.peer_addr(), None);
        assert_closed(&mut client);
    }

    #[test]
    fn response_frame_from_client_closes_session() {
        let mut server = server();
        let mut client = connect(&mut server);
        client
            .write_all(&encode_frame(PacketType::Response, &[0x00, 0x01]).unwrap())
            .unwrap();
        let err = expect_session_error(&mut server);
        assert!(matches!(
            err,
            Error::Framing(FramingError::UnexpectedPacketType(2))
        ));
        assert_closed(&mut client);
    }

    #[test]
    fn oversized_frame_closes_session() {
        let mut server = server();
        let mut client = connect(&mut server);
        let header = [0x44, 0x41, 0x50, 0x00, 0x01, 0x04, 0x01, 0x00];
        client.write_all(&header).unwrap();
        let err = expect_session_error(&mut server);
        assert!(matches!(err, Error::Framing(FramingError::Oversize(1025))));
    }

    #[test]
    fn second_client_is_turned_away() {
        let mut server = server();
        let mut first = connect(&mut server);
        let first_addr = first.local_addr().unwrap();

        let mut second = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        second
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(server.process().unwrap(), 0);
        assert_closed(&mut second);
        assert_eq!(server.peer_addr(), Some(first_addr));
        assert_eq!(exchange(&mut server, &mut first, &[0x02, 0x01]), [0x02, 0x01]);
    }

    #[test]
    fn client_that_stops_reading_is_dropped() {
        let mut server = server();
        let client = connect(&mut server);
        SockRef::from(&client).set_recv_buffer_size(4096).unwrap();

        // 100 Info requests per frame, each answered with ten bytes.
        let mut batch = vec![0x7f, 100];
        for _ in 0..100 {
            batch.extend_from_slice(&[0x00, 0x01]);
        }
        let frame = encode_frame(PacketType::Request, &batch).unwrap();
        let mut writer = client.try_clone().unwrap();
        let flood = thread::spawn(move || {
            for _ in 0..1_000_000 {
                if writer.write_all(&frame).is_err() {
                    return;
                }
            }
        });

        let started = Instant::now();
        let err = loop {
            assert!(started.elapsed() < Duration::from_secs(30), "session never timed out");
            match server.process() {
                Ok(_) => thread::sleep(Duration::from_millis(1)),
                Err(err) => break err,
            }
        };
        assert!(matches!(&err, Error::Io(io) if io.kind() == ErrorKind::TimedOut));
        assert!(!err.is_fatal());
        assert_eq!(server.peer_addr(), None);
        drop(client);
        flood.join().unwrap();

        let mut client = connect(&mut server);
        assert_eq!(exchange(&mut server, &mut client, &[0x00, 0x01]), b"\x00\x08OpenOCD\x00");
    }

    #[test]
    fn listener_returns_to_idle_after_disconnect() {
        let mut server = server();
        let client = connect(&mut server);
        drop(client);
        for _ in 0..1000 {
            assert_eq!(server.process().unwrap(), 0);
            if server.peer_addr().is_none() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(server.peer_addr(), None);

        let mut client = connect(&mut server);
        assert_eq!(exchange(&mut server, &mut client, &[0x00, 0x01]), b"\x00\x08OpenOCD\x00");
    }
}

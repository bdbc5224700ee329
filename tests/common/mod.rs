//! Simulated EtherNet/IP adapter and a recording message bus.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use eip_bridge::encap::{
    encode_cpf, parse_cpf, CpfItem, EncapHeader, SockaddrInfo, COMMAND_REGISTER_SESSION,
    COMMAND_SEND_RR_DATA, COMMAND_UNREGISTER_SESSION, ENCAP_HEADER_SIZE, ITEM_NULL_ADDRESS,
    ITEM_O2T_SOCKADDR, ITEM_T2O_SOCKADDR, ITEM_UNCONNECTED_DATA,
};
use eip_bridge::{BridgeError, IoFrame, MessageBus, MessageHandler, Result};

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Returns a UDP port that was free a moment ago.
pub fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    socket.local_addr().unwrap().port()
}

fn u16_at(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}

fn u32_at(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

/// What the adapter saw in one Forward Open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRecord {
    pub service: u8,
    pub t2o_connection_id: u32,
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    pub o2t_connection_size: u32,
    pub t2o_connection_size: u32,
    pub advertised_port: Option<u16>,
    pub connection_path: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Active {
    t2o_connection_id: u32,
    destination: SocketAddr,
}

#[derive(Debug, Default)]
struct AdapterState {
    opens: Vec<OpenRecord>,
    closes: Vec<u16>,
    reject: Option<(u8, Option<u16>)>,
    reject_next: u32,
    open_times: Vec<Instant>,
    active: Option<Active>,
    silenced: HashSet<u32>,
    o2t_frames: Vec<IoFrame>,
    encap_sequence: u32,
}

/// In-process EtherNet/IP adapter on localhost.
///
/// Answers RegisterSession, Forward Open and Forward Close over TCP,
/// records O->T datagrams on its own UDP socket and sends T->O datagrams
/// to the port the scanner advertised.
pub struct FakeAdapter {
    tcp_addr: SocketAddr,
    udp: Arc<UdpSocket>,
    state: Arc<Mutex<AdapterState>>,
    shutdown: Arc<AtomicBool>,
    producing: Arc<AtomicBool>,
    t2o_size: usize,
    o2t_size: usize,
    threads: Vec<JoinHandle<()>>,
}

impl FakeAdapter {
    pub fn start(o2t_size: usize, t2o_size: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let tcp_addr = listener.local_addr().unwrap();
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        udp.set_read_timeout(Some(Duration::from_millis(20))).unwrap();

        let state = Arc::new(Mutex::new(AdapterState::default()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let producing = Arc::new(AtomicBool::new(false));
        let udp_port = udp.local_addr().unwrap().port();
        let handles = Arc::new(AtomicU32::new(0x0001_0000));

        let mut threads = Vec::new();

        {
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            threads.push(thread::spawn(move || loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        let state = Arc::clone(&state);
                        let handle = handles.fetch_add(1, Ordering::SeqCst);
                        thread::spawn(move || serve(stream, state, handle, udp_port));
                    }
                    Err(_) => thread::sleep(Duration::from_millis(2)),
                }
            }));
        }

        {
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            let udp = Arc::clone(&udp);
            threads.push(thread::spawn(move || {
                let mut buf = vec![0u8; 2048];
                while !shutdown.load(Ordering::SeqCst) {
                    if let Ok((len, _)) = udp.recv_from(&mut buf) {
                        if let Ok(frame) = IoFrame::parse(&buf[..len], o2t_size, true) {
                            state.lock().unwrap().o2t_frames.push(frame);
                        }
                    }
                }
            }));
        }

        Self {
            tcp_addr,
            udp,
            state,
            shutdown,
            producing,
            t2o_size,
            o2t_size,
            threads,
        }
    }

    /// Device address to configure the bridge with.
    pub fn address(&self) -> String {
        self.tcp_addr.to_string()
    }

    pub fn reject_opens(&self, general_status: u8, extended_status: Option<u16>) {
        self.state.lock().unwrap().reject = Some((general_status, extended_status));
    }

    /// Refuses the next `count` Forward Opens with "out of connections",
    /// then accepts again.
    pub fn reject_next_opens(&self, count: u32) {
        self.state.lock().unwrap().reject_next = count;
    }

    /// When each Forward Open arrived.
    pub fn open_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().open_times.clone()
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        self.state.lock().unwrap().opens.clone()
    }

    pub fn closes(&self) -> Vec<u16> {
        self.state.lock().unwrap().closes.clone()
    }

    pub fn o2t_frames(&self) -> Vec<IoFrame> {
        self.state.lock().unwrap().o2t_frames.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().active.is_some()
    }

    /// Stops producing for the current connection only; a reopened
    /// connection is served normally.
    pub fn silence_current_connection(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(active) = state.active {
            state.silenced.insert(active.t2o_connection_id);
        }
    }

    /// Sends one valid T->O datagram carrying `data`.
    pub fn send_t2o(&self, data: &[u8]) {
        assert_eq!(data.len(), self.t2o_size);
        let (active, sequence) = {
            let mut state = self.state.lock().unwrap();
            state.encap_sequence = state.encap_sequence.wrapping_add(1);
            (state.active.expect("no open connection"), state.encap_sequence)
        };
        let frame = IoFrame::new(
            active.t2o_connection_id,
            sequence,
            sequence as u16,
            None,
            data.to_vec(),
        );
        self.udp.send_to(&frame.to_bytes(), active.destination).unwrap();
    }

    /// Sends raw bytes to the scanner's receive port.
    pub fn send_raw(&self, datagram: &[u8]) {
        let active = self.state.lock().unwrap().active.expect("no open connection");
        self.udp.send_to(datagram, active.destination).unwrap();
    }

    /// Builds a T->O datagram without sending it.
    pub fn frame(&self, sequence: u32, connection_id: Option<u32>, data: &[u8]) -> Vec<u8> {
        let active = self.state.lock().unwrap().active.expect("no open connection");
        IoFrame::new(
            connection_id.unwrap_or(active.t2o_connection_id),
            sequence,
            sequence as u16,
            None,
            data.to_vec(),
        )
        .to_bytes()
    }

    /// Produces T->O data every `interval` until dropped.
    pub fn produce(&mut self, interval: Duration, pattern: u8) {
        self.producing.store(true, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        let udp = Arc::clone(&self.udp);
        let shutdown = Arc::clone(&self.shutdown);
        let producing = Arc::clone(&self.producing);
        let size = self.t2o_size;
        self.threads.push(thread::spawn(move || {
            while !shutdown.load(Ordering::SeqCst) && producing.load(Ordering::SeqCst) {
                let next = {
                    let mut state = state.lock().unwrap();
                    match state.active {
                        Some(active) if !state.silenced.contains(&active.t2o_connection_id) => {
                            state.encap_sequence = state.encap_sequence.wrapping_add(1);
                            Some((active, state.encap_sequence))
                        }
                        _ => None,
                    }
                };
                if let Some((active, sequence)) = next {
                    let frame = IoFrame::new(
                        active.t2o_connection_id,
                        sequence,
                        sequence as u16,
                        None,
                        vec![pattern; size],
                    );
                    let _ = udp.send_to(&frame.to_bytes(), active.destination);
                }
                thread::sleep(interval);
            }
        }));
    }

    pub fn o2t_size(&self) -> usize {
        self.o2t_size
    }
}

impl Drop for FakeAdapter {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn serve(mut stream: TcpStream, state: Arc<Mutex<AdapterState>>, handle: u32, udp_port: u16) {
    loop {
        let mut raw = [0u8; ENCAP_HEADER_SIZE];
        if stream.read_exact(&mut raw).is_err() {
            return;
        }
        let header = EncapHeader::from_bytes(&raw).unwrap();
        let mut body = vec![0u8; header.length as usize];
        if stream.read_exact(&mut body).is_err() {
            return;
        }

        let reply_body = match header.command {
            COMMAND_REGISTER_SESSION => body,
            COMMAND_UNREGISTER_SESSION => return,
            COMMAND_SEND_RR_DATA => {
                let items = parse_cpf(&body[6..]).unwrap();
                let request = items
                    .iter()
                    .find(|item| item.type_id == ITEM_UNCONNECTED_DATA)
                    .unwrap()
                    .data
                    .clone();
                let advertised = items
                    .iter()
                    .find(|item| item.type_id == ITEM_T2O_SOCKADDR)
                    .map(|item| SockaddrInfo::from_bytes(&item.data).unwrap().port);

                let mut reply_items = vec![CpfItem::new(ITEM_NULL_ADDRESS, Vec::new())];
                match request[0] {
                    0x54 | 0x5B => {
                        let (message, accepted) =
                            forward_open_reply(&request, advertised, &state);
                        reply_items.push(CpfItem::new(ITEM_UNCONNECTED_DATA, message));
                        if accepted {
                            reply_items.push(
                                SockaddrInfo::new(Ipv4Addr::UNSPECIFIED, udp_port)
                                    .to_item(ITEM_O2T_SOCKADDR),
                            );
                        }
                    }
                    0x4E => {
                        let serial = u16_at(&request, 8);
                        {
                            let mut state = state.lock().unwrap();
                            state.closes.push(serial);
                            state.active = None;
                        }
                        let mut message = vec![0xCE, 0x00, 0x00, 0x00];
                        message.extend_from_slice(&request[8..16]);
                        message.extend_from_slice(&[0x00, 0x00]);
                        reply_items.push(CpfItem::new(ITEM_UNCONNECTED_DATA, message));
                    }
                    other => {
                        reply_items.push(CpfItem::new(
                            ITEM_UNCONNECTED_DATA,
                            vec![other | 0x80, 0x00, 0x08, 0x00],
                        ));
                    }
                }

                let mut out = vec![0u8; 6];
                out.extend_from_slice(&encode_cpf(&reply_items));
                out
            }
            _ => return,
        };

        let mut reply = EncapHeader::new(header.command, handle, reply_body.len() as u16);
        reply.sender_context = header.sender_context;
        if stream.write_all(&reply.to_bytes()).is_err() || stream.write_all(&reply_body).is_err()
        {
            return;
        }
    }
}

fn forward_open_reply(
    request: &[u8],
    advertised: Option<u16>,
    state: &Mutex<AdapterState>,
) -> (Vec<u8>, bool) {
    let service = request[0];
    let large = service == 0x5B;
    let t2o_connection_id = u32_at(request, 12);
    let triad = request[16..24].to_vec();
    let o2t_rpi = u32_at(request, 28);
    let (o2t_connection_size, t2o_rpi, t2o_connection_size, rest) = if large {
        (
            u32_at(request, 32) & 0xFFFF,
            u32_at(request, 36),
            u32_at(request, 40) & 0xFFFF,
            44,
        )
    } else {
        (
            u32::from(u16_at(request, 32) & 0x01FF),
            u32_at(request, 34),
            u32::from(u16_at(request, 38) & 0x01FF),
            40,
        )
    };
    let path_words = request[rest + 1] as usize;
    let connection_path = request[rest + 2..rest + 2 + path_words * 2].to_vec();

    let mut state = state.lock().unwrap();
    state.opens.push(OpenRecord {
        service,
        t2o_connection_id,
        connection_serial: u16_at(&triad, 0),
        vendor_id: u16_at(&triad, 2),
        originator_serial: u32_at(&triad, 4),
        o2t_connection_size,
        t2o_connection_size,
        advertised_port: advertised,
        connection_path,
    });

    state.open_times.push(Instant::now());

    let rejection = if state.reject_next > 0 {
        state.reject_next -= 1;
        Some((0x01, Some(0x0113)))
    } else {
        state.reject
    };
    if let Some((general, extended)) = rejection {
        let mut message = vec![service | 0x80, 0x00, general];
        match extended {
            Some(code) => {
                message.push(1);
                message.extend_from_slice(&code.to_le_bytes());
            }
            None => message.push(0),
        }
        return (message, false);
    }

    let o2t_connection_id = 0xA000_0000 | state.opens.len() as u32;
    state.active = Some(Active {
        t2o_connection_id,
        destination: SocketAddr::from((Ipv4Addr::LOCALHOST, advertised.unwrap_or(2222))),
    });

    let mut message = vec![service | 0x80, 0x00, 0x00, 0x00];
    message.extend_from_slice(&o2t_connection_id.to_le_bytes());
    message.extend_from_slice(&t2o_connection_id.to_le_bytes());
    message.extend_from_slice(&triad);
    message.extend_from_slice(&o2t_rpi.to_le_bytes());
    message.extend_from_slice(&t2o_rpi.to_le_bytes());
    message.extend_from_slice(&[0x00, 0x00]);
    (message, true)
}

/// Bus that keeps every message and can refuse publishes on demand.
#[derive(Default)]
pub struct RecordingBus {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
    handlers: Mutex<Vec<(String, MessageHandler)>>,
    refuse: AtomicBool,
    connected: AtomicBool,
}

impl RecordingBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Delivers `payload` to every handler subscribed to `subject`.
    pub fn deliver(&self, subject: &str, payload: &[u8]) -> usize {
        let handlers = self.handlers.lock().unwrap();
        let mut delivered = 0;
        for (s, handler) in handlers.iter() {
            if s == subject {
                handler(payload);
                delivered += 1;
            }
        }
        delivered
    }
}

impl MessageBus for RecordingBus {
    fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(BridgeError::publish("refused"));
        }
        self.messages
            .lock()
            .unwrap()
            .push((subject.to_string(), payload.to_vec()));
        Ok(())
    }

    fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<()> {
        self.handlers
            .lock()
            .unwrap()
            .push((subject.to_string(), handler));
        Ok(())
    }

    fn disconnect(&self) {
        self.handlers.lock().unwrap().clear();
        self.connected.store(false, Ordering::SeqCst);
    }
}

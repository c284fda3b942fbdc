use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::accumulator::NotificationSink;
use crate::ble::{BleConnector, BleDeviceInfo, BleLink, GattProfile};
use crate::codec;
use crate::config::CHUNK_SIZE;
use crate::error::TransportError;
use crate::rules::{tags, END_OF_LIST};
use crate::transfer::xmodem::{self, control};
use crate::variant::{variant_for, FileProtocol, HardwareFamily, RN4020_HEAD, RN4020_TAIL};

/// Link that answers the n-th write with the n-th scripted reply.
pub struct ScriptedLink {
    sink: NotificationSink,
    replies: VecDeque<Vec<u8>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedLink {
    pub fn new(sink: NotificationSink, replies: Vec<Vec<u8>>) -> Self {
        Self {
            sink,
            replies: replies.into(),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl BleLink for ScriptedLink {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.writes.lock().push(data.to_vec());
        if let Some(reply) = self.replies.pop_front() {
            if !reply.is_empty() {
                self.sink.push(&reply);
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Deterministic file content for tests and demos.
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Sender half of an XMODEM session, as the logger firmware runs it.
#[derive(Debug, Clone)]
struct XModemSender {
    data: Vec<u8>,
    block: u8,
    offset: usize,
    eot_sent: bool,
}

impl XModemSender {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            block: 1,
            offset: 0,
            eot_sent: false,
        }
    }

    fn payload_len(&self) -> usize {
        if self.data.len() - self.offset >= xmodem::STX_PAYLOAD {
            xmodem::STX_PAYLOAD
        } else {
            xmodem::SOH_PAYLOAD
        }
    }

    fn current(&self) -> Vec<u8> {
        if self.offset >= self.data.len() {
            return vec![control::EOT];
        }
        let len = self.payload_len();
        let end = (self.offset + len).min(self.data.len());
        let mut payload = self.data[self.offset..end].to_vec();
        payload.resize(len, xmodem::PADDING);
        xmodem::build_frame(self.block, &payload)
    }

    fn advance(&mut self) {
        self.offset += self.payload_len();
        self.block = self.block.wrapping_add(1);
    }
}

#[derive(Debug)]
struct MockLoggerState {
    device: BleDeviceInfo,
    family: HardwareFamily,
    files: BTreeMap<String, Vec<u8>>,
    status_code: String,
    firmware: String,
    battery_mv: u16,
    clock: String,
    silent_tags: HashSet<String>,
    canned: HashMap<String, Vec<u8>>,
    fragment_size: usize,
    corrupt_frames: usize,
    max_chunks: Option<usize>,
    chunks_served: usize,
    fail_writes: bool,
    connected: bool,
    sink: Option<NotificationSink>,
    line: Vec<u8>,
    commands: Vec<String>,
    control_bytes: Vec<u8>,
    staged: Option<String>,
    xmodem: Option<XModemSender>,
}

impl MockLoggerState {
    fn push(&self, bytes: &[u8]) {
        if let Some(sink) = &self.sink {
            for fragment in bytes.chunks(self.fragment_size.max(1)) {
                sink.push(fragment);
            }
        }
    }

    fn answer(&self, bytes: &[u8]) {
        if self.family == HardwareFamily::Rn4020 {
            let mut wrapped = RN4020_HEAD.to_vec();
            wrapped.extend_from_slice(bytes);
            wrapped.extend_from_slice(RN4020_TAIL);
            self.push(&wrapped);
        } else {
            self.push(bytes);
        }
    }

    fn answer_value(&self, tag: &str, value: &str) {
        self.answer(format!("{tag} {:02x}{value}", value.len()).as_bytes());
    }

    fn ok(&self, tag: &str) {
        self.answer_value(tag, "");
    }

    fn reject(&self) {
        self.answer(b"ERR");
    }

    fn on_write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.fail_writes {
            return Err(TransportError::Disconnected);
        }
        if let [byte] = data {
            let stray = matches!(*byte, control::ACK | control::NAK | control::CAN);
            if self.xmodem.is_some() || stray {
                self.on_control(*byte);
                return Ok(());
            }
        }
        self.line.extend_from_slice(data);
        while let Some(end) = self.line.iter().position(|b| *b == b'\r') {
            let frame: Vec<u8> = self.line.drain(..=end).collect();
            self.on_command(&frame[..end]);
        }
        Ok(())
    }

    fn on_control(&mut self, byte: u8) {
        self.control_bytes.push(byte);
        let corrupt = self.corrupt_frames > 0;
        let Some(sender) = self.xmodem.as_mut() else {
            return;
        };
        let reply = match byte {
            control::ACK if sender.eot_sent => {
                self.xmodem = None;
                self.staged = None;
                return;
            }
            control::ACK => {
                sender.advance();
                sender.eot_sent = sender.offset >= sender.data.len();
                sender.current()
            }
            control::CRC_REQUEST | control::NAK => {
                sender.eot_sent = sender.offset >= sender.data.len();
                sender.current()
            }
            control::CAN => {
                self.xmodem = None;
                return;
            }
            _ => return,
        };
        let mut reply = reply;
        if corrupt && reply.len() > 1 {
            self.corrupt_frames -= 1;
            if let Some(last) = reply.last_mut() {
                *last ^= 0xff;
            }
        }
        self.push(&reply);
    }

    fn on_command(&mut self, frame: &[u8]) {
        let text = String::from_utf8_lossy(frame).into_owned();
        self.commands.push(text.clone());

        let Some(tag) = codec::decode_tag(frame).map(str::to_string) else {
            self.answer(b"INV");
            return;
        };
        let argument = text.get(6..).unwrap_or("").to_string();

        if self.silent_tags.contains(&tag) {
            return;
        }
        if let Some(bytes) = self.canned.get(&tag) {
            self.answer(bytes);
            return;
        }

        let protocol = variant_for(self.family).file_protocol();
        match tag.as_str() {
            tags::STATUS => self.answer_value(&tag, &self.status_code),
            tags::FIRMWARE_VERSION => self.answer_value(&tag, &self.firmware),
            tags::BATTERY => {
                let [hi, lo] = self.battery_mv.to_be_bytes();
                self.answer_value(&tag, &format!("{lo:02X}{hi:02X}"));
            }
            tags::GET_TIME => self.answer_value(&tag, &self.clock),
            tags::SET_TIME => {
                self.clock = argument;
                self.ok(&tag);
            }
            tags::DIR => self.list_files(),
            tags::FILE_SIZE => match self.files.get(&argument) {
                Some(data) => self.answer_value(&tag, &data.len().to_string()),
                None => self.reject(),
            },
            tags::FILE_CRC => match self.files.get(&argument) {
                Some(data) => self.answer_value(&tag, &format!("{:08x}", codec::crc32(data))),
                None => self.reject(),
            },
            tags::DELETE => match self.files.remove(&argument) {
                Some(_) => self.ok(&tag),
                None => self.reject(),
            },
            tags::FORMAT => {
                self.files.clear();
                self.ok(&tag);
            }
            tags::DOWNLOAD_STAGE if protocol == FileProtocol::Chunked => {
                if self.files.contains_key(&argument) {
                    self.staged = Some(argument);
                    self.chunks_served = 0;
                    self.ok(&tag);
                } else {
                    self.reject();
                }
            }
            tags::DOWNLOAD_CHUNK if protocol == FileProtocol::Chunked => {
                self.serve_chunk(&argument);
            }
            tags::XMODEM_GET if protocol == FileProtocol::XModem => {
                match self.files.get(&argument) {
                    Some(data) => {
                        self.xmodem = Some(XModemSender::new(data.clone()));
                        self.staged = Some(argument);
                        self.ok(&tag);
                    }
                    None => self.reject(),
                }
            }
            tags::READ_LOGGER_INFO | tags::READ_HOST_STORAGE => {
                self.answer_value(&tag, "SN1234567")
            }
            tags::UP_TIME => self.answer_value(&tag, "0000a8c0"),
            tags::RUN
            | tags::RUN_WITH_STRING
            | tags::STOP
            | tags::STOP_WITH_STRING
            | tags::LED
            | tags::WRITE_LOGGER_INFO
            | tags::WRITE_HOST_STORAGE
            | tags::RESET
            | tags::MAKE_TEST_FILE
            | tags::CONFIG => self.ok(&tag),
            _ => self.answer(b"INV"),
        }
    }

    fn list_files(&self) {
        let mut listing = Vec::new();
        for (name, data) in &self.files {
            listing.extend_from_slice(format!("{name}\t\t\t{}\n\r", data.len()).as_bytes());
        }
        listing.push(END_OF_LIST);
        if self.family == HardwareFamily::Rn4020 {
            self.answer(&listing);
        } else {
            listing.extend_from_slice(b"\n\r");
            self.push(&listing);
        }
    }

    fn serve_chunk(&mut self, argument: &str) {
        let Some(data) = self.staged.as_ref().and_then(|name| self.files.get(name)) else {
            return;
        };
        let Ok(index) = argument.parse::<usize>() else {
            return;
        };
        if self.max_chunks.is_some_and(|max| self.chunks_served >= max) {
            return;
        }
        let start = (index * CHUNK_SIZE).min(data.len());
        let end = ((index + 1) * CHUNK_SIZE).min(data.len());
        let chunk = data[start..end].to_vec();
        self.chunks_served += 1;
        self.push(&chunk);
    }
}

/// In-memory logger behind a [`BleConnector`].
///
/// Speaks the command set of the chosen family, serves its files over the
/// family's transfer protocol and records everything written to it.
#[derive(Clone, Debug)]
pub struct MockLogger {
    state: Arc<Mutex<MockLoggerState>>,
}

impl MockLogger {
    pub fn new(family: HardwareFamily, address: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockLoggerState {
                device: BleDeviceInfo {
                    address: address.to_string(),
                    name: format!("mock-{family}"),
                },
                family,
                files: BTreeMap::new(),
                status_code: "00".to_string(),
                firmware: "3.1.07".to_string(),
                battery_mv: 3304,
                clock: "2024/03/05 10:20:30".to_string(),
                silent_tags: HashSet::new(),
                canned: HashMap::new(),
                fragment_size: 20,
                corrupt_frames: 0,
                max_chunks: None,
                chunks_served: 0,
                fail_writes: false,
                connected: false,
                sink: None,
                line: Vec::new(),
                commands: Vec::new(),
                control_bytes: Vec::new(),
                staged: None,
                xmodem: None,
            })),
        }
    }

    pub fn with_sample_data(family: HardwareFamily, address: &str) -> Self {
        let logger = Self::new(family, address);
        logger.add_file("2024-03-05_data.lid", sample_bytes(5000));
        logger.add_file("notes.lix", sample_bytes(300));
        logger
    }

    pub fn device(&self) -> BleDeviceInfo {
        self.state.lock().device.clone()
    }

    pub fn add_file(&self, name: &str, data: Vec<u8>) {
        self.state.lock().files.insert(name.to_string(), data);
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.state.lock().files.contains_key(name)
    }

    pub fn clock(&self) -> String {
        self.state.lock().clock.clone()
    }

    pub fn set_status_code(&self, code: &str) {
        self.state.lock().status_code = code.to_string();
    }

    /// Never answer `tag`.
    pub fn silence(&self, tag: &str) {
        self.state.lock().silent_tags.insert(tag.to_string());
    }

    /// Answer `tag` with `bytes` (family framing is still applied).
    pub fn set_answer(&self, tag: &str, bytes: &[u8]) {
        self.state.lock().canned.insert(tag.to_string(), bytes.to_vec());
    }

    pub fn set_fragment_size(&self, size: usize) {
        self.state.lock().fragment_size = size;
    }

    /// Flip a CRC byte in the next `count` XMODEM frames sent.
    pub fn corrupt_next_frames(&self, count: usize) {
        self.state.lock().corrupt_frames = count;
    }

    /// Stop answering `DWL` after `count` chunks.
    pub fn limit_chunks(&self, count: usize) {
        self.state.lock().max_chunks = Some(count);
    }

    pub fn fail_writes(&self) {
        self.state.lock().fail_writes = true;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Complete command lines received, without the trailing `\r`.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn commands_with_tag(&self, tag: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.starts_with(tag))
            .count()
    }

    /// XMODEM control bytes received from the host.
    pub fn control_bytes(&self) -> Vec<u8> {
        self.state.lock().control_bytes.clone()
    }
}

#[async_trait]
impl BleConnector for MockLogger {
    async fn connect(
        &mut self,
        device: &BleDeviceInfo,
        _profile: &GattProfile,
        sink: NotificationSink,
    ) -> Result<Box<dyn BleLink>, TransportError> {
        let mut state = self.state.lock();
        if !state.device.address.eq_ignore_ascii_case(&device.address) {
            return Err(TransportError::DeviceNotFound(device.address.clone()));
        }
        state.sink = Some(sink);
        state.connected = true;
        Ok(Box::new(MockLink {
            state: self.state.clone(),
        }))
    }
}

struct MockLink {
    state: Arc<Mutex<MockLoggerState>>,
}

#[async_trait]
impl BleLink for MockLink {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.state.lock().on_write(data)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.connected = false;
        state.sink = None;
        Ok(())
    }
}

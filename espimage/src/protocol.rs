//! Serial bootloader protocol client
//!
//! Strictly sequential request/response exchange with the ROM bootloader over
//! a SLIP-framed serial link: a reset-and-sync handshake, then flash-begin /
//! flash-data / flash-end commands writing flash in fixed 1 KiB blocks. Only
//! the sync handshake retries; every later command is single-shot and any
//! failure ends the session.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use crate::slip;

/// Flash write granularity used by the bootloader.
pub const FLASH_BLOCK_SIZE: usize = 0x400;

/// Control-line dance that puts the device into its serial bootloader.
pub const DEFAULT_RESET_SEQUENCE: &str = "!DTR;RTS;SLEEP;DTR;!RTS;SLEEP;!DTR;SLEEP";

const SYNC_READ_TIMEOUT: Duration = Duration::from_millis(100);
const COMMAND_READ_TIMEOUT: Duration = Duration::from_secs(5);

const SYNC_OUTER_ATTEMPTS: usize = 5;
const SYNC_INNER_ATTEMPTS: usize = 5;
/// The bootloader answers every sync attempt it saw internally; drain the
/// stragglers so later replies line up with their commands.
const SYNC_EXTRA_REPLIES: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    NoCommand = 0x00,
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid reset sequence command: {0}")]
    ResetSequence(String),

    #[error("flash operation cancelled")]
    Cancelled,
}

/// Serial control lines used to reset the device into its bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine {
    Dtr,
    Rts,
}

/// One step of the configurable reset sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStep {
    Assert(ControlLine),
    Deassert(ControlLine),
    /// Sleep for the client's default reset delay.
    Sleep,
    /// Sleep for an explicit number of milliseconds.
    SleepMs(u64),
}

/// Parse the `!DTR;RTS;SLEEP;...` reset mini-language.
pub fn parse_reset_sequence(sequence: &str) -> Result<Vec<ResetStep>, ProtocolError> {
    let mut steps = Vec::new();
    for command in sequence.split(';') {
        let step = match command {
            "" => continue,
            "DTR" => ResetStep::Assert(ControlLine::Dtr),
            "!DTR" => ResetStep::Deassert(ControlLine::Dtr),
            "RTS" => ResetStep::Assert(ControlLine::Rts),
            "!RTS" => ResetStep::Deassert(ControlLine::Rts),
            "SLEEP" => ResetStep::Sleep,
            other => match other.strip_prefix("SLEEP:") {
                Some(millis) => ResetStep::SleepMs(
                    millis
                        .parse()
                        .map_err(|_| ProtocolError::ResetSequence(other.to_string()))?,
                ),
                None => return Err(ProtocolError::ResetSequence(other.to_string())),
            },
        };
        steps.push(step);
    }
    Ok(steps)
}

/// Abstract duplex byte channel the protocol client runs on.
///
/// `read_exact` is bounded by the most recent `set_read_timeout` value and
/// surfaces expiry as [`ProtocolError::Timeout`].
#[allow(async_fn_in_trait)]
pub trait BootChannel {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError>;
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError>;
    /// Discard anything buffered in the receive direction.
    async fn flush_input(&mut self) -> Result<(), ProtocolError>;
    fn set_read_timeout(&mut self, timeout: Duration);
    fn set_control_line(&mut self, line: ControlLine, asserted: bool)
    -> Result<(), ProtocolError>;
}

/// [`BootChannel`] over a real serial port.
pub struct SerialChannel {
    port: SerialStream,
    read_timeout: Duration,
}

impl SerialChannel {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, ProtocolError> {
        log::debug!("Opening {port_name} at {baud_rate} baud");
        let port = tokio_serial::new(port_name, baud_rate).open_native_async()?;
        Ok(Self {
            port,
            read_timeout: COMMAND_READ_TIMEOUT,
        })
    }
}

impl BootChannel for SerialChannel {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.port.write_all(data).await?;
        self.port.flush().await?;
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        match tokio::time::timeout(self.read_timeout, self.port.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProtocolError::Timeout(format!(
                "no reply within {:?}",
                self.read_timeout
            ))),
        }
    }

    async fn flush_input(&mut self) -> Result<(), ProtocolError> {
        self.port.clear(tokio_serial::ClearBuffer::Input)?;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    fn set_control_line(
        &mut self,
        line: ControlLine,
        asserted: bool,
    ) -> Result<(), ProtocolError> {
        match line {
            ControlLine::Dtr => self.port.write_data_terminal_ready(asserted)?,
            ControlLine::Rts => self.port.write_request_to_send(asserted)?,
        }
        Ok(())
    }
}

/// Progress callback invoked after each flash block is written, with the
/// block's address and byte count. Returning an error cancels the operation
/// between blocks.
pub type ProgressCallback = Box<dyn FnMut(u32, usize) -> Result<(), ProtocolError> + Send>;

/// Protocol session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unsynced,
    Ready,
    FlashActive,
    Done,
    Failed,
}

/// Client for the ROM bootloader's serial command set.
///
/// Owns its channel exclusively for one flashing session: sync first, then
/// flash commands, then [`BootloaderClient::run_program`]. After a command
/// failure the session is dead and must be restarted from a fresh sync.
pub struct BootloaderClient<C: BootChannel> {
    channel: C,
    reset_delay: Duration,
    reset_sequence: Vec<ResetStep>,
    state: SessionState,
}

impl<C: BootChannel> BootloaderClient<C> {
    /// `reset_sequence` falls back to [`DEFAULT_RESET_SEQUENCE`] when `None`.
    pub fn new(
        channel: C,
        reset_delay: Duration,
        reset_sequence: Option<&str>,
    ) -> Result<Self, ProtocolError> {
        let reset_sequence =
            parse_reset_sequence(reset_sequence.unwrap_or(DEFAULT_RESET_SEQUENCE))?;
        Ok(Self {
            channel,
            reset_delay,
            reset_sequence,
            state: SessionState::Unsynced,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Reset the device into its bootloader and run the sync handshake.
    ///
    /// The only operation that retries: up to 5 outer cycles of 5 attempts
    /// each, with the reset sequence replayed at the start of every outer
    /// cycle. On success the read timeout is widened for the slow flash
    /// erase/write cycles that follow.
    pub async fn sync(&mut self) -> Result<(), ProtocolError> {
        self.channel.set_read_timeout(SYNC_READ_TIMEOUT);

        let mut payload = vec![0x07, 0x07, 0x12, 0x20];
        payload.resize(payload.len() + 32, 0x55);

        let mut last_error = None;
        for outer in 0..SYNC_OUTER_ATTEMPTS {
            for inner in 0..SYNC_INNER_ATTEMPTS {
                if inner == 0 {
                    self.run_reset_sequence().await?;
                }
                match self.try_sync(&payload).await {
                    Ok(()) => {
                        self.channel.set_read_timeout(COMMAND_READ_TIMEOUT);
                        self.state = SessionState::Ready;
                        log::info!("Bootloader sync established");
                        return Ok(());
                    }
                    Err(e) => {
                        log::debug!("Sync attempt {}.{} failed: {e}", outer + 1, inner + 1);
                        last_error = Some(e);
                    }
                }
            }
        }
        self.state = SessionState::Failed;
        Err(last_error.unwrap_or_else(|| ProtocolError::Timeout("sync handshake".into())))
    }

    async fn try_sync(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.channel.flush_input().await?;
        self.run_command(Command::Sync, payload, 0).await?;
        for _ in 0..SYNC_EXTRA_REPLIES {
            self.run_command(Command::NoCommand, &[], 0).await?;
        }
        Ok(())
    }

    async fn run_reset_sequence(&mut self) -> Result<(), ProtocolError> {
        for &step in &self.reset_sequence {
            match step {
                ResetStep::Assert(line) => self.channel.set_control_line(line, true)?,
                ResetStep::Deassert(line) => self.channel.set_control_line(line, false)?,
                ResetStep::Sleep => tokio::time::sleep(self.reset_delay).await,
                ResetStep::SleepMs(millis) => {
                    tokio::time::sleep(Duration::from_millis(millis)).await
                }
            }
        }
        Ok(())
    }

    /// Erase and prepare `size` bytes of flash at `offset`.
    pub async fn start_flash(&mut self, offset: u32, size: u32) -> Result<(), ProtocolError> {
        self.require_synced("flash-begin")?;
        let blocks = size.div_ceil(FLASH_BLOCK_SIZE as u32);
        let payload = pack_u32s(&[size, blocks, FLASH_BLOCK_SIZE as u32, offset]);
        let result = self.run_command(Command::FlashBegin, &payload, 0).await;
        let (_, reply) = self.fail(result)?;
        self.fail(check_status(&reply, "flash-begin"))?;
        self.state = SessionState::FlashActive;
        Ok(())
    }

    /// Write one flash block. `data` is the whole region; the block covers
    /// `data[offset..offset + length]`, right-padded with 0xFF when the
    /// region ends short of a full block.
    pub async fn write_flash_block(
        &mut self,
        data: &[u8],
        offset: usize,
        length: usize,
        sequence: u32,
    ) -> Result<(), ProtocolError> {
        if self.state != SessionState::FlashActive {
            return Err(ProtocolError::Protocol(
                "flash-data issued without flash-begin".into(),
            ));
        }

        let mut payload = pack_u32s(&[length as u32, sequence, 0, 0]);
        let header_len = payload.len();
        if offset < data.len() {
            let end = data.len().min(offset + length);
            payload.extend_from_slice(&data[offset..end]);
        }
        payload.resize(header_len + length, 0xFF);

        let checksum = xor_checksum(&payload[header_len..]) as u32;
        let result = self.run_command(Command::FlashData, &payload, checksum).await;
        let (_, reply) = self.fail(result)?;
        self.fail(check_status(&reply, "flash-data"))?;
        Ok(())
    }

    /// Program a whole region, block by block in sequence order.
    pub async fn program_flash(&mut self, address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        self.program_flash_with_progress(address, data, None).await
    }

    /// Program a region, reporting each written block to `progress`. The
    /// callback runs synchronously between blocks, so it may cancel the
    /// operation by returning an error.
    pub async fn program_flash_with_progress(
        &mut self,
        address: u32,
        data: &[u8],
        mut progress: Option<ProgressCallback>,
    ) -> Result<(), ProtocolError> {
        let blocks = data.len().div_ceil(FLASH_BLOCK_SIZE);
        log::info!(
            "Programming {} bytes at 0x{address:08x} in {blocks} blocks",
            data.len()
        );
        self.start_flash(address, (blocks * FLASH_BLOCK_SIZE) as u32).await?;

        for sequence in 0..blocks {
            let offset = sequence * FLASH_BLOCK_SIZE;
            self.write_flash_block(data, offset, FLASH_BLOCK_SIZE, sequence as u32)
                .await?;
            let written = (data.len() - offset).min(FLASH_BLOCK_SIZE);
            if let Some(callback) = progress.as_mut() {
                let outcome = callback(address + offset as u32, written);
                self.fail(outcome)?;
            }
        }
        Ok(())
    }

    /// End the flash session, either rebooting into the new program or
    /// staying in the bootloader.
    pub async fn run_program(
        &mut self,
        uses_alternate_mode: bool,
        reboot: bool,
    ) -> Result<(), ProtocolError> {
        self.require_synced("flash-end")?;
        // The alternate DIO finish path (staging a trampoline over mem-begin/
        // mem-end) does not work reliably on real devices; always flash-end.
        let _ = uses_alternate_mode;
        let payload = pack_u32s(&[if reboot { 0 } else { 1 }]);
        let result = self.run_command(Command::FlashEnd, &payload, 0).await;
        let (_, reply) = self.fail(result)?;
        self.fail(check_status(&reply, "flash-end"))?;
        self.state = SessionState::Done;
        Ok(())
    }

    /// Stage `data` into device RAM at `address`.
    pub async fn write_ram(&mut self, address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        self.require_synced("mem-begin")?;
        let blocks = data.len().div_ceil(FLASH_BLOCK_SIZE);
        let payload = pack_u32s(&[
            data.len() as u32,
            blocks as u32,
            FLASH_BLOCK_SIZE as u32,
            address,
        ]);
        let result = self.run_command(Command::MemBegin, &payload, 0).await;
        let (_, reply) = self.fail(result)?;
        self.fail(check_status(&reply, "mem-begin"))?;

        for (sequence, chunk) in data.chunks(FLASH_BLOCK_SIZE).enumerate() {
            let mut payload = pack_u32s(&[chunk.len() as u32, sequence as u32, 0, 0]);
            payload.extend_from_slice(chunk);
            let checksum = xor_checksum(chunk) as u32;
            let result = self.run_command(Command::MemData, &payload, checksum).await;
            let (_, reply) = self.fail(result)?;
            self.fail(check_status(&reply, "mem-data"))?;
        }
        Ok(())
    }

    /// Leave RAM-load mode; a non-zero entry point starts execution there.
    pub async fn run_ram(&mut self, entry_point: u32) -> Result<(), ProtocolError> {
        self.require_synced("mem-end")?;
        let payload = pack_u32s(&[if entry_point == 0 { 1 } else { 0 }, entry_point]);
        let result = self.run_command(Command::MemEnd, &payload, 0).await;
        let (_, reply) = self.fail(result)?;
        self.fail(check_status(&reply, "mem-end"))?;
        Ok(())
    }

    /// Read a peripheral register.
    pub async fn read_reg(&mut self, address: u32) -> Result<u32, ProtocolError> {
        self.require_synced("read-reg")?;
        let payload = pack_u32s(&[address]);
        let result = self.run_command(Command::ReadReg, &payload, 0).await;
        let (value, reply) = self.fail(result)?;
        self.fail(check_status(&reply, "read-reg"))?;
        Ok(value)
    }

    /// Masked write to a peripheral register with a post-write delay.
    pub async fn write_reg(
        &mut self,
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    ) -> Result<(), ProtocolError> {
        self.require_synced("write-reg")?;
        let payload = pack_u32s(&[address, value, mask, delay_us]);
        let result = self.run_command(Command::WriteReg, &payload, 0).await;
        let (_, reply) = self.fail(result)?;
        self.fail(check_status(&reply, "write-reg"))?;
        Ok(())
    }

    /// Send one command frame and read its reply. For
    /// [`Command::NoCommand`] nothing is sent; a pending reply is just
    /// drained and its echoed opcode not checked.
    async fn run_command(
        &mut self,
        op: Command,
        data: &[u8],
        checksum: u32,
    ) -> Result<(u32, Vec<u8>), ProtocolError> {
        if op != Command::NoCommand {
            let mut frame = Vec::with_capacity(8 + data.len());
            frame.push(0x00);
            frame.push(op as u8);
            frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
            frame.extend_from_slice(&checksum.to_le_bytes());
            frame.extend_from_slice(data);
            log::trace!("-> {op:?}, {} byte payload", data.len());
            self.channel.write_all(&slip::encode(&frame)).await?;
        }

        let mut marker = [0u8; 1];
        self.channel.read_exact(&mut marker).await?;
        if marker[0] != slip::END {
            return Err(ProtocolError::Framing(format!(
                "unexpected frame start byte 0x{:02x}",
                marker[0]
            )));
        }

        let mut reply_header = [0u8; 8];
        self.read_unescaped(&mut reply_header).await?;
        if reply_header[0] != 0x01 {
            return Err(ProtocolError::Protocol(format!(
                "bad reply direction byte 0x{:02x}",
                reply_header[0]
            )));
        }
        if op != Command::NoCommand && reply_header[1] != op as u8 {
            return Err(ProtocolError::Protocol(format!(
                "reply opcode 0x{:02x} does not match request 0x{:02x}",
                reply_header[1], op as u8
            )));
        }
        let length = u16::from_le_bytes([reply_header[2], reply_header[3]]) as usize;
        let scalar = u32::from_le_bytes([
            reply_header[4],
            reply_header[5],
            reply_header[6],
            reply_header[7],
        ]);

        let mut body = vec![0u8; length];
        self.read_unescaped(&mut body).await?;

        self.channel.read_exact(&mut marker).await?;
        if marker[0] != slip::END {
            return Err(ProtocolError::Framing(
                "missing end-of-frame delimiter".into(),
            ));
        }

        log::trace!(
            "<- opcode 0x{:02x}, scalar 0x{scalar:08x}, {length} byte body",
            reply_header[1]
        );
        Ok((scalar, body))
    }

    /// Read exactly `buf.len()` decoded bytes, undoing SLIP escapes on the
    /// fly.
    async fn read_unescaped(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        let mut byte = [0u8; 1];
        for slot in buf.iter_mut() {
            self.channel.read_exact(&mut byte).await?;
            *slot = if byte[0] == slip::ESC {
                self.channel.read_exact(&mut byte).await?;
                match byte[0] {
                    slip::ESC_END => slip::END,
                    slip::ESC_ESC => slip::ESC,
                    other => {
                        return Err(ProtocolError::Framing(format!(
                            "invalid byte 0x{other:02x} following SLIP escape"
                        )));
                    }
                }
            } else {
                byte[0]
            };
        }
        Ok(())
    }

    fn require_synced(&self, what: &str) -> Result<(), ProtocolError> {
        match self.state {
            SessionState::Ready | SessionState::FlashActive => Ok(()),
            state => Err(ProtocolError::Protocol(format!(
                "{what} is not valid in the {state:?} state"
            ))),
        }
    }

    /// Any failed command kills the session.
    fn fail<T>(&mut self, result: Result<T, ProtocolError>) -> Result<T, ProtocolError> {
        if result.is_err() {
            self.state = SessionState::Failed;
        }
        result
    }
}

fn pack_u32s(values: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

fn xor_checksum(data: &[u8]) -> u8 {
    let mut checksum = 0xEF;
    for &byte in data {
        checksum ^= byte;
    }
    checksum
}

fn check_status(reply: &[u8], what: &str) -> Result<(), ProtocolError> {
    if reply.len() != 2 || reply[0] != 0 || reply[1] != 0 {
        return Err(ProtocolError::Protocol(format!(
            "{what} failed, status bytes {reply:02x?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MockChannel {
        rx: VecDeque<u8>,
        writes: Vec<Vec<u8>>,
        control_ops: Vec<(ControlLine, bool)>,
    }

    impl MockChannel {
        fn queue_reply(&mut self, opcode: u8, scalar: u32, body: &[u8]) {
            let mut frame = vec![0x01, opcode];
            frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
            frame.extend_from_slice(&scalar.to_le_bytes());
            frame.extend_from_slice(body);
            self.rx.extend(slip::encode(&frame));
        }
    }

    impl BootChannel for MockChannel {
        async fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
            self.writes.push(data.to_vec());
            Ok(())
        }

        async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
            for slot in buf.iter_mut() {
                *slot = self
                    .rx
                    .pop_front()
                    .ok_or_else(|| ProtocolError::Timeout("mock channel drained".into()))?;
            }
            Ok(())
        }

        async fn flush_input(&mut self) -> Result<(), ProtocolError> {
            Ok(())
        }

        fn set_read_timeout(&mut self, _timeout: Duration) {}

        fn set_control_line(
            &mut self,
            line: ControlLine,
            asserted: bool,
        ) -> Result<(), ProtocolError> {
            self.control_ops.push((line, asserted));
            Ok(())
        }
    }

    fn client(channel: MockChannel) -> BootloaderClient<MockChannel> {
        BootloaderClient::new(channel, Duration::ZERO, None).unwrap()
    }

    fn synced_client(mut channel: MockChannel) -> MockChannel {
        // Queue the replies a successful first-attempt sync consumes.
        for _ in 0..(1 + SYNC_EXTRA_REPLIES) {
            channel.queue_reply(Command::Sync as u8, 0, &[0, 0]);
        }
        channel
    }

    #[test]
    fn parses_default_reset_sequence() {
        let steps = parse_reset_sequence(DEFAULT_RESET_SEQUENCE).unwrap();
        assert_eq!(
            steps,
            vec![
                ResetStep::Deassert(ControlLine::Dtr),
                ResetStep::Assert(ControlLine::Rts),
                ResetStep::Sleep,
                ResetStep::Assert(ControlLine::Dtr),
                ResetStep::Deassert(ControlLine::Rts),
                ResetStep::Sleep,
                ResetStep::Deassert(ControlLine::Dtr),
                ResetStep::Sleep,
            ]
        );
    }

    #[test]
    fn parses_explicit_sleep_and_rejects_junk() {
        assert_eq!(
            parse_reset_sequence("RTS;SLEEP:250;!RTS").unwrap(),
            vec![
                ResetStep::Assert(ControlLine::Rts),
                ResetStep::SleepMs(250),
                ResetStep::Deassert(ControlLine::Rts),
            ]
        );
        assert!(matches!(
            parse_reset_sequence("DTR;HALT"),
            Err(ProtocolError::ResetSequence(_))
        ));
    }

    #[tokio::test]
    async fn sync_succeeds_on_first_attempt() {
        let channel = synced_client(MockChannel::default());
        let mut client = client(channel);

        client.sync().await.unwrap();
        assert_eq!(client.state(), SessionState::Ready);

        // One reset replay: five control-line flips in the default sequence.
        assert_eq!(client.channel.control_ops.len(), 5);

        // The single write is the SLIP-framed sync command.
        assert_eq!(client.channel.writes.len(), 1);
        let frame = slip::decode(&client.channel.writes[0]).unwrap();
        assert_eq!(frame[0], 0x00);
        assert_eq!(frame[1], Command::Sync as u8);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 36);
        assert_eq!(&frame[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(frame[12..44].iter().all(|&b| b == 0x55));
    }

    #[tokio::test]
    async fn sync_exhausts_every_attempt_with_dead_channel() {
        let mut client = client(MockChannel::default());

        let result = client.sync().await;
        assert!(matches!(result, Err(ProtocolError::Timeout(_))));
        assert_eq!(client.state(), SessionState::Failed);

        // One sync frame per inner attempt, 5 outer x 5 inner.
        assert_eq!(
            client.channel.writes.len(),
            SYNC_OUTER_ATTEMPTS * SYNC_INNER_ATTEMPTS
        );
        // The reset sequence replays once per outer cycle.
        assert_eq!(client.channel.control_ops.len(), 5 * SYNC_OUTER_ATTEMPTS);
    }

    #[tokio::test]
    async fn program_flash_frames_and_padding() {
        let mut channel = synced_client(MockChannel::default());
        channel.queue_reply(Command::FlashBegin as u8, 0, &[0, 0]);
        channel.queue_reply(Command::FlashData as u8, 0, &[0, 0]);
        let mut client = client(channel);

        client.sync().await.unwrap();
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A];
        client.program_flash(0x2000, &data).await.unwrap();
        assert_eq!(client.state(), SessionState::FlashActive);

        // Frame 1: flash-begin with (size, blocks, block size, offset).
        let begin = slip::decode(&client.channel.writes[1]).unwrap();
        assert_eq!(begin[1], Command::FlashBegin as u8);
        assert_eq!(
            begin[8..24],
            pack_u32s(&[0x400, 1, FLASH_BLOCK_SIZE as u32, 0x2000])[..]
        );

        // Frame 2: flash-data, one block padded with 0xFF to the block size.
        let block = slip::decode(&client.channel.writes[2]).unwrap();
        assert_eq!(block[1], Command::FlashData as u8);
        let payload = &block[8..];
        assert_eq!(payload.len(), 16 + FLASH_BLOCK_SIZE);
        assert_eq!(
            payload[..16],
            pack_u32s(&[FLASH_BLOCK_SIZE as u32, 0, 0, 0])[..]
        );
        assert_eq!(&payload[16..21], &data);
        assert!(payload[21..].iter().all(|&b| b == 0xFF));

        // Checksum field folds the padded block body, header excluded.
        let checksum = u32::from_le_bytes(block[4..8].try_into().unwrap());
        assert_eq!(checksum, xor_checksum(&payload[16..]) as u32);
    }

    #[tokio::test]
    async fn non_zero_status_is_fatal() {
        let mut channel = synced_client(MockChannel::default());
        channel.queue_reply(Command::FlashBegin as u8, 0, &[1, 0]);
        let mut client = client(channel);

        client.sync().await.unwrap();
        let result = client.start_flash(0, 0x400).await;
        assert!(matches!(result, Err(ProtocolError::Protocol(_))));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn mismatched_reply_opcode_is_fatal() {
        let mut channel = synced_client(MockChannel::default());
        channel.queue_reply(Command::FlashData as u8, 0, &[0, 0]);
        let mut client = client(channel);

        client.sync().await.unwrap();
        let result = client.start_flash(0, 0x400).await;
        assert!(matches!(result, Err(ProtocolError::Protocol(_))));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn bad_frame_marker_is_a_framing_error() {
        let mut channel = synced_client(MockChannel::default());
        channel.rx.push_back(0x7E); // not a SLIP delimiter
        let mut client = client(channel);

        client.sync().await.unwrap();
        let result = client.start_flash(0, 0x400).await;
        assert!(matches!(result, Err(ProtocolError::Framing(_))));
    }

    #[tokio::test]
    async fn commands_require_sync_first() {
        let mut client = client(MockChannel::default());
        let result = client.start_flash(0, 0x400).await;
        assert!(matches!(result, Err(ProtocolError::Protocol(_))));
        // A state guard failure does not write anything to the channel.
        assert!(client.channel.writes.is_empty());
    }

    #[tokio::test]
    async fn progress_callback_cancels_between_blocks() {
        let mut channel = synced_client(MockChannel::default());
        channel.queue_reply(Command::FlashBegin as u8, 0, &[0, 0]);
        channel.queue_reply(Command::FlashData as u8, 0, &[0, 0]);
        channel.queue_reply(Command::FlashData as u8, 0, &[0, 0]);
        let mut client = client(channel);

        client.sync().await.unwrap();
        let data = vec![0u8; 2 * FLASH_BLOCK_SIZE];
        let progress: ProgressCallback = Box::new(|_, _| Err(ProtocolError::Cancelled));
        let result = client
            .program_flash_with_progress(0x1000, &data, Some(progress))
            .await;
        assert!(matches!(result, Err(ProtocolError::Cancelled)));
        assert_eq!(client.state(), SessionState::Failed);
        // Begin plus exactly one data block before the cancellation.
        assert_eq!(client.channel.writes.len(), 1 + 2);
    }

    #[tokio::test]
    async fn run_program_finishes_the_session() {
        let mut channel = synced_client(MockChannel::default());
        channel.queue_reply(Command::FlashEnd as u8, 0, &[0, 0]);
        let mut client = client(channel);

        client.sync().await.unwrap();
        client.run_program(false, true).await.unwrap();
        assert_eq!(client.state(), SessionState::Done);

        let end = slip::decode(&client.channel.writes[1]).unwrap();
        assert_eq!(end[1], Command::FlashEnd as u8);
        // Reboot flag: 0 reboots, 1 stays in the bootloader.
        assert_eq!(end[8..12], pack_u32s(&[0])[..]);
    }

    #[tokio::test]
    async fn read_reg_returns_the_scalar_field() {
        let mut channel = synced_client(MockChannel::default());
        channel.queue_reply(Command::ReadReg as u8, 0xDEAD_BEEF, &[0, 0]);
        let mut client = client(channel);

        client.sync().await.unwrap();
        let value = client.read_reg(0x6000_0000).await.unwrap();
        assert_eq!(value, 0xDEAD_BEEF);
    }
}

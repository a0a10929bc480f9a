use bytes::{Buf as _, Bytes};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::PollSender;
use crate::codec::{PacketEncode, SendPipe};
use crate::codes::{extended_data, msg};
use crate::error::{Result, Error};
use super::kind::ChannelKind;
use super::pump::Pump;
use super::server_session::ServerSession;
use super::session::SessionEvent;

/// Most data that we put into a single DATA or EXTENDED_DATA packet, so that every packet fits
/// into the 32768-byte payload that all implementations must accept (RFC 4253, section 6.1).
const SEND_DATA_LEN_MAX: usize = 32 * 1024;

pub(super) type BoxRead = Pin<Box<dyn AsyncRead + Send>>;
pub(super) type BoxWrite = Pin<Box<dyn AsyncWrite + Send>>;

/// Local end of a channel.
///
/// `reader` produces the data that we send to the peer, `writer` consumes the data that we
/// receive. The `ext_` halves carry stderr.
#[derive(Default)]
pub(super) struct LocalIo {
    pub reader: Option<BoxRead>,
    pub writer: Option<BoxWrite>,
    pub ext_reader: Option<BoxRead>,
    pub ext_writer: Option<BoxWrite>,
}

impl LocalIo {
    pub fn from_stream<S>(stream: S) -> LocalIo
        where S: AsyncRead + AsyncWrite + Send + 'static
    {
        let (reader, writer) = tokio::io::split(stream);
        LocalIo {
            reader: Some(Box::pin(reader)),
            writer: Some(Box::pin(writer)),
            ext_reader: None,
            ext_writer: None,
        }
    }
}

/// Destination of the packets produced by a channel.
pub(super) trait PacketSink {
    fn send_packet(&mut self, payload: Bytes) -> Result<()>;
}

impl PacketSink for SendPipe {
    fn send_packet(&mut self, payload: Bytes) -> Result<()> {
        self.feed_packet(&payload)?;
        Ok(())
    }
}

#[cfg(test)]
impl PacketSink for Vec<Bytes> {
    fn send_packet(&mut self, payload: Bytes) -> Result<()> {
        self.push(payload);
        Ok(())
    }
}

/// Request that we send to the peer.
#[derive(Debug)]
pub(super) struct ChannelReq {
    pub request_type: &'static str,
    pub payload: Bytes,
    pub reply_tx: Option<oneshot::Sender<bool>>,
}

pub(super) struct ChannelInit {
    pub our_id: u32,
    pub their_id: u32,
    pub kind: ChannelKind,
    pub io: Option<LocalIo>,
    pub send_window: usize,
    pub send_len_max: usize,
    pub recv_window_max: usize,
    pub recv_len_max: usize,
    pub event_tx: Option<mpsc::Sender<SessionEvent>>,
}

pub(super) struct ChannelState {
    pub our_id: u32,
    pub their_id: u32,
    pub kind: ChannelKind,
    pub io: LocalIo,
    pub io_ready: bool,
    pub session: Option<Box<ServerSession>>,
    pub event_tx: Option<PollSender<SessionEvent>>,
    /// Holds back our CLOSE (the server session waits for the process to exit).
    pub close_blocked: bool,
    send_window: usize,
    send_len_max: usize,
    recv_window: usize,
    recv_window_max: usize,
    recv_len_max: usize,
    recv_freed: usize,
    recv_buf: VecDeque<Bytes>,
    ext_buf: VecDeque<Bytes>,
    read_scratch: Vec<u8>,
    reader_done: bool,
    ext_reader_done: bool,
    pub writer_done: bool,
    ext_writer_done: bool,
    eof_sent: bool,
    eof_recvd: bool,
    want_close: bool,
    close_sent: bool,
    close_recvd: bool,
    send_reqs: VecDeque<ChannelReq>,
    recv_replies: VecDeque<oneshot::Sender<bool>>,
    send_replies: VecDeque<bool>,
}

pub(super) fn init_channel(init: ChannelInit) -> ChannelState {
    let io_ready = init.io.is_some();
    ChannelState {
        our_id: init.our_id,
        their_id: init.their_id,
        kind: init.kind,
        io: init.io.unwrap_or_default(),
        io_ready,
        session: None,
        event_tx: init.event_tx.map(PollSender::new),
        close_blocked: false,
        send_window: init.send_window,
        send_len_max: init.send_len_max,
        recv_window: init.recv_window_max,
        recv_window_max: init.recv_window_max,
        recv_len_max: init.recv_len_max,
        recv_freed: 0,
        recv_buf: VecDeque::new(),
        ext_buf: VecDeque::new(),
        read_scratch: Vec::new(),
        reader_done: false,
        ext_reader_done: false,
        writer_done: false,
        ext_writer_done: false,
        eof_sent: false,
        eof_recvd: false,
        want_close: false,
        close_sent: false,
        close_recvd: false,
        send_reqs: VecDeque::new(),
        recv_replies: VecDeque::new(),
        send_replies: VecDeque::new(),
    }
}

/// Attaches the local end to a channel that was opened without one.
pub(super) fn set_io(channel_st: &mut ChannelState, io: LocalIo) {
    channel_st.io = io;
    channel_st.io_ready = true;
}

pub(super) fn pump_channel(
    channel_st: &mut ChannelState,
    out: &mut dyn PacketSink,
    can_send: bool,
    cx: &mut Context,
) -> Result<Pump> {
    let mut progress = pump_writers(channel_st, cx);
    if !can_send {
        return Ok(progress)
    }

    if !channel_st.close_sent {
        if let Some(success) = channel_st.send_replies.pop_front() {
            send_channel_reply(channel_st, out, success)?;
            return Ok(Pump::Progress)
        }

        if let Some(req) = channel_st.send_reqs.pop_front() {
            send_channel_request(channel_st, out, &req)?;
            if let Some(reply_tx) = req.reply_tx {
                channel_st.recv_replies.push_back(reply_tx);
            }
            return Ok(Pump::Progress)
        }

        if channel_st.recv_freed >= channel_st.recv_window_max / 3 {
            let adjust = channel_st.recv_freed;
            send_channel_window_adjust(channel_st, out, adjust)?;
            channel_st.recv_window += adjust;
            channel_st.recv_freed = 0;
            debug_assert!(channel_st.recv_window <= channel_st.recv_window_max);
            return Ok(Pump::Progress)
        }

        progress |= pump_readers(channel_st, out, cx)?;

        if channel_st.io_ready && channel_st.reader_done && channel_st.ext_reader_done
            && !channel_st.eof_sent
        {
            send_channel_eof(channel_st, out)?;
            channel_st.eof_sent = true;
            return Ok(Pump::Progress)
        }

        let local_done = channel_st.eof_sent && channel_st.writer_done
            && (channel_st.ext_writer_done || channel_st.io.ext_writer.is_none());
        let local_close = (local_done || channel_st.want_close) && !channel_st.close_blocked;
        if channel_st.close_recvd || local_close {
            send_channel_close(channel_st, out)?;
            channel_st.close_sent = true;
            channel_st.send_reqs.clear();
            return Ok(Pump::Progress)
        }
    }

    Ok(progress)
}

/// True once both sides have sent CLOSE and the received data were handed over.
pub(super) fn is_finished(channel_st: &ChannelState) -> bool {
    channel_st.close_sent && channel_st.close_recvd
        && (channel_st.recv_buf.is_empty() || channel_st.writer_done)
        && (channel_st.ext_buf.is_empty() || channel_st.ext_writer_done)
}

fn pump_writers(channel_st: &mut ChannelState, cx: &mut Context) -> Pump {
    if !channel_st.io_ready {
        return Pump::Pending
    }

    let eof = channel_st.eof_recvd || channel_st.close_recvd;
    let mut progress = pump_writer(
        &mut channel_st.io.writer, &mut channel_st.recv_buf, &mut channel_st.writer_done,
        eof, &mut channel_st.recv_freed, cx);
    progress |= pump_writer(
        &mut channel_st.io.ext_writer, &mut channel_st.ext_buf, &mut channel_st.ext_writer_done,
        eof, &mut channel_st.recv_freed, cx);
    progress
}

fn pump_writer(
    writer: &mut Option<BoxWrite>,
    buf: &mut VecDeque<Bytes>,
    done: &mut bool,
    eof: bool,
    freed: &mut usize,
    cx: &mut Context,
) -> Pump {
    let mut progress = Pump::Pending;
    loop {
        let Some(w) = writer.as_mut() else {
            *done = true;
            let discarded = buf.drain(..).map(|data| data.len()).sum::<usize>();
            if discarded > 0 {
                *freed += discarded;
                progress = Pump::Progress;
            }
            return progress
        };

        if let Some(data) = buf.front_mut() {
            match w.as_mut().poll_write(cx, data) {
                Poll::Ready(Ok(written)) if written > 0 => {
                    data.advance(written);
                    if data.is_empty() { buf.pop_front(); }
                    *freed += written;
                    progress = Pump::Progress;
                },
                Poll::Ready(Ok(_)) => {
                    log::debug!("local writer of channel was closed");
                    *writer = None;
                },
                Poll::Ready(Err(err)) => {
                    log::debug!("error when writing to local end of channel: {}", err);
                    *writer = None;
                },
                Poll::Pending => return progress,
            }
        } else if eof {
            match w.as_mut().poll_shutdown(cx) {
                Poll::Ready(_) => {
                    *writer = None;
                    *done = true;
                    return Pump::Progress
                },
                Poll::Pending => return progress,
            }
        } else {
            let _ = w.as_mut().poll_flush(cx);
            return progress
        }
    }
}

fn pump_readers(channel_st: &mut ChannelState, out: &mut dyn PacketSink, cx: &mut Context) -> Result<Pump> {
    if !channel_st.io_ready || channel_st.eof_sent {
        return Ok(Pump::Pending)
    }

    let mut progress = Pump::Pending;
    if !channel_st.reader_done {
        progress |= pump_reader(channel_st, out, false, cx)?;
    }
    if !channel_st.ext_reader_done {
        progress |= pump_reader(channel_st, out, true, cx)?;
    }
    Ok(progress)
}

fn pump_reader(
    channel_st: &mut ChannelState,
    out: &mut dyn PacketSink,
    ext: bool,
    cx: &mut Context,
) -> Result<Pump> {
    let reader = if ext { &mut channel_st.io.ext_reader } else { &mut channel_st.io.reader };
    let Some(r) = reader.as_mut() else {
        if ext { channel_st.ext_reader_done = true } else { channel_st.reader_done = true }
        return Ok(Pump::Progress)
    };

    let read_len = channel_st.send_window.min(channel_st.send_len_max).min(SEND_DATA_LEN_MAX);
    if read_len == 0 {
        return Ok(Pump::Pending)
    }
    channel_st.read_scratch.resize(read_len, 0);
    let mut read_buf = ReadBuf::new(&mut channel_st.read_scratch[..read_len]);

    let data = match r.as_mut().poll_read(cx, &mut read_buf) {
        Poll::Ready(Ok(())) => Bytes::copy_from_slice(read_buf.filled()),
        Poll::Ready(Err(err)) => {
            log::debug!("error when reading from local end of channel: {}", err);
            Bytes::new()
        },
        Poll::Pending => return Ok(Pump::Pending),
    };

    if data.is_empty() {
        *reader = None;
        if ext { channel_st.ext_reader_done = true } else { channel_st.reader_done = true }
        return Ok(Pump::Progress)
    }

    send_channel_data(channel_st, out, ext, &data)?;
    channel_st.send_window -= data.len();
    Ok(Pump::Progress)
}

fn send_channel_data(
    channel_st: &ChannelState,
    out: &mut dyn PacketSink,
    ext: bool,
    data: &[u8],
) -> Result<()> {
    let mut payload = PacketEncode::new();
    if ext {
        payload.put_u8(msg::CHANNEL_EXTENDED_DATA);
        payload.put_u32(channel_st.their_id);
        payload.put_u32(extended_data::STDERR);
        log::trace!("sending SSH_MSG_CHANNEL_EXTENDED_DATA for our channel {} with {} bytes",
            channel_st.our_id, data.len());
    } else {
        payload.put_u8(msg::CHANNEL_DATA);
        payload.put_u32(channel_st.their_id);
        log::trace!("sending SSH_MSG_CHANNEL_DATA for our channel {} with {} bytes",
            channel_st.our_id, data.len());
    }
    payload.put_bytes(data);
    out.send_packet(payload.finish())
}

pub(super) fn recv_channel_data(channel_st: &mut ChannelState, data: Bytes) -> Result<()> {
    charge_recv_window(channel_st, data.len())?;
    log::trace!("received SSH_MSG_CHANNEL_DATA for our channel {} with {} bytes",
        channel_st.our_id, data.len());
    if !data.is_empty() {
        channel_st.recv_buf.push_back(data);
    }
    Ok(())
}

pub(super) fn recv_channel_extended_data(channel_st: &mut ChannelState, code: u32, data: Bytes) -> Result<()> {
    charge_recv_window(channel_st, data.len())?;
    log::trace!("received SSH_MSG_CHANNEL_EXTENDED_DATA for our channel {}, code {}, with {} bytes",
        channel_st.our_id, code, data.len());

    if code == extended_data::STDERR && channel_st.kind.uses_ext_data() {
        if !data.is_empty() {
            channel_st.ext_buf.push_back(data);
        }
    } else {
        channel_st.recv_freed += data.len();
    }
    Ok(())
}

fn charge_recv_window(channel_st: &mut ChannelState, len: usize) -> Result<()> {
    if len > channel_st.recv_len_max {
        return Err(Error::Protocol("received channel data that exceed the maximum packet size"))
    }
    if len > channel_st.recv_window {
        return Err(Error::Protocol("received channel data that exceed the window size"))
    }
    channel_st.recv_window -= len;
    Ok(())
}

fn send_channel_window_adjust(channel_st: &ChannelState, out: &mut dyn PacketSink, adjust: usize) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_WINDOW_ADJUST);
    payload.put_u32(channel_st.their_id);
    payload.put_u32(adjust as u32);
    out.send_packet(payload.finish())?;
    log::trace!("sending SSH_MSG_CHANNEL_WINDOW_ADJUST for our channel {} with {} bytes",
        channel_st.our_id, adjust);
    Ok(())
}

pub(super) fn recv_channel_window_adjust(channel_st: &mut ChannelState, adjust: u32) {
    log::trace!("received SSH_MSG_CHANNEL_WINDOW_ADJUST for our channel {} with {} bytes",
        channel_st.our_id, adjust);
    channel_st.send_window = channel_st.send_window
        .saturating_add(adjust as usize)
        .min(u32::MAX as usize);
}

fn send_channel_eof(channel_st: &ChannelState, out: &mut dyn PacketSink) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_EOF);
    payload.put_u32(channel_st.their_id);
    out.send_packet(payload.finish())?;
    log::debug!("sending SSH_MSG_CHANNEL_EOF for our channel {}", channel_st.our_id);
    Ok(())
}

pub(super) fn recv_channel_eof(channel_st: &mut ChannelState) {
    log::debug!("received SSH_MSG_CHANNEL_EOF for our channel {}", channel_st.our_id);
    channel_st.eof_recvd = true;
}

fn send_channel_close(channel_st: &ChannelState, out: &mut dyn PacketSink) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_CLOSE);
    payload.put_u32(channel_st.their_id);
    out.send_packet(payload.finish())?;
    log::debug!("sending SSH_MSG_CHANNEL_CLOSE for our channel {}", channel_st.our_id);
    Ok(())
}

pub(super) fn recv_channel_close(channel_st: &mut ChannelState) -> Result<()> {
    if channel_st.close_recvd {
        return Err(Error::Protocol("received SSH_MSG_CHANNEL_CLOSE twice"))
    }
    log::debug!("received SSH_MSG_CHANNEL_CLOSE for our channel {}", channel_st.our_id);
    channel_st.close_recvd = true;
    Ok(())
}

pub(super) fn close(channel_st: &mut ChannelState) {
    channel_st.want_close = true;
}

pub(super) fn send_request(channel_st: &mut ChannelState, req: ChannelReq) -> Result<()> {
    if channel_st.close_sent || channel_st.want_close {
        return Err(Error::ChannelClosed)
    }
    channel_st.send_reqs.push_back(req);
    Ok(())
}

fn send_channel_request(channel_st: &ChannelState, out: &mut dyn PacketSink, req: &ChannelReq) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_REQUEST);
    payload.put_u32(channel_st.their_id);
    payload.put_str(req.request_type);
    payload.put_bool(req.reply_tx.is_some());
    payload.put_raw(&req.payload);
    out.send_packet(payload.finish())?;
    log::debug!("sending SSH_MSG_CHANNEL_REQUEST {:?} for our channel {}",
        req.request_type, channel_st.our_id);
    Ok(())
}

/// Queues our reply to a request of the peer; replies go out in the order of the requests.
pub(super) fn queue_reply(channel_st: &mut ChannelState, success: bool) {
    channel_st.send_replies.push_back(success);
}

fn send_channel_reply(channel_st: &ChannelState, out: &mut dyn PacketSink, success: bool) -> Result<()> {
    let mut payload = PacketEncode::new();
    if success {
        payload.put_u8(msg::CHANNEL_SUCCESS);
        log::debug!("sending SSH_MSG_CHANNEL_SUCCESS for our channel {}", channel_st.our_id);
    } else {
        payload.put_u8(msg::CHANNEL_FAILURE);
        log::debug!("sending SSH_MSG_CHANNEL_FAILURE for our channel {}", channel_st.our_id);
    }
    payload.put_u32(channel_st.their_id);
    out.send_packet(payload.finish())
}

pub(super) fn recv_channel_reply(channel_st: &mut ChannelState, success: bool) -> Result<()> {
    let Some(reply_tx) = channel_st.recv_replies.pop_front() else {
        return Err(Error::Protocol("received channel reply, but no reply was expected"))
    };
    log::debug!("received SSH_MSG_CHANNEL_{} for our channel {}",
        if success { "SUCCESS" } else { "FAILURE" }, channel_st.our_id);
    let _ = reply_tx.send(success);
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::BufMut as _;
    use futures::task::noop_waker_ref;
    use rand::SeedableRng as _;
    use rand_chacha::ChaCha8Rng;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use crate::codec::PacketDecode;
    use super::*;

    fn make_channel(io: Option<LocalIo>, send_window: usize, recv_window_max: usize) -> ChannelState {
        init_channel(ChannelInit {
            our_id: 0,
            their_id: 42,
            kind: ChannelKind::Session,
            io,
            send_window,
            send_len_max: 1000,
            recv_window_max,
            recv_len_max: 2000,
            event_tx: None,
        })
    }

    fn pump_all(channel_st: &mut ChannelState, out: &mut Vec<Bytes>) {
        let mut cx = Context::from_waker(noop_waker_ref());
        while pump_channel(channel_st, out, true, &mut cx).unwrap().is_progress() {}
    }

    fn msg_ids(out: &[Bytes]) -> Vec<u8> {
        out.iter().map(|payload| payload[0]).collect()
    }

    fn data_len(payload: &Bytes) -> usize {
        let mut decode = PacketDecode::new(payload.clone());
        assert_eq!(decode.get_u8().unwrap(), msg::CHANNEL_DATA);
        assert_eq!(decode.get_u32().unwrap(), 42);
        decode.get_bytes().unwrap().len()
    }

    fn bytes_of(len: usize) -> Bytes {
        let mut buf = bytes::BytesMut::new();
        buf.put_bytes(b'x', len);
        buf.freeze()
    }

    #[tokio::test]
    async fn test_data_respects_window_and_packet_len() {
        let (mut app, engine) = tokio::io::duplex(100_000);
        let mut channel_st = make_channel(Some(LocalIo::from_stream(engine)), 2500, 100_000);
        app.write_all(&[7; 4000]).await.unwrap();

        let mut out = Vec::new();
        pump_all(&mut channel_st, &mut out);
        assert_eq!(out.iter().map(data_len).collect::<Vec<_>>(), vec![1000, 1000, 500]);

        recv_channel_window_adjust(&mut channel_st, 10_000);
        out.clear();
        pump_all(&mut channel_st, &mut out);
        assert_eq!(out.iter().map(data_len).sum::<usize>(), 1500);
    }

    #[test]
    fn test_data_beyond_window_is_fatal() {
        let mut channel_st = make_channel(None, 0, 1000);
        recv_channel_data(&mut channel_st, bytes_of(600)).unwrap();
        recv_channel_extended_data(&mut channel_st, extended_data::STDERR, bytes_of(300)).unwrap();
        assert!(matches!(recv_channel_data(&mut channel_st, bytes_of(101)), Err(Error::Protocol(_))));
        recv_channel_data(&mut channel_st, bytes_of(100)).unwrap();
        assert_eq!(channel_st.recv_window, 0);
    }

    #[tokio::test]
    async fn test_window_restocked_after_consumption() {
        let (mut app, engine) = tokio::io::duplex(100_000);
        let mut channel_st = make_channel(Some(LocalIo::from_stream(engine)), 0, 3000);
        let mut out = Vec::new();

        recv_channel_data(&mut channel_st, bytes_of(500)).unwrap();
        pump_all(&mut channel_st, &mut out);
        assert!(out.is_empty());
        assert_eq!(channel_st.recv_window, 2500);

        recv_channel_data(&mut channel_st, bytes_of(600)).unwrap();
        pump_all(&mut channel_st, &mut out);
        assert_eq!(msg_ids(&out), vec![msg::CHANNEL_WINDOW_ADJUST]);
        assert_eq!(channel_st.recv_window, 3000);

        let mut received = vec![0; 1100];
        app.read_exact(&mut received).await.unwrap();
    }

    #[tokio::test]
    async fn test_data_fits_into_transport_packet() {
        let (mut app, engine) = tokio::io::duplex(100_000);
        let mut channel_st = init_channel(ChannelInit {
            our_id: 0,
            their_id: 42,
            kind: ChannelKind::Session,
            io: Some(LocalIo::from_stream(engine)),
            send_window: 100_000,
            send_len_max: u32::MAX as usize,
            recv_window_max: 1000,
            recv_len_max: 1000,
            event_tx: None,
        });
        app.write_all(&[7; 70_000]).await.unwrap();

        let mut out = Vec::new();
        pump_all(&mut channel_st, &mut out);
        assert_eq!(out.iter().map(data_len).collect::<Vec<_>>(), vec![32768, 32768, 4464]);

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut pipe = SendPipe::new(&mut rng).unwrap();
        for payload in out.iter() {
            pipe.feed_packet(payload).unwrap();
        }
    }

    #[tokio::test]
    async fn test_data_larger_than_window() {
        let (mut app, engine) = tokio::io::duplex(100_000);
        let mut channel_st = init_channel(ChannelInit {
            our_id: 0,
            their_id: 42,
            kind: ChannelKind::Session,
            io: Some(LocalIo::from_stream(engine)),
            send_window: 32768,
            send_len_max: 16384,
            recv_window_max: 32768,
            recv_len_max: 16384,
            event_tx: None,
        });
        app.write_all(&[7; 40_000]).await.unwrap();

        let mut out = Vec::new();
        pump_all(&mut channel_st, &mut out);
        assert_eq!(out.iter().map(data_len).collect::<Vec<_>>(), vec![16384, 16384]);
        assert_eq!(channel_st.send_window, 0);

        // the peer echoes the data back and we pass it to the application
        out.clear();
        recv_channel_data(&mut channel_st, bytes_of(16384)).unwrap();
        recv_channel_data(&mut channel_st, bytes_of(16384)).unwrap();
        pump_all(&mut channel_st, &mut out);
        assert_eq!(msg_ids(&out), vec![msg::CHANNEL_WINDOW_ADJUST]);
        assert_eq!(channel_st.recv_window, 32768);
        let mut received = vec![0; 32768];
        app.read_exact(&mut received).await.unwrap();

        out.clear();
        recv_channel_window_adjust(&mut channel_st, 32768);
        pump_all(&mut channel_st, &mut out);
        assert_eq!(out.iter().map(data_len).collect::<Vec<_>>(), vec![7232]);
    }

    #[test]
    fn test_data_beyond_packet_len_is_fatal() {
        let mut channel_st = make_channel(None, 0, 10_000);
        recv_channel_data(&mut channel_st, bytes_of(2000)).unwrap();
        assert!(matches!(recv_channel_data(&mut channel_st, bytes_of(2001)), Err(Error::Protocol(_))));
        assert!(matches!(
            recv_channel_extended_data(&mut channel_st, extended_data::STDERR, bytes_of(2001)),
            Err(Error::Protocol(_)),
        ));
        assert_eq!(channel_st.recv_window, 8000);
    }

    #[test]
    fn test_window_adjust_is_clamped() {
        let mut channel_st = make_channel(None, u32::MAX as usize - 10, 1000);
        recv_channel_window_adjust(&mut channel_st, 100);
        assert_eq!(channel_st.send_window, u32::MAX as usize);
    }

    #[test]
    fn test_ext_data_of_other_kinds_is_discarded() {
        let mut channel_st = make_channel(None, 0, 3000);
        channel_st.kind = ChannelKind::AuthAgent;
        recv_channel_extended_data(&mut channel_st, extended_data::STDERR, bytes_of(1000)).unwrap();
        assert!(channel_st.ext_buf.is_empty());
        assert_eq!(channel_st.recv_window, 2000);
        assert_eq!(channel_st.recv_freed, 1000);
    }

    #[tokio::test]
    async fn test_close_after_eof_both_ways() {
        let (mut app, engine) = tokio::io::duplex(1000);
        let mut channel_st = make_channel(Some(LocalIo::from_stream(engine)), 1000, 1000);
        let mut out = Vec::new();

        app.shutdown().await.unwrap();
        pump_all(&mut channel_st, &mut out);
        assert_eq!(msg_ids(&out), vec![msg::CHANNEL_EOF]);

        recv_channel_eof(&mut channel_st);
        pump_all(&mut channel_st, &mut out);
        assert_eq!(msg_ids(&out), vec![msg::CHANNEL_EOF, msg::CHANNEL_CLOSE]);
        assert!(!is_finished(&channel_st));

        recv_channel_close(&mut channel_st).unwrap();
        assert!(is_finished(&channel_st));
    }

    #[test]
    fn test_peer_close_is_reciprocated() {
        let mut channel_st = make_channel(None, 1000, 1000);
        let mut out = Vec::new();
        recv_channel_close(&mut channel_st).unwrap();
        assert!(!is_finished(&channel_st));
        pump_all(&mut channel_st, &mut out);
        assert_eq!(msg_ids(&out), vec![msg::CHANNEL_CLOSE]);
        assert!(is_finished(&channel_st));
        assert!(recv_channel_close(&mut channel_st).is_err());
    }

    #[test]
    fn test_local_close_waits_for_peer() {
        let mut channel_st = make_channel(None, 1000, 1000);
        let mut out = Vec::new();
        close(&mut channel_st);
        pump_all(&mut channel_st, &mut out);
        assert_eq!(msg_ids(&out), vec![msg::CHANNEL_CLOSE]);
        assert!(!is_finished(&channel_st));
        assert!(send_request(&mut channel_st, ChannelReq {
            request_type: "shell", payload: Bytes::new(), reply_tx: None,
        }).is_err());
        recv_channel_close(&mut channel_st).unwrap();
        assert!(is_finished(&channel_st));
    }

    #[test]
    fn test_nothing_sent_while_kex_in_progress() {
        let mut channel_st = make_channel(None, 1000, 1000);
        close(&mut channel_st);
        queue_reply(&mut channel_st, true);
        let mut out = Vec::new();
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(!pump_channel(&mut channel_st, &mut out, false, &mut cx).unwrap().is_progress());
        assert!(out.is_empty());
    }

    #[test]
    fn test_replies_in_order() {
        let mut channel_st = make_channel(None, 1000, 1000);
        let (tx_1, mut rx_1) = oneshot::channel();
        let (tx_2, mut rx_2) = oneshot::channel();
        send_request(&mut channel_st, ChannelReq {
            request_type: "env", payload: Bytes::new(), reply_tx: Some(tx_1),
        }).unwrap();
        send_request(&mut channel_st, ChannelReq {
            request_type: "exec", payload: Bytes::new(), reply_tx: Some(tx_2),
        }).unwrap();
        queue_reply(&mut channel_st, false);

        let mut out = Vec::new();
        pump_all(&mut channel_st, &mut out);
        assert_eq!(msg_ids(&out), vec![msg::CHANNEL_FAILURE, msg::CHANNEL_REQUEST, msg::CHANNEL_REQUEST]);

        recv_channel_reply(&mut channel_st, true).unwrap();
        recv_channel_reply(&mut channel_st, false).unwrap();
        assert_eq!(rx_1.try_recv().unwrap(), true);
        assert_eq!(rx_2.try_recv().unwrap(), false);
        assert!(recv_channel_reply(&mut channel_st, true).is_err());
    }
}

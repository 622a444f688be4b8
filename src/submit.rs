use tracing::{debug, error};

use crate::contract::{DecodeError, SendOutcome, Timestamp};
use crate::engine::{MppEngine, MppError, MppPacket};

/// Turns caller units into engine packets and owns the stream-start and
/// end-of-stream flags.
#[derive(Debug)]
pub(crate) struct PacketSubmitter {
    extradata: Option<Vec<u8>>,
    header_pending: bool,
    first_packet: bool,
    eos_reached: bool,
    stashed_pts: i64,
}

impl PacketSubmitter {
    pub(crate) fn new(extradata: Option<Vec<u8>>) -> Self {
        let extradata = extradata.filter(|header| !header.is_empty());
        Self {
            header_pending: extradata.is_some(),
            extradata,
            first_packet: true,
            eos_reached: false,
            stashed_pts: 0,
        }
    }

    pub(crate) fn first_packet(&self) -> bool {
        self.first_packet
    }

    pub(crate) fn eos_reached(&self) -> bool {
        self.eos_reached
    }

    pub(crate) fn mark_eos(&mut self) {
        self.eos_reached = true;
    }

    /// Remembers the last ordering key seen on the output side.
    pub(crate) fn note_pts(&mut self, pts: i64) {
        self.stashed_pts = pts;
    }

    pub(crate) fn reset(&mut self) {
        self.header_pending = self.extradata.is_some();
        self.first_packet = true;
        self.eos_reached = false;
    }

    /// Submits one unit; an empty `data` slice signals end of stream.
    pub(crate) fn submit(
        &mut self,
        engine: &mut dyn MppEngine,
        data: &[u8],
        pts: Option<Timestamp>,
    ) -> Result<SendOutcome, DecodeError> {
        if data.is_empty() {
            debug!("end of stream");
            self.eos_reached = true;
            return self.send_eos(engine);
        }

        let pts = pts.map_or(self.stashed_pts, |Timestamp(value)| value);

        if self.header_pending
            && let Some(header) = self.extradata.as_deref()
        {
            match write_data(engine, &MppPacket::new(header, pts)) {
                Ok(()) => self.header_pending = false,
                Err(MppError::BufferFull) => return Ok(SendOutcome::TryAgain),
                Err(err) => {
                    error!(%err, "failed to write extradata to decoder");
                    return Err(DecodeError::engine("write extradata", err));
                }
            }
        }

        match write_data(engine, &MppPacket::new(data, pts)) {
            Ok(()) => {
                self.first_packet = false;
                self.stashed_pts = pts;
                Ok(SendOutcome::Accepted)
            }
            Err(MppError::BufferFull) => Ok(SendOutcome::TryAgain),
            Err(err) => {
                error!(%err, "failed to write data to decoder");
                Err(DecodeError::engine("write packet", err))
            }
        }
    }

    /// Issues the zero-length end-of-stream marker. The flag is left alone so
    /// a marker refused for lack of room is re-sent on the next poll.
    pub(crate) fn send_eos(
        &mut self,
        engine: &mut dyn MppEngine,
    ) -> Result<SendOutcome, DecodeError> {
        match write_data(engine, &MppPacket::end_of_stream()) {
            Ok(()) => Ok(SendOutcome::Accepted),
            Err(MppError::BufferFull) => Ok(SendOutcome::TryAgain),
            Err(err) => {
                error!(%err, "failed to send EOS to decoder");
                Err(DecodeError::engine("write end of stream", err))
            }
        }
    }
}

fn write_data(engine: &mut dyn MppEngine, packet: &MppPacket<'_>) -> Result<(), MppError> {
    let size = packet.data.len();
    match engine.put_packet(packet) {
        Ok(()) => {
            debug!(size, pts = packet.pts, "wrote packet to decoder");
            Ok(())
        }
        Err(MppError::BufferFull) => {
            debug!(size, "buffer full writing packet to decoder");
            Err(MppError::BufferFull)
        }
        Err(err) => Err(err),
    }
}

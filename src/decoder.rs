//! Decoder facade consumed by the decoder-feeder worker. The real H.264/AAC
//! codec is an external collaborator (spec §1); this module only defines
//! the trait boundary plus two stand-ins sufficient to run and test the
//! pipeline without one.

/// Annex-B start code prepended to SPS/PPS NAL units if the caller didn't
/// already include one.
const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

fn with_start_code(nal: &[u8]) -> Vec<u8> {
    if nal.starts_with(&ANNEX_B_START_CODE) {
        nal.to_vec()
    } else {
        let mut out = Vec::with_capacity(ANNEX_B_START_CODE.len() + nal.len());
        out.extend_from_slice(&ANNEX_B_START_CODE);
        out.extend_from_slice(nal);
        out
    }
}

/// A decoded video frame, or (for [`PassthroughDecoder`]) an opaque NAL
/// payload destined for an external process instead of an in-process
/// surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Consumed by Worker B. Implementations may hold onto SPS/PPS until the
/// first video payload arrives.
pub trait VideoDecoder: Send {
    fn set_sps(&mut self, sps: &[u8]);
    fn set_pps(&mut self, pps: &[u8]);
    /// Decode one payload. A `None` return means "no frame yet" (e.g. the
    /// payload was itself parameter data) — not an error.
    fn decode(&mut self, payload: &[u8]) -> Option<Frame>;
    fn stop(&mut self);
}

/// Discards all input. Used as the default decoder and by tests that only
/// exercise routing and back-pressure, not decode correctness.
#[derive(Default)]
pub struct NullDecoder {
    stopped: bool,
}

impl VideoDecoder for NullDecoder {
    fn set_sps(&mut self, _sps: &[u8]) {}
    fn set_pps(&mut self, _pps: &[u8]) {}
    fn decode(&mut self, _payload: &[u8]) -> Option<Frame> {
        None
    }
    fn stop(&mut self) {
        self.stopped = true;
    }
}

/// The second permissible pipeline shape from the spec's open question:
/// instead of decoding in-process, forward raw Annex-B H.264 as an opaque
/// "frame" for an external process (e.g. piping to ffplay) to consume.
#[derive(Default)]
pub struct PassthroughDecoder {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl VideoDecoder for PassthroughDecoder {
    fn set_sps(&mut self, sps: &[u8]) {
        self.sps = Some(with_start_code(sps));
    }

    fn set_pps(&mut self, pps: &[u8]) {
        self.pps = Some(with_start_code(pps));
    }

    fn decode(&mut self, payload: &[u8]) -> Option<Frame> {
        let mut data = Vec::new();
        if let Some(sps) = self.sps.take() {
            data.extend_from_slice(&sps);
        }
        if let Some(pps) = self.pps.take() {
            data.extend_from_slice(&pps);
        }
        data.extend_from_slice(&with_start_code(payload));
        Some(Frame {
            data,
            width: 0,
            height: 0,
        })
    }

    fn stop(&mut self) {
        self.sps = None;
        self.pps = None;
    }
}

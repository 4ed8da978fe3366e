//! Capture driver. `Packet` decoding itself lives in `pcapstats-core`;
//! this module only gets raw frames off the wire or out of a file.

use pcapstats_core::Error;

pub trait CaptureSource {
    /// Returns the next raw link-layer frame, or `None` at end of input
    /// (offline capture exhausted).
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, Error>;
}

/// In-memory replay used by integration tests; avoids depending on the
/// `pcap` feature or a real interface/file.
pub struct SliceCapture {
    frames: std::vec::IntoIter<Vec<u8>>,
}

impl SliceCapture {
    pub fn new(frames: Vec<Vec<u8>>) -> Self {
        Self { frames: frames.into_iter() }
    }
}

impl CaptureSource for SliceCapture {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.frames.next())
    }
}

#[cfg(feature = "live-capture")]
pub struct PcapCapture {
    capture: pcap::Capture<pcap::Active>,
}

#[cfg(feature = "live-capture")]
impl PcapCapture {
    pub fn open_live(interface: &str) -> Result<Self, Error> {
        let capture = pcap::Capture::from_device(interface)
            .map_err(|e| Error::Fatal(format!("no such interface '{interface}': {e}")))?
            .promisc(true)
            .snaplen(65535)
            .timeout(1000)
            .open()
            .map_err(|e| Error::Fatal(format!("failed to open interface '{interface}': {e}")))?;
        Ok(Self { capture })
    }
}

#[cfg(feature = "live-capture")]
pub struct PcapOfflineCapture {
    capture: pcap::Capture<pcap::Offline>,
}

#[cfg(feature = "live-capture")]
impl PcapOfflineCapture {
    pub fn open_file(path: &str) -> Result<Self, Error> {
        let capture =
            pcap::Capture::from_file(path).map_err(|e| Error::Fatal(format!("failed to open '{path}': {e}")))?;
        Ok(Self { capture })
    }
}

#[cfg(feature = "live-capture")]
impl CaptureSource for PcapCapture {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(Some(packet.data.to_vec())),
            Err(pcap::Error::TimeoutExpired) => Ok(Some(Vec::new())),
            Err(pcap::Error::NoMorePackets) => Ok(None),
            Err(e) => Err(Error::Fatal(format!("capture error: {e}"))),
        }
    }
}

#[cfg(feature = "live-capture")]
impl CaptureSource for PcapOfflineCapture {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(Some(packet.data.to_vec())),
            Err(pcap::Error::NoMorePackets) => Ok(None),
            Err(e) => Err(Error::Fatal(format!("capture error: {e}"))),
        }
    }
}

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use pcap_file::pcap::PcapReader;
use replay_common::duration_nanos;
use tracing::debug;

use super::PacketSource;
use crate::{CaptureError, LinkType, Packet};

/// Reads packets from a pcap capture file.
pub struct PcapFileSource {
    path: PathBuf,
    name: String,
    link: LinkType,
    reader: PcapReader<BufReader<File>>,
}

impl std::fmt::Debug for PcapFileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcapFileSource").field("path", &self.path).field("link", &self.link).finish()
    }
}

impl PcapFileSource {
    /// Opens a capture file. Fails if the path does not exist, is a directory, or is not a pcap
    /// file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let name = path.display().to_string();

        let metadata = std::fs::metadata(path)
            .map_err(|e| CaptureError::Open { name: name.clone(), reason: e.to_string() })?;
        if metadata.is_dir() {
            return Err(CaptureError::Open { name, reason: "path is a directory".to_string() });
        }

        let file = File::open(path)?;
        let reader = PcapReader::new(BufReader::new(file))
            .map_err(|e| CaptureError::Open { name: name.clone(), reason: e.to_string() })?;
        let link = LinkType::from_dlt(u32::from(reader.header().datalink));

        debug!(file = %name, ?link, "Opened capture file");

        Ok(Self { path: path.to_path_buf(), name, link, reader })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn link_type(&self) -> LinkType {
        self.link
    }
}

impl PacketSource for PcapFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_packet(&mut self) -> Option<Result<Packet, CaptureError>> {
        let link = self.link;
        Some(match self.reader.next_packet()? {
            Ok(pkt) => Ok(Packet::decode(link, pkt.data.into_owned(), duration_nanos(pkt.timestamp))),
            Err(e) => Err(CaptureError::Pcap(e.to_string())),
        })
    }
}

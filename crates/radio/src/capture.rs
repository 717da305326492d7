//! pcap capture of PHY frames, readable by Wireshark as 802.15.4 with FCS.

use std::path::Path;
use std::time::UNIX_EPOCH;

use log::{error, info, warn};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use crate::framing::PhyFrame;
use crate::RadioError;

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const LINKTYPE_IEEE802_15_4_WITHFCS: u32 = 195;
const SNAPLEN: u32 = 65_535;
const CAPTURE_QUEUE: usize = 256;

pub struct CaptureWriter<W> {
    writer: W,
    records: u64,
}

impl<W: AsyncWrite + Unpin> CaptureWriter<W> {
    /// Writes the pcap global header.
    pub async fn new(mut writer: W) -> std::io::Result<Self> {
        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes());
        header.extend_from_slice(&4u16.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&SNAPLEN.to_le_bytes());
        header.extend_from_slice(&LINKTYPE_IEEE802_15_4_WITHFCS.to_le_bytes());
        writer.write_all(&header).await?;
        Ok(Self { writer, records: 0 })
    }

    pub async fn write_frame(&mut self, frame: &PhyFrame) -> std::io::Result<()> {
        let psdu = frame.psdu();
        let since_epoch = frame.timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();

        let mut record = Vec::with_capacity(16 + psdu.len());
        record.extend_from_slice(&(since_epoch.as_secs() as u32).to_le_bytes());
        record.extend_from_slice(&since_epoch.subsec_micros().to_le_bytes());
        record.extend_from_slice(&(psdu.len() as u32).to_le_bytes());
        record.extend_from_slice(&(psdu.len() as u32).to_le_bytes());
        record.extend_from_slice(&psdu);
        self.writer.write_all(&record).await?;
        self.records += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush().await
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Non-blocking handle feeding a capture task.
#[derive(Clone)]
pub struct CaptureSink {
    tx: mpsc::Sender<PhyFrame>,
}

impl CaptureSink {
    /// Queues a frame; dropped if the capture task is behind or gone.
    pub fn record(&self, frame: &PhyFrame) {
        if self.tx.try_send(frame.clone()).is_err() {
            warn!("capture queue unavailable, frame not recorded");
        }
    }

    /// Runs a capture task over any writer. A write failure ends only this task.
    pub fn spawn<W>(mut writer: CaptureWriter<W>) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<PhyFrame>(CAPTURE_QUEUE);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let written = match writer.write_frame(&frame).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    error!("capture write failed, stopping capture: {}", e);
                    return;
                }
            }
            info!("capture closed after {} frames", writer.records());
        });
        Self { tx }
    }
}

pub async fn spawn_capture(path: impl AsRef<Path>) -> Result<CaptureSink, RadioError> {
    let path = path.as_ref();
    let file = File::create(path).await?;
    let writer = CaptureWriter::new(BufWriter::new(file)).await?;
    info!("capturing frames to {}", path.display());
    Ok(CaptureSink::spawn(writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use wpan_core::CrcKind;

    fn frame(payload: &'static [u8]) -> PhyFrame {
        let mut frame = PhyFrame::from_payload(Bytes::from_static(payload), CrcKind::Crc16);
        frame.timestamp = UNIX_EPOCH + Duration::new(1_700_000_000, 250_000_000);
        frame
    }

    #[tokio::test]
    async fn test_pcap_layout() {
        let mut writer = CaptureWriter::new(Vec::new()).await.unwrap();
        writer.write_frame(&frame(b"\x41\x88\x01abc")).await.unwrap();
        assert_eq!(writer.records(), 1);
        let bytes = writer.into_inner();

        assert_eq!(&bytes[..4], &[0xd4, 0xc3, 0xb2, 0xa1]);
        assert_eq!(&bytes[4..8], &[2, 0, 4, 0]);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 65_535);
        assert_eq!(u32::from_le_bytes(bytes[20..24].try_into().unwrap()), 195);

        let record = &bytes[24..];
        assert_eq!(u32::from_le_bytes(record[0..4].try_into().unwrap()), 1_700_000_000);
        assert_eq!(u32::from_le_bytes(record[4..8].try_into().unwrap()), 250_000);
        assert_eq!(u32::from_le_bytes(record[8..12].try_into().unwrap()), 8);
        assert_eq!(u32::from_le_bytes(record[12..16].try_into().unwrap()), 8);
        // Payload then FCS, whose CRC residue is zero.
        assert_eq!(&record[16..22], b"\x41\x88\x01abc");
        assert_eq!(wpan_core::crc16(&record[16..]), 0);
    }

    #[tokio::test]
    async fn test_spawn_capture_writes_file() {
        let path = std::env::temp_dir().join(format!("wpan-capture-{}.pcap", std::process::id()));
        let sink = spawn_capture(&path).await.unwrap();
        sink.record(&frame(b"one"));
        sink.record(&frame(b"two!"));
        drop(sink);

        let expected = 24 + (16 + 5) + (16 + 6);
        let mut bytes = Vec::new();
        for _ in 0..100 {
            bytes = tokio::fs::read(&path).await.unwrap();
            if bytes.len() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bytes.len(), expected);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_unwritable_path_is_reported() {
        let result = spawn_capture("/nonexistent-dir/capture.pcap").await;
        assert!(matches!(result, Err(RadioError::Io(_))));
    }
}

//! UDP bridge between local applications and the rime broadcast channel.

use std::net::SocketAddr;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, watch};

use crate::pipeline::TransceiverHandle;
use crate::rime::{RimeDelivery, RimeMode};
use crate::RadioError;

pub const DEFAULT_UDP_PORT: u16 = 52001;
pub const MAX_DATAGRAM: usize = 10_000;

pub struct UdpBridge {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl UdpBridge {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, RadioError> {
        let socket = UdpSocket::bind(addr).await?;
        info!("UDP bridge listening on {}", socket.local_addr()?);
        Ok(Self { socket, peer: None })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RadioError> {
        Ok(self.socket.local_addr()?)
    }

    /// Inbound datagrams go out as rime broadcasts; rime broadcasts heard on
    /// air are sent to the most recent datagram source. Anycast deliveries
    /// are not part of the broadcast channel and stay off the socket.
    pub async fn run(
        mut self,
        handle: TransceiverHandle,
        mut deliveries: mpsc::Receiver<RimeDelivery>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RadioError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    if self.peer != Some(from) {
                        debug!("UDP bridge peer is now {}", from);
                        self.peer = Some(from);
                    }
                    trace!("UDP bridge received {} bytes from {}", len, from);
                    match handle.send_up(Bytes::copy_from_slice(&buf[..len])).await {
                        Ok(()) => {}
                        Err(RadioError::Shutdown) => break,
                        Err(e) => warn!("UDP bridge dropped datagram: {}", e),
                    }
                }
                delivery = deliveries.recv() => {
                    let Some(delivery) = delivery else { break };
                    if delivery.mode != RimeMode::Broadcast {
                        trace!("UDP bridge skipping {:?} delivery from {}", delivery.mode, delivery.origin);
                        continue;
                    }
                    match self.peer {
                        Some(peer) => {
                            self.socket.send_to(&delivery.payload, peer).await?;
                            trace!("UDP bridge forwarded {} bytes from {}", delivery.payload.len(), delivery.origin);
                        }
                        None => debug!("UDP bridge has no peer yet, dropping delivery from {}", delivery.origin),
                    }
                }
            }
        }
        info!("UDP bridge stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rime::{RimeAddress, RimeRequest};
    use crate::{RadioConfig, RadioControl};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_datagrams_flow_both_ways_broadcast_only() {
        let (rime_tx, mut rime_rx) = mpsc::channel::<RimeRequest>(4);
        let control = RadioControl::new(RadioConfig::default()).unwrap();
        let handle = TransceiverHandle::new(rime_tx, control, 90);

        let bridge = UdpBridge::bind("127.0.0.1:0").await.unwrap();
        let bridge_addr = bridge.local_addr().unwrap();
        let (delivery_tx, delivery_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(bridge.run(handle, delivery_rx, shutdown));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"from app", bridge_addr).await.unwrap();

        let request = timeout(Duration::from_secs(5), rime_rx.recv()).await.unwrap().unwrap();
        assert_eq!(&request.payload[..], b"from app");
        assert_eq!(request.mode, RimeMode::Broadcast);

        delivery_tx
            .send(RimeDelivery {
                mode: RimeMode::Anycast,
                origin: RimeAddress([1, 3]),
                hops: 1,
                payload: Bytes::from_static(b"addressed to us"),
            })
            .await
            .unwrap();
        delivery_tx
            .send(RimeDelivery {
                mode: RimeMode::Broadcast,
                origin: RimeAddress([1, 2]),
                hops: 1,
                payload: Bytes::from_static(b"from air"),
            })
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"from air");
        assert!(timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await.is_err());

        drop(delivery_tx);
        assert!(timeout(Duration::from_secs(5), task).await.unwrap().unwrap().is_ok());
    }
}

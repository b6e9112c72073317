use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

use crate::pipeline::caps::{Caps, Pads};
use crate::pipeline::clock::MediaClock;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::stage::{Stage, StageContext, StageOptions, option_or};
use crate::pipeline::types::Buffer;

const MAX_DATAGRAM: usize = 65536;

/// Receives RTP over UDP
///
/// Every datagram that parses as RTP is forwarded unchanged; anything else
/// is counted as a drop. A source nobody sends to simply never produces.
pub struct UdpSrc {
    address: String,
    port: u16,
    media: String,
    encoding_name: String,
    payload: u8,
    clock_rate: u32,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
    clock: MediaClock,
    health: Arc<PipelineHealth>,
    name: String,
}

impl UdpSrc {
    pub fn from_options(options: &StageOptions) -> Result<Self> {
        Ok(Self {
            address: option_or(options, "address", "0.0.0.0".to_string())?,
            port: option_or(options, "port", 5000)?,
            media: option_or(options, "media", "video".to_string())?,
            encoding_name: option_or(options, "encoding-name", "H264".to_string())?,
            payload: option_or(options, "payload", 96)?,
            clock_rate: option_or(options, "clock-rate", 90000)?,
            socket: None,
            buf: vec![0; MAX_DATAGRAM],
            clock: MediaClock::new(),
            health: Arc::new(PipelineHealth::new()),
            name: String::new(),
        })
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

#[async_trait]
impl Stage for UdpSrc {
    fn pads(&self) -> Pads {
        Pads::source(
            Caps::builder("application/x-rtp")
                .field("media", &self.media)
                .field("encoding-name", &self.encoding_name)
                .field("payload", self.payload)
                .field("clock-rate", self.clock_rate)
                .build(),
        )
    }

    async fn start(&mut self, ctx: &StageContext) -> Result<()> {
        let bind = format!("{}:{}", self.address, self.port);
        let socket = UdpSocket::bind(&bind)
            .await
            .with_context(|| format!("cannot bind {}", bind))?;
        info!(
            "{}: listening on {} for {} payload {}",
            ctx.name,
            socket.local_addr().map(|a| a.to_string()).unwrap_or(bind),
            self.encoding_name,
            self.payload
        );
        self.socket = Some(socket);
        self.clock = ctx.clock.clone();
        self.health = Arc::clone(&ctx.health);
        self.name = ctx.name.clone();
        Ok(())
    }

    async fn pull(&mut self) -> Result<Option<Buffer>> {
        let socket = self.socket.as_ref().ok_or_else(|| anyhow!("socket is not bound"))?;
        loop {
            let (len, from) = socket
                .recv_from(&mut self.buf)
                .await
                .context("receive failed")?;

            let datagram = &self.buf[..len];
            let mut raw = datagram;
            match Packet::unmarshal(&mut raw) {
                Ok(packet) => {
                    if packet.header.version != 2 {
                        debug!("{}: RTP version {} from {}", self.name, packet.header.version, from);
                        self.health.record_drop();
                        continue;
                    }
                    return Ok(Some(Buffer::new(
                        Bytes::copy_from_slice(datagram),
                        self.clock.now(),
                    )));
                }
                Err(e) => {
                    warn!("{}: dropping {} byte datagram from {}: {}", self.name, len, from, e);
                    self.health.record_drop();
                }
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp::header::Header;
    use webrtc::util::Marshal;

    fn options() -> StageOptions {
        [("address", "127.0.0.1"), ("port", "0")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ctx() -> StageContext {
        StageContext {
            name: "capture".into(),
            clock: MediaClock::new(),
            health: Arc::new(PipelineHealth::new()),
        }
    }

    #[test]
    fn test_caps_describe_the_stream() {
        let src = UdpSrc::from_options(&options()).unwrap();
        let caps = src.pads().src.unwrap();
        let structure = caps.structure().unwrap();
        assert_eq!(structure.get("encoding-name"), Some("H264"));
        assert_eq!(structure.get("payload"), Some("96"));
        assert_eq!(structure.get("clock-rate"), Some("90000"));
    }

    #[tokio::test]
    async fn test_forwards_rtp_and_drops_garbage() {
        let ctx = ctx();
        let mut src = UdpSrc::from_options(&options()).unwrap();
        src.start(&ctx).await.unwrap();
        let target = src.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&[0xde, 0xad], target).await.unwrap();

        let packet = Packet {
            header: Header {
                version: 2,
                payload_type: 96,
                sequence_number: 7,
                marker: true,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x65, 0x88]),
        };
        let wire = packet.marshal().unwrap();
        sender.send_to(&wire, target).await.unwrap();

        let buffer = src.pull().await.unwrap().unwrap();
        assert_eq!(buffer.data, wire);
        assert_eq!(ctx.health.buffers_dropped(), 1);
        src.stop().await.unwrap();
    }
}

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use fleet_proto::Inbound;
use futures::stream::{Fuse, FusedStream};
use futures::{Stream, StreamExt};
use pin_project_lite::pin_project;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

pin_project! {
    /// Decodes raw transport frames into [`Inbound`] frames. The stream ends
    /// right after the first transport error or malformed frame.
    pub struct Frames<St> {
        #[pin]
        stream: Fuse<St>,
        failed: bool,
    }
}

impl<St> Frames<St>
where
    St: Stream<Item = io::Result<Vec<u8>>>,
{
    pub fn new(stream: St) -> Self {
        Self {
            stream: stream.fuse(),
            failed: false,
        }
    }
}

impl<St> Stream for Frames<St>
where
    St: Stream<Item = io::Result<Vec<u8>>>,
{
    type Item = Result<Inbound>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.failed {
            return Poll::Ready(None);
        }

        let frame = match ready!(this.stream.poll_next(cx)) {
            Some(Ok(bytes)) => Inbound::decode(&bytes).map_err(Error::from),
            Some(Err(e)) => Err(Error::Internal(e.into())),
            None => return Poll::Ready(None),
        };
        if frame.is_err() {
            *this.failed = true;
        }
        Poll::Ready(Some(frame))
    }
}

impl<St> FusedStream for Frames<St>
where
    St: Stream<Item = io::Result<Vec<u8>>>,
{
    fn is_terminated(&self) -> bool {
        self.failed || self.stream.is_terminated()
    }
}

/// Outbound half of a node stream.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: Vec<u8>) -> anyhow::Result<()>;
}

#[async_trait]
impl FrameSink for mpsc::Sender<Vec<u8>> {
    async fn send(&mut self, frame: Vec<u8>) -> anyhow::Result<()> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| anyhow::anyhow!("Node stream closed"))
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    #[tokio::test]
    async fn stops_after_malformed_frame() {
        let raw = vec![
            Ok(br#"{"type":"heartbeatPing","data":{"idleConcurrency":1,"maxConcurrency":2,"timestamp":0}}"#.to_vec()),
            Ok(b"not json".to_vec()),
            Ok(br#"{"type":"heartbeatPing","data":{"idleConcurrency":1,"maxConcurrency":2,"timestamp":0}}"#.to_vec()),
        ];
        let frames: Vec<_> = Frames::new(stream::iter(raw)).collect().await;

        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        assert!(matches!(frames[1], Err(Error::InvalidArgument(_))));
    }
}

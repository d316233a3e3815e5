use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use http_body::Frame;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use tokio::sync::oneshot;

use crate::error::ProxyError;
use crate::proxy::ProxyBody;

/// The bytes observed flowing through a [`TeeBody`], delivered once the
/// stream completes. `truncated` is set when a capture cap cut the buffer
/// short of the full body.
#[derive(Debug)]
pub struct CapturedBody {
    pub bytes: Bytes,
    pub truncated: bool,
}

pin_project! {
    /// Body wrapper that duplicates every data frame into a buffer while
    /// passing frames through untouched.
    ///
    /// The buffer is handed to the receiver only when the inner body ends
    /// cleanly; an erroring or abandoned stream never yields a capture, so
    /// flows are only built for completed exchanges.
    struct TeeBody {
        #[pin]
        inner: ProxyBody,
        buffer: BytesMut,
        limit: usize,
        truncated: bool,
        sender: Option<oneshot::Sender<CapturedBody>>,
    }
}

/// Wrap `body` so that its bytes are captured as they stream through.
pub fn capture(
    body: ProxyBody,
    limit: Option<usize>,
) -> (ProxyBody, oneshot::Receiver<CapturedBody>) {
    let (sender, receiver) = oneshot::channel();
    let tee = TeeBody {
        inner: body,
        buffer: BytesMut::new(),
        limit: limit.unwrap_or(usize::MAX),
        truncated: false,
        sender: Some(sender),
    };
    (BodyExt::boxed(tee), receiver)
}

impl http_body::Body for TeeBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let result = match ready!(this.inner.poll_frame(cx)) {
            None => {
                if let Some(sender) = this.sender.take() {
                    let _ = sender.send(CapturedBody {
                        bytes: this.buffer.split().freeze(),
                        truncated: *this.truncated,
                    });
                }
                None
            }
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    let room = this.limit.saturating_sub(this.buffer.len());
                    if data.len() <= room {
                        this.buffer.extend_from_slice(data);
                    } else {
                        this.buffer.extend_from_slice(&data[..room]);
                        *this.truncated = true;
                    }
                }
                Some(Ok(frame))
            }
            Some(Err(err)) => {
                // Incomplete stream: drop the capture.
                this.sender.take();
                Some(Err(err))
            }
        };
        Poll::Ready(result)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn boxed(payload: &'static [u8]) -> ProxyBody {
        BodyExt::boxed(Full::new(Bytes::from_static(payload)).map_err(|never| match never {}))
    }

    #[tokio::test]
    async fn test_capture_passes_bytes_through() {
        let (body, rx) = capture(boxed(b"hello world"), None);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"hello world"));

        let captured = rx.await.unwrap();
        assert_eq!(captured.bytes, Bytes::from_static(b"hello world"));
        assert!(!captured.truncated);
    }

    #[tokio::test]
    async fn test_capture_empty_body() {
        let (body, rx) = capture(boxed(b""), None);
        assert!(body.collect().await.unwrap().to_bytes().is_empty());

        let captured = rx.await.unwrap();
        assert!(captured.bytes.is_empty());
        assert!(!captured.truncated);
    }

    #[tokio::test]
    async fn test_capture_cap_marks_truncated() {
        let (body, rx) = capture(boxed(b"0123456789"), Some(4));

        // The downstream copy still sees every byte.
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"0123456789"));

        let captured = rx.await.unwrap();
        assert_eq!(captured.bytes, Bytes::from_static(b"0123"));
        assert!(captured.truncated);
    }

    #[tokio::test]
    async fn test_abandoned_body_yields_no_capture() {
        let (body, rx) = capture(boxed(b"never read"), None);
        drop(body);
        assert!(rx.await.is_err());
    }
}

//! Wraps a request/response body so streaming bytes are metered as they pass through, without
//! buffering (the proxy engine pipes bytes through unless a location opts into buffering). Both
//! legs of a request share the same wrapper: the inbound body is metered into `bytes_in`, the
//! outbound one into `bytes_out`.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame};

use super::ListenerCounters;

/// Which of a listener's two byte counters a [`MeteredBody`] feeds.
#[derive(Clone, Copy)]
pub enum Direction {
	In,
	Out,
}

pub struct MeteredBody<B> {
	inner: B,
	counters: Arc<ListenerCounters>,
	direction: Direction,
}

impl<B> MeteredBody<B> {
	pub fn new(inner: B, counters: Arc<ListenerCounters>, direction: Direction) -> Self {
		MeteredBody { inner, counters, direction }
	}
}

impl<B> Body for MeteredBody<B>
where
	B: Body<Data = Bytes> + Unpin,
{
	type Data = Bytes;
	type Error = B::Error;

	fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
		let this = &mut *self;
		match Pin::new(&mut this.inner).poll_frame(cx) {
			Poll::Ready(Some(Ok(frame))) => {
				if let Some(data) = frame.data_ref() {
					let counter = match this.direction {
						Direction::In => &this.counters.bytes_in,
						Direction::Out => &this.counters.bytes_out,
					};
					counter.fetch_add(data.len() as u64, Ordering::Relaxed);
				}
				Poll::Ready(Some(Ok(frame)))
			},
			other => other,
		}
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.inner.size_hint()
	}
}

/// Approximates the wire size of a request/response line plus headers (spec §4.6's "request-line
/// + headers + body byte count" accounting); exact framing varies by HTTP version, so this counts
/// the same bytes a `curl -v` header dump would show.
pub fn header_block_len(line: &str, headers: &http::HeaderMap) -> u64 {
	let mut total = line.len() + 2;
	for (name, value) in headers.iter() {
		total += name.as_str().len() + 2 + value.len() + 2;
	}
	total as u64 + 2
}

#[cfg(test)]
mod tests {
	use super::*;
	use http_body_util::{BodyExt, Full};

	#[tokio::test]
	async fn counts_bytes_as_frames_are_polled() {
		let counters = Arc::new(ListenerCounters::default());
		let body = MeteredBody::new(Full::new(Bytes::from_static(b"hello world")), counters.clone(), Direction::Out);
		let collected = body.collect().await.unwrap().to_bytes();
		assert_eq!(collected.as_ref(), b"hello world");
		assert_eq!(counters.bytes_out.load(Ordering::Relaxed), 11);
		assert_eq!(counters.bytes_in.load(Ordering::Relaxed), 0);
	}

	#[test]
	fn header_block_len_counts_line_and_headers() {
		let mut headers = http::HeaderMap::new();
		headers.insert(http::header::HOST, "example.com".parse().unwrap());
		let len = header_block_len("GET / HTTP/1.1", &headers);
		assert!(len > "GET / HTTP/1.1".len() as u64);
	}
}

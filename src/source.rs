//! Sources deliver streams of update [Messages](Message).
//!
//! The streaming source follows the server-sent-events endpoint; the polling
//! source periodically fetches the full data set and emits it as a `put`.

use crate::message::{Message, MessageParseError};
use bytes::Buf;
use eventsource_client as es;
use futures::{ready, stream, Stream, StreamExt};
use pin_project::pin_project;
use std::sync::Arc;
use std::{
    fmt::Debug,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tracing::debug;

/// default URL for subscribing to the update stream
const DEFAULT_STREAM_URL: &str = "https://stream.launchdarkly.com/all";

/// default URL for the polling endpoint
const DEFAULT_POLL_URL: &str = "https://app.launchdarkly.com/sdk/latest-all";

/// header identifying a wrapping SDK on top of this one
pub(crate) const WRAPPER_HEADER: &str = "X-LaunchDarkly-Wrapper";

/// User-Agent reported to the service.
pub(crate) fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Allows reading a stream of update [Messages](Message)
pub trait Source {
    type Error;
    type Stream: Stream<Item = Result<Message, Self::Error>>;

    /// Get the stream of updates
    ///
    /// Whenever a stream returned an error,
    /// this should be called again to get a
    /// fresh stream.
    fn stream(&self) -> Self::Stream;
}

impl<T: Source> Source for Arc<T> {
    type Error = T::Error;
    type Stream = T::Stream;
    fn stream(&self) -> Self::Stream {
        self.as_ref().stream()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError<E>
where
    E: Debug,
{
    #[error("Failed to read SSE stream: {0:?}")]
    Inner(E),

    #[error("Failed to parse event: {0}")]
    Parse(#[from] MessageParseError),
}

/// [Source] for reading from an SSE stream.
///
/// This is the most common way the service delivers updates.
pub struct SseSource {
    client: Box<dyn es::Client>,
}

#[derive(Debug, thiserror::Error)]
pub enum SseCreateError {
    #[error("Invalid stream URL or credential: {0:?}")]
    Build(es::Error),
}

impl SseSource {
    /// Create a [Source] consuming from SSE with an SDK token
    pub fn new<T: AsRef<str>>(token: T) -> Result<Self, SseCreateError> {
        Self::for_url(DEFAULT_STREAM_URL, token, None)
    }

    /// Same as [SseSource::new] but against a custom endpoint. A wrapping
    /// SDK identifies itself with `wrapper` (`name` or `name/version`).
    pub fn for_url<T: AsRef<str>>(
        url: &str,
        token: T,
        wrapper: Option<&str>,
    ) -> Result<Self, SseCreateError> {
        let mut builder = es::ClientBuilder::for_url(url)
            .map_err(SseCreateError::Build)?
            .header("Authorization", token.as_ref())
            .map_err(SseCreateError::Build)?
            .header("User-Agent", &default_user_agent())
            .map_err(SseCreateError::Build)?;
        if let Some(wrapper) = wrapper {
            builder = builder
                .header(WRAPPER_HEADER, wrapper)
                .map_err(SseCreateError::Build)?;
        }
        Ok(Self {
            client: Box::new(builder.build()),
        })
    }
}

impl Source for SseSource {
    type Error = StreamError<es::Error>;
    type Stream = MessageStream<futures::stream::BoxStream<'static, Result<es::SSE, es::Error>>>;

    fn stream(&self) -> Self::Stream {
        MessageStream(self.client.stream())
    }
}

/// [Stream] impl mapping SSE items onto [Messages](Message).
///
/// Comments and connection notices are skipped.
#[pin_project]
pub struct MessageStream<S>(#[pin] S);

impl<S, E> Stream for MessageStream<S>
where
    S: Stream<Item = Result<es::SSE, E>>,
    E: Debug,
{
    type Item = Result<Message, StreamError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            let item = match ready!(this.0.as_mut().poll_next(cx))
                .transpose()
                .map_err(StreamError::Inner)?
            {
                Some(item) => item,
                None => return Poll::Ready(None),
            };
            // only named events carry updates
            if let es::SSE::Event(event) = item {
                let message = Message::parse(&event.event_type, &event.data)?;
                return Poll::Ready(Some(Ok(message)));
            }
        }
    }
}

/// [Source] fetching the full data set on an interval.
///
/// Each successful `GET /sdk/latest-all` is delivered as a `put`.
pub struct PollingSource {
    client: hyper::Client<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>,
    uri: http::Uri,
    token: String,
    wrapper: Option<String>,
    interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Polling URL is invalid: {0}")]
    Uri(#[from] http::uri::InvalidUri),

    #[error("Failed to build poll request: {0}")]
    Request(#[from] http::Error),

    #[error("Poll request failed: {0}")]
    Transport(#[from] hyper::Error),

    #[error("Poll returned status {0}")]
    Status(http::StatusCode),

    #[error("Failed to parse poll response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl PollingSource {
    pub fn new<T: Into<String>>(token: T, interval: Duration) -> Result<Self, PollError> {
        Self::for_url(DEFAULT_POLL_URL, token, None, interval)
    }

    pub fn for_url<T: Into<String>>(
        url: &str,
        token: T,
        wrapper: Option<&str>,
        interval: Duration,
    ) -> Result<Self, PollError> {
        let https = hyper_rustls::HttpsConnector::with_native_roots();
        Ok(Self {
            client: hyper::Client::builder().build(https),
            uri: url.parse()?,
            token: token.into(),
            wrapper: wrapper.map(str::to_string),
            interval,
        })
    }

    async fn poll_once(
        client: &hyper::Client<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>,
        uri: &http::Uri,
        token: &str,
        wrapper: Option<&str>,
    ) -> Result<Message, PollError> {
        let mut request = http::Request::get(uri.clone())
            .header(http::header::AUTHORIZATION, token)
            .header(http::header::USER_AGENT, default_user_agent());
        if let Some(wrapper) = wrapper {
            request = request.header(WRAPPER_HEADER, wrapper);
        }
        let request = request.body(hyper::Body::empty())?;

        let response = client.request(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status(status));
        }

        let body = hyper::body::aggregate(response.into_body()).await?;
        let data = serde_json::from_reader(body.reader())?;
        debug!("poll fetched full data set");
        Ok(Message::Put(data))
    }
}

impl Source for PollingSource {
    type Error = PollError;
    type Stream = Pin<Box<dyn Stream<Item = Result<Message, PollError>> + Send>>;

    fn stream(&self) -> Self::Stream {
        let client = self.client.clone();
        let uri = self.uri.clone();
        let token = self.token.clone();
        let wrapper = self.wrapper.clone();
        let interval = self.interval;

        stream::unfold(true, move |first| {
            let client = client.clone();
            let uri = uri.clone();
            let token = token.clone();
            let wrapper = wrapper.clone();
            async move {
                if !first {
                    tokio::time::sleep(interval).await;
                }
                let item =
                    Self::poll_once(&client, &uri, &token, wrapper.as_deref()).await;
                Some((item, false))
            }
        })
        .boxed()
    }
}

/// Either of the service-backed sources, chosen from configuration.
pub enum DefaultSource {
    Stream(SseSource),
    Poll(PollingSource),
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Stream(#[from] StreamError<es::Error>),

    #[error(transparent)]
    Poll(#[from] PollError),
}

impl Source for DefaultSource {
    type Error = SourceError;
    type Stream = Pin<Box<dyn Stream<Item = Result<Message, SourceError>> + Send>>;

    fn stream(&self) -> <Self as Source>::Stream {
        match self {
            DefaultSource::Stream(source) => source
                .stream()
                .map(|item| item.map_err(SourceError::from))
                .boxed(),
            DefaultSource::Poll(source) => source
                .stream()
                .map(|item| item.map_err(SourceError::from))
                .boxed(),
        }
    }
}

//! Streaming transport
//!
//! One interaction is one request. The response is consumed as a stream of
//! [`ResponseItem`]s so the tree can start patching before the server is done.
//!
//! [`Transport`] is the seam the session manager talks to; [`HttpTransport`]
//! is the reqwest implementation. Navigation side effects on the host history
//! are handled here, by [`InteractionStream`], once a response has drained.

mod http;
mod jsonlines;
mod request;

pub use http::HttpTransport;
pub use jsonlines::{decode_json_lines, JsonLinesDecoder};
pub use request::{
    build_request, FileUpload, NavigationIntent, OutboundRequest, RequestBody, UiEvent,
    UiEventPayload, BROWSER_NAVIGATION_ID, EVENT_INITIALIZE, EVENT_NAVIGATE, REFERER_HEADER,
};

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::error::TransportError;
use crate::host::Host;
use crate::tree::ResponseItem;

/// Items of one response, in arrival order.
pub type ResponseStream = BoxStream<'static, Result<ResponseItem, TransportError>>;

/// Performs interaction requests.
///
/// `send` resolves once the response head is in; the body is read lazily by
/// polling the returned stream.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<ResponseStream, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: OutboundRequest) -> Result<ResponseStream, TransportError> {
        (**self).send(request).await
    }
}

/// Send `request` and wrap the response so that a navigation updates `host`
/// history once the stream is fully drained without error.
pub async fn send_interaction(
    transport: &dyn Transport,
    host: Arc<dyn Host>,
    request: OutboundRequest,
) -> Result<InteractionStream, TransportError> {
    let navigation = request.navigation.clone();
    debug!(
        url = %request.url,
        component = %request.body.ui_event.component_id,
        event = %request.body.ui_event.event_type,
        fragment = ?request.body.fragment_id,
        multipart = request.is_multipart(),
        "sending interaction"
    );
    let inner = transport.send(request).await?;
    Ok(InteractionStream {
        inner,
        navigation,
        host,
    })
}

/// Response stream of one interaction.
///
/// Dropping it early (cancellation) skips the history update.
pub struct InteractionStream {
    inner: ResponseStream,
    navigation: Option<NavigationIntent>,
    host: Arc<dyn Host>,
}

impl InteractionStream {
    pub fn navigation(&self) -> Option<&NavigationIntent> {
        self.navigation.as_ref()
    }
}

impl Stream for InteractionStream {
    type Item = Result<ResponseItem, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match ready!(this.inner.poll_next_unpin(cx)) {
            Some(Ok(item)) => Poll::Ready(Some(Ok(item))),
            Some(Err(e)) => {
                this.navigation = None;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                if let Some(nav) = this.navigation.take() {
                    if nav.replace {
                        this.host.replace_state(&nav.url);
                    } else {
                        this.host.push_state(&nav.url);
                    }
                    debug!(url = %nav.url, replace = nav.replace, "history updated");
                }
                Poll::Ready(None)
            }
        }
    }
}

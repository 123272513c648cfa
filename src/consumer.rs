use crate::{
    message::Message,
    source::Source,
    store::{DataStore, StoreError},
};
use futures::{
    future::{self, BoxFuture, Ready},
    Future, FutureExt, StreamExt,
};
use std::{error::Error as StdError, fmt, sync::Arc};
use tokio::{sync::watch, task};
use tracing::warn;

#[derive(Clone, Debug, thiserror::Error)]
pub enum ReadError<E>
where
    E: Clone + fmt::Debug + StdError + 'static,
{
    #[error("Background task stopped before sending result")]
    TaskDropped,

    #[error("Starting stream failed 4 times in a row")]
    RetryFailed,

    #[error(transparent)]
    Inner(#[from] E),
}

/// Represents the state of a [Consumer]
/// after consuming a message
pub enum InitState {
    Pending,
    Done,
}

/// A Consumer reads messages from a source and persists them
///
/// Implemented for every [DataStore](crate::store::DataStore),
/// which is what production wires a source into.
pub trait Consumer {
    type Error;
    type Future: Future<Output = Result<InitState, Self::Error>> + Send;

    /// Process a single message coming from a [Source]
    ///
    /// Receives a shared reference only, so it stays portable and
    /// queries on stores can be made concurrently.
    /// Use atomic updates or an inner mutex to mutate.
    fn consume(&self, msg: Message) -> Self::Future;

    /// Start reading messages from a stream and provide readiness signaling
    /// and retries.
    ///
    /// Usually just wraps [`Consumer::consume`] in a background task.
    ///
    /// Default impl will abort after 4 consecutive stream failures.
    /// Waits until the consumer got the init data (transitioned to InitState::Done).
    ///
    /// When not interested in readiness, just drop the returned future. This has no
    /// bad consequences.
    fn read_from<S>(
        self: Arc<Self>,
        source: S,
    ) -> BoxFuture<'static, Result<(), ReadError<Self::Error>>>
    where
        Self: Send + Sync + 'static,
        Self::Error: fmt::Debug + StdError + Clone + Sync + Send,
        S: Source + Send + 'static,
        S::Stream: Unpin + Send,
        S::Error: fmt::Display + Send,
    {
        let (init_tx, mut init_rx) =
            watch::channel::<Option<Result<(), ReadError<Self::Error>>>>(None);

        task::spawn(async move {
            let mut stream = source.stream();
            let mut failures = 0;
            while failures < 4 {
                let msg = match stream.next().await {
                    Some(Ok(msg)) => msg,
                    Some(Err(error)) => {
                        failures += 1;
                        warn!(%error, "failed processing event, restarting stream");
                        // retry stream (usually reopens the connection)
                        stream = source.stream();
                        continue;
                    }
                    None => return,
                };
                // reset failure counter after single successful read
                failures = 0;

                match self.consume(msg).await {
                    Err(e) => {
                        let _ = init_tx.send(Some(Err(e.into())));
                    }
                    Ok(InitState::Done) => {
                        let _ = init_tx.send(Some(Ok(())));
                    }
                    Ok(InitState::Pending) => {}
                };
            }

            // Exited loop after too many failures
            let _ = init_tx.send(Some(Err(ReadError::RetryFailed)));
        });

        // future to wait for readiness
        async move {
            if init_rx.borrow().is_none() {
                init_rx
                    .changed()
                    .await
                    .map_err(|_| ReadError::TaskDropped)?;
            }
            // safe to unwrap: if it's still None at this point, it's a bug
            let res = init_rx.borrow().as_ref().cloned().unwrap();
            res
        }
        .boxed()
    }
}

/// Every store consumes messages by mapping them onto its own operations.
/// Patches and deletes arriving before the initial `put` are ignored.
impl<T> Consumer for T
where
    T: DataStore,
{
    type Error = StoreError;
    type Future = Ready<Result<InitState, Self::Error>>;

    fn consume(&self, msg: Message) -> Self::Future {
        let outcome = match msg {
            Message::Put(data) => self.init(data).map(|_| InitState::Done),
            Message::Patch { kind, item, .. } => {
                if !self.initialized() {
                    warn!("ignoring update sent before init");
                    Ok(InitState::Pending)
                } else {
                    self.upsert(kind, item).map(|_| InitState::Done)
                }
            }
            Message::Delete { kind, key, version } => {
                if !self.initialized() {
                    warn!("ignoring delete sent before init");
                    Ok(InitState::Pending)
                } else {
                    self.remove(kind, &key, version).map(|_| InitState::Done)
                }
            }
            Message::Unknown => {
                warn!("unknown update, missing some info or not yet implemented");
                Ok(if self.initialized() {
                    InitState::Done
                } else {
                    InitState::Pending
                })
            }
        };
        future::ready(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AllData;
    use crate::store::{DataKind, MemoryStore};
    use crate::test_utils::FlagBuilder;

    fn patch(key: &str, version: u64) -> Message {
        Message::Patch {
            kind: DataKind::Flag,
            key: key.to_string(),
            item: FlagBuilder::default()
                .with_key(key)
                .with_version(version)
                .into_item(),
        }
    }

    #[tokio::test]
    async fn patches_before_init_are_ignored() {
        let store = MemoryStore::new();
        let state = store.consume(patch("f", 1)).await.expect("consume");
        assert!(matches!(state, InitState::Pending));
        assert!(store.get(DataKind::Flag, "f").expect("get").is_none());
    }

    #[tokio::test]
    async fn put_then_patch_then_delete() {
        let store = MemoryStore::new();

        let state = store
            .consume(Message::Put(AllData::default()))
            .await
            .expect("consume");
        assert!(matches!(state, InitState::Done));
        assert!(store.initialized());

        store.consume(patch("f", 2)).await.expect("consume");
        assert_eq!(
            store
                .get(DataKind::Flag, "f")
                .expect("get")
                .expect("item")
                .version(),
            2
        );

        store
            .consume(Message::Delete {
                kind: DataKind::Flag,
                key: "f".to_string(),
                version: 3,
            })
            .await
            .expect("consume");
        assert!(store.get(DataKind::Flag, "f").expect("get").is_none());
    }
}

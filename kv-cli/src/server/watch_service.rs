use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use kvcore::error::Error;
use kvcore::kvstore::KeyRecord;
use kvcore::watch::{Event, EventKind, Filter, WatchId, WatchUpdate};

use crate::pb::etcdserverpb::event::EventType;
use crate::pb::etcdserverpb::watch_request::RequestUnion;
use crate::pb::etcdserverpb::watch_server::Watch;
use crate::pb::etcdserverpb::{self, KeyValue, WatchRequest, WatchResponse};
use crate::server::auth::PermType;
use crate::server::{bearer_token, header, require_permission, Shared};

pub struct WatchService {
    shared: Arc<Shared>,
}

impl WatchService {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

fn to_keyvalue(record: &KeyRecord, key: Vec<u8>) -> KeyValue {
    KeyValue {
        key,
        create_revision: record.create_revision,
        mod_revision: record.mod_revision,
        version: record.version,
        value: record.value.clone(),
        lease: record.lease,
    }
}

fn to_event(event: Event) -> etcdserverpb::Event {
    let kv = event.record.as_ref().map(|r| to_keyvalue(r, event.key.clone()));
    let prev_kv = event.prev_record.as_ref().map(|r| to_keyvalue(r, event.key.clone()));
    let event_type = match event.kind {
        EventKind::Put => EventType::Put,
        EventKind::Delete => EventType::Delete,
    };
    etcdserverpb::Event { r#type: event_type as i32, kv, prev_kv }
}

#[tonic::async_trait]
impl Watch for WatchService {
    type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchResponse, Status>> + Send + 'static>>;

    async fn watch(
        &self,
        request: Request<Streaming<WatchRequest>>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let token = bearer_token(&request);
        let mut incoming = request.into_inner();
        let shared = self.shared.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            // One forwarding task per active subscription, each draining its
            // own kvcore watch receiver into the shared outbound channel.
            let mut forwarders: Vec<tokio::task::JoinHandle<()>> = Vec::new();

            while let Some(Ok(req)) = incoming.next().await {
                match req.request_union {
                    Some(RequestUnion::CreateRequest(create)) => {
                        if let Err(status) =
                            require_permission(&shared, &token, PermType::Read, &create.key, &create.range_end)
                        {
                            if tx.send(Err(status)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        let mut filters = Vec::new();
                        if create.no_put {
                            filters.push(Filter::NoPut);
                        }
                        if create.no_delete {
                            filters.push(Filter::NoDelete);
                        }
                        let start_revision =
                            if create.start_revision > 0 { Some(create.start_revision) } else { None };
                        let current = shared.node.current_revision();

                        match shared.node.watches().watch(
                            create.key,
                            create.range_end,
                            start_revision,
                            current,
                            filters,
                        ) {
                            Ok((id, receiver)) => {
                                let created = WatchResponse {
                                    header: Some(header(&shared)),
                                    watch_id: id,
                                    created: true,
                                    canceled: false,
                                    cancel_reason: String::new(),
                                    events: Vec::new(),
                                };
                                if tx.send(Ok(created)).await.is_err() {
                                    break;
                                }
                                forwarders.push(spawn_forwarder(tx.clone(), shared.clone(), id, receiver));
                            }
                            Err(Error::Compacted { compact_revision }) => {
                                let canceled = WatchResponse {
                                    header: Some(header(&shared)),
                                    watch_id: 0,
                                    created: false,
                                    canceled: true,
                                    cancel_reason: format!("compacted at revision {compact_revision}"),
                                    events: Vec::new(),
                                };
                                if tx.send(Ok(canceled)).await.is_err() {
                                    break;
                                }
                            }
                            Err(other) => {
                                if tx.send(Err(crate::server::to_status(other))).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(RequestUnion::CancelRequest(cancel)) => {
                        shared.node.watches().cancel(cancel.watch_id as WatchId);
                        let response = WatchResponse {
                            header: Some(header(&shared)),
                            watch_id: cancel.watch_id,
                            created: false,
                            canceled: true,
                            cancel_reason: String::new(),
                            events: Vec::new(),
                        };
                        if tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                    }
                    None => {}
                }
            }

            for handle in forwarders {
                handle.abort();
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

fn spawn_forwarder(
    tx: tokio::sync::mpsc::Sender<Result<WatchResponse, Status>>,
    shared: Arc<Shared>,
    id: WatchId,
    mut receiver: tokio::sync::mpsc::Receiver<WatchUpdate>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = receiver.recv().await {
            let response = match update {
                WatchUpdate::Events { events, .. } => WatchResponse {
                    header: Some(header(&shared)),
                    watch_id: id,
                    created: false,
                    canceled: false,
                    cancel_reason: String::new(),
                    events: events.into_iter().map(to_event).collect(),
                },
                WatchUpdate::Canceled { reason } => WatchResponse {
                    header: Some(header(&shared)),
                    watch_id: id,
                    created: false,
                    canceled: true,
                    cancel_reason: reason,
                    events: Vec::new(),
                },
            };
            if tx.send(Ok(response)).await.is_err() {
                break;
            }
        }
    })
}

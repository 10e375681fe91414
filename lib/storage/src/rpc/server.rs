//! RPC server: hyper accepts the CONNECT handshake, then the connection becomes a raw,
//! length-prefixed msgpack frame stream dispatched against the handlers (SPEC_FULL.md §4.3/§6).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method as HttpMethod, Request, Response, Server, StatusCode};

use crate::envelope::{Frame, Method, WireResult};
use crate::error::StorageResult;
use crate::handlers::Handlers;
use crate::rpc::codec::{read_frame, write_frame};

pub async fn serve(addr: SocketAddr, handlers: Arc<Handlers>) -> StorageResult<()> {
    let make_svc = make_service_fn(move |_conn| {
        let handlers = handlers.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle_connect(req, handlers.clone()))) }
    });

    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|err| crate::error::StorageError::service_error(err.to_string()))
}

async fn handle_connect(req: Request<Body>, handlers: Arc<Handlers>) -> Result<Response<Body>, Infallible> {
    if req.method() != HttpMethod::CONNECT {
        return Ok(Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Body::from("expected CONNECT"))
            .unwrap());
    }

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(err) = frame_loop(upgraded, handlers).await {
                    log::warn!("rpc connection ended with error: {err}");
                }
            }
            Err(err) => log::warn!("rpc upgrade failed: {err}"),
        }
    });

    Ok(Response::new(Body::empty()))
}

async fn frame_loop(mut stream: hyper::upgrade::Upgraded, handlers: Arc<Handlers>) -> StorageResult<()> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return Ok(()), // peer closed the connection; not an error worth surfacing
        };
        let reply = dispatch(&handlers, frame).await;
        write_frame(&mut stream, &reply).await?;
    }
}

macro_rules! dispatch_method {
    ($handlers:expr, $frame:expr, $method:ident, $handler_fn:ident) => {{
        let request = rmp_serde::from_slice(&$frame.body)
            .map_err(|err| crate::error::StorageError::service_error(err.to_string()));
        let result = match request {
            Ok(request) => $handlers.$handler_fn(&$frame.header.dest, request).await,
            Err(err) => Err(err),
        };
        rmp_serde::to_vec_named(&WireResult::from_result(result)).unwrap_or_default()
    }};
}

async fn dispatch(handlers: &Arc<Handlers>, frame: Frame) -> Frame {
    let header = crate::envelope::Header {
        source: frame.header.dest.clone(),
        dest: frame.header.source.clone(),
        method: frame.header.method,
        seq: frame.header.seq,
    };

    let body = match frame.header.method {
        Method::Ping => dispatch_method!(handlers, frame, Ping, ping),
        Method::CreateCollection => dispatch_method!(handlers, frame, CreateCollection, create_collection),
        Method::DeleteCollection => dispatch_method!(handlers, frame, DeleteCollection, delete_collection),
        Method::ListCollections => dispatch_method!(handlers, frame, ListCollections, list_collections),
        Method::GetCollection => dispatch_method!(handlers, frame, GetCollection, get_collection),
        Method::CreateShard => dispatch_method!(handlers, frame, CreateShard, create_shard),
        Method::GetShardInfo => dispatch_method!(handlers, frame, GetShardInfo, get_shard_info),
        Method::DeleteCollectionShards => {
            dispatch_method!(handlers, frame, DeleteCollectionShards, delete_collection_shards)
        }
        Method::InsertPoints => dispatch_method!(handlers, frame, InsertPoints, insert_points),
        Method::UpdatePoints => dispatch_method!(handlers, frame, UpdatePoints, update_points),
        Method::DeletePoints => dispatch_method!(handlers, frame, DeletePoints, delete_points),
        Method::SearchPoints => dispatch_method!(handlers, frame, SearchPoints, search_points),
        Method::SetNodeKeyValue => dispatch_method!(handlers, frame, SetNodeKeyValue, set_node_key_value),
        Method::SendShard => dispatch_method!(handlers, frame, SendShard, send_shard),
    };

    Frame { header, body }
}

//! Client-facing gRPC façade: OpenSession, Get and Update.
//!
//! Pre-checks (request type, password, leadership, session) run here and
//! fail fast without touching consensus; everything else goes through
//! [`KvServer::submit`].

use std::sync::Arc;

use uuid::Uuid;

use crate::kv::Command;
use crate::metrics;
use crate::server::KvServer;

pub mod pb {
    tonic::include_proto!("kvservice");
}

use pb::kv_service_server::KvService;
use pb::{
    ErrCode, GetReply, GetRequest, OpenSessionReply, OpenSessionRequest, RequestType, UpdateReply,
    UpdateRequest,
};

pub struct KvServiceSVC {
    server: Arc<KvServer>,
}

impl KvServiceSVC {
    pub fn new(server: Arc<KvServer>) -> Self {
        KvServiceSVC { server }
    }
}

#[tonic::async_trait]
impl KvService for KvServiceSVC {
    async fn open_session(
        &self,
        request: tonic::Request<OpenSessionRequest>,
    ) -> Result<tonic::Response<OpenSessionReply>, tonic::Status> {
        let server = self.server.clone();
        metrics::record_metrics("open_session", || async move {
            let req = request.into_inner();
            let mut reply = OpenSessionReply {
                err_code: ErrCode::Ok as i32,
                session_id: String::new(),
            };
            if req.request_type() != RequestType::OpenSession {
                reply.err_code = ErrCode::InvalidRequestType as i32;
                return Ok(tonic::Response::new(reply));
            }
            if !server.password_matches(&req.password) {
                reply.err_code = ErrCode::InvalidPassword as i32;
                return Ok(tonic::Response::new(reply));
            }

            let command = Command::OpenSession {
                nonce: Uuid::new_v4().to_string(),
            };
            match server.submit(&command).await {
                Some(result) => {
                    reply.session_id = result.session_id.unwrap_or_default();
                    if server.verbose() {
                        log::info!(
                            "[{}] OpenSession finished, session_id={}",
                            server.me(),
                            reply.session_id
                        );
                    }
                }
                None => reply.err_code = ErrCode::WrongLeader as i32,
            }
            Ok(tonic::Response::new(reply))
        })
        .await
    }

    async fn get(
        &self,
        request: tonic::Request<GetRequest>,
    ) -> Result<tonic::Response<GetReply>, tonic::Status> {
        let server = self.server.clone();
        metrics::record_metrics("get", || async move {
            let req = request.into_inner();
            let mut reply = GetReply {
                err_code: ErrCode::Ok as i32,
                value: String::new(),
            };
            if req.request_type() != RequestType::Get {
                reply.err_code = ErrCode::InvalidRequestType as i32;
                return Ok(tonic::Response::new(reply));
            }
            if !server.is_leader() {
                reply.err_code = ErrCode::WrongLeader as i32;
                return Ok(tonic::Response::new(reply));
            }
            if !server.check_session(&req.session_id) {
                reply.err_code = ErrCode::InvalidSession as i32;
                return Ok(tonic::Response::new(reply));
            }

            // Replicating the read fixes its place in the log: the reply
            // below reflects every write committed before it, and a node
            // that lost leadership cannot answer from stale state.
            let command = Command::Get {
                key: req.key.clone(),
            };
            match server.submit(&command).await {
                Some(_) => match server.read(&req.key) {
                    Some(value) => reply.value = value,
                    None => reply.err_code = ErrCode::NoKey as i32,
                },
                None => reply.err_code = ErrCode::WrongLeader as i32,
            }
            if server.verbose() {
                log::info!(
                    "[{}] Get finished, key={}, err_code={}, session_id={}",
                    server.me(),
                    req.key,
                    reply.err_code,
                    req.session_id
                );
            }
            Ok(tonic::Response::new(reply))
        })
        .await
    }

    async fn update(
        &self,
        request: tonic::Request<UpdateRequest>,
    ) -> Result<tonic::Response<UpdateReply>, tonic::Status> {
        let server = self.server.clone();
        metrics::record_metrics("update", || async move {
            let req = request.into_inner();
            let mut reply = UpdateReply {
                err_code: ErrCode::Ok as i32,
            };
            let request_type = req.request_type();
            let command = match request_type {
                RequestType::Put => Command::Put {
                    key: req.key.clone(),
                    value: req.value.clone(),
                },
                RequestType::Append => Command::Append {
                    key: req.key.clone(),
                    value: req.value.clone(),
                },
                RequestType::Delete => Command::Delete {
                    key: req.key.clone(),
                },
                _ => {
                    reply.err_code = ErrCode::InvalidRequestType as i32;
                    return Ok(tonic::Response::new(reply));
                }
            };
            if !server.is_leader() {
                reply.err_code = ErrCode::WrongLeader as i32;
                return Ok(tonic::Response::new(reply));
            }
            if !server.check_session(&req.session_id) {
                reply.err_code = ErrCode::InvalidSession as i32;
                return Ok(tonic::Response::new(reply));
            }

            if server.submit(&command).await.is_none() {
                reply.err_code = ErrCode::WrongLeader as i32;
            }
            if server.verbose() {
                log::info!(
                    "[{}] {:?} finished, key={}, err_code={}, session_id={}",
                    server.me(),
                    request_type,
                    req.key,
                    reply.err_code,
                    req.session_id
                );
            }
            Ok(tonic::Response::new(reply))
        })
        .await
    }
}

//! Inbound raft transport: peers stream serialized raft messages here and
//! they are forwarded into the driver's mailbox.

use protobuf::Message as PbMessage;
use raft::eraftpb::Message as RaftMessage;
use tokio::sync::mpsc::Sender;
use tonic::Streaming;

pub mod pb {
    tonic::include_proto!("raft");
}

use pb::raft_service_server::RaftService;
use pb::{PostDataRequest, PostDataResponse};

pub struct RaftServiceSVC {
    mailbox: Sender<RaftMessage>,
}

impl RaftServiceSVC {
    pub fn new(mailbox: Sender<RaftMessage>) -> Self {
        RaftServiceSVC { mailbox }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn post_data(
        &self,
        request: tonic::Request<Streaming<PostDataRequest>>,
    ) -> Result<tonic::Response<PostDataResponse>, tonic::Status> {
        let mut stream = request.into_inner();
        while let Some(req) = stream.message().await? {
            match RaftMessage::parse_from_bytes(req.data.as_slice()) {
                Ok(message) => {
                    if self.mailbox.send(message).await.is_err() {
                        log::warn!("raft driver mailbox closed, dropping stream");
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("undecodable raft message: {}", e);
                    continue;
                }
            }
        }
        Ok(tonic::Response::new(PostDataResponse::default()))
    }
}

use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use uuid::Uuid;

use crate::claim::ClaimId;
use crate::core::SchedulerHandle;
use crate::grpc::convert::{
    header_from_proto, job_from_submit, job_id_from_proto, matchmaker_message_from_proto,
};
use crate::proto;
use crate::proto::scheduler_service_server::SchedulerService;

/// Messages buffered towards a matchmaker before the session stalls.
const OUTBOUND_BUFFER: usize = 64;

type ScheddStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<proto::ScheddMessage, Status>> + Send>>;

/// gRPC front end of the scheduler core.
pub struct ScheddService {
    handle: SchedulerHandle,
}

impl ScheddService {
    pub fn new(handle: SchedulerHandle) -> Self {
        Self { handle }
    }
}

/// Pump matchmaker messages into the core until the session ends.
async fn drive_session(
    handle: &SchedulerHandle,
    session: Uuid,
    inbound: &mut Streaming<proto::NegotiatorMessage>,
    outbound: &mpsc::Sender<Result<proto::ScheddMessage, Status>>,
) -> Result<(), Status> {
    loop {
        let Some(msg) = inbound.message().await? else {
            return Err(Status::aborted("matchmaker closed the stream mid-session"));
        };
        let message = matchmaker_message_from_proto(msg)?;
        let step = handle.negotiation_message(session, message).await?;
        for reply in step.replies {
            outbound
                .send(Ok(reply.into()))
                .await
                .map_err(|_| Status::cancelled("matchmaker went away"))?;
        }
        if step.ended {
            return Ok(());
        }
    }
}

#[tonic::async_trait]
impl SchedulerService for ScheddService {
    type NegotiateStream = ScheddStream;

    async fn negotiate(
        &self,
        request: Request<Streaming<proto::NegotiatorMessage>>,
    ) -> Result<Response<Self::NegotiateStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("negotiation closed before the header"))?;
        let header = header_from_proto(first)?;
        let session = self.handle.begin_negotiation(header).await?;

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            match drive_session(&handle, session, &mut inbound, &tx).await {
                Ok(()) => tracing::debug!(session = %session, "Negotiation stream finished"),
                Err(status) => {
                    tracing::warn!(session = %session, error = %status.message(), "Negotiation stream failed");
                    handle.abort_negotiation(session);
                    let _ = tx.send(Err(status)).await;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::NegotiateStream))
    }

    async fn release_claim(
        &self,
        request: Request<proto::ReleaseClaimRequest>,
    ) -> Result<Response<proto::ReleaseClaimResponse>, Status> {
        let req = request.into_inner();
        if req.claim_id.is_empty() {
            return Err(Status::invalid_argument("claim_id cannot be empty"));
        }
        let found = self.handle.release_claim(ClaimId::new(req.claim_id)).await?;
        Ok(Response::new(proto::ReleaseClaimResponse { found }))
    }

    async fn reassign_slot(
        &self,
        request: Request<proto::ReassignSlotRequest>,
    ) -> Result<Response<proto::ReassignSlotResponse>, Status> {
        let req = request.into_inner();
        let beneficiary = job_id_from_proto(req.beneficiary, "beneficiary")?;
        let victims = req
            .victims
            .into_iter()
            .map(|victim| job_id_from_proto(Some(victim), "victims"))
            .collect::<Result<Vec<_>, Status>>()?;
        self.handle.reassign_slot(beneficiary, victims).await?;
        Ok(Response::new(proto::ReassignSlotResponse {}))
    }

    async fn recycle_handler(
        &self,
        request: Request<proto::RecycleHandlerRequest>,
    ) -> Result<Response<proto::RecycleHandlerResponse>, Status> {
        let req = request.into_inner();
        let previous = job_id_from_proto(req.previous_job, "previous_job")?;
        let next = self
            .handle
            .recycle_handler(previous, req.previous_exit_code)
            .await?;
        let response = match next {
            Some(recycled) => proto::RecycleHandlerResponse {
                next_job: Some(recycled.job_id.into()),
                job_ad_json: recycled.job_ad.to_json(),
            },
            None => proto::RecycleHandlerResponse::default(),
        };
        Ok(Response::new(response))
    }

    async fn ack_recycle(
        &self,
        request: Request<proto::AckRecycleRequest>,
    ) -> Result<Response<proto::AckRecycleResponse>, Status> {
        let job_id = job_id_from_proto(request.into_inner().job, "job")?;
        self.handle.ack_recycle(job_id).await?;
        Ok(Response::new(proto::AckRecycleResponse {}))
    }

    async fn submit_job(
        &self,
        request: Request<proto::SubmitJobRequest>,
    ) -> Result<Response<proto::SubmitJobResponse>, Status> {
        let job = job_from_submit(request.into_inner())?;
        let id = self.handle.submit_job(job).await?;
        Ok(Response::new(proto::SubmitJobResponse {
            job: Some(id.into()),
        }))
    }

    async fn hold_job(
        &self,
        request: Request<proto::HoldJobRequest>,
    ) -> Result<Response<proto::HoldJobResponse>, Status> {
        let req = request.into_inner();
        let job_id = job_id_from_proto(req.job, "job")?;
        let reason = if req.reason.is_empty() {
            "held by user".to_string()
        } else {
            req.reason
        };
        self.handle.hold_job(job_id, reason).await?;
        Ok(Response::new(proto::HoldJobResponse {}))
    }

    async fn remove_job(
        &self,
        request: Request<proto::RemoveJobRequest>,
    ) -> Result<Response<proto::RemoveJobResponse>, Status> {
        let req = request.into_inner();
        let job_id = job_id_from_proto(req.job, "job")?;
        self.handle.remove_job(job_id).await?;
        if req.force {
            self.handle.purge_job(job_id).await?;
        }
        Ok(Response::new(proto::RemoveJobResponse {}))
    }

    async fn get_status(
        &self,
        _request: Request<proto::GetStatusRequest>,
    ) -> Result<Response<proto::GetStatusResponse>, Status> {
        let report = self.handle.status().await?;
        Ok(Response::new(report.into()))
    }
}

use chrono::Utc;
use tracing::{debug, info};

use crate::database::catalog::ChannelAdmissionContext;
use crate::database::sessions::{NewSession, SlotReservation};
use crate::database::Database;
use crate::errors::AppResult;
use crate::models::*;

/// Answers whether a new stream for a URL may start right now
#[derive(Clone)]
pub struct AdmissionOracle {
    database: Database,
}

impl AdmissionOracle {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Check only, nothing is reserved
    pub async fn decide(&self, stream_url: &str) -> AppResult<AdmissionDecision> {
        let context = self.database.find_channel_admission_context(stream_url).await?;
        let decision = evaluate(context.as_ref());
        debug!("Admission for {}: {:?}", stream_url, decision);
        Ok(decision)
    }

    /// Decide and, when admitted, hold a stream slot for the requesting
    /// client. The capacity check and the counter increment are one step.
    pub async fn admit(&self, request: &AdmissionRequest) -> AppResult<AdmissionDecision> {
        let context = self
            .database
            .find_channel_admission_context(&request.stream_url)
            .await?;
        let decision = evaluate(context.as_ref());
        let (Some(context), AdmissionDecision::Admitted) = (context, decision) else {
            debug!("Admission for {}: {:?}", request.stream_url, decision);
            return Ok(decision);
        };

        let key = request.session_key();
        let reservation = self
            .database
            .reserve_stream_slot(&NewSession {
                session_key: &key,
                stream_url: &request.stream_url,
                client_address: &request.client,
                channel_id: context.channel_id,
                source_id: context.source_id,
                proxy_name: &request.proxy_name,
                started_at: Utc::now(),
            })
            .await?;

        Ok(match reservation {
            SlotReservation::Reserved => AdmissionDecision::Admitted,
            SlotReservation::Inherited => {
                info!("Session {} restarted, keeping its stream slot", key);
                AdmissionDecision::Admitted
            }
            SlotReservation::Full => {
                debug!("Source '{}' filled up while admitting {}", context.source_name, key);
                AdmissionDecision::Denied(DenyReason::CapacityExhausted)
            }
        })
    }

    /// Extra tag lines of the channel behind a URL, empty when unknown
    pub async fn channel_opts(&self, stream_url: &str) -> AppResult<String> {
        Ok(self
            .database
            .find_channel_admission_context(stream_url)
            .await?
            .map(|context| context.extra_tag_lines)
            .unwrap_or_default())
    }
}

fn evaluate(context: Option<&ChannelAdmissionContext>) -> AdmissionDecision {
    let Some(context) = context else {
        return AdmissionDecision::Denied(DenyReason::UnknownChannel);
    };

    if !context.source_enabled {
        AdmissionDecision::Denied(DenyReason::SourceDisabled)
    } else if !context.group_enabled {
        AdmissionDecision::Denied(DenyReason::GroupDisabled)
    } else if !context.channel_enabled {
        AdmissionDecision::Denied(DenyReason::ChannelDisabled)
    } else if context.max_concurrent_streams > 0
        && context.active_stream_count >= context.max_concurrent_streams
    {
        AdmissionDecision::Denied(DenyReason::CapacityExhausted)
    } else {
        AdmissionDecision::Admitted
    }
}

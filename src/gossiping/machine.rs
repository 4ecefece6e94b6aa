// Copyright 2026 The megolm-engine contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{collections::BTreeMap, sync::Arc};

use ruma::{
    to_device::DeviceIdOrAllDevices, OwnedDeviceId, OwnedUserId, TransactionId, UserId,
};
use tracing::{debug, info, trace};

use super::{OutgoingKeyRequest, RequestState};
use crate::{
    error::OlmResult,
    store::CryptoStore,
    transport::{ToDeviceRequest, Transport},
    types::{
        events::{EventType, RoomKeyRequestContent},
        RoomKeyRequestBody,
    },
};

/// The persistent state machine driving our outgoing room key requests.
///
/// One logical request exists per canonical body. Requests move through
/// `Unsent -> Sent -> CancellationPending(AndWillResend)` and every wire
/// send gets a transaction ID that was never used before, so receiving
/// devices can't mistake a genuine retry for a duplicate.
#[derive(Debug)]
pub struct KeyRequestMachine {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    store: Arc<dyn CryptoStore>,
    transport: Arc<dyn Transport>,
}

impl KeyRequestMachine {
    /// Create a new request machine for our own device.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        store: Arc<dyn CryptoStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            user_id,
            device_id,
            store,
            transport,
        }
    }

    /// Make sure a live request exists for the given body.
    ///
    /// Duplicate bodies collapse into the existing request. A request that
    /// is waiting for its cancellation to flush is flipped into
    /// "cancel, then send a fresh request".
    ///
    /// Returns true if a new request was created.
    pub async fn ensure_request(&self, body: RoomKeyRequestBody) -> OlmResult<bool> {
        if let Some(existing) = self.store.get_key_request_by_info(&body).await? {
            if existing.state == RequestState::CancellationPending {
                trace!(
                    request_id = ?existing.request_id,
                    "A key request being cancelled is needed again, scheduling a resend"
                );

                let mut update = existing.clone();
                update.state = RequestState::CancellationPendingAndWillResend;
                self.store
                    .update_key_request(
                        &existing.request_id,
                        RequestState::CancellationPending,
                        update,
                    )
                    .await?;
            }

            return Ok(false);
        }

        let request = OutgoingKeyRequest {
            request_id: TransactionId::new(),
            body,
            recipients: vec![self.user_id.clone()],
            state: RequestState::Unsent,
        };

        info!(
            request_id = ?request.request_id,
            room_id = ?request.body.room_id,
            session_id = request.body.session_id,
            "Created a new outgoing room key request"
        );

        self.store.save_key_request(&request).await?;

        Ok(true)
    }

    /// Cancel the request for the given body, if one is live.
    ///
    /// A request that never went out is deleted on the spot, a sent one is
    /// scheduled for a wire-level cancellation.
    pub async fn cancel_request(&self, body: &RoomKeyRequestBody) -> OlmResult<()> {
        let Some(request) = self.store.get_key_request_by_info(body).await? else {
            return Ok(());
        };

        match request.state {
            RequestState::Unsent => {
                debug!(
                    request_id = ?request.request_id,
                    "Deleting a key request that was never sent"
                );
                self.store
                    .delete_key_request(&request.request_id, RequestState::Unsent)
                    .await?;
            }
            RequestState::Sent | RequestState::CancellationPendingAndWillResend => {
                let expected = request.state;
                let mut update = request.clone();
                update.state = RequestState::CancellationPending;
                self.store
                    .update_key_request(&request.request_id, expected, update)
                    .await?;
            }
            RequestState::CancellationPending => {}
        }

        Ok(())
    }

    /// Cancel the request for the given body and schedule a fresh request
    /// for the same body once the cancellation went out.
    pub async fn cancel_and_resend(&self, body: &RoomKeyRequestBody) -> OlmResult<()> {
        let Some(request) = self.store.get_key_request_by_info(body).await? else {
            return Ok(());
        };

        match request.state {
            // Not out yet, the pending send already covers it.
            RequestState::Unsent | RequestState::CancellationPendingAndWillResend => {}
            RequestState::Sent | RequestState::CancellationPending => {
                let expected = request.state;
                let mut update = request.clone();
                update.state = RequestState::CancellationPendingAndWillResend;
                self.store
                    .update_key_request(&request.request_id, expected, update)
                    .await?;
            }
        }

        Ok(())
    }

    /// Cancel and resend every sent request that was targeted at devices of
    /// the given user.
    ///
    /// Used after a wedged Olm channel was repaired, the answer to those
    /// requests may have been lost in the wedged channel.
    pub async fn cancel_and_resend_for_target(&self, user_id: &UserId) -> OlmResult<()> {
        for request in self
            .store
            .get_key_requests_by_state(RequestState::Sent)
            .await?
        {
            if request.sent_to(user_id) {
                self.cancel_and_resend(&request.body).await?;
            }
        }

        Ok(())
    }

    /// Send out everything the state machine has queued up.
    ///
    /// Cancellations are always flushed before any replacement request for
    /// the same body, as separate to-device transactions.
    pub async fn send_outgoing_requests(&self) -> OlmResult<()> {
        for request in self
            .store
            .get_key_requests_by_state(RequestState::CancellationPending)
            .await?
        {
            self.send_cancellation(&request).await?;
            self.store
                .delete_key_request(&request.request_id, RequestState::CancellationPending)
                .await?;
        }

        for request in self
            .store
            .get_key_requests_by_state(RequestState::CancellationPendingAndWillResend)
            .await?
        {
            self.send_cancellation(&request).await?;

            // The replacement is a brand new logical request.
            let mut replacement = request.clone();
            replacement.request_id = TransactionId::new();
            replacement.state = RequestState::Unsent;

            debug!(
                old_request_id = ?request.request_id,
                request_id = ?replacement.request_id,
                "Recreating a cancelled key request under a fresh request ID"
            );

            self.store
                .update_key_request(
                    &request.request_id,
                    RequestState::CancellationPendingAndWillResend,
                    replacement,
                )
                .await?;
        }

        for request in self
            .store
            .get_key_requests_by_state(RequestState::Unsent)
            .await?
        {
            self.send_request(&request).await?;

            let mut update = request.clone();
            update.state = RequestState::Sent;
            self.store
                .update_key_request(&request.request_id, RequestState::Unsent, update)
                .await?;
        }

        Ok(())
    }

    async fn send_request(&self, request: &OutgoingKeyRequest) -> OlmResult<()> {
        let content = RoomKeyRequestContent::new_request(
            request.body.clone(),
            self.device_id.clone(),
            request.request_id.clone(),
        );

        info!(
            request_id = ?request.request_id,
            room_id = ?request.body.room_id,
            session_id = request.body.session_id,
            "Sending an outgoing room key request"
        );

        self.send_content(&request.recipients, &content).await
    }

    async fn send_cancellation(&self, request: &OutgoingKeyRequest) -> OlmResult<()> {
        let content = RoomKeyRequestContent::new_cancellation(
            self.device_id.clone(),
            request.request_id.clone(),
        );

        info!(
            request_id = ?request.request_id,
            "Sending a room key request cancellation"
        );

        self.send_content(&request.recipients, &content).await
    }

    async fn send_content(
        &self,
        recipients: &[OwnedUserId],
        content: &RoomKeyRequestContent,
    ) -> OlmResult<()> {
        let content = serde_json::to_value(content)?;

        let messages = recipients
            .iter()
            .map(|user_id| {
                (
                    user_id.clone(),
                    BTreeMap::from([(DeviceIdOrAllDevices::AllDevices, content.clone())]),
                )
            })
            .collect();

        let request = ToDeviceRequest::new(RoomKeyRequestContent::EVENT_TYPE, messages);

        self.transport.send_to_device(&request).await?;

        Ok(())
    }
}

impl KeyRequestMachine {
    /// Does an outstanding (already sent) request exist for this body with
    /// the given user among its recipients.
    pub async fn outstanding_request_to(
        &self,
        body: &RoomKeyRequestBody,
        user_id: &UserId,
    ) -> OlmResult<bool> {
        Ok(self
            .store
            .get_key_request_by_info(body)
            .await?
            .map(|r| {
                matches!(
                    r.state,
                    RequestState::Sent
                        | RequestState::CancellationPendingAndWillResend
                        | RequestState::Unsent
                ) && r.sent_to(user_id)
            })
            .unwrap_or(false))
    }
}

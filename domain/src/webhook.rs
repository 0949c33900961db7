//! Dispatch of verified provider webhooks.

use chrono::Duration;
use connect_auth::oauth::token::{Manager, Storage};
use connect_auth::oauth::ProviderKind;
use connect_auth::webhook::ProviderEvent;
use log::*;
use serde::Serialize;
use url::Url;

use crate::data_deletion::DeletionQueue;
use crate::error::Error;

/// Body returned to a provider for a data-deletion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionReceipt {
    pub url: String,
    pub confirmation_code: String,
}

/// How a verified webhook was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookAck {
    /// Deauthorizations and unrecognised events: nothing to return but success.
    Acknowledged,
    DataDeletion(DeletionReceipt),
}

/// Act on an authenticated event.
///
/// A deauthorization unlinks every user linked to the account; an unknown account is already
/// unlinked and is acknowledged as such. A deletion request is handed to `deletions` and
/// answered with the status URL for its confirmation code.
pub(crate) async fn dispatch<S: Storage>(
    manager: &Manager<S>,
    deletions: &dyn DeletionQueue,
    status_base: &Url,
    sla: Duration,
    provider: ProviderKind,
    event: ProviderEvent,
) -> Result<WebhookAck, Error> {
    match event {
        ProviderEvent::Deauthorization { account_id } => {
            let owners = manager.unlink_account(provider, &account_id).await?;
            if owners.is_empty() {
                info!(
                    "{} deauthorized account {} which has no link",
                    provider, account_id
                );
            } else {
                info!(
                    "{} deauthorized account {}; unlinked users {}",
                    provider,
                    account_id,
                    owners.join(", ")
                );
            }
            Ok(WebhookAck::Acknowledged)
        }
        ProviderEvent::DataDeletion { account_id } => {
            let owner_ids = manager.find_owners(provider, &account_id).await?;
            let request = deletions
                .enqueue(provider, &account_id, owner_ids, sla)
                .await?;

            let mut url = status_base.clone();
            url.query_pairs_mut()
                .append_pair("code", &request.confirmation_code);

            Ok(WebhookAck::DataDeletion(DeletionReceipt {
                url: url.to_string(),
                confirmation_code: request.confirmation_code,
            }))
        }
        ProviderEvent::Ignored { event } => {
            debug!("Ignoring {} webhook event {}", provider, event);
            Ok(WebhookAck::Acknowledged)
        }
    }
}

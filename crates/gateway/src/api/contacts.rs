//! Contact ingestion: bulk add to a campaign, and the one-shot
//! create-and-start used by the dashboard's CSV upload. The upload and
//! parsing pipeline lives upstream; this endpoint receives the parsed
//! rows.

use axum::extract::{Path, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use vox_domain::model::{CampaignSettings, Contact, ContactStatus};

use crate::api::respond::{ApiError, ApiResult};
use crate::state::AppState;

/// E.164: leading `+`, 8–15 digits.
pub fn validate_phone(phone: &str) -> Result<(), ApiError> {
    let digits = phone.strip_prefix('+').unwrap_or("");
    let ok = !digits.is_empty()
        && digits.len() >= 8
        && digits.len() <= 15
        && digits.chars().all(|c| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(ApiError::validation(
            format!("not an E.164 phone number: {phone}"),
            vec!["phone".into()],
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRow {
    pub phone: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub do_not_call: Option<bool>,
}

impl ContactRow {
    fn into_contact(self) -> Result<Contact, ApiError> {
        validate_phone(&self.phone)?;
        if self.name.trim().is_empty() {
            return Err(ApiError::validation(
                "contact name must not be empty",
                vec!["name".into()],
            ));
        }
        let mut contact = Contact::new(self.phone, self.name.trim());
        contact.email = self.email;
        contact.priority = self.priority.unwrap_or(0);
        if self.do_not_call.unwrap_or(false) {
            contact.status = ContactStatus::DoNotCall;
        }
        Ok(contact)
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkAddBody {
    pub contacts: Vec<ContactRow>,
}

/// `POST /api/campaigns/:id/contacts`
pub async fn add_to_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<BulkAddBody>,
) -> ApiResult<Json<Value>> {
    if state.campaigns.get(&id).is_none() {
        return Err(ApiError::not_found(format!("campaign {id}")));
    }
    if body.contacts.is_empty() {
        return Err(ApiError::validation(
            "contacts must not be empty",
            vec!["contacts".into()],
        ));
    }

    let rows: Result<Vec<Contact>, ApiError> = body
        .contacts
        .into_iter()
        .map(ContactRow::into_contact)
        .collect();
    let report = state.contacts.add_to_campaign(id, rows?).await;

    let total = state.contacts.list_for_campaign(&id).len() as u64;
    let campaign = state
        .campaigns
        .update(&id, |c| c.stats.total_contacts = total)
        .await
        .ok_or_else(|| ApiError::not_found(format!("campaign {id}")))?;
    state.engine.publish_campaign(&campaign);

    Ok(Json(json!({
        "success": true,
        "added": report.added,
        "merged": report.merged,
        "totalContacts": total,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartFromCsvBody {
    pub name: String,
    #[serde(default)]
    pub settings: Option<CampaignSettings>,
    pub contacts: Vec<ContactRow>,
}

/// `POST /api/campaigns/start-from-csv` — create a campaign from parsed
/// CSV rows and start dialing immediately.
pub async fn start_from_csv(
    State(state): State<AppState>,
    Json(body): Json<StartFromCsvBody>,
) -> ApiResult<Json<Value>> {
    if body.name.trim().is_empty() {
        return Err(ApiError::validation(
            "campaign name must not be empty",
            vec!["name".into()],
        ));
    }
    if body.contacts.is_empty() {
        return Err(ApiError::validation(
            "contacts must not be empty",
            vec!["contacts".into()],
        ));
    }

    let rows: Result<Vec<Contact>, ApiError> = body
        .contacts
        .into_iter()
        .map(ContactRow::into_contact)
        .collect();
    let rows = rows?;

    let campaign = vox_domain::model::Campaign::new(
        body.name.trim(),
        body.settings.unwrap_or_default(),
    );
    let id = campaign.id;
    state.campaigns.insert(campaign).await;

    let report = state.contacts.add_to_campaign(id, rows).await;
    let total = state.contacts.list_for_campaign(&id).len() as u64;
    state
        .campaigns
        .update(&id, |c| c.stats.total_contacts = total)
        .await;

    let campaign = state.engine.start(&id).await?;

    Ok(Json(json!({
        "success": true,
        "campaign": campaign,
        "added": report.added,
        "merged": report.merged,
    })))
}

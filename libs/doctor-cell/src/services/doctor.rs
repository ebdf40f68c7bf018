use anyhow::{anyhow, Result};
use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::models::{Doctor, DoctorSearchFilters};

pub struct DoctorService {
    supabase: SupabaseClient,
}

impl DoctorService {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::new(config),
        }
    }

    pub fn supabase(&self) -> &SupabaseClient {
        &self.supabase
    }

    /// List doctors for the public roster view.
    pub async fn list_doctors(&self, filters: DoctorSearchFilters) -> Result<Vec<Doctor>> {
        debug!("Listing doctors with filters: {:?}", filters);

        let mut query_parts: Vec<String> = Vec::new();

        if let Some(specialty) = filters.specialty {
            query_parts.push(format!("specialty=ilike.%{}%", specialty));
        }
        if filters.available_only.unwrap_or(false) {
            query_parts.push("available=eq.true".to_string());
        }

        let mut path = "/rest/v1/doctors".to_string();
        if !query_parts.is_empty() {
            path.push('?');
            path.push_str(&query_parts.join("&"));
            path.push_str("&order=full_name.asc");
        } else {
            path.push_str("?order=full_name.asc");
        }

        let result: Vec<Value> = self.supabase.request(Method::GET, &path, None, None).await?;

        let doctors: Vec<Doctor> = result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<Doctor>, _>>()?;

        Ok(doctors)
    }

    /// Get doctor by ID.
    pub async fn get_doctor(&self, doctor_id: &str, auth_token: Option<&str>) -> Result<Doctor> {
        debug!("Fetching doctor profile: {}", doctor_id);

        let path = format!("/rest/v1/doctors?id=eq.{}", doctor_id);
        let result: Vec<Value> = self.supabase.request(Method::GET, &path, auth_token, None).await?;

        if result.is_empty() {
            return Err(anyhow!("Doctor not found"));
        }

        let doctor: Doctor = serde_json::from_value(result[0].clone())?;
        Ok(doctor)
    }

    /// Toggle whether the doctor accepts new queue joins. Caller must have
    /// already enforced the staff-only boundary.
    pub async fn set_availability(
        &self,
        doctor_id: &str,
        available: bool,
        auth_token: &str,
    ) -> Result<Doctor> {
        debug!("Setting availability for doctor {}: {}", doctor_id, available);

        let update_data = json!({
            "available": available,
            "updated_at": Utc::now().to_rfc3339(),
        });

        let path = format!("/rest/v1/doctors?id=eq.{}", doctor_id);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Prefer",
            reqwest::header::HeaderValue::from_static("return=representation"),
        );

        let result: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                Some(auth_token),
                Some(update_data),
                Some(headers),
            )
            .await?;

        if result.is_empty() {
            return Err(anyhow!("Doctor not found"));
        }

        let doctor: Doctor = serde_json::from_value(result[0].clone())?;
        Ok(doctor)
    }
}

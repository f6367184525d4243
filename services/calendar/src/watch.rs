//! Google push channel lifecycle
//!
//! Channels expire after about a week, so a daily job re-registers every
//! channel that would lapse within the renewal window.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::CalendarError,
    google::CalendarApi,
    models::{GoogleIntegration, RenewalSummary, WatchChannel},
    repositories::IntegrationRepository,
};

#[derive(Clone)]
pub struct WatchManager {
    integrations: Arc<dyn IntegrationRepository>,
    calendar: Arc<dyn CalendarApi>,
    webhook_url: String,
    renewal_window: chrono::Duration,
}

impl WatchManager {
    pub fn new(
        integrations: Arc<dyn IntegrationRepository>,
        calendar: Arc<dyn CalendarApi>,
        webhook_url: String,
        renewal_window: chrono::Duration,
    ) -> Self {
        Self {
            integrations,
            calendar,
            webhook_url,
            renewal_window,
        }
    }

    /// Register a fresh channel for an owner, replacing the current one
    pub async fn ensure_watch(&self, user_id: Uuid) -> Result<WatchChannel> {
        let integration = self
            .integrations
            .find(user_id)
            .await?
            .ok_or(CalendarError::NotIntegrated(user_id))?;

        self.renew(&integration).await
    }

    /// Renew every channel expiring within the renewal window
    pub async fn renew_expiring(&self) -> Result<RenewalSummary> {
        let due = self
            .integrations
            .find_expiring(Utc::now() + self.renewal_window)
            .await?;

        let mut summary = RenewalSummary {
            due: due.len(),
            ..Default::default()
        };

        for integration in &due {
            match self.renew(integration).await {
                Ok(_) => summary.renewed += 1,
                Err(e) => {
                    error!(user_id = %integration.user_id, "Failed to renew calendar watch: {:#}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            due = summary.due,
            renewed = summary.renewed,
            failed = summary.failed,
            "Calendar watch renewal finished"
        );
        Ok(summary)
    }

    /// Stop the owner's channel and forget the integration
    ///
    /// Returns `false` when the owner had no integration.
    pub async fn disconnect(&self, user_id: Uuid) -> Result<bool> {
        let Some(integration) = self.integrations.find(user_id).await? else {
            return Ok(false);
        };

        self.stop_quietly(&integration).await;
        let deleted = self.integrations.delete(user_id).await?;

        info!(%user_id, "Disconnected Google Calendar integration");
        Ok(deleted)
    }

    /// Run `renew_expiring` on a cron schedule
    pub async fn start_schedule(&self, schedule: &str) -> Result<JobScheduler> {
        let manager = self.clone();
        let scheduler = JobScheduler::new().await?;

        let job = Job::new_async(schedule, move |_, _| {
            let manager = manager.clone();
            Box::pin(async move {
                if let Err(e) = manager.renew_expiring().await {
                    error!("Scheduled watch renewal failed: {:#}", e);
                }
            })
        })?;

        scheduler.add(job).await?;
        scheduler.start().await?;

        info!("Started calendar watch renewal with schedule: {}", schedule);
        Ok(scheduler)
    }

    async fn renew(&self, integration: &GoogleIntegration) -> Result<WatchChannel> {
        let channel_id = Uuid::new_v4().to_string();
        let channel = self
            .calendar
            .watch(&integration.refresh_token, &channel_id, &self.webhook_url)
            .await?;

        self.integrations
            .save_watch(integration.user_id, &channel)
            .await?;

        // The new channel is stored, so the old one can only produce duplicates
        self.stop_quietly(integration).await;

        info!(
            user_id = %integration.user_id,
            google_email = ?integration.google_email,
            channel_id = %channel.channel_id,
            expires_at = %channel.expires_at,
            "Registered calendar watch"
        );
        Ok(channel)
    }

    async fn stop_quietly(&self, integration: &GoogleIntegration) {
        let (Some(channel_id), Some(resource_id)) = (
            integration.watch_channel_id.as_deref(),
            integration.watch_resource_id.as_deref(),
        ) else {
            return;
        };

        if let Err(e) = self
            .calendar
            .stop_channel(&integration.refresh_token, channel_id, resource_id)
            .await
        {
            warn!(user_id = %integration.user_id, channel_id, "Failed to stop calendar channel: {}", e);
        }
    }
}
